//! # Local State Store
//!
//! Single source of truth for the UI: one [`ConversationState`] partition
//! per open conversation. Partitions are independent; there is no ordering
//! between conversations.
//!
//! The store is owned by the engine and mutated only through `&mut`, by the
//! reconciler and the outbox. Readers take cloned snapshots and learn about
//! mutations through [`LocalStateStore::subscribe`].
//!
//! The reaction feed carries no conversation id, so a reaction for a message
//! no partition holds cannot be placed. Such reactions wait in one bounded
//! buffer shared by all partitions and are adopted when their message lands.

pub mod conversation;

pub use conversation::{ConversationState, EntryState, MessageEntry, Upsert};

use std::collections::{HashMap, VecDeque};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::shared::messaging::{MessageId, Reaction};

/// Reactions held for messages not in any partition
pub const ORPHAN_REACTION_LIMIT: usize = 256;

/// Change notification for store observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Partition replaced wholesale by a snapshot
    Reset { conversation_id: Uuid },
    MessageUpserted { conversation_id: Uuid, message_id: MessageId },
    MessageReplaced { conversation_id: Uuid, temp_id: MessageId, message_id: MessageId },
    MessageRemoved { conversation_id: Uuid, message_id: MessageId },
    ReactionsChanged { conversation_id: Uuid, message_id: MessageId },
    ParticipantsChanged { conversation_id: Uuid },
    ProfileChanged { conversation_id: Uuid, user_id: Uuid },
    CursorMoved { conversation_id: Uuid, user_id: Uuid },
    TypingChanged { conversation_id: Uuid },
    DraftChanged { conversation_id: Uuid },
    Closed { conversation_id: Uuid },
}

/// Partitions of every open conversation
#[derive(Debug)]
pub struct LocalStateStore {
    partitions: HashMap<Uuid, ConversationState>,
    orphan_reactions: VecDeque<Reaction>,
    observers: broadcast::Sender<StoreChange>,
}

impl LocalStateStore {
    pub fn new(buffer: usize) -> Self {
        let (observers, _) = broadcast::channel(buffer.max(1));
        Self {
            partitions: HashMap::new(),
            orphan_reactions: VecDeque::new(),
            observers,
        }
    }

    /// Observe mutations. Slow observers miss changes and should re-read
    /// a snapshot when they see `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.observers.subscribe()
    }

    pub fn notify(&self, change: StoreChange) {
        tracing::trace!("[STORE] {:?}", change);
        // no observers is fine
        let _ = self.observers.send(change);
    }

    pub fn contains(&self, conversation_id: Uuid) -> bool {
        self.partitions.contains_key(&conversation_id)
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<&ConversationState> {
        self.partitions.get(&conversation_id)
    }

    pub fn get_mut(&mut self, conversation_id: Uuid) -> Option<&mut ConversationState> {
        self.partitions.get_mut(&conversation_id)
    }

    /// Partition of a conversation, created empty when missing
    pub fn open(&mut self, conversation_id: Uuid) -> &mut ConversationState {
        self.partitions.entry(conversation_id).or_default()
    }

    /// Drop a partition
    pub fn close(&mut self, conversation_id: Uuid) -> Option<ConversationState> {
        let removed = self.partitions.remove(&conversation_id);
        if removed.is_some() {
            tracing::debug!("[STORE] closed partition {}", conversation_id);
            self.notify(StoreChange::Closed { conversation_id });
        }
        removed
    }

    pub fn conversation_ids(&self) -> Vec<Uuid> {
        self.partitions.keys().copied().collect()
    }

    /// Conversation whose partition holds a message
    pub fn partition_of(&self, message_id: &MessageId) -> Option<Uuid> {
        self.partitions
            .iter()
            .find(|(_, state)| state.contains_message(message_id))
            .map(|(id, _)| *id)
    }

    /// Cloned view of one partition for rendering
    pub fn snapshot(&self, conversation_id: Uuid) -> Option<ConversationState> {
        self.partitions.get(&conversation_id).cloned()
    }

    pub fn clear(&mut self) {
        for conversation_id in self.conversation_ids() {
            self.close(conversation_id);
        }
        self.orphan_reactions.clear();
    }

    // reactions for unknown messages

    /// Hold a reaction whose message is not loaded. The oldest held
    /// reaction is dropped once the buffer is full.
    pub fn hold_orphan(&mut self, reaction: Reaction) -> bool {
        if self.orphan_reactions.contains(&reaction) {
            return false;
        }
        if self.orphan_reactions.len() >= ORPHAN_REACTION_LIMIT {
            self.orphan_reactions.pop_front();
        }
        self.orphan_reactions.push_back(reaction);
        true
    }

    pub fn release_orphan(&mut self, reaction: &Reaction) -> bool {
        let before = self.orphan_reactions.len();
        self.orphan_reactions.retain(|held| held != reaction);
        self.orphan_reactions.len() != before
    }

    pub fn orphan_count(&self) -> usize {
        self.orphan_reactions.len()
    }

    /// Move held reactions of `message_id` into the partition that now
    /// holds it. Returns whether any were adopted.
    pub fn adopt_orphans(&mut self, conversation_id: Uuid, message_id: &MessageId) -> bool {
        if !self.orphan_reactions.iter().any(|r| &r.message_id == message_id) {
            return false;
        }
        let Some(partition) = self.partitions.get_mut(&conversation_id) else {
            return false;
        };
        if !partition.contains_message(message_id) {
            return false;
        }
        let mut adopted = false;
        let mut kept = VecDeque::with_capacity(self.orphan_reactions.len());
        for reaction in self.orphan_reactions.drain(..) {
            if &reaction.message_id == message_id {
                adopted |= partition.add_reaction(reaction);
            } else {
                kept.push_back(reaction);
            }
        }
        self.orphan_reactions = kept;
        adopted
    }

    /// Forget held reactions of messages an authoritative snapshot covered
    pub fn discard_orphans_of(&mut self, message_ids: &[MessageId]) {
        self.orphan_reactions.retain(|r| !message_ids.contains(&r.message_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::shared::messaging::ChatMessage;

    #[test]
    fn test_partitions_are_independent() {
        let mut store = LocalStateStore::new(16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let message = ChatMessage::new_text(MessageId::from("m1"), a, Uuid::new_v4(), "hi", Utc::now());
        store.open(a).upsert_message(MessageEntry::confirmed(message));
        store.open(b);

        assert_eq!(store.partition_of(&MessageId::from("m1")), Some(a));
        assert_eq!(store.get(b).map(|s| s.messages().len()), Some(0));
    }

    #[tokio::test]
    async fn test_close_notifies_observers() {
        let mut store = LocalStateStore::new(16);
        let mut changes = store.subscribe();
        let id = Uuid::new_v4();
        store.open(id);
        assert!(store.close(id).is_some());
        assert!(store.close(id).is_none());

        assert_eq!(changes.recv().await.unwrap(), StoreChange::Closed { conversation_id: id });
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_orphans_are_bounded_and_adopted_once() {
        let mut store = LocalStateStore::new(16);
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        for n in 0..ORPHAN_REACTION_LIMIT + 10 {
            store.hold_orphan(Reaction::new(MessageId::from(format!("x{}", n)), user, "👍"));
        }
        assert_eq!(store.orphan_count(), ORPHAN_REACTION_LIMIT);

        let late = Reaction::new(MessageId::from("late"), user, "🎉");
        assert!(store.hold_orphan(late.clone()));
        assert!(!store.hold_orphan(late.clone()));

        // not adopted until the message is actually in the partition
        store.open(conv);
        assert!(!store.adopt_orphans(conv, &late.message_id));

        let message = ChatMessage::new_text(late.message_id.clone(), conv, user, "hi", Utc::now());
        store.open(conv).upsert_message(MessageEntry::confirmed(message));
        assert!(store.adopt_orphans(conv, &late.message_id));
        assert!(store.get(conv).unwrap().has_reaction(&late));
        assert_eq!(store.orphan_count(), ORPHAN_REACTION_LIMIT - 1);
    }
}
