//! # Reconciler
//!
//! Merges authoritative snapshots and live change events into the local
//! state store without duplicating or reordering messages.
//!
//! ## Rules
//!
//! - **Snapshot**: replaces confirmed messages, reactions, roster and
//!   cursors wholesale. Optimistic entries survive unless the snapshot
//!   already holds their confirmed row
//! - **Message insert**: merge by id; a second delivery is a no-op
//! - **Own echo**: a confirmed row from the local user that matches an
//!   optimistic entry (same body, within the match window) replaces it,
//!   failed entries included; the claimed temporary id is reported back
//! - **Reactions**: set semantics on (message, user, emoji); reactions for
//!   a message no partition holds wait in the store's orphan buffer
//! - **Cursors** only move forward; **typing** is last-write-wins
//! - Ordering comes from the store's sort key, never from arrival order

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::client::backend::BackendService;
use crate::client::error::{with_timeout, Result, SyncError};
use crate::client::store::{LocalStateStore, MessageEntry, StoreChange, Upsert};
use crate::shared::config::{self, DEFAULT_MATCH_WINDOW};
use crate::shared::event::{ChangeEvent, ChangeOp, EntityKind};
use crate::shared::messaging::{
    ChatMessage, Conversation, MessageId, Participant, Profile, Reaction, ReadCursor, TypingState,
};

/// Full current state of one conversation as fetched from the backend
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
    pub participants: Vec<Participant>,
    pub reactions: Vec<Reaction>,
    pub profiles: Vec<Profile>,
    pub cursors: Vec<ReadCursor>,
}

/// What applying a remote event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Unchanged,
    Changed,
    /// A participant without a loaded profile joined
    NeedsProfile(Uuid),
    /// An echo replaced the optimistic entry with this temporary id
    EchoConfirmed(MessageId),
    /// The local user's participant row was deleted
    RemovedFromConversation,
    ConversationDeleted,
}

#[derive(Debug, Deserialize)]
struct RowId<T> {
    id: T,
}

/// Snapshot and event merge for the local user's view
#[derive(Debug, Clone)]
pub struct Reconciler {
    local_user: Uuid,
    match_window: chrono::Duration,
}

impl Reconciler {
    pub fn new(local_user: Uuid, match_window: Duration) -> Self {
        Self {
            local_user,
            match_window: config::span(match_window, DEFAULT_MATCH_WINDOW),
        }
    }

    pub fn local_user(&self) -> Uuid {
        self.local_user
    }

    /// Fetch messages, roster, reactions, profiles and cursors of a
    /// conversation. Fails with `PermissionDenied` when the local user is no
    /// longer a participant.
    pub async fn fetch_snapshot(
        &self,
        backend: &dyn BackendService,
        conversation_id: Uuid,
        timeout: Duration,
    ) -> Result<Snapshot> {
        let conversation = with_timeout(timeout, backend.get_conversation(conversation_id)).await?;
        let participants = with_timeout(timeout, backend.list_participants(conversation_id)).await?;
        if !participants.iter().any(|p| p.user_id == self.local_user) {
            return Err(SyncError::permission_denied(format!(
                "not a participant of {}",
                conversation_id
            )));
        }

        let messages = with_timeout(timeout, backend.list_messages(conversation_id)).await?;
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id.clone()).collect();
        let reactions = if ids.is_empty() {
            Vec::new()
        } else {
            with_timeout(timeout, backend.list_reactions(&ids)).await?
        };
        let user_ids: Vec<Uuid> = participants.iter().map(|p| p.user_id).collect();
        let profiles = with_timeout(timeout, backend.get_profiles(&user_ids)).await?;
        let cursors = with_timeout(timeout, backend.list_read_cursors(conversation_id)).await?;

        tracing::debug!(
            "[SYNC] fetched snapshot of {}: {} messages, {} participants, {} reactions",
            conversation_id,
            messages.len(),
            participants.len(),
            reactions.len()
        );

        Ok(Snapshot {
            conversation,
            messages,
            participants,
            reactions,
            profiles,
            cursors,
        })
    }

    /// Replace a partition with a snapshot. `local_cursor` is the side
    /// store's fallback for the local user's cursor. Returns the temporary
    /// ids whose confirmed row the snapshot already holds.
    pub fn apply_snapshot(
        &self,
        store: &mut LocalStateStore,
        snapshot: Snapshot,
        local_cursor: Option<DateTime<Utc>>,
    ) -> Vec<MessageId> {
        let conversation_id = snapshot.conversation.id;
        let covered: Vec<MessageId> = snapshot.messages.iter().map(|m| m.id.clone()).collect();
        store.discard_orphans_of(&covered);
        let partition = store.open(conversation_id);

        // Optimistic entries whose confirmed row is already in the snapshot
        // are dropped; the rest stay visible. Rows the partition already
        // holds were matched before and claim nothing.
        let mut claimed = HashSet::new();
        for confirmed in snapshot
            .messages
            .iter()
            .filter(|m| m.sender_id == self.local_user && !partition.contains_message(&m.id))
        {
            if let Some(temp_id) =
                partition.find_optimistic_match_excluding(confirmed, self.match_window, &claimed)
            {
                claimed.insert(temp_id);
            }
        }
        let survivors: Vec<MessageEntry> = partition
            .optimistic_entries()
            .filter(|entry| !claimed.contains(entry.id()))
            .cloned()
            .collect();

        let mut entries: Vec<MessageEntry> = snapshot
            .messages
            .into_iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(MessageEntry::confirmed)
            .collect();
        entries.extend(survivors);
        partition.replace_messages(entries);

        partition.replace_reactions(snapshot.reactions);
        partition.replace_participants(snapshot.participants);
        for profile in snapshot.profiles {
            partition.set_profile(profile);
        }

        let mut cursors: HashMap<Uuid, DateTime<Utc>> = snapshot
            .cursors
            .into_iter()
            .filter(|c| c.conversation_id == conversation_id)
            .map(|c| (c.user_id, c.last_viewed_at))
            .collect();
        if let Some(local) = local_cursor {
            let merged = cursors
                .get(&self.local_user)
                .map_or(local, |remote| (*remote).max(local));
            cursors.insert(self.local_user, merged);
        }
        partition.replace_cursors(cursors);
        partition.set_conversation(snapshot.conversation);

        tracing::info!(
            "[SYNC] snapshot applied to {} ({} messages, {} unconfirmed kept)",
            conversation_id,
            partition.messages().len(),
            partition.optimistic_entries().count()
        );
        store.notify(StoreChange::Reset { conversation_id });
        claimed.into_iter().collect()
    }

    /// Merge one change event delivered for `conversation_id`
    pub fn apply_event(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        if !store.contains(conversation_id) {
            return Ok(Applied::Unchanged);
        }
        if let Some(scoped) = event.conversation_id() {
            if scoped != conversation_id {
                return Ok(Applied::Unchanged);
            }
        }

        match event.entity {
            EntityKind::Message => self.apply_message(store, conversation_id, event),
            EntityKind::Reaction => self.apply_reaction(store, conversation_id, event),
            EntityKind::Participant => self.apply_participant(store, conversation_id, event),
            EntityKind::Conversation => self.apply_conversation(store, conversation_id, event),
            EntityKind::Profile => self.apply_profile(store, conversation_id, event),
            EntityKind::Typing => self.apply_typing(store, conversation_id, event),
            EntityKind::ReadCursor => self.apply_cursor(store, conversation_id, event),
            EntityKind::Favourite | EntityKind::Block | EntityKind::GroupNotification => {
                Ok(Applied::Unchanged)
            }
        }
    }

    fn apply_message(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        if event.op == ChangeOp::Delete {
            let RowId { id } = event.decode::<RowId<MessageId>>()?;
            let removed = store
                .get_mut(conversation_id)
                .and_then(|partition| partition.remove_message(&id));
            if removed.is_none() {
                return Ok(Applied::Unchanged);
            }
            tracing::debug!("[SYNC] message {} deleted remotely", id);
            store.notify(StoreChange::MessageRemoved {
                conversation_id,
                message_id: id,
            });
            return Ok(Applied::Changed);
        }

        let message: ChatMessage = event.decode()?;
        if message.conversation_id != conversation_id {
            return Ok(Applied::Unchanged);
        }
        let window = self.match_window;
        let local_user = self.local_user;
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };

        if !partition.contains_message(&message.id) && message.sender_id == local_user {
            if let Some(temp_id) = partition.find_optimistic_match(&message, window) {
                let message_id = message.id.clone();
                partition.replace_optimistic(&temp_id, message);
                tracing::debug!("[SYNC] echo {} replaced optimistic {}", message_id, temp_id);
                store.adopt_orphans(conversation_id, &message_id);
                store.notify(StoreChange::MessageReplaced {
                    conversation_id,
                    temp_id: temp_id.clone(),
                    message_id,
                });
                return Ok(Applied::EchoConfirmed(temp_id));
            }
        }

        let message_id = message.id.clone();
        match partition.upsert_message(MessageEntry::confirmed(message)) {
            Upsert::Unchanged => {
                tracing::debug!("[SYNC] duplicate delivery of {} ignored", message_id);
                Ok(Applied::Unchanged)
            }
            Upsert::Inserted | Upsert::Updated => {
                if store.adopt_orphans(conversation_id, &message_id) {
                    tracing::debug!("[SYNC] adopted held reactions of {}", message_id);
                }
                store.notify(StoreChange::MessageUpserted {
                    conversation_id,
                    message_id,
                });
                Ok(Applied::Changed)
            }
        }
    }

    fn apply_reaction(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        let reaction: Reaction = event.decode()?;
        // The reaction feed is not scoped; only the partition holding the
        // message takes it.
        match store.partition_of(&reaction.message_id) {
            Some(owner) if owner == conversation_id => {}
            Some(_) => return Ok(Applied::Unchanged),
            None => {
                match event.op {
                    ChangeOp::Delete => store.release_orphan(&reaction),
                    ChangeOp::Insert | ChangeOp::Update => store.hold_orphan(reaction),
                };
                return Ok(Applied::Unchanged);
            }
        }
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };

        let message_id = reaction.message_id.clone();
        let changed = match event.op {
            ChangeOp::Delete => partition.remove_reaction(&reaction),
            ChangeOp::Insert | ChangeOp::Update => partition.add_reaction(reaction),
        };
        if !changed {
            return Ok(Applied::Unchanged);
        }
        store.notify(StoreChange::ReactionsChanged {
            conversation_id,
            message_id,
        });
        Ok(Applied::Changed)
    }

    fn apply_participant(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        let participant: Participant = event.decode()?;
        let user_id = participant.user_id;
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };

        if event.op == ChangeOp::Delete {
            if partition.remove_participant(user_id).is_none() {
                return Ok(Applied::Unchanged);
            }
            store.notify(StoreChange::ParticipantsChanged { conversation_id });
            if user_id == self.local_user {
                tracing::info!("[SYNC] local user removed from {}", conversation_id);
                return Ok(Applied::RemovedFromConversation);
            }
            return Ok(Applied::Changed);
        }

        let needs_profile = partition.profile(user_id).is_none();
        if !partition.upsert_participant(participant) {
            return Ok(Applied::Unchanged);
        }
        store.notify(StoreChange::ParticipantsChanged { conversation_id });
        if needs_profile {
            Ok(Applied::NeedsProfile(user_id))
        } else {
            Ok(Applied::Changed)
        }
    }

    fn apply_conversation(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        if event.op == ChangeOp::Delete {
            tracing::info!("[SYNC] conversation {} deleted remotely", conversation_id);
            return Ok(Applied::ConversationDeleted);
        }
        let conversation: Conversation = event.decode()?;
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };
        if partition.conversation() == Some(&conversation) {
            return Ok(Applied::Unchanged);
        }
        partition.set_conversation(conversation);
        store.notify(StoreChange::ParticipantsChanged { conversation_id });
        Ok(Applied::Changed)
    }

    fn apply_profile(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        let profile: Profile = event.decode()?;
        let user_id = profile.id;
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };
        if !partition.is_participant(user_id) || !partition.set_profile(profile) {
            return Ok(Applied::Unchanged);
        }
        store.notify(StoreChange::ProfileChanged {
            conversation_id,
            user_id,
        });
        Ok(Applied::Changed)
    }

    fn apply_typing(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        if event.op == ChangeOp::Delete {
            return Ok(Applied::Unchanged);
        }
        let state: TypingState = event.decode()?;
        if state.user_id == self.local_user {
            return Ok(Applied::Unchanged);
        }
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };
        if !partition.apply_typing(state) {
            return Ok(Applied::Unchanged);
        }
        store.notify(StoreChange::TypingChanged { conversation_id });
        Ok(Applied::Changed)
    }

    fn apply_cursor(
        &self,
        store: &mut LocalStateStore,
        conversation_id: Uuid,
        event: &ChangeEvent,
    ) -> Result<Applied> {
        if event.op == ChangeOp::Delete {
            return Ok(Applied::Unchanged);
        }
        let cursor: ReadCursor = event.decode()?;
        let Some(partition) = store.get_mut(conversation_id) else {
            return Ok(Applied::Unchanged);
        };
        if !partition.advance_cursor(cursor.user_id, cursor.last_viewed_at) {
            tracing::debug!("[SYNC] stale cursor for {} ignored", cursor.user_id);
            return Ok(Applied::Unchanged);
        }
        store.notify(StoreChange::CursorMoved {
            conversation_id,
            user_id: cursor.user_id,
        });
        Ok(Applied::Changed)
    }

    /// Resolve an optimistic send the backend confirmed. Covers the echo
    /// having arrived first (temp entry already gone) and both entries being
    /// present. Returns false when the conversation is not open.
    pub fn confirm_send(
        &self,
        store: &mut LocalStateStore,
        temp_id: &MessageId,
        confirmed: ChatMessage,
    ) -> bool {
        let conversation_id = confirmed.conversation_id;
        let message_id = confirmed.id.clone();
        let Some(partition) = store.get_mut(conversation_id) else {
            return false;
        };
        let had_real = partition.contains_message(&message_id);
        let had_temp = partition.replace_optimistic(temp_id, confirmed);
        store.adopt_orphans(conversation_id, &message_id);
        if had_temp {
            store.notify(StoreChange::MessageReplaced {
                conversation_id,
                temp_id: temp_id.clone(),
                message_id,
            });
        } else if !had_real {
            store.notify(StoreChange::MessageUpserted {
                conversation_id,
                message_id,
            });
        }
        true
    }
}
