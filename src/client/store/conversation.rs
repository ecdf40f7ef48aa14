//! # Conversation Partition
//!
//! State of one open conversation: the ordered message log, the reaction
//! index, the roster with profiles, read cursors, typing state and the
//! local draft.
//!
//! The message log is kept sorted ascending by `(created_at, id)` and never
//! holds two entries with the same id. Every mutation goes through the
//! methods below so the invariant cannot be broken from outside.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::shared::messaging::{
    ChatMessage, Conversation, ConversationKind, MessageId, Participant, Profile, Reaction,
    ReactionCount, TypingState,
};

/// Lifecycle of a message entry in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Confirmed by the backend
    Confirmed,
    /// Optimistic; the write is in flight
    Pending,
    /// Optimistic; the write failed and waits for retry or discard
    Failed { reason: String },
}

/// A message plus its delivery state
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub message: ChatMessage,
    pub state: EntryState,
}

impl MessageEntry {
    pub fn confirmed(message: ChatMessage) -> Self {
        Self {
            message,
            state: EntryState::Confirmed,
        }
    }

    pub fn pending(message: ChatMessage) -> Self {
        Self {
            message,
            state: EntryState::Pending,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.message.id
    }

    /// Entry created by the outbox and not yet replaced by its confirmed row
    pub fn is_optimistic(&self) -> bool {
        !matches!(self.state, EntryState::Confirmed)
    }
}

/// Result of inserting or updating a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-conversation partition of the local state store
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    conversation: Option<Conversation>,
    messages: Vec<MessageEntry>,
    reactions: HashMap<MessageId, Vec<Reaction>>,
    participants: HashMap<Uuid, Participant>,
    profiles: HashMap<Uuid, Profile>,
    cursors: HashMap<Uuid, DateTime<Utc>>,
    typing: HashMap<Uuid, TypingState>,
    draft: Option<String>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn set_conversation(&mut self, conversation: Conversation) {
        self.conversation = Some(conversation);
    }

    pub fn kind(&self) -> Option<ConversationKind> {
        self.conversation.as_ref().map(Conversation::kind)
    }

    // messages

    /// Messages in display order
    pub fn messages(&self) -> &[MessageEntry] {
        &self.messages
    }

    pub fn message(&self, id: &MessageId) -> Option<&MessageEntry> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Most recent confirmed message
    pub fn last_confirmed(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|entry| !entry.is_optimistic())
            .map(|entry| &entry.message)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|entry| &entry.message.id == id)
    }

    fn insert_sorted(&mut self, entry: MessageEntry) {
        let at = self
            .messages
            .partition_point(|existing| existing.message.sort_key() < entry.message.sort_key());
        self.messages.insert(at, entry);
    }

    /// Insert a message, or update the entry with the same id. Idempotent.
    pub fn upsert_message(&mut self, entry: MessageEntry) -> Upsert {
        match self.position(&entry.message.id) {
            Some(i) if self.messages[i] == entry => Upsert::Unchanged,
            Some(i) => {
                if self.messages[i].message.created_at == entry.message.created_at {
                    self.messages[i] = entry;
                } else {
                    self.messages.remove(i);
                    self.insert_sorted(entry);
                }
                Upsert::Updated
            }
            None => {
                self.insert_sorted(entry);
                Upsert::Inserted
            }
        }
    }

    /// Remove a message together with its reactions
    pub fn remove_message(&mut self, id: &MessageId) -> Option<MessageEntry> {
        let i = self.position(id)?;
        self.reactions.remove(id);
        Some(self.messages.remove(i))
    }

    pub fn set_entry_state(&mut self, id: &MessageId, state: EntryState) -> bool {
        match self.position(id) {
            Some(i) if self.messages[i].state != state => {
                self.messages[i].state = state;
                true
            }
            _ => false,
        }
    }

    /// Swap an optimistic entry for its confirmed row. The confirmed entry
    /// lands where its own timestamp puts it and is never duplicated.
    /// Returns whether the optimistic entry was still present.
    pub fn replace_optimistic(&mut self, temp_id: &MessageId, confirmed: ChatMessage) -> bool {
        let had_temp = self.remove_message(temp_id).is_some();
        if !self.contains_message(&confirmed.id) {
            self.insert_sorted(MessageEntry::confirmed(confirmed));
        }
        had_temp
    }

    /// Earliest optimistic entry that `confirmed` is the echo of: same
    /// sender, type and body, created within `window` of each other.
    pub fn find_optimistic_match(&self, confirmed: &ChatMessage, window: Duration) -> Option<MessageId> {
        self.find_optimistic_match_excluding(confirmed, window, &HashSet::new())
    }

    pub(crate) fn find_optimistic_match_excluding(
        &self,
        confirmed: &ChatMessage,
        window: Duration,
        claimed: &HashSet<MessageId>,
    ) -> Option<MessageId> {
        self.messages
            .iter()
            .filter(|entry| entry.is_optimistic() && !claimed.contains(entry.id()))
            .map(|entry| &entry.message)
            .find(|candidate| {
                candidate.sender_id == confirmed.sender_id
                    && candidate.message_type == confirmed.message_type
                    && candidate.content == confirmed.content
                    && (candidate.created_at - confirmed.created_at).abs() <= window
            })
            .map(|candidate| candidate.id.clone())
    }

    /// Optimistic entries in display order
    pub fn optimistic_entries(&self) -> impl Iterator<Item = &MessageEntry> {
        self.messages.iter().filter(|entry| entry.is_optimistic())
    }

    /// Replace every entry with `entries`, then restore the sort order
    pub(crate) fn replace_messages(&mut self, mut entries: Vec<MessageEntry>) {
        entries.sort_by(|a, b| a.message.sort_key().cmp(&b.message.sort_key()));
        entries.dedup_by(|a, b| a.message.id == b.message.id);
        self.messages = entries;
    }

    // reactions

    pub fn reactions(&self, message_id: &MessageId) -> &[Reaction] {
        self.reactions.get(message_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_reaction(&self, reaction: &Reaction) -> bool {
        self.reactions(&reaction.message_id).contains(reaction)
    }

    pub fn add_reaction(&mut self, reaction: Reaction) -> bool {
        let list = self.reactions.entry(reaction.message_id.clone()).or_default();
        if list.contains(&reaction) {
            return false;
        }
        list.push(reaction);
        true
    }

    pub fn remove_reaction(&mut self, reaction: &Reaction) -> bool {
        let Some(list) = self.reactions.get_mut(&reaction.message_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r != reaction);
        let removed = list.len() != before;
        if list.is_empty() {
            self.reactions.remove(&reaction.message_id);
        }
        removed
    }

    pub(crate) fn replace_reactions(&mut self, reactions: Vec<Reaction>) {
        self.reactions.clear();
        for reaction in reactions {
            self.add_reaction(reaction);
        }
    }

    /// Per-emoji counts of one message, in first-reacted order
    pub fn reaction_counts(&self, message_id: &MessageId, local_user: Uuid) -> Vec<ReactionCount> {
        let mut counts: Vec<ReactionCount> = Vec::new();
        for reaction in self.reactions(message_id) {
            match counts.iter_mut().find(|c| c.emoji == reaction.emoji) {
                Some(count) => {
                    count.count += 1;
                    count.reacted_by_me |= reaction.user_id == local_user;
                }
                None => counts.push(ReactionCount {
                    emoji: reaction.emoji.clone(),
                    count: 1,
                    reacted_by_me: reaction.user_id == local_user,
                }),
            }
        }
        counts
    }

    // roster

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn participant(&self, user_id: Uuid) -> Option<&Participant> {
        self.participants.get(&user_id)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains_key(&user_id)
    }

    pub fn upsert_participant(&mut self, participant: Participant) -> bool {
        let changed = self.participants.get(&participant.user_id) != Some(&participant);
        self.participants.insert(participant.user_id, participant);
        changed
    }

    pub fn remove_participant(&mut self, user_id: Uuid) -> Option<Participant> {
        self.cursors.remove(&user_id);
        self.typing.remove(&user_id);
        self.participants.remove(&user_id)
    }

    pub(crate) fn replace_participants(&mut self, participants: Vec<Participant>) {
        self.participants = participants.into_iter().map(|p| (p.user_id, p)).collect();
    }

    /// Other participant of a direct conversation
    pub fn counterpart(&self, local_user: Uuid) -> Option<Uuid> {
        match self.kind() {
            Some(ConversationKind::Direct) => self
                .participants
                .keys()
                .copied()
                .find(|user_id| *user_id != local_user),
            _ => None,
        }
    }

    pub fn profile(&self, user_id: Uuid) -> Option<&Profile> {
        self.profiles.get(&user_id)
    }

    pub fn set_profile(&mut self, profile: Profile) -> bool {
        let changed = self.profiles.get(&profile.id) != Some(&profile);
        self.profiles.insert(profile.id, profile);
        changed
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.profiles.get(&user_id).is_some_and(|p| p.is_online)
    }

    // read cursors

    pub fn cursor(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.cursors.get(&user_id).copied()
    }

    /// Move a cursor forward; never backwards
    pub fn advance_cursor(&mut self, user_id: Uuid, at: DateTime<Utc>) -> bool {
        match self.cursors.get(&user_id) {
            Some(current) if *current >= at => false,
            _ => {
                self.cursors.insert(user_id, at);
                true
            }
        }
    }

    pub(crate) fn replace_cursors(&mut self, cursors: HashMap<Uuid, DateTime<Utc>>) {
        self.cursors = cursors;
    }

    /// Confirmed messages from others after the user's cursor
    pub fn unread_count(&self, user_id: Uuid) -> u32 {
        let cursor = self.cursor(user_id);
        let count = self
            .messages
            .iter()
            .filter(|entry| !entry.is_optimistic() && entry.message.sender_id != user_id)
            .filter(|entry| cursor.map_or(true, |at| entry.message.created_at > at))
            .count();
        count as u32
    }

    // typing

    /// Last-write-wins by `updated_at`
    pub fn apply_typing(&mut self, state: TypingState) -> bool {
        match self.typing.get(&state.user_id) {
            Some(current) if current.updated_at > state.updated_at => false,
            Some(current) if current == &state => false,
            _ => {
                self.typing.insert(state.user_id, state);
                true
            }
        }
    }

    /// Users typing as of `now`, ignoring states older than `ttl`
    pub fn typing_users(&self, now: DateTime<Utc>, ttl: Duration, exclude: Uuid) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self
            .typing
            .values()
            .filter(|state| state.is_typing && state.user_id != exclude)
            .filter(|state| now - state.updated_at <= ttl)
            .map(|state| state.user_id)
            .collect();
        users.sort();
        users
    }

    // draft

    pub fn draft(&self) -> Option<&str> {
        self.draft.as_deref()
    }

    pub fn set_draft(&mut self, draft: Option<String>) {
        self.draft = draft.filter(|body| !body.is_empty());
    }
}
