//! # In-Memory Backend
//!
//! A complete [`BackendService`] and [`AuthProvider`] held in process memory.
//! Every write is published on a broadcast change feed, so several engines
//! sharing one `MemoryBackend` see each other's changes the way clients of
//! the hosted service do.
//!
//! ## Features
//!
//! - **Change feed**: per-table streams with `eq` filters
//! - **Failure injection**: `fail_next` makes the next call of a method fail
//! - **Connectivity**: `set_offline` and `drop_subscriptions` simulate
//!   transport loss
//! - **Call log**: `call_count` for asserting write collapsing
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chatsync::client::backend::{InjectedFailure, MemoryBackend};
//!
//! let backend = MemoryBackend::new();
//! backend.fail_next("insert_message", InjectedFailure::Network);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use super::{AuthProvider, BackendService, ChangeStream, RowFilter, Session, SignUpRequest};
use crate::client::error::{Result, SyncError};
use crate::shared::event::{ChangeEvent, ChangeOp, EntityKind};
use crate::shared::messaging::{
    ChatMessage, Conversation, CreateConversationRequest, GroupNotification, MessageId,
    Participant, Profile, Reaction, ReadCursor, SendMessageRequest, TypingState,
};

const FEED_CAPACITY: usize = 1024;

/// Failure returned by the next call of an instrumented method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Network,
    Conflict,
    NotFound,
    PermissionDenied,
    Validation,
    /// Never answer; the caller's request timeout decides
    Hang,
}

impl InjectedFailure {
    fn into_error(self, method: &str) -> SyncError {
        match self {
            InjectedFailure::Network => SyncError::NetworkUnavailable(format!("{} failed", method)),
            InjectedFailure::Conflict => SyncError::Conflict(method.to_string()),
            InjectedFailure::NotFound => SyncError::not_found(method),
            InjectedFailure::PermissionDenied => SyncError::permission_denied(method),
            InjectedFailure::Validation => SyncError::validation(method),
            InjectedFailure::Hang => SyncError::NetworkUnavailable(format!("{} hung", method)),
        }
    }
}

#[derive(Debug)]
struct Account {
    user_id: Uuid,
    password: String,
    verified: bool,
    pending_code: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    conversations: HashMap<Uuid, Conversation>,
    participants: Vec<Participant>,
    messages: Vec<ChatMessage>,
    reactions: Vec<Reaction>,
    profiles: HashMap<Uuid, Profile>,
    typing: HashMap<(Uuid, Uuid), TypingState>,
    cursors: HashMap<(Uuid, Uuid), ReadCursor>,
    favourites: HashSet<(Uuid, Uuid)>,
    blocked: HashSet<(Uuid, Uuid)>,
    notifications: Vec<GroupNotification>,
    objects: HashMap<String, Bytes>,
    accounts: HashMap<String, Account>,
    session: Option<Session>,
}

/// In-process backend service
#[derive(Debug)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    feed: broadcast::Sender<ChangeEvent>,
    epoch: watch::Sender<u64>,
    offline: AtomicBool,
    failures: Mutex<HashMap<String, VecDeque<InjectedFailure>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let (epoch, _) = watch::channel(0);
        Self {
            tables: RwLock::new(Tables::default()),
            feed,
            epoch,
            offline: AtomicBool::new(false),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next call of `method` fail
    pub fn fail_next(&self, method: &str, failure: InjectedFailure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.entry(method.to_string()).or_default().push_back(failure);
        }
    }

    /// Take the transport down (or bring it back). Going offline ends every
    /// open subscription.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
        if offline {
            self.drop_subscriptions();
        }
    }

    /// End every open change stream, as a dropped socket would
    pub fn drop_subscriptions(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
        tracing::debug!("[STORE] memory backend dropped all subscriptions");
    }

    /// Number of calls made to `method`
    pub fn call_count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Seed a conversation and its roster without publishing events
    pub async fn seed_conversation(&self, conversation: Conversation, participants: &[Participant]) {
        let mut tables = self.tables.write().await;
        tables.conversations.insert(conversation.id, conversation);
        tables.participants.extend(participants.iter().cloned());
    }

    pub async fn seed_profile(&self, profile: Profile) {
        self.tables.write().await.profiles.insert(profile.id, profile);
    }

    /// Store a message written by another client and publish it
    pub async fn insert_remote_message(&self, message: ChatMessage) {
        self.tables.write().await.messages.push(message.clone());
        self.emit(EntityKind::Message, ChangeOp::Insert, &message);
    }

    /// Publish a raw change event
    pub fn push_event(&self, event: ChangeEvent) -> usize {
        self.feed.send(event).unwrap_or(0)
    }

    /// Update a profile's presence and publish the change
    pub async fn set_online(&self, user_id: Uuid, online: bool) {
        let profile = {
            let mut tables = self.tables.write().await;
            tables.profiles.get_mut(&user_id).map(|profile| {
                profile.is_online = online;
                profile.last_seen = Some(Utc::now());
                profile.clone()
            })
        };
        if let Some(profile) = profile {
            self.emit(EntityKind::Profile, ChangeOp::Update, &profile);
        }
    }

    pub async fn messages(&self, conversation_id: Uuid) -> Vec<ChatMessage> {
        let tables = self.tables.read().await;
        let mut messages: Vec<ChatMessage> = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        messages
    }

    pub async fn reactions(&self) -> Vec<Reaction> {
        self.tables.read().await.reactions.clone()
    }

    pub async fn notifications(&self) -> Vec<GroupNotification> {
        self.tables.read().await.notifications.clone()
    }

    pub async fn read_cursor(&self, conversation_id: Uuid, user_id: Uuid) -> Option<ReadCursor> {
        self.tables.read().await.cursors.get(&(conversation_id, user_id)).cloned()
    }

    pub async fn typing_state(&self, conversation_id: Uuid, user_id: Uuid) -> Option<TypingState> {
        self.tables.read().await.typing.get(&(conversation_id, user_id)).cloned()
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.tables.read().await.objects.get(&format!("{}/{}", bucket, key)).cloned()
    }

    /// Verification code emailed on sign-up
    pub async fn pending_code(&self, email: &str) -> Option<String> {
        let tables = self.tables.read().await;
        tables.accounts.get(email).and_then(|a| a.pending_code.clone())
    }

    /// Record the call, then apply connectivity and injected failures
    async fn enter(&self, method: &str) -> Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(method.to_string()).or_insert(0) += 1;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NetworkUnavailable("backend offline".to_string()));
        }
        let injected = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.get_mut(method).and_then(|queue| queue.pop_front()));
        match injected {
            Some(InjectedFailure::Hang) => {
                std::future::pending::<()>().await;
                Err(InjectedFailure::Hang.into_error(method))
            }
            Some(failure) => Err(failure.into_error(method)),
            None => Ok(()),
        }
    }

    /// Publish a change; returns the number of live subscribers
    fn emit<T: Serialize>(&self, entity: EntityKind, op: ChangeOp, row: &T) -> usize {
        match ChangeEvent::from_row(entity, op, row) {
            Ok(event) => match self.feed.send(event) {
                Ok(count) => count,
                Err(e) => {
                    tracing::debug!("[STORE] no subscribers for {} change: {}", entity.table(), e);
                    0
                }
            },
            Err(e) => {
                tracing::warn!("[STORE] failed to encode {} change: {}", entity.table(), e);
                0
            }
        }
    }
}

#[async_trait]
impl BackendService for MemoryBackend {
    async fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.enter("get_conversation").await?;
        let tables = self.tables.read().await;
        tables
            .conversations
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::not_found(format!("conversation {}", id)))
    }

    async fn list_conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.enter("list_conversations_for").await?;
        let tables = self.tables.read().await;
        let mut seen = HashSet::new();
        let mut conversations: Vec<Conversation> = tables
            .participants
            .iter()
            .filter(|p| p.user_id == user_id && seen.insert(p.conversation_id))
            .filter_map(|p| tables.conversations.get(&p.conversation_id).cloned())
            .collect();
        conversations.sort_by_key(|c| c.created_at);
        Ok(conversations)
    }

    async fn create_conversation(&self, request: &CreateConversationRequest) -> Result<Conversation> {
        self.enter("create_conversation").await?;
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4(),
            is_group: request.is_group,
            group_name: request.group_name.clone(),
            avatar_url: None,
            created_by: Some(request.created_by),
            created_at: now,
            updated_at: Some(now),
        };
        self.tables
            .write()
            .await
            .conversations
            .insert(conversation.id, conversation.clone());
        self.emit(EntityKind::Conversation, ChangeOp::Insert, &conversation);
        Ok(conversation)
    }

    async fn delete_conversation(&self, id: Uuid) -> Result<()> {
        self.enter("delete_conversation").await?;
        let removed = {
            let mut tables = self.tables.write().await;
            let removed = tables.conversations.remove(&id);
            if removed.is_some() {
                tables.participants.retain(|p| p.conversation_id != id);
                let gone: HashSet<MessageId> = tables
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == id)
                    .map(|m| m.id.clone())
                    .collect();
                tables.messages.retain(|m| m.conversation_id != id);
                tables.reactions.retain(|r| !gone.contains(&r.message_id));
                tables.cursors.retain(|(conv, _), _| *conv != id);
                tables.typing.retain(|(conv, _), _| *conv != id);
                tables.favourites.retain(|(_, conv)| *conv != id);
            }
            removed
        };
        match removed {
            Some(conversation) => {
                self.emit(EntityKind::Conversation, ChangeOp::Delete, &conversation);
                Ok(())
            }
            None => Err(SyncError::not_found(format!("conversation {}", id))),
        }
    }

    async fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        self.enter("list_participants").await?;
        let tables = self.tables.read().await;
        if !tables.conversations.contains_key(&conversation_id) {
            return Err(SyncError::not_found(format!("conversation {}", conversation_id)));
        }
        Ok(tables
            .participants
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn add_participants(&self, rows: &[Participant]) -> Result<()> {
        self.enter("add_participants").await?;
        let mut added = Vec::new();
        {
            let mut tables = self.tables.write().await;
            for row in rows {
                if !tables.conversations.contains_key(&row.conversation_id) {
                    return Err(SyncError::not_found(format!("conversation {}", row.conversation_id)));
                }
                let exists = tables
                    .participants
                    .iter()
                    .any(|p| p.conversation_id == row.conversation_id && p.user_id == row.user_id);
                if !exists {
                    tables.participants.push(row.clone());
                    added.push(row.clone());
                }
            }
        }
        for row in &added {
            self.emit(EntityKind::Participant, ChangeOp::Insert, row);
        }
        Ok(())
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.enter("remove_participant").await?;
        let removed = {
            let mut tables = self.tables.write().await;
            let position = tables
                .participants
                .iter()
                .position(|p| p.conversation_id == conversation_id && p.user_id == user_id);
            position.map(|i| tables.participants.remove(i))
        };
        match removed {
            Some(row) => {
                self.emit(EntityKind::Participant, ChangeOp::Delete, &row);
                Ok(())
            }
            None => Err(SyncError::not_found(format!("participant {} in {}", user_id, conversation_id))),
        }
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>> {
        self.enter("list_messages").await?;
        if !self.tables.read().await.conversations.contains_key(&conversation_id) {
            return Err(SyncError::not_found(format!("conversation {}", conversation_id)));
        }
        Ok(self.messages(conversation_id).await)
    }

    async fn latest_message(&self, conversation_id: Uuid) -> Result<Option<ChatMessage>> {
        self.enter("latest_message").await?;
        Ok(self.messages(conversation_id).await.pop())
    }

    async fn insert_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        self.enter("insert_message").await?;
        let message = {
            let mut tables = self.tables.write().await;
            if !tables.conversations.contains_key(&request.conversation_id) {
                return Err(SyncError::not_found(format!("conversation {}", request.conversation_id)));
            }
            let member = tables
                .participants
                .iter()
                .any(|p| p.conversation_id == request.conversation_id && p.user_id == request.sender_id);
            if !member {
                return Err(SyncError::permission_denied("sender is not a participant"));
            }
            let message = request.to_optimistic(MessageId::from(Uuid::new_v4()), Utc::now());
            tables.messages.push(message.clone());
            message
        };
        self.emit(EntityKind::Message, ChangeOp::Insert, &message);
        Ok(message)
    }

    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        self.enter("count_unread").await?;
        let tables = self.tables.read().await;
        let count = tables
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id && m.sender_id != user_id)
            .filter(|m| after.map_or(true, |cursor| m.created_at > cursor))
            .count();
        Ok(count as u32)
    }

    async fn list_reactions(&self, message_ids: &[MessageId]) -> Result<Vec<Reaction>> {
        self.enter("list_reactions").await?;
        let wanted: HashSet<&MessageId> = message_ids.iter().collect();
        let tables = self.tables.read().await;
        Ok(tables
            .reactions
            .iter()
            .filter(|r| wanted.contains(&r.message_id))
            .cloned()
            .collect())
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.enter("insert_reaction").await?;
        {
            let mut tables = self.tables.write().await;
            if !tables.messages.iter().any(|m| m.id == reaction.message_id) {
                return Err(SyncError::not_found(format!("message {}", reaction.message_id)));
            }
            if tables.reactions.contains(reaction) {
                return Err(SyncError::Conflict("reaction already exists".to_string()));
            }
            tables.reactions.push(reaction.clone());
        }
        self.emit(EntityKind::Reaction, ChangeOp::Insert, reaction);
        Ok(())
    }

    async fn delete_reaction(&self, reaction: &Reaction) -> Result<()> {
        self.enter("delete_reaction").await?;
        let removed = {
            let mut tables = self.tables.write().await;
            let before = tables.reactions.len();
            tables.reactions.retain(|r| r != reaction);
            before != tables.reactions.len()
        };
        if !removed {
            return Err(SyncError::not_found("reaction"));
        }
        self.emit(EntityKind::Reaction, ChangeOp::Delete, reaction);
        Ok(())
    }

    async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>> {
        self.enter("get_profiles").await?;
        let tables = self.tables.read().await;
        Ok(ids.iter().filter_map(|id| tables.profiles.get(id).cloned()).collect())
    }

    async fn upsert_typing(&self, state: &TypingState) -> Result<()> {
        self.enter("upsert_typing").await?;
        let existed = self
            .tables
            .write()
            .await
            .typing
            .insert((state.conversation_id, state.user_id), state.clone())
            .is_some();
        let op = if existed { ChangeOp::Update } else { ChangeOp::Insert };
        self.emit(EntityKind::Typing, op, state);
        Ok(())
    }

    async fn list_read_cursors(&self, conversation_id: Uuid) -> Result<Vec<ReadCursor>> {
        self.enter("list_read_cursors").await?;
        let tables = self.tables.read().await;
        Ok(tables
            .cursors
            .values()
            .filter(|c| c.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn upsert_read_cursor(&self, cursor: &ReadCursor) -> Result<()> {
        self.enter("upsert_read_cursor").await?;
        let existed = self
            .tables
            .write()
            .await
            .cursors
            .insert((cursor.conversation_id, cursor.user_id), cursor.clone())
            .is_some();
        let op = if existed { ChangeOp::Update } else { ChangeOp::Insert };
        self.emit(EntityKind::ReadCursor, op, cursor);
        Ok(())
    }

    async fn list_favourites(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.enter("list_favourites").await?;
        let tables = self.tables.read().await;
        Ok(tables
            .favourites
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, conv)| *conv)
            .collect())
    }

    async fn set_favourite(&self, user_id: Uuid, conversation_id: Uuid, favourite: bool) -> Result<()> {
        self.enter("set_favourite").await?;
        let row = serde_json::json!({ "user_id": user_id, "conversation_id": conversation_id });
        let changed = {
            let mut tables = self.tables.write().await;
            if favourite {
                tables.favourites.insert((user_id, conversation_id))
            } else {
                tables.favourites.remove(&(user_id, conversation_id))
            }
        };
        if changed {
            let op = if favourite { ChangeOp::Insert } else { ChangeOp::Delete };
            self.emit(EntityKind::Favourite, op, &row);
        }
        Ok(())
    }

    async fn list_blocked(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        self.enter("list_blocked").await?;
        let tables = self.tables.read().await;
        Ok(tables
            .blocked
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, blocked)| *blocked)
            .collect())
    }

    async fn set_blocked(&self, user_id: Uuid, blocked_id: Uuid, blocked: bool) -> Result<()> {
        self.enter("set_blocked").await?;
        let row = serde_json::json!({ "blocker_id": user_id, "blocked_id": blocked_id });
        let changed = {
            let mut tables = self.tables.write().await;
            if blocked {
                tables.blocked.insert((user_id, blocked_id))
            } else {
                tables.blocked.remove(&(user_id, blocked_id))
            }
        };
        if changed {
            let op = if blocked { ChangeOp::Insert } else { ChangeOp::Delete };
            self.emit(EntityKind::Block, op, &row);
        }
        Ok(())
    }

    async fn insert_group_notifications(&self, rows: &[GroupNotification]) -> Result<()> {
        self.enter("insert_group_notifications").await?;
        self.tables.write().await.notifications.extend(rows.iter().cloned());
        for row in rows {
            self.emit(EntityKind::GroupNotification, ChangeOp::Insert, row);
        }
        Ok(())
    }

    async fn upload(&self, bucket: &str, key: &str, bytes: Bytes, _content_type: &str) -> Result<String> {
        self.enter("upload").await?;
        let path = format!("{}/{}", bucket, key);
        self.tables.write().await.objects.insert(path.clone(), bytes);
        Ok(format!("memory://storage/{}", path))
    }

    async fn subscribe(&self, entity: EntityKind, filter: Option<RowFilter>) -> Result<ChangeStream> {
        self.enter("subscribe").await?;
        let mut epoch = self.epoch.subscribe();
        let stream = BroadcastStream::new(self.feed.subscribe())
            .filter_map(move |item| {
                let out = match item {
                    Ok(event) if event.entity == entity => match &filter {
                        Some(f) if !f.matches(&event.row) => None,
                        _ => Some(Ok(event)),
                    },
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(SyncError::NetworkUnavailable(
                        format!("change feed lagged by {} events", n),
                    ))),
                };
                futures_util::future::ready(out)
            })
            .take_until(async move {
                let _ = epoch.changed().await;
            });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl AuthProvider for MemoryBackend {
    async fn sign_up(&self, request: &SignUpRequest) -> Result<()> {
        self.enter("sign_up").await?;
        if request.password.len() < 6 {
            return Err(SyncError::validation("password must be at least 6 characters"));
        }
        let mut tables = self.tables.write().await;
        if tables.accounts.contains_key(&request.email) {
            return Err(SyncError::Conflict("email already registered".to_string()));
        }
        let user_id = Uuid::new_v4();
        let code = format!("{:04}", rand::thread_rng().gen_range(0..10_000));
        tables.accounts.insert(
            request.email.clone(),
            Account {
                user_id,
                password: request.password.clone(),
                verified: false,
                pending_code: Some(code),
            },
        );
        tables.profiles.insert(
            user_id,
            Profile {
                id: user_id,
                username: request.username.clone(),
                full_name: request.full_name.clone(),
                avatar_url: None,
                is_online: false,
                last_seen: None,
            },
        );
        Ok(())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        self.enter("sign_in").await?;
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .get(email)
            .filter(|a| a.password == password)
            .ok_or_else(|| SyncError::permission_denied("invalid login credentials"))?;
        if !account.verified {
            return Err(SyncError::permission_denied("email not confirmed"));
        }
        let session = new_session(account.user_id);
        tables.session = Some(session.clone());
        Ok(session)
    }

    async fn verify_otp(&self, email: &str, code: &str) -> Result<Session> {
        super::validate_otp_code(code)?;
        self.enter("verify_otp").await?;
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .get_mut(email)
            .ok_or_else(|| SyncError::not_found(format!("account {}", email)))?;
        if account.pending_code.as_deref() != Some(code) {
            return Err(SyncError::permission_denied("invalid verification code"));
        }
        account.pending_code = None;
        account.verified = true;
        let session = new_session(account.user_id);
        tables.session = Some(session.clone());
        Ok(session)
    }

    async fn reset_password(&self, email: &str) -> Result<()> {
        self.enter("reset_password").await?;
        tracing::debug!("[STORE] password reset requested for {}", email);
        Ok(())
    }

    async fn session(&self) -> Result<Option<Session>> {
        Ok(self.tables.read().await.session.clone())
    }

    async fn sign_out(&self) -> Result<()> {
        self.tables.write().await.session = None;
        Ok(())
    }
}

fn new_session(user_id: Uuid) -> Session {
    Session {
        access_token: Uuid::new_v4().simple().to_string(),
        user_id,
        expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn seeded() -> (MemoryBackend, Uuid, Uuid) {
        let backend = MemoryBackend::new();
        let conv = Uuid::new_v4();
        let user = Uuid::new_v4();
        backend
            .seed_conversation(
                Conversation {
                    id: conv,
                    is_group: false,
                    group_name: None,
                    avatar_url: None,
                    created_by: Some(user),
                    created_at: Utc::now(),
                    updated_at: None,
                },
                &[Participant::member(conv, user)],
            )
            .await;
        (backend, conv, user)
    }

    #[tokio::test]
    async fn test_insert_message_publishes_change() {
        let (backend, conv, user) = seeded().await;
        let mut stream = backend
            .subscribe(EntityKind::Message, Some(RowFilter::eq("conversation_id", conv)))
            .await
            .unwrap();

        let stored = backend
            .insert_message(&SendMessageRequest::text(conv, user, "hello"))
            .await
            .unwrap();
        assert!(!stored.id.is_temporary());

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.op, ChangeOp::Insert);
        assert_eq!(event.row["content"], "hello");
    }

    #[tokio::test]
    async fn test_filter_excludes_other_conversations() {
        let (backend, conv, user) = seeded().await;
        let mut stream = backend
            .subscribe(EntityKind::Message, Some(RowFilter::eq("conversation_id", Uuid::new_v4())))
            .await
            .unwrap();
        backend
            .insert_message(&SendMessageRequest::text(conv, user, "hello"))
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn test_non_participant_cannot_send() {
        let (backend, conv, _) = seeded().await;
        let err = backend
            .insert_message(&SendMessageRequest::text(conv, Uuid::new_v4(), "hi"))
            .await
            .unwrap_err();
        assert_matches!(err, SyncError::PermissionDenied(_));
    }

    #[tokio::test]
    async fn test_duplicate_reaction_conflicts() {
        let (backend, conv, user) = seeded().await;
        let msg = backend
            .insert_message(&SendMessageRequest::text(conv, user, "hi"))
            .await
            .unwrap();
        let reaction = Reaction::new(msg.id.clone(), user, "👍");
        backend.insert_reaction(&reaction).await.unwrap();
        assert_matches!(backend.insert_reaction(&reaction).await, Err(SyncError::Conflict(_)));
        backend.delete_reaction(&reaction).await.unwrap();
        assert_matches!(backend.delete_reaction(&reaction).await, Err(SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed_once() {
        let (backend, conv, user) = seeded().await;
        backend.fail_next("insert_message", InjectedFailure::Network);
        let request = SendMessageRequest::text(conv, user, "hi");
        assert_matches!(backend.insert_message(&request).await, Err(SyncError::NetworkUnavailable(_)));
        assert!(backend.insert_message(&request).await.is_ok());
        assert_eq!(backend.call_count("insert_message"), 2);
    }

    #[tokio::test]
    async fn test_drop_subscriptions_ends_streams() {
        let (backend, _, _) = seeded().await;
        let mut stream = backend.subscribe(EntityKind::Typing, None).await.unwrap();
        backend.drop_subscriptions();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_offline_rejects_calls() {
        let (backend, conv, _) = seeded().await;
        backend.set_offline(true);
        assert_matches!(backend.list_messages(conv).await, Err(SyncError::NetworkUnavailable(_)));
        backend.set_offline(false);
        assert!(backend.list_messages(conv).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let (backend, conv, user) = seeded().await;
        let msg = backend
            .insert_message(&SendMessageRequest::text(conv, user, "hi"))
            .await
            .unwrap();
        backend.insert_reaction(&Reaction::new(msg.id, user, "🔥")).await.unwrap();
        backend.delete_conversation(conv).await.unwrap();

        assert!(backend.messages(conv).await.is_empty());
        assert!(backend.reactions().await.is_empty());
        assert_matches!(backend.get_conversation(conv).await, Err(SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sign_up_verify_sign_in() {
        let backend = MemoryBackend::new();
        let request = SignUpRequest {
            email: "alice@example.com".to_string(),
            password: "secret123".to_string(),
            username: "alice".to_string(),
            full_name: None,
        };
        backend.sign_up(&request).await.unwrap();
        assert_matches!(
            backend.sign_in("alice@example.com", "secret123").await,
            Err(SyncError::PermissionDenied(_))
        );

        let code = backend.pending_code("alice@example.com").await.unwrap();
        let session = backend.verify_otp("alice@example.com", &code).await.unwrap();
        assert_eq!(backend.session().await.unwrap(), Some(session.clone()));

        let profiles = backend.get_profiles(&[session.user_id]).await.unwrap();
        assert_eq!(profiles[0].username, "alice");

        backend.sign_out().await.unwrap();
        assert!(backend.session().await.unwrap().is_none());
        assert!(backend.sign_in("alice@example.com", "secret123").await.is_ok());
    }
}
