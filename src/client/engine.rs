//! # Sync Engine
//!
//! Single owner of the local state store. Every mutation, local or remote,
//! funnels through one `&mut self` so the store never sees two writers:
//!
//! - UI operations (`send_message`, `toggle_reaction`, `mark_viewed`, ...)
//!   validate, apply optimistically and hand the write to the outbox
//! - Background tasks (event bus subscriptions, outbox lanes, tracker
//!   timers) report back as [`EngineInput`]s on one channel, drained by
//!   [`SyncEngine::process_next`]
//!
//! Outcomes the UI has to react to beyond store changes (removal from a
//! conversation, failed sends, connection status) are broadcast as
//! [`EngineSignal`]s.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::client::backend::BackendService;
use crate::client::error::{with_timeout, Result, SyncError};
use crate::client::event_bus::{BusMessage, EventBus, SubscriptionStatus};
use crate::client::local_db::LocalDatabase;
use crate::client::outbox::optimistic::OptimisticManager;
use crate::client::outbox::queue::{OperationQueue, OperationStatus, QueueStats};
use crate::client::outbox::{
    attachment_key, content_type_for, Outbox, OutboxCommand, OutboxOutcome, PendingUpload,
    PresenceCommand, ATTACHMENT_BUCKET,
};
use crate::client::reconciler::{Applied, Reconciler};
use crate::client::retry::{BackoffStrategy, RetryPolicy};
use crate::client::store::{ConversationState, EntryState, LocalStateStore, MessageEntry, StoreChange};
use crate::client::tracker::{self, Tracker};
use crate::shared::config::AppConfig;
use crate::shared::event::{ChangeEvent, EntityKind};
use crate::shared::messaging::{
    ChatMessage, Conversation, ConversationKind, ConversationSummary, CreateConversationRequest,
    GroupNotification, MessageId, MessageType, Participant, Reaction, ReactionCount, ReadCursor,
    ReadStatus, SendMessageRequest, TypingState,
};

/// Name used in system messages when a profile cannot be loaded
const FALLBACK_NAME: &str = "Someone";
const PREVIEW_LEN: usize = 50;
const RESUBSCRIBE_JITTER: f64 = 0.2;

/// Work reported to the engine by its background tasks
#[derive(Debug)]
pub enum EngineInput {
    Bus {
        conversation_id: Uuid,
        message: BusMessage,
    },
    Outbox(OutboxOutcome),
    /// A debounced read cursor fell due
    CursorDue(Uuid),
    /// The typing quiet timer of `generation` fired
    TypingQuiet { conversation_id: Uuid, generation: u64 },
}

/// Notifications for the UI layer
#[derive(Debug, Clone, PartialEq)]
pub enum EngineSignal {
    /// The local user was removed; the conversation is closed locally
    RemovedFromConversation(Uuid),
    ConversationDeleted(Uuid),
    /// A snapshot was re-applied after (re)connecting
    Resynced(Uuid),
    ConnectionChanged {
        conversation_id: Uuid,
        status: SubscriptionStatus,
    },
    SendFailed {
        conversation_id: Uuid,
        temp_id: MessageId,
        error: String,
    },
    ActionFailed {
        conversation_id: Option<Uuid>,
        action: String,
        error: String,
    },
}

/// Client-side synchronization engine for one signed-in user
pub struct SyncEngine {
    config: AppConfig,
    local_user: Uuid,
    backend: Arc<dyn BackendService>,
    local_db: LocalDatabase,
    store: LocalStateStore,
    reconciler: Reconciler,
    tracker: Tracker,
    outbox: Outbox,
    queue: OperationQueue,
    optimistic: OptimisticManager,
    bus: EventBus,
    inbound: mpsc::UnboundedReceiver<EngineInput>,
    signals: broadcast::Sender<EngineSignal>,
    blocked: HashSet<Uuid>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("local_user", &self.local_user)
            .field("open", &self.store.conversation_ids())
            .field("queue", &self.queue.stats())
            .finish()
    }
}

impl SyncEngine {
    /// Validate the configuration and spawn the background lanes
    pub async fn start(
        config: AppConfig,
        backend: Arc<dyn BackendService>,
        local_db: LocalDatabase,
        local_user: Uuid,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let backoff = BackoffStrategy::exponential(config.resubscribe_base_delay, config.resubscribe_max_delay)
            .with_jitter(RESUBSCRIBE_JITTER);
        let outbox = Outbox::start(backend.clone(), config.request_timeout, RetryPolicy::default(), tx.clone());
        let bus = EventBus::new(backend.clone(), backoff, tx.clone());
        let tracker = Tracker::new(config.read_debounce, config.typing_quiet_period, tx);
        let (signals, _) = broadcast::channel(config.event_buffer);

        let blocked = match with_timeout(config.request_timeout, backend.list_blocked(local_user)).await {
            Ok(list) => list.into_iter().collect(),
            Err(e) => {
                tracing::warn!("[SYNC] could not load blocked users: {}", e);
                HashSet::new()
            }
        };

        tracing::info!("[SYNC] engine started for user {}", local_user);
        Ok(Self {
            reconciler: Reconciler::new(local_user, config.optimistic_match_window),
            store: LocalStateStore::new(config.event_buffer),
            config,
            local_user,
            backend,
            local_db,
            tracker,
            outbox,
            queue: OperationQueue::new(),
            optimistic: OptimisticManager::new(),
            bus,
            inbound,
            signals,
            blocked,
        })
    }

    pub fn local_user(&self) -> Uuid {
        self.local_user
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<EngineSignal> {
        self.signals.subscribe()
    }

    /// Copy of an open conversation's state
    pub fn snapshot(&self, conversation_id: Uuid) -> Option<ConversationState> {
        self.store.snapshot(conversation_id)
    }

    pub fn is_open(&self, conversation_id: Uuid) -> bool {
        self.store.contains(conversation_id)
    }

    pub fn pending_sends(&self) -> QueueStats {
        self.queue.stats()
    }

    fn signal(&self, signal: EngineSignal) {
        tracing::debug!("[SYNC] signal {:?}", signal);
        let _ = self.signals.send(signal);
    }

    fn partition(&self, conversation_id: Uuid) -> Result<&ConversationState> {
        self.store
            .get(conversation_id)
            .ok_or_else(|| SyncError::not_found(format!("conversation {} is not open", conversation_id)))
    }

    fn partition_mut(&mut self, conversation_id: Uuid) -> Result<&mut ConversationState> {
        self.store
            .get_mut(conversation_id)
            .ok_or_else(|| SyncError::not_found(format!("conversation {} is not open", conversation_id)))
    }

    // ---- background inputs ----

    /// Wait for the next background input and apply it. Returns false once
    /// every producer is gone.
    pub async fn process_next(&mut self) -> bool {
        match self.inbound.recv().await {
            Some(input) => {
                self.handle_input(input).await;
                true
            }
            None => false,
        }
    }

    /// Apply every input that is already queued
    pub async fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inbound.try_recv() {
            self.handle_input(input).await;
            handled += 1;
        }
        handled
    }

    /// Apply inputs until none arrives for `quiet`
    pub async fn settle(&mut self, quiet: Duration) -> usize {
        let mut handled = 0;
        while let Ok(Some(input)) = tokio::time::timeout(quiet, self.inbound.recv()).await {
            self.handle_input(input).await;
            handled += 1;
        }
        handled
    }

    async fn handle_input(&mut self, input: EngineInput) {
        match input {
            EngineInput::Bus { conversation_id, message } => match message {
                BusMessage::Status(status) => self.handle_status(conversation_id, status).await,
                BusMessage::Event(event) => self.handle_event(conversation_id, event).await,
            },
            EngineInput::Outbox(outcome) => self.handle_outcome(outcome).await,
            EngineInput::CursorDue(conversation_id) => {
                if let Some(at) = self.tracker.cursor_due(conversation_id) {
                    self.write_cursor(conversation_id, at);
                }
            }
            EngineInput::TypingQuiet {
                conversation_id,
                generation,
            } => {
                if self.tracker.typing_quiet(conversation_id, generation) {
                    self.broadcast_typing(conversation_id, false);
                }
            }
        }
    }

    async fn handle_status(&mut self, conversation_id: Uuid, status: SubscriptionStatus) {
        if !self.bus.is_subscribed(conversation_id) {
            return;
        }
        let resync = status == SubscriptionStatus::Connected && self.store.contains(conversation_id);
        self.signal(EngineSignal::ConnectionChanged {
            conversation_id,
            status,
        });
        if resync {
            self.resync(conversation_id).await;
        }
    }

    /// Re-apply a fresh snapshot; events missed while disconnected are not
    /// replayed by the backend.
    async fn resync(&mut self, conversation_id: Uuid) {
        tracing::info!("[SYNC] resnapshot of {} after (re)connect", conversation_id);
        match self.load_snapshot(conversation_id).await {
            Ok(()) => self.signal(EngineSignal::Resynced(conversation_id)),
            Err(SyncError::NotFound(_)) => {
                self.drop_conversation(conversation_id);
                self.signal(EngineSignal::ConversationDeleted(conversation_id));
            }
            Err(SyncError::PermissionDenied(_)) => {
                self.drop_conversation(conversation_id);
                self.signal(EngineSignal::RemovedFromConversation(conversation_id));
            }
            Err(e) => tracing::warn!("[SYNC] resnapshot of {} failed, view may be stale: {}", conversation_id, e),
        }
    }

    async fn handle_event(&mut self, conversation_id: Uuid, event: ChangeEvent) {
        if !self.store.contains(conversation_id) {
            return;
        }
        // The local toggle owns the reaction until its write settles
        if event.entity == EntityKind::Reaction {
            if let Ok(reaction) = event.decode::<Reaction>() {
                if reaction.user_id == self.local_user
                    && self.optimistic.is_toggle_pending(&reaction.message_id, &reaction.emoji)
                {
                    tracing::debug!("[SYNC] skipping echo of pending reaction on {}", reaction.message_id);
                    return;
                }
            }
        }

        match self.reconciler.apply_event(&mut self.store, conversation_id, &event) {
            Ok(Applied::NeedsProfile(user_id)) => self.load_profile(conversation_id, user_id).await,
            Ok(Applied::RemovedFromConversation) => {
                self.drop_conversation(conversation_id);
                self.signal(EngineSignal::RemovedFromConversation(conversation_id));
            }
            Ok(Applied::ConversationDeleted) => {
                self.drop_conversation(conversation_id);
                self.signal(EngineSignal::ConversationDeleted(conversation_id));
            }
            Ok(Applied::EchoConfirmed(temp_id)) => self.retire_send(&temp_id),
            Ok(Applied::Changed) | Ok(Applied::Unchanged) => {}
            Err(e) => tracing::warn!(
                "[SYNC] could not apply {} event in {}: {}",
                event.entity.table(),
                conversation_id,
                e
            ),
        }
    }

    async fn load_profile(&mut self, conversation_id: Uuid, user_id: Uuid) {
        let profiles = match with_timeout(self.config.request_timeout, self.backend.get_profiles(&[user_id])).await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!("[SYNC] could not load profile {}: {}", user_id, e);
                return;
            }
        };
        let Some(partition) = self.store.get_mut(conversation_id) else {
            return;
        };
        let mut changed = false;
        for profile in profiles {
            changed |= partition.set_profile(profile);
        }
        if changed {
            self.store.notify(StoreChange::ProfileChanged {
                conversation_id,
                user_id,
            });
        }
    }

    async fn handle_outcome(&mut self, outcome: OutboxOutcome) {
        match outcome {
            OutboxOutcome::Uploaded { temp_id, file_url } => {
                let conversation_id = self.queue.get(&temp_id).map(|op| op.request.conversation_id);
                self.queue.mark_uploaded(&temp_id, file_url.clone());
                let Some(conversation_id) = conversation_id else {
                    return;
                };
                let Some(partition) = self.store.get_mut(conversation_id) else {
                    return;
                };
                if let Some(mut entry) = partition.message(&temp_id).cloned() {
                    entry.message.file_url = Some(file_url);
                    partition.upsert_message(entry);
                    self.store.notify(StoreChange::MessageUpserted {
                        conversation_id,
                        message_id: temp_id,
                    });
                }
            }
            OutboxOutcome::Confirmed { temp_id, message } => {
                self.queue.complete(&temp_id);
                let conversation_id = message.conversation_id;
                let body = message.content.clone();
                self.reconciler.confirm_send(&mut self.store, &temp_id, message);
                if let Some(body) = body {
                    self.clear_sent_draft(conversation_id, &body).await;
                }
            }
            OutboxOutcome::SendFailed {
                conversation_id,
                temp_id,
                error,
            } => self.mark_send_failed(conversation_id, temp_id, error),
            OutboxOutcome::ReactionSettled {
                conversation_id,
                reaction,
                add,
                generation,
                error,
            } => self.settle_reaction(conversation_id, reaction, add, generation, error),
        }
    }

    async fn clear_sent_draft(&mut self, conversation_id: Uuid, body: &str) {
        match self.local_db.clear_draft_if(conversation_id, self.local_user, body).await {
            Ok(true) => {
                if let Some(partition) = self.store.get_mut(conversation_id) {
                    partition.set_draft(None);
                    self.store.notify(StoreChange::DraftChanged { conversation_id });
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("[STORE] could not clear draft of {}: {}", conversation_id, e),
        }
    }

    fn mark_send_failed(&mut self, conversation_id: Uuid, temp_id: MessageId, error: SyncError) {
        let reason = error.to_string();
        if !self.queue.fail(&temp_id, reason.clone()) {
            // the row reached the backend after all
            tracing::debug!("[OUTBOX] late failure of {} ignored: {}", temp_id, reason);
            return;
        }
        tracing::error!("[OUTBOX] message {} in {} failed: {}", temp_id, conversation_id, reason);
        if let Some(partition) = self.store.get_mut(conversation_id) {
            let state = EntryState::Failed { reason: reason.clone() };
            if partition.set_entry_state(&temp_id, state) {
                self.store.notify(StoreChange::MessageUpserted {
                    conversation_id,
                    message_id: temp_id.clone(),
                });
            }
        }
        self.signal(EngineSignal::SendFailed {
            conversation_id,
            temp_id,
            error: reason,
        });
    }

    fn settle_reaction(
        &mut self,
        conversation_id: Uuid,
        reaction: Reaction,
        add: bool,
        generation: u64,
        error: Option<SyncError>,
    ) {
        let resolution = self.optimistic.finish_toggle(&reaction.message_id, &reaction.emoji, generation);
        let Some(error) = error else {
            return;
        };
        tracing::warn!(
            "[OUTBOX] reaction {} on {} failed: {}",
            reaction.emoji,
            reaction.message_id,
            error
        );
        // A newer toggle of the same pair decides the final state
        if !resolution.is_latest {
            return;
        }

        let message_gone = matches!(error, SyncError::NotFound(_)) && add;
        if let Some(partition) = self.store.get_mut(conversation_id) {
            if message_gone {
                if partition.remove_message(&reaction.message_id).is_some() {
                    self.store.notify(StoreChange::MessageRemoved {
                        conversation_id,
                        message_id: reaction.message_id.clone(),
                    });
                }
            } else {
                let reverted = if add {
                    partition.remove_reaction(&reaction)
                } else {
                    partition.add_reaction(reaction.clone())
                };
                if reverted {
                    self.store.notify(StoreChange::ReactionsChanged {
                        conversation_id,
                        message_id: reaction.message_id.clone(),
                    });
                }
            }
        }
        self.signal(EngineSignal::ActionFailed {
            conversation_id: Some(conversation_id),
            action: "toggle_reaction".to_string(),
            error: error.to_string(),
        });
    }

    fn write_cursor(&self, conversation_id: Uuid, at: DateTime<Utc>) {
        let cursor = ReadCursor {
            conversation_id,
            user_id: self.local_user,
            last_viewed_at: at,
        };
        if let Err(e) = self.outbox.submit_presence(PresenceCommand::Cursor(cursor)) {
            tracing::warn!("[SYNC] could not queue cursor write: {}", e);
        }
    }

    fn broadcast_typing(&self, conversation_id: Uuid, is_typing: bool) {
        let state = TypingState {
            conversation_id,
            user_id: self.local_user,
            is_typing,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.outbox.submit_presence(PresenceCommand::Typing(state)) {
            tracing::warn!("[SYNC] could not queue typing update: {}", e);
        }
    }

    // ---- conversation lifecycle ----

    /// Subscribe to a conversation and load its snapshot. Idempotent.
    pub async fn open_conversation(&mut self, conversation_id: Uuid) -> Result<()> {
        if self.store.contains(conversation_id) {
            return Ok(());
        }
        tracing::info!("[SYNC] opening conversation {}", conversation_id);
        self.bus.subscribe(conversation_id);

        if let Err(e) = self.load_snapshot(conversation_id).await {
            tracing::warn!("[SYNC] could not open {}: {}", conversation_id, e);
            self.drop_conversation(conversation_id);
            return Err(e);
        }

        match self.local_db.get_draft(conversation_id, self.local_user).await {
            Ok(Some(draft)) => {
                if let Some(partition) = self.store.get_mut(conversation_id) {
                    partition.set_draft(Some(draft));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[STORE] could not load draft of {}: {}", conversation_id, e),
        }
        Ok(())
    }

    /// Fetch the authoritative state of a conversation and replace its
    /// partition. Optimistic entries without a confirmed row survive.
    pub async fn load_snapshot(&mut self, conversation_id: Uuid) -> Result<()> {
        let snapshot = self
            .reconciler
            .fetch_snapshot(self.backend.as_ref(), conversation_id, self.config.request_timeout)
            .await?;
        let local_cursor = match self.local_db.get_cursor(conversation_id, self.local_user).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!("[STORE] could not read local cursor of {}: {}", conversation_id, e);
                None
            }
        };
        let claimed = self.reconciler.apply_snapshot(&mut self.store, snapshot, local_cursor);
        for temp_id in &claimed {
            self.retire_send(temp_id);
        }
        Ok(())
    }

    /// The backend holds the row of a queued send; nothing is left to
    /// retry or discard
    fn retire_send(&mut self, temp_id: &MessageId) {
        if self.queue.complete(temp_id).is_some() {
            tracing::debug!("[OUTBOX] {} confirmed by the change feed", temp_id);
        }
    }

    /// Unsubscribe and drop the partition. Sends already queued still
    /// complete; owed presence is flushed.
    pub fn close_conversation(&mut self, conversation_id: Uuid) {
        let owed = self.tracker.close(conversation_id);
        if owed.was_typing {
            self.broadcast_typing(conversation_id, false);
        }
        if let Some(at) = owed.unsent_cursor {
            self.write_cursor(conversation_id, at);
        }
        self.bus.unsubscribe(conversation_id);
        if self.store.close(conversation_id).is_some() {
            tracing::info!("[SYNC] closed conversation {}", conversation_id);
        }
    }

    /// Local teardown after the conversation went away remotely
    fn drop_conversation(&mut self, conversation_id: Uuid) {
        self.bus.unsubscribe(conversation_id);
        self.tracker.close(conversation_id);
        self.store.close(conversation_id);
    }

    // ---- messages ----

    /// Send a text message. Returns the temporary id of the optimistic entry.
    pub async fn send_message(
        &mut self,
        conversation_id: Uuid,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        if content.trim().is_empty() {
            return Err(SyncError::validation("message is empty"));
        }
        let max = self.config.max_message_len;
        if content.chars().count() > max {
            return Err(SyncError::validation(format!("message exceeds {} characters", max)));
        }
        self.check_can_send(conversation_id, reply_to.as_ref())?;

        let mut request = SendMessageRequest::text(conversation_id, self.local_user, content);
        request.reply_to = reply_to;
        Ok(self.enqueue_send(request, None))
    }

    /// Upload an attachment, then send it as an image or file message
    pub async fn send_attachment(
        &mut self,
        conversation_id: Uuid,
        message_type: MessageType,
        file_name: &str,
        bytes: Bytes,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId> {
        if !message_type.is_attachment() {
            return Err(SyncError::validation("attachments must be images or files"));
        }
        if file_name.trim().is_empty() {
            return Err(SyncError::validation("attachment has no file name"));
        }
        if bytes.is_empty() {
            return Err(SyncError::validation("attachment is empty"));
        }
        self.check_can_send(conversation_id, reply_to.as_ref())?;

        let key = attachment_key(conversation_id, self.local_user, file_name, Utc::now().timestamp_millis());
        let upload = PendingUpload {
            bucket: ATTACHMENT_BUCKET.to_string(),
            key,
            bytes,
            content_type: content_type_for(file_name).to_string(),
        };
        let request = SendMessageRequest {
            conversation_id,
            sender_id: self.local_user,
            content: None,
            message_type,
            file_url: None,
            file_name: Some(file_name.to_string()),
            reply_to,
            link_preview: None,
        };
        Ok(self.enqueue_send(request, Some(upload)))
    }

    fn check_can_send(&self, conversation_id: Uuid, reply_to: Option<&MessageId>) -> Result<()> {
        let partition = self.partition(conversation_id)?;
        if partition.kind() == Some(ConversationKind::Direct) {
            if let Some(counterpart) = partition.counterpart(self.local_user) {
                if self.blocked.contains(&counterpart) {
                    return Err(SyncError::permission_denied("you blocked this user"));
                }
            }
        }
        if let Some(parent) = reply_to {
            if parent.is_temporary() {
                return Err(SyncError::validation("cannot reply to an unsent message"));
            }
            if !partition.contains_message(parent) {
                return Err(SyncError::not_found(format!("message {}", parent)));
            }
        }
        Ok(())
    }

    fn enqueue_send(&mut self, request: SendMessageRequest, upload: Option<PendingUpload>) -> MessageId {
        let conversation_id = request.conversation_id;
        let temp_id = self.optimistic.next_temp_id();
        let optimistic = request.to_optimistic(temp_id.clone(), Utc::now());

        if let Some(partition) = self.store.get_mut(conversation_id) {
            partition.upsert_message(MessageEntry::pending(optimistic));
            self.store.notify(StoreChange::MessageUpserted {
                conversation_id,
                message_id: temp_id.clone(),
            });
        }
        if self.tracker.set_typing(conversation_id, false) == Some(false) {
            self.broadcast_typing(conversation_id, false);
        }

        self.queue.enqueue(temp_id.clone(), request.clone(), upload.clone());
        tracing::debug!("[OUTBOX] queued {} for {}", temp_id, conversation_id);
        self.dispatch_send(temp_id.clone(), request, upload);
        temp_id
    }

    fn dispatch_send(&mut self, temp_id: MessageId, request: SendMessageRequest, upload: Option<PendingUpload>) {
        let conversation_id = request.conversation_id;
        let command = OutboxCommand::SendMessage {
            temp_id: temp_id.clone(),
            request,
            upload,
        };
        if let Err(e) = self.outbox.submit(command) {
            self.mark_send_failed(conversation_id, temp_id, e);
        }
    }

    /// Resend a failed message under its original temporary id
    pub fn retry_message(&mut self, temp_id: &MessageId) -> Result<()> {
        self.require_failed(temp_id)?;
        let Some(operation) = self.queue.retry(temp_id) else {
            return Err(SyncError::not_found(format!("queued message {}", temp_id)));
        };

        let conversation_id = operation.request.conversation_id;
        if let Some(partition) = self.store.get_mut(conversation_id) {
            if partition.set_entry_state(temp_id, EntryState::Pending) {
                self.store.notify(StoreChange::MessageUpserted {
                    conversation_id,
                    message_id: temp_id.clone(),
                });
            }
        }
        tracing::info!("[OUTBOX] retrying {} (attempt {})", temp_id, operation.attempts);
        self.dispatch_send(operation.temp_id, operation.request, operation.upload);
        Ok(())
    }

    /// Drop a failed message from the queue and the store
    pub fn discard_message(&mut self, temp_id: &MessageId) -> Result<()> {
        self.require_failed(temp_id)?;
        let Some(operation) = self.queue.complete(temp_id) else {
            return Ok(());
        };
        let conversation_id = operation.request.conversation_id;
        if let Some(partition) = self.store.get_mut(conversation_id) {
            if partition.remove_message(temp_id).is_some() {
                self.store.notify(StoreChange::MessageRemoved {
                    conversation_id,
                    message_id: temp_id.clone(),
                });
            }
        }
        tracing::info!("[OUTBOX] discarded {}", temp_id);
        Ok(())
    }

    fn require_failed(&mut self, temp_id: &MessageId) -> Result<()> {
        let Some(operation) = self.queue.get(temp_id) else {
            return Err(SyncError::not_found(format!("queued message {}", temp_id)));
        };
        if matches!(operation.status, OperationStatus::InFlight) {
            return Err(SyncError::validation("message is still being sent"));
        }
        // An open partition without the entry means its row already arrived
        let conversation_id = operation.request.conversation_id;
        let replaced = self
            .store
            .get(conversation_id)
            .is_some_and(|partition| !partition.contains_message(temp_id));
        if replaced {
            self.retire_send(temp_id);
            return Err(SyncError::not_found(format!("queued message {}", temp_id)));
        }
        Ok(())
    }

    /// Forward a confirmed message into the direct conversation with `to_user`
    pub async fn forward_message(
        &mut self,
        conversation_id: Uuid,
        message_id: &MessageId,
        to_user: Uuid,
    ) -> Result<MessageId> {
        let source = {
            let entry = self
                .partition(conversation_id)?
                .message(message_id)
                .ok_or_else(|| SyncError::not_found(format!("message {}", message_id)))?;
            if entry.is_optimistic() {
                return Err(SyncError::validation("cannot forward an unsent message"));
            }
            entry.message.clone()
        };
        if self.blocked.contains(&to_user) {
            return Err(SyncError::permission_denied("you blocked this user"));
        }

        let target = self.find_or_create_direct(to_user).await?;
        let request = SendMessageRequest {
            conversation_id: target,
            sender_id: self.local_user,
            content: source.content,
            message_type: match source.message_type {
                MessageType::System => MessageType::Text,
                other => other,
            },
            file_url: source.file_url,
            file_name: source.file_name,
            reply_to: None,
            link_preview: source.link_preview,
        };

        if self.store.contains(target) {
            return Ok(self.enqueue_send(request, None));
        }
        let message = with_timeout(self.config.request_timeout, self.backend.insert_message(&request)).await?;
        tracing::info!("[SYNC] forwarded {} to {}", message_id, target);
        Ok(message.id)
    }

    // ---- reactions ----

    /// Flip the local user's reaction. Returns true when the reaction is now
    /// present.
    pub fn toggle_reaction(&mut self, conversation_id: Uuid, message_id: &MessageId, emoji: &str) -> Result<bool> {
        let emoji = emoji.trim();
        if emoji.is_empty() {
            return Err(SyncError::validation("emoji is empty"));
        }
        if message_id.is_temporary() {
            return Err(SyncError::validation("cannot react to an unsent message"));
        }
        let local_user = self.local_user;
        let partition = self.partition_mut(conversation_id)?;
        if !partition.contains_message(message_id) {
            return Err(SyncError::not_found(format!("message {}", message_id)));
        }

        let reaction = Reaction::new(message_id.clone(), local_user, emoji);
        let add = !partition.has_reaction(&reaction);
        if add {
            partition.add_reaction(reaction.clone());
        } else {
            partition.remove_reaction(&reaction);
        }
        self.store.notify(StoreChange::ReactionsChanged {
            conversation_id,
            message_id: message_id.clone(),
        });

        let generation = self.optimistic.begin_toggle(message_id, emoji);
        let command = OutboxCommand::ToggleReaction {
            conversation_id,
            reaction: reaction.clone(),
            add,
            generation,
        };
        if let Err(e) = self.outbox.submit(command) {
            self.settle_reaction(conversation_id, reaction, add, generation, Some(e));
            return Ok(!add);
        }
        Ok(add)
    }

    pub fn reaction_counts(&self, conversation_id: Uuid, message_id: &MessageId) -> Result<Vec<ReactionCount>> {
        Ok(self
            .partition(conversation_id)?
            .reaction_counts(message_id, self.local_user))
    }

    // ---- read state and typing ----

    /// The local user is looking at the newest messages of a conversation
    pub async fn mark_viewed(&mut self, conversation_id: Uuid) -> Result<()> {
        let local_user = self.local_user;
        let partition = self.partition_mut(conversation_id)?;
        let newest = partition.last_confirmed().map(|m| m.created_at);
        let now = Utc::now();
        let at = newest.map_or(now, |newest| newest.max(now));

        if partition.advance_cursor(local_user, at) {
            self.store.notify(StoreChange::CursorMoved {
                conversation_id,
                user_id: local_user,
            });
        }
        self.local_db.advance_cursor(conversation_id, local_user, at).await?;
        if let Some(at) = self.tracker.mark_viewed(conversation_id, at, newest) {
            self.write_cursor(conversation_id, at);
        }
        Ok(())
    }

    /// Local typing input changed
    pub fn set_typing(&mut self, conversation_id: Uuid, is_typing: bool) -> Result<()> {
        self.partition(conversation_id)?;
        if let Some(state) = self.tracker.set_typing(conversation_id, is_typing) {
            self.broadcast_typing(conversation_id, state);
        }
        Ok(())
    }

    /// Other users typing right now
    pub fn typing_users(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let ttl = self.config.typing_ttl_span();
        Ok(self
            .partition(conversation_id)?
            .typing_users(Utc::now(), ttl, self.local_user))
    }

    pub fn message_status(&self, conversation_id: Uuid, message_id: &MessageId) -> Result<ReadStatus> {
        let partition = self.partition(conversation_id)?;
        let entry = partition
            .message(message_id)
            .ok_or_else(|| SyncError::not_found(format!("message {}", message_id)))?;
        Ok(tracker::message_status(partition, entry))
    }

    // ---- drafts ----

    pub async fn set_draft(&mut self, conversation_id: Uuid, body: &str) -> Result<()> {
        self.local_db.save_draft(conversation_id, self.local_user, body).await?;
        if let Some(partition) = self.store.get_mut(conversation_id) {
            partition.set_draft((!body.is_empty()).then(|| body.to_string()));
            self.store.notify(StoreChange::DraftChanged { conversation_id });
        }
        Ok(())
    }

    pub async fn draft(&self, conversation_id: Uuid) -> Result<Option<String>> {
        Ok(self.local_db.get_draft(conversation_id, self.local_user).await?)
    }

    pub async fn discard_draft(&mut self, conversation_id: Uuid) -> Result<()> {
        self.local_db.clear_draft(conversation_id, self.local_user).await?;
        if let Some(partition) = self.store.get_mut(conversation_id) {
            partition.set_draft(None);
            self.store.notify(StoreChange::DraftChanged { conversation_id });
        }
        Ok(())
    }

    // ---- conversation list and management ----

    /// Every conversation of the local user, favourites first, then by
    /// last activity.
    pub async fn conversation_list(&self) -> Result<Vec<ConversationSummary>> {
        let timeout = self.config.request_timeout;
        let conversations = with_timeout(timeout, self.backend.list_conversations_for(self.local_user)).await?;
        let favourites: HashSet<Uuid> = with_timeout(timeout, self.backend.list_favourites(self.local_user))
            .await?
            .into_iter()
            .collect();

        let mut entries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let created_at = conversation.created_at;
            let is_favourite = favourites.contains(&conversation.id);
            let summary = self.summarize(conversation, is_favourite).await?;
            let activity = summary.last_message_time.unwrap_or(created_at);
            entries.push((summary, activity));
        }
        entries.sort_by(|(a, a_at), (b, b_at)| b.is_favourite.cmp(&a.is_favourite).then_with(|| b_at.cmp(a_at)));
        Ok(entries.into_iter().map(|(summary, _)| summary).collect())
    }

    async fn summarize(
        &self,
        conversation: Conversation,
        is_favourite: bool,
    ) -> Result<ConversationSummary> {
        let timeout = self.config.request_timeout;
        let id = conversation.id;
        let kind = conversation.kind();

        let (title, avatar_url, is_online) = match kind {
            ConversationKind::Direct => {
                let participants = with_timeout(timeout, self.backend.list_participants(id)).await?;
                let counterpart = participants
                    .iter()
                    .map(|p| p.user_id)
                    .find(|user_id| *user_id != self.local_user);
                let profile = match counterpart {
                    Some(user_id) => with_timeout(timeout, self.backend.get_profiles(&[user_id]))
                        .await?
                        .into_iter()
                        .next(),
                    None => None,
                };
                match profile {
                    Some(profile) => (profile.display_name().to_string(), profile.avatar_url, profile.is_online),
                    None => (FALLBACK_NAME.to_string(), None, false),
                }
            }
            ConversationKind::Group => (
                conversation.group_name.clone().unwrap_or_else(|| "Group".to_string()),
                conversation.avatar_url.clone(),
                false,
            ),
        };

        let latest = with_timeout(timeout, self.backend.latest_message(id)).await?;
        let unread_count = match self.store.get(id) {
            Some(partition) => partition.unread_count(self.local_user),
            None => {
                let remote = with_timeout(timeout, self.backend.list_read_cursors(id))
                    .await?
                    .into_iter()
                    .find(|c| c.user_id == self.local_user)
                    .map(|c| c.last_viewed_at);
                let local = match self.local_db.get_cursor(id, self.local_user).await {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        tracing::warn!("[STORE] could not read local cursor of {}: {}", id, e);
                        None
                    }
                };
                with_timeout(timeout, self.backend.count_unread(id, self.local_user, remote.max(local))).await?
            }
        };

        Ok(ConversationSummary {
            id,
            kind,
            title,
            avatar_url,
            is_online,
            last_message_preview: latest.as_ref().map(|m| m.preview(PREVIEW_LEN)),
            last_message_time: latest.map(|m| m.created_at),
            unread_count,
            is_favourite,
        })
    }

    /// Existing direct conversation with `other`, created when missing
    pub async fn find_or_create_direct(&mut self, other: Uuid) -> Result<Uuid> {
        if other == self.local_user {
            return Err(SyncError::validation("cannot start a conversation with yourself"));
        }
        let timeout = self.config.request_timeout;
        let conversations = with_timeout(timeout, self.backend.list_conversations_for(self.local_user)).await?;
        for conversation in conversations.iter().filter(|c| !c.is_group) {
            let participants = with_timeout(timeout, self.backend.list_participants(conversation.id)).await?;
            if participants.len() == 2 && participants.iter().any(|p| p.user_id == other) {
                return Ok(conversation.id);
            }
        }

        let conversation = with_timeout(
            timeout,
            self.backend.create_conversation(&CreateConversationRequest::direct(self.local_user)),
        )
        .await?;
        let rows = [
            Participant::member(conversation.id, self.local_user),
            Participant::member(conversation.id, other),
        ];
        with_timeout(timeout, self.backend.add_participants(&rows)).await?;
        tracing::info!("[SYNC] created direct conversation {} with {}", conversation.id, other);
        Ok(conversation.id)
    }

    /// Create a group with the local user as admin and announce it
    pub async fn create_group(&mut self, name: &str, members: &[Uuid]) -> Result<Uuid> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::validation("group name is empty"));
        }
        let members = self.distinct_others(members);
        if members.is_empty() {
            return Err(SyncError::validation("a group needs at least one other member"));
        }

        let timeout = self.config.request_timeout;
        let conversation = with_timeout(
            timeout,
            self.backend
                .create_conversation(&CreateConversationRequest::group(name, self.local_user)),
        )
        .await?;
        let id = conversation.id;

        let mut rows = vec![Participant::admin(id, self.local_user)];
        rows.extend(members.iter().map(|user_id| Participant::member(id, *user_id)));
        with_timeout(timeout, self.backend.add_participants(&rows)).await?;

        let creator = self.display_name(self.local_user).await;
        self.notify_added(id, &members, &creator).await;
        self.post_system_message(id, format!("Group \"{}\" was created by {}", name, creator))
            .await;

        tracing::info!("[SYNC] created group {} with {} members", id, members.len() + 1);
        Ok(id)
    }

    /// Add members to a group; admin only
    pub async fn add_members(&mut self, conversation_id: Uuid, users: &[Uuid]) -> Result<()> {
        let timeout = self.config.request_timeout;
        let conversation = with_timeout(timeout, self.backend.get_conversation(conversation_id)).await?;
        if !conversation.is_group {
            return Err(SyncError::validation("members can only be added to groups"));
        }
        let participants = with_timeout(timeout, self.backend.list_participants(conversation_id)).await?;
        self.require_admin(&participants)?;

        let existing: HashSet<Uuid> = participants.iter().map(|p| p.user_id).collect();
        let added: Vec<Uuid> = self
            .distinct_others(users)
            .into_iter()
            .filter(|user_id| !existing.contains(user_id))
            .collect();
        if added.is_empty() {
            return Ok(());
        }

        let rows: Vec<Participant> = added
            .iter()
            .map(|user_id| Participant::member(conversation_id, *user_id))
            .collect();
        with_timeout(timeout, self.backend.add_participants(&rows)).await?;

        let adder = self.display_name(self.local_user).await;
        self.notify_added(conversation_id, &added, &adder).await;
        for user_id in &added {
            let member = self.display_name(*user_id).await;
            self.post_system_message(conversation_id, format!("{} was added by {}", member, adder))
                .await;
        }

        if let Some(partition) = self.store.get_mut(conversation_id) {
            for row in rows {
                partition.upsert_participant(row);
            }
            self.store.notify(StoreChange::ParticipantsChanged { conversation_id });
        }
        for user_id in added {
            if self.store.contains(conversation_id) {
                self.load_profile(conversation_id, user_id).await;
            }
        }
        Ok(())
    }

    /// Remove another member from a group; admin only
    pub async fn remove_member(&mut self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        if user_id == self.local_user {
            return Err(SyncError::validation("use leave_conversation to leave"));
        }
        let timeout = self.config.request_timeout;
        let participants = with_timeout(timeout, self.backend.list_participants(conversation_id)).await?;
        self.require_admin(&participants)?;
        if !participants.iter().any(|p| p.user_id == user_id) {
            return Err(SyncError::not_found(format!("participant {}", user_id)));
        }

        with_timeout(timeout, self.backend.remove_participant(conversation_id, user_id)).await?;
        if let Some(partition) = self.store.get_mut(conversation_id) {
            if partition.remove_participant(user_id).is_some() {
                self.store.notify(StoreChange::ParticipantsChanged { conversation_id });
            }
        }
        tracing::info!("[SYNC] removed {} from {}", user_id, conversation_id);
        Ok(())
    }

    /// Leave a conversation; the last participant out deletes it
    pub async fn leave_conversation(&mut self, conversation_id: Uuid) -> Result<()> {
        let timeout = self.config.request_timeout;
        let participants = with_timeout(timeout, self.backend.list_participants(conversation_id)).await?;
        if !participants.iter().any(|p| p.user_id == self.local_user) {
            return Err(SyncError::not_found(format!("not a participant of {}", conversation_id)));
        }

        if participants.len() == 1 {
            with_timeout(timeout, self.backend.delete_conversation(conversation_id)).await?;
            tracing::info!("[SYNC] last participant left, deleted {}", conversation_id);
        } else {
            with_timeout(timeout, self.backend.remove_participant(conversation_id, self.local_user)).await?;
            tracing::info!("[SYNC] left {}", conversation_id);
        }
        self.close_conversation(conversation_id);
        Ok(())
    }

    /// Delete a group; creator or admin only
    pub async fn delete_group(&mut self, conversation_id: Uuid) -> Result<()> {
        let timeout = self.config.request_timeout;
        let conversation = with_timeout(timeout, self.backend.get_conversation(conversation_id)).await?;
        if !conversation.is_group {
            return Err(SyncError::validation("only groups can be deleted"));
        }
        let participants = with_timeout(timeout, self.backend.list_participants(conversation_id)).await?;
        let is_creator = conversation.created_by == Some(self.local_user);
        if !is_creator && self.require_admin(&participants).is_err() {
            return Err(SyncError::permission_denied("only the creator or an admin can delete a group"));
        }

        with_timeout(timeout, self.backend.delete_conversation(conversation_id)).await?;
        self.drop_conversation(conversation_id);
        self.signal(EngineSignal::ConversationDeleted(conversation_id));
        tracing::info!("[SYNC] deleted group {}", conversation_id);
        Ok(())
    }

    pub async fn set_favourite(&self, conversation_id: Uuid, favourite: bool) -> Result<()> {
        with_timeout(
            self.config.request_timeout,
            self.backend.set_favourite(self.local_user, conversation_id, favourite),
        )
        .await
    }

    pub async fn block_user(&mut self, user_id: Uuid) -> Result<()> {
        if user_id == self.local_user {
            return Err(SyncError::validation("cannot block yourself"));
        }
        with_timeout(
            self.config.request_timeout,
            self.backend.set_blocked(self.local_user, user_id, true),
        )
        .await?;
        self.blocked.insert(user_id);
        Ok(())
    }

    pub async fn unblock_user(&mut self, user_id: Uuid) -> Result<()> {
        with_timeout(
            self.config.request_timeout,
            self.backend.set_blocked(self.local_user, user_id, false),
        )
        .await?;
        self.blocked.remove(&user_id);
        Ok(())
    }

    pub fn is_blocked(&self, user_id: Uuid) -> bool {
        self.blocked.contains(&user_id)
    }

    fn require_admin(&self, participants: &[Participant]) -> Result<()> {
        if participants.iter().any(|p| p.user_id == self.local_user && p.is_admin) {
            Ok(())
        } else {
            Err(SyncError::permission_denied("only admins can manage members"))
        }
    }

    /// `users` without duplicates and without the local user, order kept
    fn distinct_others(&self, users: &[Uuid]) -> Vec<Uuid> {
        let mut seen = HashSet::new();
        users
            .iter()
            .copied()
            .filter(|user_id| *user_id != self.local_user && seen.insert(*user_id))
            .collect()
    }

    async fn display_name(&self, user_id: Uuid) -> String {
        match with_timeout(self.config.request_timeout, self.backend.get_profiles(&[user_id])).await {
            Ok(profiles) => profiles
                .first()
                .map(|p| p.display_name().to_string())
                .unwrap_or_else(|| FALLBACK_NAME.to_string()),
            Err(e) => {
                tracing::warn!("[SYNC] could not load profile {}: {}", user_id, e);
                FALLBACK_NAME.to_string()
            }
        }
    }

    /// Announcements are best effort; the membership change already happened
    async fn notify_added(&self, conversation_id: Uuid, users: &[Uuid], adder: &str) {
        let rows: Vec<GroupNotification> = users
            .iter()
            .map(|user_id| GroupNotification {
                user_id: *user_id,
                conversation_id,
                message: format!("You were added by {}", adder),
            })
            .collect();
        let result = with_timeout(
            self.config.request_timeout,
            self.backend.insert_group_notifications(&rows),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!("[SYNC] could not notify new members of {}: {}", conversation_id, e);
        }
    }

    async fn post_system_message(&self, conversation_id: Uuid, text: String) -> Option<ChatMessage> {
        let request = SendMessageRequest::system(conversation_id, self.local_user, text);
        match with_timeout(self.config.request_timeout, self.backend.insert_message(&request)).await {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("[SYNC] could not post system message in {}: {}", conversation_id, e);
                None
            }
        }
    }

    /// Stop every background task and drop all local state
    pub fn shutdown(&mut self) {
        self.bus.shutdown();
        self.outbox.shutdown();
        self.tracker.shutdown();
        self.store.clear();
        tracing::info!("[SYNC] engine for {} shut down", self.local_user);
    }
}
