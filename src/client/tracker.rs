//! # Read/Typing Tracker
//!
//! Local presence bookkeeping per open conversation:
//!
//! - Read cursor writes are debounced. The first `mark_viewed` writes
//!   immediately; calls within `read_debounce` of the last write collapse
//!   into one deferred write of the newest cursor, and into nothing at all
//!   when no message arrived after the cursor already written
//! - Local typing is broadcast on transitions only. Each keystroke re-arms
//!   a quiet timer; when it fires the state drops back to not typing
//!
//! Timers run as tokio tasks that report back through the engine's inbound
//! channel; the tracker itself never touches the network.
//!
//! Read status derivation for display lives here as well.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::engine::EngineInput;
use crate::client::store::{ConversationState, EntryState, MessageEntry};
use crate::shared::messaging::{derive_status, ReadStatus};

#[derive(Debug, Default)]
struct Presence {
    last_cursor_write: Option<Instant>,
    last_written: Option<DateTime<Utc>>,
    /// Newest cursor not yet written, and the timer that will write it
    pending_cursor: Option<DateTime<Utc>>,
    cursor_timer: Option<JoinHandle<()>>,
    typing: bool,
    typing_generation: u64,
    quiet_timer: Option<JoinHandle<()>>,
}

impl Presence {
    fn abort_timers(&mut self) {
        if let Some(timer) = self.cursor_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.quiet_timer.take() {
            timer.abort();
        }
    }
}

/// Presence owed to the backend when a conversation closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClosedPresence {
    pub was_typing: bool,
    pub unsent_cursor: Option<DateTime<Utc>>,
}

/// Debounced read cursors and typing timers
#[derive(Debug)]
pub struct Tracker {
    read_debounce: Duration,
    typing_quiet: Duration,
    inbound: mpsc::UnboundedSender<EngineInput>,
    conversations: HashMap<Uuid, Presence>,
}

impl Tracker {
    pub fn new(
        read_debounce: Duration,
        typing_quiet: Duration,
        inbound: mpsc::UnboundedSender<EngineInput>,
    ) -> Self {
        Self {
            read_debounce,
            typing_quiet,
            inbound,
            conversations: HashMap::new(),
        }
    }

    /// Record a view at `at`; `newest_message` is the creation time of the
    /// newest confirmed message. Returns the cursor to write now, or `None`
    /// when the write is deferred to a `CursorDue` input or not needed.
    pub fn mark_viewed(
        &mut self,
        conversation_id: Uuid,
        at: DateTime<Utc>,
        newest_message: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let debounce = self.read_debounce;
        let inbound = self.inbound.clone();
        let presence = self.conversations.entry(conversation_id).or_default();
        let now = Instant::now();

        let since_write = presence.last_cursor_write.map(|last| now.saturating_duration_since(last));
        match since_write {
            Some(elapsed) if elapsed < debounce => {
                let covered = match (newest_message, presence.last_written) {
                    (None, _) => true,
                    (Some(newest), Some(written)) => newest <= written,
                    (Some(_), None) => false,
                };
                if covered && presence.pending_cursor.is_none() {
                    tracing::debug!("[TRACKER] cursor write for {} already covered", conversation_id);
                    return None;
                }
                presence.pending_cursor = Some(presence.pending_cursor.map_or(at, |p| p.max(at)));
                let armed = presence.cursor_timer.as_ref().is_some_and(|t| !t.is_finished());
                if !armed {
                    let wait = debounce - elapsed;
                    presence.cursor_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        let _ = inbound.send(EngineInput::CursorDue(conversation_id));
                    }));
                    tracing::debug!("[TRACKER] cursor write for {} deferred by {:?}", conversation_id, wait);
                }
                None
            }
            _ => {
                presence.last_cursor_write = Some(now);
                presence.last_written = Some(at);
                presence.pending_cursor = None;
                Some(at)
            }
        }
    }

    /// The deferred cursor of a conversation fell due
    pub fn cursor_due(&mut self, conversation_id: Uuid) -> Option<DateTime<Utc>> {
        let presence = self.conversations.get_mut(&conversation_id)?;
        presence.cursor_timer = None;
        let cursor = presence.pending_cursor.take()?;
        presence.last_cursor_write = Some(Instant::now());
        presence.last_written = Some(cursor);
        Some(cursor)
    }

    /// Update the local typing state. Returns the state to broadcast when
    /// it changed.
    pub fn set_typing(&mut self, conversation_id: Uuid, is_typing: bool) -> Option<bool> {
        let quiet = self.typing_quiet;
        let inbound = self.inbound.clone();
        let presence = self.conversations.entry(conversation_id).or_default();

        if let Some(timer) = presence.quiet_timer.take() {
            timer.abort();
        }
        presence.typing_generation += 1;

        if is_typing {
            let generation = presence.typing_generation;
            presence.quiet_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(quiet).await;
                let _ = inbound.send(EngineInput::TypingQuiet {
                    conversation_id,
                    generation,
                });
            }));
        }

        if presence.typing == is_typing {
            return None;
        }
        presence.typing = is_typing;
        tracing::debug!("[TRACKER] local typing in {} -> {}", conversation_id, is_typing);
        Some(is_typing)
    }

    /// The quiet timer of `generation` fired. Returns true when typing must
    /// be cleared and broadcast.
    pub fn typing_quiet(&mut self, conversation_id: Uuid, generation: u64) -> bool {
        let Some(presence) = self.conversations.get_mut(&conversation_id) else {
            return false;
        };
        if presence.typing_generation != generation || !presence.typing {
            return false;
        }
        presence.typing = false;
        presence.quiet_timer = None;
        tracing::debug!("[TRACKER] typing in {} cleared after quiet period", conversation_id);
        true
    }

    pub fn is_typing(&self, conversation_id: Uuid) -> bool {
        self.conversations.get(&conversation_id).is_some_and(|p| p.typing)
    }

    /// Forget a conversation and cancel its timers
    pub fn close(&mut self, conversation_id: Uuid) -> ClosedPresence {
        match self.conversations.remove(&conversation_id) {
            Some(mut presence) => {
                presence.abort_timers();
                ClosedPresence {
                    was_typing: presence.typing,
                    unsent_cursor: presence.pending_cursor,
                }
            }
            None => ClosedPresence::default(),
        }
    }

    pub fn shutdown(&mut self) {
        for (_, mut presence) in self.conversations.drain() {
            presence.abort_timers();
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Display status of a message.
///
/// Optimistic entries report `Pending`/`Failed`. A confirmed message is
/// `Read` once every other participant's cursor reached it, otherwise
/// `Delivered` while any of them is online, otherwise `Sent`. With a single
/// counterpart this is exactly [`derive_status`].
pub fn message_status(partition: &ConversationState, entry: &MessageEntry) -> ReadStatus {
    match entry.state {
        EntryState::Pending => return ReadStatus::Pending,
        EntryState::Failed { .. } => return ReadStatus::Failed,
        EntryState::Confirmed => {}
    }

    let message = &entry.message;
    let recipients: Vec<Uuid> = partition
        .participants()
        .map(|p| p.user_id)
        .filter(|user_id| *user_id != message.sender_id)
        .collect();

    match recipients.as_slice() {
        [] => ReadStatus::Sent,
        [counterpart] => derive_status(
            message.sender_id,
            *counterpart,
            partition.cursor(*counterpart),
            message.created_at,
            partition.is_online(*counterpart),
        ),
        many => {
            let all_read = many
                .iter()
                .all(|user_id| partition.cursor(*user_id).is_some_and(|c| c >= message.created_at));
            if all_read {
                ReadStatus::Read
            } else if many.iter().any(|user_id| partition.is_online(*user_id)) {
                ReadStatus::Delivered
            } else {
                ReadStatus::Sent
            }
        }
    }
}
