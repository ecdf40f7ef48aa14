//! # Outbox
//!
//! Locally authored writes, applied optimistically by the engine and
//! delivered to the backend in the background.
//!
//! ## Lanes
//!
//! - **Send lane**: message sends (attachment upload first, then insert) and
//!   reaction toggles, strictly in submission order. A failed send is
//!   reported and never retried on its own, so nothing is sent twice
//! - **Presence lane**: typing and read cursor writes, retried on transient
//!   failures with [`RetryPolicy`]
//!
//! Lanes are independent of conversation views: closing a conversation does
//! not cancel its in-flight sends. Results come back to the engine as
//! [`OutboxOutcome`]s on the inbound channel.

pub mod optimistic;
pub mod queue;

pub use optimistic::{OptimisticManager, ToggleResolution};
pub use queue::{OperationQueue, OperationStatus, QueueStats, QueuedOperation};

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::backend::BackendService;
use crate::client::engine::EngineInput;
use crate::client::error::{with_timeout, Result, SyncError};
use crate::client::retry::RetryPolicy;
use crate::shared::messaging::{ChatMessage, MessageId, Reaction, ReadCursor, SendMessageRequest, TypingState};

/// Storage bucket for message attachments
pub const ATTACHMENT_BUCKET: &str = "attachments";

/// Attachment bytes waiting to be uploaded
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub bucket: String,
    pub key: String,
    pub bytes: Bytes,
    pub content_type: String,
}

/// Content type guessed from a file name's extension
pub fn content_type_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Object key of an attachment: `<conversation>/<user>-<millis>.<ext>`
pub fn attachment_key(conversation_id: Uuid, user_id: Uuid, file_name: &str, at_millis: i64) -> String {
    match file_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => format!("{}/{}-{}.{}", conversation_id, user_id, at_millis, ext),
        _ => format!("{}/{}-{}", conversation_id, user_id, at_millis),
    }
}

/// Work for the send lane
#[derive(Debug, Clone)]
pub enum OutboxCommand {
    SendMessage {
        temp_id: MessageId,
        request: SendMessageRequest,
        upload: Option<PendingUpload>,
    },
    ToggleReaction {
        conversation_id: Uuid,
        reaction: Reaction,
        add: bool,
        generation: u64,
    },
}

/// Work for the presence lane
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceCommand {
    Typing(TypingState),
    Cursor(ReadCursor),
}

/// Result of one outbox command
#[derive(Debug)]
pub enum OutboxOutcome {
    /// The attachment is stored; the insert is next
    Uploaded {
        temp_id: MessageId,
        file_url: String,
    },
    Confirmed {
        temp_id: MessageId,
        message: ChatMessage,
    },
    SendFailed {
        conversation_id: Uuid,
        temp_id: MessageId,
        error: SyncError,
    },
    ReactionSettled {
        conversation_id: Uuid,
        reaction: Reaction,
        add: bool,
        generation: u64,
        error: Option<SyncError>,
    },
}

/// Send and presence lanes
#[derive(Debug)]
pub struct Outbox {
    lane: mpsc::UnboundedSender<OutboxCommand>,
    presence: mpsc::UnboundedSender<PresenceCommand>,
    tasks: Vec<JoinHandle<()>>,
}

impl Outbox {
    /// Spawn both lanes
    pub fn start(
        backend: Arc<dyn BackendService>,
        timeout: Duration,
        policy: RetryPolicy,
        inbound: mpsc::UnboundedSender<EngineInput>,
    ) -> Self {
        let (lane, lane_rx) = mpsc::unbounded_channel();
        let (presence, presence_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(run_send_lane(backend.clone(), timeout, lane_rx, inbound)),
            tokio::spawn(run_presence_lane(backend, timeout, policy, presence_rx)),
        ];
        Self { lane, presence, tasks }
    }

    pub fn submit(&self, command: OutboxCommand) -> Result<()> {
        self.lane
            .send(command)
            .map_err(|_| SyncError::NetworkUnavailable("outbox is shut down".to_string()))
    }

    pub fn submit_presence(&self, command: PresenceCommand) -> Result<()> {
        self.presence
            .send(command)
            .map_err(|_| SyncError::NetworkUnavailable("outbox is shut down".to_string()))
    }

    /// Abort both lanes; queued work is dropped
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_send_lane(
    backend: Arc<dyn BackendService>,
    timeout: Duration,
    mut commands: mpsc::UnboundedReceiver<OutboxCommand>,
    inbound: mpsc::UnboundedSender<EngineInput>,
) {
    let report = |outcome: OutboxOutcome| inbound.send(EngineInput::Outbox(outcome)).is_ok();

    while let Some(command) = commands.recv().await {
        let delivered = match command {
            OutboxCommand::SendMessage {
                temp_id,
                mut request,
                upload,
            } => {
                let conversation_id = request.conversation_id;
                let mut outcome = None;
                if let Some(upload) = upload {
                    match upload_attachment(backend.as_ref(), timeout, &upload).await {
                        Ok(file_url) => {
                            request.file_url = Some(file_url.clone());
                            if !report(OutboxOutcome::Uploaded {
                                temp_id: temp_id.clone(),
                                file_url,
                            }) {
                                return;
                            }
                        }
                        Err(error) => {
                            outcome = Some(OutboxOutcome::SendFailed {
                                conversation_id,
                                temp_id: temp_id.clone(),
                                error,
                            });
                        }
                    }
                }
                let outcome = match outcome {
                    Some(failed) => failed,
                    None => match with_timeout(timeout, backend.insert_message(&request)).await {
                        Ok(message) => {
                            tracing::debug!("[OUTBOX] {} confirmed as {}", temp_id, message.id);
                            OutboxOutcome::Confirmed { temp_id, message }
                        }
                        Err(error) => {
                            tracing::warn!("[OUTBOX] send of {} failed: {}", temp_id, error);
                            OutboxOutcome::SendFailed {
                                conversation_id,
                                temp_id,
                                error,
                            }
                        }
                    },
                };
                report(outcome)
            }
            OutboxCommand::ToggleReaction {
                conversation_id,
                reaction,
                add,
                generation,
            } => {
                let error = toggle_reaction(backend.as_ref(), timeout, &reaction, add).await.err();
                report(OutboxOutcome::ReactionSettled {
                    conversation_id,
                    reaction,
                    add,
                    generation,
                    error,
                })
            }
        };
        if !delivered {
            break;
        }
    }
    tracing::debug!("[OUTBOX] send lane stopped");
}

async fn upload_attachment(backend: &dyn BackendService, timeout: Duration, upload: &PendingUpload) -> Result<String> {
    let url = with_timeout(
        timeout,
        backend.upload(&upload.bucket, &upload.key, upload.bytes.clone(), &upload.content_type),
    )
    .await?;
    tracing::debug!("[OUTBOX] uploaded {} ({} bytes)", upload.key, upload.bytes.len());
    Ok(url)
}

/// Apply a toggle; an existing row on add and a missing row on remove mean
/// the backend already has the intended state.
async fn toggle_reaction(backend: &dyn BackendService, timeout: Duration, reaction: &Reaction, add: bool) -> Result<()> {
    let result = if add {
        with_timeout(timeout, backend.insert_reaction(reaction)).await
    } else {
        with_timeout(timeout, backend.delete_reaction(reaction)).await
    };
    match result {
        Err(SyncError::Conflict(_)) if add => Ok(()),
        Err(SyncError::NotFound(_)) if !add => Ok(()),
        other => other,
    }
}

async fn run_presence_lane(
    backend: Arc<dyn BackendService>,
    timeout: Duration,
    policy: RetryPolicy,
    mut commands: mpsc::UnboundedReceiver<PresenceCommand>,
) {
    let backend = backend.as_ref();
    while let Some(command) = commands.recv().await {
        let result = match &command {
            PresenceCommand::Typing(state) => {
                policy
                    .run(move || with_timeout(timeout, backend.upsert_typing(state)))
                    .await
            }
            PresenceCommand::Cursor(cursor) => {
                policy
                    .run(move || with_timeout(timeout, backend.upsert_read_cursor(cursor)))
                    .await
            }
        };
        if let Err(e) = result {
            tracing::warn!("[OUTBOX] presence write {:?} dropped: {}", command, e);
        }
    }
}
