//! # Operation Queue
//!
//! Bookkeeping for locally authored sends, keyed by temporary message id.
//! An operation stays queued from submission until the backend confirms it
//! or the user discards it, so a failed send keeps everything needed for a
//! manual retry.
//!
//! ## Usage
//!
//! ```rust
//! use chatsync::client::outbox::queue::{OperationQueue, OperationStatus};
//! use chatsync::shared::messaging::{MessageId, SendMessageRequest};
//! use uuid::Uuid;
//!
//! let mut queue = OperationQueue::new();
//! let temp_id = MessageId::temporary(1);
//! queue.enqueue(temp_id.clone(), SendMessageRequest::text(Uuid::new_v4(), Uuid::new_v4(), "hi"), None);
//! queue.fail(&temp_id, "offline".to_string());
//! assert_eq!(queue.get(&temp_id).map(|op| op.status.clone()), Some(OperationStatus::Failed));
//! ```

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::PendingUpload;
use crate::shared::messaging::{MessageId, SendMessageRequest};

/// Queued send with metadata
#[derive(Debug, Clone)]
pub struct QueuedOperation {
    /// Temporary id of the optimistic entry
    pub temp_id: MessageId,
    pub request: SendMessageRequest,
    /// Attachment still to be uploaded before the insert
    pub upload: Option<PendingUpload>,
    pub status: OperationStatus,
    /// Number of submissions, the first one included
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Operation execution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    /// Submitted to the lane, waiting or running
    InFlight,
    /// Failed; waits for retry or discard
    Failed,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub total: usize,
    pub in_flight: usize,
    pub failed: usize,
}

/// Sends not yet confirmed, in submission order
#[derive(Debug, Default)]
pub struct OperationQueue {
    operations: VecDeque<QueuedOperation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a send that is being submitted
    pub fn enqueue(&mut self, temp_id: MessageId, request: SendMessageRequest, upload: Option<PendingUpload>) {
        let now = Utc::now();
        self.operations.push_back(QueuedOperation {
            temp_id,
            request,
            upload,
            status: OperationStatus::InFlight,
            attempts: 1,
            queued_at: now,
            last_attempt: Some(now),
            last_error: None,
        });
    }

    pub fn get(&self, temp_id: &MessageId) -> Option<&QueuedOperation> {
        self.operations.iter().find(|op| &op.temp_id == temp_id)
    }

    fn get_mut(&mut self, temp_id: &MessageId) -> Option<&mut QueuedOperation> {
        self.operations.iter_mut().find(|op| &op.temp_id == temp_id)
    }

    /// Drop a confirmed operation
    pub fn complete(&mut self, temp_id: &MessageId) -> Option<QueuedOperation> {
        let i = self.operations.iter().position(|op| &op.temp_id == temp_id)?;
        self.operations.remove(i)
    }

    /// Mark an operation as failed
    pub fn fail(&mut self, temp_id: &MessageId, error: String) -> bool {
        match self.get_mut(temp_id) {
            Some(op) => {
                op.status = OperationStatus::Failed;
                op.last_error = Some(error);
                true
            }
            None => false,
        }
    }

    /// Put a failed operation back in flight; returns it for resubmission
    pub fn retry(&mut self, temp_id: &MessageId) -> Option<QueuedOperation> {
        let op = self.get_mut(temp_id)?;
        if op.status != OperationStatus::Failed {
            return None;
        }
        op.status = OperationStatus::InFlight;
        op.attempts += 1;
        op.last_attempt = Some(Utc::now());
        Some(op.clone())
    }

    /// The attachment of an operation has been uploaded
    pub fn mark_uploaded(&mut self, temp_id: &MessageId, file_url: String) {
        if let Some(op) = self.get_mut(temp_id) {
            op.request.file_url = Some(file_url);
            op.upload = None;
        }
    }

    pub fn failed(&self) -> Vec<&QueuedOperation> {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let failed = self.operations.iter().filter(|op| op.status == OperationStatus::Failed).count();
        QueueStats {
            total: self.operations.len(),
            in_flight: self.operations.len() - failed,
            failed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
