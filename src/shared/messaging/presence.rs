//! Read Cursors and Typing Indicators
//!
//! Both are keyed by (conversation id, user id). Read cursors only move
//! forward; typing state is ephemeral and overwritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row of `conversation_views`: the last time a user viewed a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadCursor {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub last_viewed_at: DateTime<Utc>,
}

/// Row of `typing_indicators`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingState {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

/// Display status of a message sent by the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    /// Optimistic, not yet confirmed by the backend
    Pending,
    /// The backend write failed; retry or discard
    Failed,
    Sent,
    Delivered,
    Read,
}

/// Derive the read status of a confirmed message.
///
/// `read` iff the counterpart is not the sender and its cursor is at or past
/// the message time; otherwise `delivered` while the counterpart is online,
/// else `sent`.
pub fn derive_status(
    sender_id: Uuid,
    counterpart_id: Uuid,
    counterpart_cursor: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    counterpart_online: bool,
) -> ReadStatus {
    let seen = counterpart_cursor.is_some_and(|cursor| cursor >= created_at);
    if sender_id != counterpart_id && seen {
        ReadStatus::Read
    } else if counterpart_online {
        ReadStatus::Delivered
    } else {
        ReadStatus::Sent
    }
}
