//! # Backend Service Seam
//!
//! Everything the engine needs from the hosted backend: row operations over
//! the chat tables, object storage, a per-table change feed, and an opaque
//! authentication capability.
//!
//! ## Implementations
//!
//! - [`MemoryBackend`] - in-process tables with a broadcast change feed and
//!   failure injection; used by tests and offline demos
//! - [`RestBackend`] - `reqwest` adapter for a PostgREST-style service
//!
//! The engine holds the backend as an `Arc<dyn BackendService>` handed over
//! at construction; it is never a process-wide singleton.

pub mod memory;
pub mod rest;

pub use memory::{InjectedFailure, MemoryBackend};
pub use rest::RestBackend;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::error::{Result, SyncError};
use crate::shared::event::{ChangeEvent, EntityKind};
use crate::shared::messaging::{
    ChatMessage, Conversation, CreateConversationRequest, GroupNotification, MessageId,
    Participant, Profile, Reaction, ReadCursor, SendMessageRequest, TypingState,
};

/// Lazy, infinite change feed of one table. The stream ending means the
/// subscription was dropped and must be re-established.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<ChangeEvent>> + Send>>;

/// Equality filter on a subscription, e.g. `conversation_id=eq.<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub column: &'static str,
    pub value: String,
}

impl RowFilter {
    pub fn eq(column: &'static str, value: impl ToString) -> Self {
        Self {
            column,
            value: value.to_string(),
        }
    }

    /// PostgREST query fragment
    pub fn to_query(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    /// Whether a row passes the filter
    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(self.column) {
            Some(serde_json::Value::String(s)) => s == &self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

/// Row operations, storage and change feed of the backend service
#[async_trait]
pub trait BackendService: Send + Sync {
    // conversations
    async fn get_conversation(&self, id: Uuid) -> Result<Conversation>;
    async fn list_conversations_for(&self, user_id: Uuid) -> Result<Vec<Conversation>>;
    async fn create_conversation(&self, request: &CreateConversationRequest) -> Result<Conversation>;
    async fn delete_conversation(&self, id: Uuid) -> Result<()>;

    // conversation_participants
    async fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>>;
    async fn add_participants(&self, rows: &[Participant]) -> Result<()>;
    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;

    // messages
    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>>;
    async fn latest_message(&self, conversation_id: Uuid) -> Result<Option<ChatMessage>>;
    /// Insert a message; the returned row carries the final id and timestamp
    async fn insert_message(&self, request: &SendMessageRequest) -> Result<ChatMessage>;
    /// Messages from other users created strictly after `after`
    async fn count_unread(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        after: Option<DateTime<Utc>>,
    ) -> Result<u32>;

    // message_reactions
    async fn list_reactions(&self, message_ids: &[MessageId]) -> Result<Vec<Reaction>>;
    /// `Conflict` when the (message, user, emoji) row already exists
    async fn insert_reaction(&self, reaction: &Reaction) -> Result<()>;
    /// `NotFound` when there is no such row
    async fn delete_reaction(&self, reaction: &Reaction) -> Result<()>;

    // profiles
    async fn get_profiles(&self, ids: &[Uuid]) -> Result<Vec<Profile>>;

    // typing_indicators / conversation_views
    async fn upsert_typing(&self, state: &TypingState) -> Result<()>;
    async fn list_read_cursors(&self, conversation_id: Uuid) -> Result<Vec<ReadCursor>>;
    async fn upsert_read_cursor(&self, cursor: &ReadCursor) -> Result<()>;

    // favourite_conversations / blocked_users / group_notifications
    async fn list_favourites(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
    async fn set_favourite(&self, user_id: Uuid, conversation_id: Uuid, favourite: bool) -> Result<()>;
    async fn list_blocked(&self, user_id: Uuid) -> Result<Vec<Uuid>>;
    async fn set_blocked(&self, user_id: Uuid, blocked_id: Uuid, blocked: bool) -> Result<()>;
    async fn insert_group_notifications(&self, rows: &[GroupNotification]) -> Result<()>;

    /// Store an object and return its public URL
    async fn upload(&self, bucket: &str, key: &str, bytes: Bytes, content_type: &str) -> Result<String>;

    /// Subscribe to the change feed of one table
    async fn subscribe(&self, entity: EntityKind, filter: Option<RowFilter>) -> Result<ChangeStream>;
}

/// Signed-in session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Sign-up form: credentials plus the profile fields created with the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// Opaque authentication capability of the backend
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Create an account; a verification code is emailed
    async fn sign_up(&self, request: &SignUpRequest) -> Result<()>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;
    /// Confirm the emailed 4-digit code
    async fn verify_otp(&self, email: &str, code: &str) -> Result<Session>;
    async fn reset_password(&self, email: &str) -> Result<()>;
    async fn session(&self) -> Result<Option<Session>>;
    async fn sign_out(&self) -> Result<()>;
}

/// Verification codes are exactly four ASCII digits
pub fn validate_otp_code(code: &str) -> Result<()> {
    if code.len() == 4 && code.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(SyncError::validation("verification code must be 4 digits"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_filter() {
        let id = Uuid::new_v4();
        let filter = RowFilter::eq("conversation_id", id);
        assert_eq!(filter.to_query(), format!("conversation_id=eq.{}", id));
        assert!(filter.matches(&serde_json::json!({ "conversation_id": id })));
        assert!(!filter.matches(&serde_json::json!({ "conversation_id": Uuid::new_v4() })));
        assert!(!filter.matches(&serde_json::json!({ "id": id })));
    }

    #[test]
    fn test_otp_code_validation() {
        assert!(validate_otp_code("0427").is_ok());
        assert!(validate_otp_code("427").is_err());
        assert!(validate_otp_code("04a7").is_err());
        assert!(validate_otp_code("٠١٢٣").is_err());
    }
}
