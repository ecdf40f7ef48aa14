//! Conversation Data Structure
//!
//! Represents a direct (1:1) or group conversation and the side tables the
//! chat list reads next to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Represents a conversation between users
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    /// Unique conversation ID
    pub id: Uuid,
    /// Group conversations carry a name and admins
    #[serde(default)]
    pub is_group: bool,
    /// Display name of a group
    #[serde(default)]
    pub group_name: Option<String>,
    /// Group avatar
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Creator, allowed to delete the group
    #[serde(default)]
    pub created_by: Option<Uuid>,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// Last metadata change
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn kind(&self) -> ConversationKind {
        if self.is_group {
            ConversationKind::Group
        } else {
            ConversationKind::Direct
        }
    }
}

/// Request to create a conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateConversationRequest {
    pub is_group: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub created_by: Uuid,
}

impl CreateConversationRequest {
    pub fn direct(created_by: Uuid) -> Self {
        Self {
            is_group: false,
            group_name: None,
            created_by,
        }
    }

    pub fn group(name: impl Into<String>, created_by: Uuid) -> Self {
        Self {
            is_group: true,
            group_name: Some(name.into()),
            created_by,
        }
    }
}

/// Row of `group_notifications`, shown to a user added to a group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupNotification {
    pub user_id: Uuid,
    pub conversation_id: Uuid,
    pub message: String,
}

/// Chat list entry derived from the store and the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub kind: ConversationKind,
    /// Group name, or the counterpart's name for direct conversations
    pub title: String,
    pub avatar_url: Option<String>,
    /// Counterpart presence; always false for groups
    pub is_online: bool,
    pub last_message_preview: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub is_favourite: bool,
}
