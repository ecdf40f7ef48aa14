//! Chat Message Data Structure
//!
//! Represents a message in a conversation, as stored by the backend and as
//! held (possibly still unconfirmed) by the local state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a message.
///
/// Server-assigned ids are opaque strings. Ids handed out by the outbox before
/// the backend confirms a write carry the `tmp-` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Prefix reserved for locally assigned ids
    pub const TEMP_PREFIX: &'static str = "tmp-";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Temporary id for an optimistic message
    pub fn temporary(seq: u64) -> Self {
        Self(format!("{}{}", Self::TEMP_PREFIX, seq))
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(Self::TEMP_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Type of message content
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain text message
    #[default]
    Text,
    /// Image attachment
    Image,
    /// File attachment
    File,
    /// Announcement posted by the client on a membership change
    System,
}

impl MessageType {
    /// Column value used by the backend
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::System => "system",
        }
    }

    /// Whether this type carries an uploaded object
    pub fn is_attachment(&self) -> bool {
        matches!(self, MessageType::Image | MessageType::File)
    }
}

/// Represents a chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Unique message ID
    pub id: MessageId,
    /// Conversation this message belongs to
    pub conversation_id: Uuid,
    /// User who sent the message
    pub sender_id: Uuid,
    /// Text content; `None` for attachments without a caption
    #[serde(default)]
    pub content: Option<String>,
    /// Type of message
    #[serde(default)]
    pub message_type: MessageType,
    /// Public URL of the uploaded object for image/file messages
    #[serde(default)]
    pub file_url: Option<String>,
    /// Original file name for image/file messages
    #[serde(default)]
    pub file_name: Option<String>,
    /// Message this one replies to
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Serialized link preview, passed through untouched
    #[serde(default)]
    pub link_preview: Option<serde_json::Value>,
    /// Creation time; finalized by the backend on confirmation
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new text message
    pub fn new_text(
        id: MessageId,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content: Some(content.into()),
            message_type: MessageType::Text,
            file_url: None,
            file_name: None,
            reply_to: None,
            link_preview: None,
            created_at,
        }
    }

    /// Ordering key of the store: ascending by (created_at, id)
    pub fn sort_key(&self) -> (DateTime<Utc>, &MessageId) {
        (self.created_at, &self.id)
    }

    /// Text body, empty for attachments without caption
    pub fn body(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Get a preview of the message (first N characters)
    pub fn preview(&self, max_len: usize) -> String {
        let text = match (self.message_type, self.content.as_deref()) {
            (_, Some(content)) if !content.is_empty() => content.to_string(),
            (MessageType::Image, _) => "[image]".to_string(),
            (MessageType::File, _) => {
                format!("[file] {}", self.file_name.as_deref().unwrap_or(""))
                    .trim_end()
                    .to_string()
            }
            (MessageType::Text | MessageType::System, _) => String::new(),
        };

        if text.chars().count() <= max_len {
            text
        } else {
            let mut preview: String = text.chars().take(max_len.saturating_sub(3)).collect();
            preview.push_str("...");
            preview
        }
    }
}

/// Request to insert a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_preview: Option<serde_json::Value>,
}

impl SendMessageRequest {
    /// Plain text request
    pub fn text(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: Some(content.into()),
            message_type: MessageType::Text,
            file_url: None,
            file_name: None,
            reply_to: None,
            link_preview: None,
        }
    }

    /// Membership announcement; never shown optimistically
    pub fn system(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::System,
            ..Self::text(conversation_id, sender_id, content)
        }
    }

    /// Materialize the optimistic copy shown before the backend confirms
    pub fn to_optimistic(&self, id: MessageId, created_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            message_type: self.message_type,
            file_url: self.file_url.clone(),
            file_name: self.file_name.clone(),
            reply_to: self.reply_to.clone(),
            link_preview: self.link_preview.clone(),
            created_at,
        }
    }
}
