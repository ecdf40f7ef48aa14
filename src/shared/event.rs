//! Change Events
//!
//! A change event is one row-level notification from the backend's change
//! feed: which table changed, how, and the row itself (the old row for
//! deletes). Events are ordered only within a single table's stream.
//!
//! On the wire an event looks like:
//!
//! ```json
//! {"table": "messages", "event_type": "INSERT", "row": {"id": "abc-123", "...": "..."}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::SharedError;

/// Backend entity (table) a change refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    #[serde(rename = "conversations")]
    Conversation,
    #[serde(rename = "conversation_participants")]
    Participant,
    #[serde(rename = "messages")]
    Message,
    #[serde(rename = "message_reactions")]
    Reaction,
    #[serde(rename = "profiles")]
    Profile,
    #[serde(rename = "typing_indicators")]
    Typing,
    #[serde(rename = "conversation_views")]
    ReadCursor,
    #[serde(rename = "favourite_conversations")]
    Favourite,
    #[serde(rename = "blocked_users")]
    Block,
    #[serde(rename = "group_notifications")]
    GroupNotification,
}

impl EntityKind {
    /// Entities an open conversation subscribes to
    pub const CONVERSATION_SCOPED: [EntityKind; 6] = [
        EntityKind::Conversation,
        EntityKind::Participant,
        EntityKind::Message,
        EntityKind::Reaction,
        EntityKind::Typing,
        EntityKind::ReadCursor,
    ];

    /// Backend table name
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Conversation => "conversations",
            EntityKind::Participant => "conversation_participants",
            EntityKind::Message => "messages",
            EntityKind::Reaction => "message_reactions",
            EntityKind::Profile => "profiles",
            EntityKind::Typing => "typing_indicators",
            EntityKind::ReadCursor => "conversation_views",
            EntityKind::Favourite => "favourite_conversations",
            EntityKind::Block => "blocked_users",
            EntityKind::GroupNotification => "group_notifications",
        }
    }

    pub fn from_table(table: &str) -> Option<Self> {
        let kind = match table {
            "conversations" => EntityKind::Conversation,
            "conversation_participants" => EntityKind::Participant,
            "messages" => EntityKind::Message,
            "message_reactions" => EntityKind::Reaction,
            "profiles" => EntityKind::Profile,
            "typing_indicators" => EntityKind::Typing,
            "conversation_views" => EntityKind::ReadCursor,
            "favourite_conversations" => EntityKind::Favourite,
            "blocked_users" => EntityKind::Block,
            "group_notifications" => EntityKind::GroupNotification,
            _ => return None,
        };
        Some(kind)
    }

    /// Column a subscription filter uses to scope this entity to one
    /// conversation. Reactions carry no conversation column.
    pub fn conversation_column(&self) -> Option<&'static str> {
        match self {
            EntityKind::Conversation => Some("id"),
            EntityKind::Reaction | EntityKind::Profile | EntityKind::Block => None,
            _ => Some("conversation_id"),
        }
    }
}

/// Kind of row change
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// Row-level change notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// Table that changed
    #[serde(rename = "table")]
    pub entity: EntityKind,
    /// How it changed
    #[serde(rename = "event_type")]
    pub op: ChangeOp,
    /// New row for inserts/updates, old row for deletes
    pub row: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(entity: EntityKind, op: ChangeOp, row: serde_json::Value) -> Self {
        Self { entity, op, row }
    }

    /// Build an event from a typed row
    pub fn from_row<T: Serialize>(entity: EntityKind, op: ChangeOp, row: &T) -> Result<Self, SharedError> {
        Ok(Self::new(entity, op, serde_json::to_value(row)?))
    }

    /// Conversation the row belongs to, when the entity carries one
    pub fn conversation_id(&self) -> Option<Uuid> {
        let column = self.entity.conversation_column()?;
        self.row
            .get(column)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Decode the row into a typed record
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SharedError> {
        serde_json::from_value(self.row.clone())
            .map_err(|e| SharedError::row(self.entity.table(), e.to_string()))
    }
}
