//! Message Reactions

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::MessageId;

/// Row of `message_reactions`, unique per (message, user, emoji)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: Uuid,
    pub emoji: String,
}

impl Reaction {
    pub fn new(message_id: MessageId, user_id: Uuid, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            emoji: emoji.into(),
        }
    }
}

/// Aggregated view of one emoji on one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionCount {
    pub emoji: String,
    pub count: usize,
    /// Whether the local user is among the reactors
    pub reacted_by_me: bool,
}
