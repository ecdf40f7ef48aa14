//! Messaging Module
//!
//! This module contains all the data structures for the messaging system:
//!
//! - `ChatMessage` - A message in a conversation
//! - `Conversation` - A direct or group conversation
//! - `Participant` / `Profile` - Conversation membership and user profiles
//! - `Reaction` - An emoji attached to a message by a user
//! - `ReadCursor` / `TypingState` - Per-user presence rows
//!
//! # Usage
//!
//! ```rust
//! use chatsync::shared::messaging::{ChatMessage, Conversation, MessageId, Reaction};
//! ```

pub mod conversation;
pub mod message;
pub mod participant;
pub mod presence;
pub mod reaction;

// Re-export all types
pub use conversation::{
    Conversation, ConversationKind, ConversationSummary, CreateConversationRequest,
    GroupNotification,
};
pub use message::{ChatMessage, MessageId, MessageType, SendMessageRequest};
pub use participant::{Participant, Profile};
pub use presence::{derive_status, ReadCursor, ReadStatus, TypingState};
pub use reaction::{Reaction, ReactionCount};
