//! chatsync - Client Sync Engine for Chat
//!
//! chatsync keeps a chat client's local view of conversations, messages,
//! reactions, read cursors and typing state consistent with a hosted
//! backend, under unreliable networks and optimistic local actions.
//!
//! # Overview
//!
//! - Optimistic sends with temporary ids, replaced in place on confirmation
//! - Ordered per-conversation message log without duplicates
//! - Reaction toggles with rollback on failure
//! - Debounced read cursors and derived read status
//! - Typing indicators with a quiet period and remote expiry
//! - Resubscribe with backoff and a resnapshot after every reconnect
//!
//! # Module Structure
//!
//! - **`shared`** - Row types, change events, configuration, shared errors
//! - **`client`** - The sync engine and its adapters
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatsync::client::{LocalDatabase, MemoryBackend, SyncEngine};
//! use chatsync::shared::AppConfig;
//!
//! # async fn example(conversation_id: uuid::Uuid, me: uuid::Uuid) -> chatsync::client::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let db = LocalDatabase::in_memory().await?;
//! let mut engine = SyncEngine::start(AppConfig::default(), backend, db, me).await?;
//!
//! engine.open_conversation(conversation_id).await?;
//! let temp_id = engine.send_message(conversation_id, "hello", None).await?;
//! while engine.process_next().await {
//!     // render engine.snapshot(conversation_id)
//! }
//! # let _ = temp_id;
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! - `client::SyncError` for every engine and backend failure
//! - `shared::SharedError` for row decoding and validation of shared types

/// Shared types and data structures
pub mod shared;

/// Client sync engine
pub mod client;
