//! Client Sync Engine Module
//!
//! Keeps a client's local view of conversations consistent with the backend
//! while the network is flaky and users act optimistically.
//!
//! # Architecture
//!
//! - **`engine`** - `SyncEngine`, the single owner of local state
//! - **`store`** - Per-conversation partitions and change notifications
//! - **`reconciler`** - Snapshot and live event merge
//! - **`event_bus`** - Per-conversation subscriptions with resubscribe
//! - **`outbox`** - Ordered send lane, presence lane, optimistic ids
//! - **`tracker`** - Debounced read cursors, typing timers, read status
//! - **`local_db`** - SQLite side store for drafts and cursor fallback
//! - **`backend`** - `BackendService` trait with REST and in-memory adapters
//! - **`retry`** - Backoff strategies and retry policy
//! - **`config`** / **`error`** - Configuration loading and `SyncError`
//!
//! # Module Structure
//!
//! ```text
//! client/
//! ├── mod.rs        - Module exports and documentation
//! ├── main.rs       - Demo binary
//! ├── engine.rs     - Sync engine
//! ├── store/        - Local state store
//! ├── reconciler.rs - Merge rules
//! ├── event_bus.rs  - Subscriptions
//! ├── outbox/       - Write lanes and queue
//! ├── tracker.rs    - Read and typing tracking
//! ├── local_db/     - SQLite side store
//! ├── backend/      - Backend adapters
//! ├── retry.rs      - Backoff
//! ├── config.rs     - Configuration
//! └── error.rs      - Errors
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod local_db;
pub mod outbox;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod tracker;

// Re-export commonly used types
pub use backend::{BackendService, MemoryBackend, RestBackend};
pub use config::Config;
pub use engine::{EngineInput, EngineSignal, SyncEngine};
pub use error::{Result, SyncError};
pub use event_bus::SubscriptionStatus;
pub use local_db::LocalDatabase;
pub use store::{ConversationState, EntryState, LocalStateStore, MessageEntry, StoreChange};
