//! Shared Module
//!
//! This module contains types and data structures that are shared between
//! the sync engine and any backend adapter. These types are used for
//! serialization of backend rows and change notifications.
//!
//! # Overview
//!
//! The shared module provides platform-agnostic types that can be used
//! by the engine, by the in-memory backend and by the REST adapter. All
//! row types serialize to the column names of the backend tables.

/// Change notifications delivered by the event bus
pub mod event;

/// Shared error types
pub mod error;

/// Application configuration
pub mod config;

/// Messaging data model
pub mod messaging;

/// Re-export commonly used types for convenience
pub use config::{AppConfig, AppConfigBuilder, ConfigError};
pub use error::SharedError;
pub use event::{ChangeEvent, ChangeOp, EntityKind};
