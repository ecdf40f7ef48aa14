//! Shared Error Types
//!
//! Errors raised while validating user intents or decoding backend rows.
//! They carry no transport context; the client wraps them into its own
//! taxonomy.
//!
//! # Error Categories
//!
//! - `SerializationError` - JSON encoding/decoding of rows and payloads
//! - `ValidationError` - An intent rejected before it reaches the store
//! - `RowError` - A change event whose row is missing a required column
//!
//! # Usage
//!
//! ```rust
//! use chatsync::shared::error::SharedError;
//!
//! let error = SharedError::validation("content", "Message cannot be empty");
//! assert!(error.is_validation());
//! ```
use thiserror::Error;

/// Errors shared by the data model, the engine and the backend adapters
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SharedError {
    /// JSON serialization or deserialization error
    #[error("Serialization error: {message}")]
    SerializationError {
        /// Human-readable error message
        message: String,
    },

    /// Data validation error
    #[error("Validation error in field '{field}': {message}")]
    ValidationError {
        /// The field that failed validation
        field: String,
        /// Human-readable error message
        message: String,
    },

    /// Malformed row in a change notification or snapshot
    #[error("Malformed {table} row: {message}")]
    RowError {
        /// Backend table the row came from
        table: String,
        /// Human-readable error message
        message: String,
    },
}

impl SharedError {
    /// Create a new serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new row error
    pub fn row(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RowError {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::ValidationError { .. })
    }
}

impl From<serde_json::Error> for SharedError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(format!("JSON error: {}", err))
    }
}
