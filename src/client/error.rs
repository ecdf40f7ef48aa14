//! Sync Engine Errors
//!
//! Every failure the engine can surface. Transient errors (network loss,
//! timeouts) are retried or healed by a resnapshot; errors caused by a user
//! action are attached to the entity that action touched.

use std::time::Duration;
use thiserror::Error;

use crate::shared::config::ConfigError;
use crate::shared::error::SharedError;

/// Result type for engine and backend operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport is down; triggers resubscribe and resnapshot
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Row already exists (e.g. duplicate reaction)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referenced message or conversation is gone
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend refused the action for this user
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Rejected before any local mutation
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// The bounded request timeout elapsed
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Local side store failure
    #[error("local store error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Shared(SharedError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    /// Errors that heal on their own once connectivity returns
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_) | Self::Timeout(_))
    }

    /// Whether repeating the same action may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkUnavailable(_) | Self::Timeout(_) | Self::Conflict(_) | Self::Storage(_) => true,
            Self::NotFound(_)
            | Self::PermissionDenied(_)
            | Self::ValidationFailed(_)
            | Self::Shared(_)
            | Self::Config(_) => false,
        }
    }
}

impl From<SharedError> for SyncError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::ValidationError { field, message } => {
                Self::ValidationFailed(format!("{}: {}", field, message))
            }
            other => Self::Shared(other),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(SharedError::from(err))
    }
}

/// Run a backend call under the bounded request timeout
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout(limit)),
    }
}
