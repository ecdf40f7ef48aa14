//! Application configuration module
//!
//! Tunables of the sync engine and the address of the backend service.
//! Use [`AppConfig::builder`] to override defaults; `build` validates.

use std::time::Duration;
use thiserror::Error;

/// Default age after which a remote typing state is stale
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(6);
/// Default distance allowed between an optimistic message and its echo
pub const DEFAULT_MATCH_WINDOW: Duration = Duration::from_secs(30);

/// `value` as a timestamp span; `fallback` when it does not fit
pub fn span(value: Duration, fallback: Duration) -> chrono::Duration {
    chrono::Duration::from_std(value)
        .or_else(|_| chrono::Duration::from_std(fallback))
        .unwrap_or(chrono::Duration::MAX)
}

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// Base URL of the backend service
    pub backend_url: String,
    /// Public API key sent with every backend request
    pub anon_key: Option<String>,
    /// Upper bound on any single backend call
    pub request_timeout: Duration,
    /// Window within which repeated `mark_viewed` calls collapse to one write
    pub read_debounce: Duration,
    /// Idle time after which local typing is cleared
    pub typing_quiet_period: Duration,
    /// Remote typing states older than this are treated as stale
    pub typing_ttl: Duration,
    /// Maximum timestamp distance when matching an optimistic message to its echo
    pub optimistic_match_window: Duration,
    /// Maximum text length in characters
    pub max_message_len: usize,
    /// First resubscribe delay after a disconnect
    pub resubscribe_base_delay: Duration,
    /// Cap for the exponential resubscribe delay
    pub resubscribe_max_delay: Duration,
    /// Capacity of the engine's event channels
    pub event_buffer: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".to_string(),
            anon_key: None,
            request_timeout: Duration::from_secs(10),
            read_debounce: Duration::from_secs(2),
            typing_quiet_period: Duration::from_secs(2),
            typing_ttl: DEFAULT_TYPING_TTL,
            optimistic_match_window: DEFAULT_MATCH_WINDOW,
            max_message_len: 4000,
            resubscribe_base_delay: Duration::from_secs(1),
            resubscribe_max_delay: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

impl AppConfig {
    /// Create a new AppConfigBuilder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// `typing_ttl` for timestamp arithmetic
    pub fn typing_ttl_span(&self) -> chrono::Duration {
        span(self.typing_ttl, DEFAULT_TYPING_TTL)
    }

    /// `optimistic_match_window` for timestamp arithmetic
    pub fn match_window_span(&self) -> chrono::Duration {
        span(self.optimistic_match_window, DEFAULT_MATCH_WINDOW)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backend_url.starts_with("http://") || self.backend_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.backend_url.clone()));
        }
        let durations = [
            ("request_timeout", self.request_timeout),
            ("typing_quiet_period", self.typing_quiet_period),
            ("typing_ttl", self.typing_ttl),
            ("optimistic_match_window", self.optimistic_match_window),
            ("resubscribe_base_delay", self.resubscribe_base_delay),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroValue(name));
            }
        }
        if self.resubscribe_max_delay < self.resubscribe_base_delay {
            return Err(ConfigError::ZeroValue("resubscribe_max_delay"));
        }
        if self.max_message_len == 0 {
            return Err(ConfigError::ZeroValue("max_message_len"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::ZeroValue("event_buffer"));
        }
        Ok(())
    }
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    /// Set the backend URL; a trailing slash is dropped
    pub fn backend_url(mut self, url: impl Into<String>) -> Self {
        self.config.backend_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn anon_key(mut self, key: impl Into<String>) -> Self {
        self.config.anon_key = Some(key.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn read_debounce(mut self, window: Duration) -> Self {
        self.config.read_debounce = window;
        self
    }

    pub fn typing_quiet_period(mut self, period: Duration) -> Self {
        self.config.typing_quiet_period = period;
        self
    }

    pub fn typing_ttl(mut self, ttl: Duration) -> Self {
        self.config.typing_ttl = ttl;
        self
    }

    pub fn optimistic_match_window(mut self, window: Duration) -> Self {
        self.config.optimistic_match_window = window;
        self
    }

    pub fn max_message_len(mut self, len: usize) -> Self {
        self.config.max_message_len = len;
        self
    }

    pub fn resubscribe_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.resubscribe_base_delay = base;
        self.config.resubscribe_max_delay = max;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
