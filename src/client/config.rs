use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::shared::config::{AppConfig, AppConfigBuilder, ConfigError};

/// Environment variable overriding the backend URL
pub const ENV_BACKEND_URL: &str = "CHATSYNC_BACKEND_URL";
/// Environment variable holding the public API key
pub const ENV_ANON_KEY: &str = "CHATSYNC_ANON_KEY";
/// Environment variable overriding the request timeout, in seconds
pub const ENV_REQUEST_TIMEOUT: &str = "CHATSYNC_REQUEST_TIMEOUT_SECS";

/// Client configuration wrapper.
///
/// Holds the validated [`AppConfig`] plus the session token of the signed-in
/// user, and builds endpoint URLs for the REST adapter.
#[derive(Debug, Clone, Default)]
pub struct Config {
    app: AppConfig,
    token: Option<String>,
}

/// Keys accepted in a TOML configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    backend_url: Option<String>,
    anon_key: Option<String>,
    request_timeout_secs: Option<u64>,
    read_debounce_ms: Option<u64>,
    typing_quiet_period_ms: Option<u64>,
    typing_ttl_secs: Option<u64>,
    optimistic_match_window_secs: Option<u64>,
    max_message_len: Option<usize>,
    resubscribe_base_delay_ms: Option<u64>,
    resubscribe_max_delay_secs: Option<u64>,
    event_buffer: Option<usize>,
}

impl FileConfig {
    fn apply(self, mut builder: AppConfigBuilder, base: &AppConfig) -> AppConfigBuilder {
        if let Some(url) = self.backend_url {
            builder = builder.backend_url(url);
        }
        if let Some(key) = self.anon_key {
            builder = builder.anon_key(key);
        }
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(ms) = self.read_debounce_ms {
            builder = builder.read_debounce(Duration::from_millis(ms));
        }
        if let Some(ms) = self.typing_quiet_period_ms {
            builder = builder.typing_quiet_period(Duration::from_millis(ms));
        }
        if let Some(secs) = self.typing_ttl_secs {
            builder = builder.typing_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.optimistic_match_window_secs {
            builder = builder.optimistic_match_window(Duration::from_secs(secs));
        }
        if let Some(len) = self.max_message_len {
            builder = builder.max_message_len(len);
        }
        if self.resubscribe_base_delay_ms.is_some() || self.resubscribe_max_delay_secs.is_some() {
            let base_delay = self
                .resubscribe_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(base.resubscribe_base_delay);
            let max_delay = self
                .resubscribe_max_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(base.resubscribe_max_delay);
            builder = builder.resubscribe_delays(base_delay, max_delay);
        }
        if let Some(capacity) = self.event_buffer {
            builder = builder.event_buffer(capacity);
        }
        builder
    }
}

impl Config {
    /// Defaults overridden by `CHATSYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::with_builder(Self::env_overrides(AppConfig::builder())?)
    }

    pub fn with_builder(builder: AppConfigBuilder) -> Result<Self, ConfigError> {
        let app = builder.build()?;
        Ok(Self { app, token: None })
    }

    /// Load a TOML file, then apply environment overrides on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
            key: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key: "config file".to_string(),
            message: e.to_string(),
        })?;
        let builder = file.apply(AppConfig::builder(), &AppConfig::default());
        Self::with_builder(Self::env_overrides(builder)?)
    }

    fn env_overrides(mut builder: AppConfigBuilder) -> Result<AppConfigBuilder, ConfigError> {
        if let Ok(url) = std::env::var(ENV_BACKEND_URL) {
            builder = builder.backend_url(url);
        }
        if let Ok(key) = std::env::var(ENV_ANON_KEY) {
            builder = builder.anon_key(key);
        }
        if let Ok(raw) = std::env::var(ENV_REQUEST_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: ENV_REQUEST_TIMEOUT.to_string(),
                message: e.to_string(),
            })?;
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        Ok(builder)
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    /// Set the session access token
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    /// Get the session access token
    pub fn get_token(&self) -> Option<&String> {
        self.token.as_ref()
    }

    /// Clear the token (sign-out)
    pub fn clear_token(&mut self) {
        self.token = None;
    }

    /// Bearer credential: the session token, else the anon key
    pub fn bearer(&self) -> Option<&str> {
        self.token.as_deref().or(self.app.anon_key.as_deref())
    }

    /// Get the full URL for an API endpoint
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.backend_url(), path)
    }

    pub fn backend_url(&self) -> &str {
        &self.app.backend_url
    }
}
