use crate::error::{Result, SyncError};
use crate::polling::PollingConfig;
use crate::realtime::ChannelConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session-wide configuration for the sync layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_url: String,
    pub ws_url: String,
    pub api_token: Option<String>,
    /// How long a cached read is served without revalidation.
    pub freshness_ms: u64,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_backoff: f64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3001/api".to_string(),
            ws_url: "ws://127.0.0.1:3001/ws".to_string(),
            api_token: None,
            freshness_ms: 5_000,
            request_timeout_ms: 10_000,
            poll_interval_ms: 3_000,
            poll_max_interval_ms: 30_000,
            poll_backoff: 1.5,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            connect_timeout_ms: 10_000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl SyncConfig {
    /// Load config from `SIPSYNC_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            api_url: std::env::var("SIPSYNC_API_URL").unwrap_or(defaults.api_url),
            ws_url: std::env::var("SIPSYNC_WS_URL").unwrap_or(defaults.ws_url),
            api_token: std::env::var("SIPSYNC_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            freshness_ms: env_parse("SIPSYNC_FRESHNESS_MS").unwrap_or(defaults.freshness_ms),
            request_timeout_ms: env_parse("SIPSYNC_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            poll_interval_ms: env_parse("SIPSYNC_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval_ms),
            poll_max_interval_ms: env_parse("SIPSYNC_POLL_MAX_INTERVAL_MS")
                .unwrap_or(defaults.poll_max_interval_ms),
            poll_backoff: env_parse("SIPSYNC_POLL_BACKOFF").unwrap_or(defaults.poll_backoff),
            reconnect_attempts: env_parse("SIPSYNC_RECONNECT_ATTEMPTS")
                .unwrap_or(defaults.reconnect_attempts),
            reconnect_delay_ms: env_parse("SIPSYNC_RECONNECT_DELAY_MS")
                .unwrap_or(defaults.reconnect_delay_ms),
            connect_timeout_ms: env_parse("SIPSYNC_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
        };

        config.validate()?;
        Ok(config)
    }

    /// Load `{dir}/sipsync.json`, or fall back to the environment and then
    /// to defaults. Never fails: a broken file is logged and ignored.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join("sipsync.json");

        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str::<SyncConfig>(&content) {
                    Ok(config) => match config.validate() {
                        Ok(()) => {
                            tracing::info!(
                                "Loaded sync config: api_url={}, ws_url={}",
                                config.api_url,
                                config.ws_url
                            );
                            return config;
                        }
                        Err(e) => {
                            tracing::error!("Invalid sipsync.json: {}, using defaults", e);
                        }
                    },
                    Err(e) => {
                        tracing::error!("Failed to parse sipsync.json: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read sipsync.json: {}, using defaults", e);
                }
            }
        }

        match Self::from_env() {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Invalid SIPSYNC_* environment: {}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let api = url::Url::parse(&self.api_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(SyncError::Config(format!(
                "api_url must be http(s), got: {}",
                self.api_url
            )));
        }

        let ws = url::Url::parse(&self.ws_url)?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(SyncError::Config(format!(
                "ws_url must be ws(s), got: {}",
                self.ws_url
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(SyncError::Config("poll_interval_ms must be > 0".into()));
        }
        if self.poll_max_interval_ms < self.poll_interval_ms {
            return Err(SyncError::Config(format!(
                "poll_max_interval_ms ({}) is below poll_interval_ms ({})",
                self.poll_max_interval_ms, self.poll_interval_ms
            )));
        }
        if !(self.poll_backoff >= 1.0 && self.poll_backoff.is_finite()) {
            return Err(SyncError::Config(format!(
                "poll_backoff must be >= 1.0, got {}",
                self.poll_backoff
            )));
        }

        Ok(())
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig::new()
            .with_interval(Duration::from_millis(self.poll_interval_ms))
            .with_max_interval(Duration::from_millis(self.poll_max_interval_ms))
            .with_backoff_multiplier(self.poll_backoff)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig::new(self.ws_url.clone())
            .with_reconnect_attempts(self.reconnect_attempts)
            .with_reconnect_delay(Duration::from_millis(self.reconnect_delay_ms))
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
    }
}
