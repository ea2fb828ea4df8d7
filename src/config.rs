//! Runtime configuration for the live connection manager

use reqwest::Url;
use std::time::Duration;
use thiserror::Error;
use treadmill_shared::live;

/// Errors raised while validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid API base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("unsupported URL scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
}

/// Configuration for the live connection manager
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Base URL shared by the push and pull endpoints
    pub base_url: String,
    /// Credential used when the user has not stored one
    pub default_api_key: Option<String>,
    /// Whether the push transport may be used at all
    pub push_supported: bool,
    /// Interval between pull requests
    pub polling_interval: Duration,
    /// Timeout for a single pull request / stream handshake
    pub request_timeout: Duration,
    /// Longest silence tolerated on an open push stream
    pub stream_idle_timeout: Duration,
    /// Quiet period that coalesces reconnect triggers
    pub reconnect_debounce: Duration,
    /// Pause between teardown and the next connect attempt
    pub reconnect_settle: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".into(),
            default_api_key: None,
            push_supported: true,
            polling_interval: Duration::from_millis(live::DEFAULT_POLLING_INTERVAL_MS),
            request_timeout: Duration::from_secs(10),
            stream_idle_timeout: Duration::from_secs(live::STREAM_IDLE_TIMEOUT_SECS),
            reconnect_debounce: Duration::from_millis(live::RECONNECT_DEBOUNCE_MS),
            reconnect_settle: Duration::from_millis(live::RECONNECT_SETTLE_MS),
        }
    }
}

impl LiveConfig {
    /// Check the base URL and normalize the polling interval
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }

        self.base_url = self.base_url.trim_end_matches('/').to_string();
        self.default_api_key = self
            .default_api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
        self.polling_interval = clamp_polling_interval(self.polling_interval);

        Ok(self)
    }

    /// URL of the push endpoint
    pub fn stream_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), live::STREAM_PATH)
    }

    /// URL of the pull endpoint
    pub fn latest_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), live::LATEST_PATH)
    }
}

/// Apply the lower bound on the pull interval
pub fn clamp_polling_interval(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(live::MIN_POLLING_INTERVAL_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LiveConfig::default();
        assert!(config.push_supported);
        assert_eq!(config.polling_interval, Duration::from_millis(1000));
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(45));
        assert_eq!(config.reconnect_debounce, Duration::from_millis(200));
        assert_eq!(config.reconnect_settle, Duration::from_millis(250));
    }

    #[test]
    fn test_endpoint_urls() {
        let config = LiveConfig {
            base_url: "http://treadmill.local:8080/".into(),
            ..Default::default()
        }
        .validate()
        .expect("valid config");

        assert_eq!(config.stream_url(), "http://treadmill.local:8080/api/live/stream");
        assert_eq!(config.latest_url(), "http://treadmill.local:8080/api/live/latest");
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let bad = LiveConfig {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidBaseUrl { .. })));

        let ftp = LiveConfig {
            base_url: "ftp://example.com".into(),
            ..Default::default()
        };
        assert!(matches!(ftp.validate(), Err(ConfigError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_validate_normalizes_values() {
        let config = LiveConfig {
            default_api_key: Some("   ".into()),
            polling_interval: Duration::from_millis(100),
            ..Default::default()
        }
        .validate()
        .expect("valid config");

        assert_eq!(config.default_api_key, None);
        assert_eq!(config.polling_interval, Duration::from_millis(500));
    }
}
