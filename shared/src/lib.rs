//! Treadmill Live Shared Types
//!
//! This crate provides the wire types, the Server-Sent-Events codec and the
//! connection status state machine shared by the live connection manager and
//! the mock backend.

pub mod codec;
pub mod state_machine;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Get the current time as an RFC 3339 / ISO-8601 string (UTC, milliseconds)
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parameters of the live feed
pub mod live {
    /// Lower bound for the pull transport interval
    pub const MIN_POLLING_INTERVAL_MS: u64 = 500;

    /// Pull transport interval used until the caller picks one
    pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;

    /// Quiet period that coalesces a burst of reconnect triggers
    pub const RECONNECT_DEBOUNCE_MS: u64 = 200;

    /// Pause between tearing down a transport and starting the next one
    pub const RECONNECT_SETTLE_MS: u64 = 250;

    /// Push stream silence (no data, no keep-alive) after which it counts as failed
    pub const STREAM_IDLE_TIMEOUT_SECS: u64 = 45;

    /// Upper bound of the exponential backoff
    pub const MAX_BACKOFF_SECS: u64 = 30;

    /// `last_error` value reported when the pull endpoint answers 404
    pub const NOT_FOUND_ERROR: &str = "not_found";

    /// Push endpoint (server-sent events)
    pub const STREAM_PATH: &str = "/api/live/stream";

    /// Pull endpoint (latest sample)
    pub const LATEST_PATH: &str = "/api/live/latest";

    /// Header carrying the credential on pull requests
    pub const API_KEY_HEADER: &str = "x-api-key";

    /// Query parameter carrying the credential on the push stream
    pub const API_KEY_QUERY: &str = "apiKey";
}

/// Backoff delay in seconds for the given (1-based) retry attempt: `min(30, 2^attempt)`
pub fn backoff_delay_secs(attempt: u32) -> u64 {
    2u64.checked_pow(attempt)
        .unwrap_or(u64::MAX)
        .min(live::MAX_BACKOFF_SECS)
}

/// One telemetry reading from the treadmill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub speed: f64,
    pub incline: f64,
    pub distance: f64,
    pub calories: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cadence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<f64>,
    pub timestamp: String,
}

/// Mechanism used to acquire samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Server-initiated event stream
    Push,
    /// Periodic request for the latest sample
    Pull,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Push => write!(f, "SSE"),
            Transport::Pull => write!(f, "Polling"),
        }
    }
}

/// Externally visible connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Offline,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// Snapshot of the live connection as seen by subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub transport: Transport,
    pub retry_in_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// Initial state for a manager that is about to use `transport`
    pub fn connecting(transport: Transport) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            transport,
            retry_in_seconds: None,
            last_error: None,
        }
    }

    /// Whether a manual retry is meaningful (the pull transport gave up)
    pub fn can_retry(&self) -> bool {
        self.status == ConnectionStatus::Disconnected && self.transport == Transport::Pull
    }
}
