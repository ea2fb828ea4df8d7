//! Reachability probe
//!
//! Periodically opens a TCP connection to a target and reports the outcome on
//! a [`ConnectivitySignal`]. Only failures that say nothing answered at all
//! (timeouts, unreachable network or host) mark the device offline. A refused
//! or reset connection proves the network path works, so a stopped backend
//! stays a transport failure and keeps its backoff.
//!
//! A powered-off target host still looks like an outage; point the probe at
//! something other than the backend when that matters.

use super::ConnectivitySignal;
use crate::config::ConfigError;
use reqwest::Url;
use std::time::Duration;
use std::io;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;

/// Probe configuration and target
#[derive(Debug, Clone)]
pub struct ReachabilityProbe {
    /// `host:port` to connect to
    address: String,
    /// Time between probes
    period: Duration,
    /// Connect timeout for a single probe
    connect_timeout: Duration,
}

impl ReachabilityProbe {
    /// Create a probe for an explicit `host:port`
    pub fn new(address: impl Into<String>, period: Duration) -> Self {
        Self {
            address: address.into(),
            period,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Create a probe targeting the host of an HTTP(S) base URL
    pub fn for_base_url(base_url: &str, period: Duration) -> Result<Self, ConfigError> {
        let url = Url::parse(base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;

        let host = url.host_str().ok_or_else(|| ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: "missing host".into(),
        })?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConfigError::UnsupportedScheme(url.scheme().to_string()))?;

        Ok(Self::new(format!("{}:{}", host, port), period))
    }

    /// Override the per-probe connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Target address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Run a single probe; true when the network path to the target works
    pub async fn check_once(&self) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) if reached_peer(&e) => {
                debug!("[NET] Probe to {} answered: {}", self.address, e);
                true
            }
            Ok(Err(e)) => {
                debug!("[NET] Probe to {} failed: {}", self.address, e);
                false
            }
            Err(_) => {
                debug!("[NET] Probe to {} timed out", self.address);
                false
            }
        }
    }

    /// Start probing in the background, reporting on `signal`
    pub fn spawn(self, signal: ConnectivitySignal) -> ProbeHandle {
        let task = tokio::spawn(async move {
            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let online = self.check_once().await;
                signal.set_online(online);
            }
        });

        ProbeHandle { task }
    }
}

/// Whether a connect error was produced by the remote end
fn reached_peer(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// Handle to stop a running probe; dropping it stops the probe as well
pub struct ProbeHandle {
    task: JoinHandle<()>,
}

impl ProbeHandle {
    /// Stop probing
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
