//! Transport trait abstraction for pluggable push/pull backends

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use treadmill_shared::codec::CodecError;

/// Raw message payloads delivered by an open push transport
pub type PushStream = BoxStream<'static, Result<String, TransportError>>;

/// Errors reported by a transport
///
/// The `Display` output is what subscribers see as `last_error`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not_found")]
    NotFound,

    #[error("server responded with status {code}")]
    Status { code: u16 },

    #[error("request failed: {0}")]
    Request(String),

    #[error("stream closed by server")]
    StreamClosed,

    #[error("no data from stream for {0:?}")]
    IdleTimeout(Duration),

    #[error("malformed event stream: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) if status == reqwest::StatusCode::NOT_FOUND => TransportError::NotFound,
            Some(status) => TransportError::Status {
                code: status.as_u16(),
            },
            None => TransportError::Request(e.to_string()),
        }
    }
}

/// Factory for long-lived server-initiated streams
#[async_trait]
pub trait PushConnector: Send + Sync {
    /// Open the stream, returning message payloads as they arrive
    async fn open(&self, credential: Option<&str>) -> Result<PushStream, TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Request/response access to the latest sample
#[async_trait]
pub trait PullConnector: Send + Sync {
    /// Fetch the latest sample body
    async fn fetch_latest(&self, credential: Option<&str>) -> Result<String, TransportError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// The pair of connectors a manager chooses between
#[derive(Clone)]
pub struct Transports {
    pub push: Arc<dyn PushConnector>,
    pub pull: Arc<dyn PullConnector>,
}

impl Transports {
    pub fn new(push: Arc<dyn PushConnector>, pull: Arc<dyn PullConnector>) -> Self {
        Self { push, pull }
    }
}
