//! Push transport over Server-Sent Events

use crate::config::LiveConfig;
use crate::transport::traits::{PushConnector, PushStream, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::{Client, StatusCode, Url};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};
use treadmill_shared::codec::SseDecoder;
use treadmill_shared::live;

/// Connector for the live event stream endpoint
pub struct SseConnector {
    client: Client,
    url: String,
    /// Silence after which an open stream is reported as failed
    idle_timeout: Duration,
}

impl SseConnector {
    /// Create a connector for the given stream URL
    ///
    /// The handshake is bounded by `connect_timeout`. Once open, the stream fails
    /// after 45 s without any bytes (keep-alive comments count).
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
            idle_timeout: Duration::from_secs(live::STREAM_IDLE_TIMEOUT_SECS),
        })
    }

    /// Override the idle limit of open streams
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Create a connector for the stream endpoint of `config`
    pub fn from_config(config: &LiveConfig) -> Result<Self, TransportError> {
        Ok(Self::new(config.stream_url(), config.request_timeout)?
            .with_idle_timeout(config.stream_idle_timeout))
    }

    /// Build the request URL, carrying the credential as a query parameter
    fn request_url(&self, credential: Option<&str>) -> Result<Url, TransportError> {
        let mut url =
            Url::parse(&self.url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;

        if let Some(key) = credential {
            url.query_pairs_mut().append_pair(live::API_KEY_QUERY, key);
        }

        Ok(url)
    }
}

#[async_trait]
impl PushConnector for SseConnector {
    async fn open(&self, credential: Option<&str>) -> Result<PushStream, TransportError> {
        let url = self.request_url(credential)?;
        debug!("[SSE] Opening {}", self.url);

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(TransportError::NotFound),
            status if !status.is_success() => Err(TransportError::Status {
                code: status.as_u16(),
            }),
            _ => Ok(message_stream(response.bytes_stream(), self.idle_timeout)),
        }
    }

    fn name(&self) -> &'static str {
        "SSE"
    }
}

struct StreamState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    idle_timeout: Duration,
    done: bool,
}

/// Turn a chunked event-stream body into message payloads
///
/// Named events are skipped. The stream always ends with an error item so the
/// consumer can tell a closed stream from a quiet one; a body that delivers
/// nothing for `idle_timeout` ends it with [`TransportError::IdleTimeout`].
pub fn message_stream<S, E>(body: S, idle_timeout: Duration) -> PushStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<TransportError> + Send + 'static,
{
    let state = StreamState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        idle_timeout,
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            match state.decoder.decode_next() {
                Ok(Some(event)) if event.is_message() => return Some((Ok(event.data), state)),
                Ok(Some(event)) => {
                    debug!("[SSE] Ignoring named event {:?}", event.event);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
            }

            match timeout(state.idle_timeout, state.body.next()).await {
                Ok(Some(Ok(chunk))) => state.decoder.extend(&chunk),
                Ok(Some(Err(e))) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                Ok(None) => {
                    state.done = true;
                    return Some((Err(TransportError::StreamClosed), state));
                }
                Err(_) => {
                    warn!("[SSE] No data for {:?}, dropping stream", state.idle_timeout);
                    state.done = true;
                    return Some((Err(TransportError::IdleTimeout(state.idle_timeout)), state));
                }
            }
        }
    })
    .boxed()
}
