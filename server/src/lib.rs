//! Mock live-telemetry backend
//!
//! Serves the two endpoints the live client talks to:
//! - `GET /api/live/stream`: server-sent events, one `message` per sample
//! - `GET /api/live/latest`: the most recent sample as JSON, 404 before the first one

mod simulator;

pub use simulator::Simulator;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use treadmill_shared::{codec::encode_sample, live, Sample};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    simulator: Simulator,
    /// Key clients must present; `None` disables the check
    api_key: Option<String>,
    /// Status the pull endpoint answers with instead of data (0 = none)
    forced_status: Arc<AtomicU16>,
}

impl AppState {
    pub fn new(simulator: Simulator, api_key: Option<String>) -> Self {
        Self {
            simulator,
            api_key,
            forced_status: Arc::new(AtomicU16::new(0)),
        }
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    /// Make the pull endpoint fail with `status` until cleared with `None`
    pub fn force_status(&self, status: Option<StatusCode>) {
        let code = status.map(|s| s.as_u16()).unwrap_or(0);
        self.forced_status.store(code, Ordering::SeqCst);
    }

    fn authorized(&self, headers: &HeaderMap, query: &KeyQuery) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };

        let header = headers
            .get(live::API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());

        header == Some(expected.as_str()) || query.api_key.as_deref() == Some(expected.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(live::STREAM_PATH, get(stream_handler))
        .route(live::LATEST_PATH, get(latest_handler))
        .with_state(state)
}

/// Serve on an already bound listener in the background
pub fn spawn(listener: TcpListener, state: AppState) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move { axum::serve(listener, router(state)).await })
}

/// Bind `addr` and serve in the background, returning the bound address
pub async fn bind(
    addr: &str,
    state: AppState,
) -> std::io::Result<(SocketAddr, JoinHandle<std::io::Result<()>>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("[MOCK] Listening on {}", local);
    Ok((local, spawn(listener, state)))
}

async fn latest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Response {
    if !state.authorized(&headers, &query) {
        warn!("[MOCK] Rejected pull request without a valid key");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    // 0 is not a valid status code
    if let Ok(status) = StatusCode::from_u16(state.forced_status.load(Ordering::SeqCst)) {
        return status.into_response();
    }

    match state.simulator.latest() {
        Some(sample) => Json(sample).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Response {
    if !state.authorized(&headers, &query) {
        warn!("[MOCK] Rejected stream without a valid key");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    debug!("[MOCK] Stream opened");
    Sse::new(sample_events(state.simulator.subscribe()))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// One SSE `message` per sample, starting with the current one if present
fn sample_events(
    rx: watch::Receiver<Option<Sample>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !(first && rx.borrow().is_some()) {
            rx.changed().await.ok()?;
        }
        let current = rx.borrow_and_update().clone();

        let event = match current.map(|sample| encode_sample(&sample)) {
            Some(Ok(data)) => Event::default().data(data),
            Some(Err(e)) => {
                warn!("[MOCK] Failed to encode sample: {}", e);
                Event::default().comment("encode error")
            }
            None => Event::default().comment("no sample"),
        };
        Some((Ok(event), (rx, false)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(speed: f64) -> Sample {
        Sample {
            speed,
            incline: 1.0,
            distance: 0.2,
            calories: 10.0,
            heart_rate: None,
            cadence: None,
            steps: None,
            timestamp: "2024-05-01T10:00:00.000Z".into(),
        }
    }

    async fn start(api_key: Option<&str>) -> (String, AppState) {
        let state = AppState::new(Simulator::new(), api_key.map(str::to_string));
        let (addr, _task) = bind("127.0.0.1:0", state.clone()).await.unwrap();
        (format!("http://{}", addr), state)
    }

    #[tokio::test]
    async fn test_latest_is_404_until_first_sample() {
        let (base, state) = start(None).await;
        let url = format!("{}{}", base, live::LATEST_PATH);

        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status().as_u16(), 404);

        state.simulator().publish(sample(7.0));
        let body: Sample = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body.speed, 7.0);
    }

    #[tokio::test]
    async fn test_key_required_when_configured() {
        let (base, state) = start(Some("k1")).await;
        state.simulator().publish(sample(7.0));
        let url = format!("{}{}", base, live::LATEST_PATH);
        let client = reqwest::Client::new();

        let denied = client.get(&url).send().await.unwrap();
        assert_eq!(denied.status().as_u16(), 401);

        let by_header = client
            .get(&url)
            .header(live::API_KEY_HEADER, "k1")
            .send()
            .await
            .unwrap();
        assert!(by_header.status().is_success());

        let by_query = client
            .get(format!("{}?apiKey=k1", url))
            .send()
            .await
            .unwrap();
        assert!(by_query.status().is_success());
    }

    #[tokio::test]
    async fn test_forced_status() {
        let (base, state) = start(None).await;
        state.simulator().publish(sample(7.0));
        state.force_status(Some(StatusCode::INTERNAL_SERVER_ERROR));

        let url = format!("{}{}", base, live::LATEST_PATH);
        assert_eq!(reqwest::get(&url).await.unwrap().status().as_u16(), 500);

        state.force_status(None);
        assert!(reqwest::get(&url).await.unwrap().status().is_success());
    }
}
