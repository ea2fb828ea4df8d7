//! Transports and manager against the mock backend over real HTTP

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use treadmill_live::network::ReachabilityProbe;
use treadmill_live::transport::{PollingConnector, PullConnector, PushConnector, SseConnector, TransportError};
use treadmill_live::{
    connectivity, ConnectionState, ConnectionStatus, CredentialStore, LiveConfig,
    LiveConnectionManager, Sample, StateStream, Transport,
};
use treadmill_mock_backend::{bind, AppState, Simulator};
use treadmill_shared::codec::decode_sample;

const WAIT: Duration = Duration::from_secs(10);

fn sample(speed: f64) -> Sample {
    Sample {
        speed,
        incline: 2.0,
        distance: 1.25,
        calories: 80.0,
        heart_rate: Some(130.0),
        cadence: None,
        steps: None,
        timestamp: "2024-05-01T10:00:00.000Z".into(),
    }
}

async fn start_backend(api_key: Option<&str>) -> (LiveConfig, AppState) {
    let state = AppState::new(Simulator::new(), api_key.map(str::to_string));
    let (addr, _server) = bind("127.0.0.1:0", state.clone()).await.unwrap();

    let config = LiveConfig {
        base_url: format!("http://{}", addr),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
    .validate()
    .unwrap();

    (config, state)
}

async fn wait_for(states: &mut StateStream, status: ConnectionStatus) -> ConnectionState {
    timeout(WAIT, async {
        loop {
            let state = states.next().await.expect("state stream ended");
            if state.status == status {
                return state;
            }
        }
    })
    .await
    .expect("timed out waiting for state")
}

#[tokio::test]
async fn test_sse_connector_receives_samples() {
    let (config, state) = start_backend(None).await;
    state.simulator().publish(sample(8.5));

    let connector = SseConnector::from_config(&config).unwrap();
    let mut stream = connector.open(None).await.unwrap();

    let first = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(decode_sample(&first).unwrap().speed, 8.5);

    state.simulator().publish(sample(9.5));
    let second = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(decode_sample(&second).unwrap().speed, 9.5);
}

#[tokio::test]
async fn test_sse_connector_sends_key_as_query() {
    let (config, state) = start_backend(Some("k-42")).await;
    state.simulator().publish(sample(6.0));
    let connector = SseConnector::from_config(&config).unwrap();

    match connector.open(None).await {
        Err(TransportError::Status { code }) => assert_eq!(code, 401),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("stream opened without a key"),
    }

    let mut stream = connector.open(Some("k-42")).await.unwrap();
    let first = timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(decode_sample(&first).unwrap().speed, 6.0);
}

#[tokio::test]
async fn test_polling_connector_statuses() {
    let (config, state) = start_backend(Some("k-1")).await;
    let connector = PollingConnector::from_config(&config).unwrap();

    assert!(matches!(
        connector.fetch_latest(None).await,
        Err(TransportError::Status { code: 401 })
    ));
    assert!(matches!(
        connector.fetch_latest(Some("k-1")).await,
        Err(TransportError::NotFound)
    ));

    state.simulator().publish(sample(7.0));
    let body = connector.fetch_latest(Some("k-1")).await.unwrap();
    assert_eq!(decode_sample(&body).unwrap(), sample(7.0));
}

#[tokio::test]
async fn test_manager_streams_then_switches_to_polling() {
    let (config, state) = start_backend(None).await;
    state.simulator().publish(sample(5.0));

    let (_signal, watch) = connectivity(true);
    let credentials = Arc::new(CredentialStore::in_memory(None));
    let manager = LiveConnectionManager::with_http_transports(config, watch, credentials).unwrap();
    let mut states = manager.subscribe_state();
    let mut samples = manager.subscribe_samples();

    let connected = wait_for(&mut states, ConnectionStatus::Connected).await;
    assert_eq!(connected.transport, Transport::Push);
    let received = timeout(WAIT, samples.next()).await.unwrap().unwrap();
    assert_eq!(received.speed, 5.0);

    manager.set_credential(Some("any".into()));
    let connecting = wait_for(&mut states, ConnectionStatus::Connecting).await;
    assert_eq!(connecting.transport, Transport::Pull);
    let connected = wait_for(&mut states, ConnectionStatus::Connected).await;
    assert_eq!(connected.transport, Transport::Pull);

    manager.shutdown();
    assert!(timeout(WAIT, states.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_manager_pull_not_found_then_retry() {
    let (mut config, state) = start_backend(None).await;
    config.push_supported = false;
    config.polling_interval = Duration::from_millis(500);

    let (_signal, watch) = connectivity(true);
    let credentials = Arc::new(CredentialStore::in_memory(None));
    let manager = LiveConnectionManager::with_http_transports(config, watch, credentials).unwrap();
    let mut states = manager.subscribe_state();

    let stopped = wait_for(&mut states, ConnectionStatus::Disconnected).await;
    assert_eq!(stopped.transport, Transport::Pull);
    assert_eq!(stopped.retry_in_seconds, None);
    assert_eq!(stopped.last_error.as_deref(), Some("not_found"));

    state.simulator().publish(sample(4.0));
    assert!(manager.retry());

    let connected = wait_for(&mut states, ConnectionStatus::Connected).await;
    assert_eq!(connected.last_error, None);
    assert_eq!(manager.latest_sample().unwrap().speed, 4.0);
}

#[tokio::test]
async fn test_backend_outage_is_not_reported_offline() {
    // Reserve a port, then close it so nothing listens there
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = LiveConfig {
        base_url: format!("http://{}", addr),
        request_timeout: Duration::from_secs(2),
        ..Default::default()
    }
    .validate()
    .unwrap();

    let (signal, watch) = connectivity(true);
    let probe = ReachabilityProbe::for_base_url(&config.base_url, Duration::from_millis(50))
        .unwrap()
        .spawn(signal);

    let credentials = Arc::new(CredentialStore::in_memory(None));
    let manager = LiveConnectionManager::with_http_transports(config, watch.clone(), credentials).unwrap();
    let mut states = manager.subscribe_state();

    let failed = wait_for(&mut states, ConnectionStatus::Disconnected).await;
    assert_eq!(failed.retry_in_seconds, Some(2));

    // Several check rounds later the device is still considered online
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(watch.is_online());
    assert_eq!(manager.state().status, ConnectionStatus::Disconnected);
    probe.stop();
}
