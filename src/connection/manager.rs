//! Live connection manager with transport selection and automatic reconnection

use super::publisher::{Publisher, SampleStream, StateStream};
use crate::config::{clamp_polling_interval, LiveConfig};
use crate::credential::CredentialStore;
use crate::network::ConnectivityWatch;
use crate::transport::{
    PollingConnector, PullConnector, PushConnector, SseConnector, TransportError, Transports,
};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use treadmill_shared::codec::decode_sample;
use treadmill_shared::state_machine::{
    is_valid_transition, LinkEvent, LinkStateMachine, TransitionResult,
};
use treadmill_shared::{backoff_delay_secs, ConnectionState, Sample, Transport};

/// Requests sent from the public handle to the driver task
#[derive(Debug)]
enum Command {
    /// User asked to reconnect
    Retry,
    /// Pull interval changed
    SetPollingInterval(Duration),
    /// The resolved credential may have changed
    CredentialChanged,
    /// Stop everything
    Shutdown,
}

/// Something a transport task observed
#[derive(Debug)]
enum TransportEvent {
    /// A raw sample payload
    Payload(String),
    /// The transport stopped with an error
    Failed(TransportError),
}

/// Transport event tagged with the attempt that produced it
#[derive(Debug)]
struct AttemptEvent {
    generation: u64,
    event: TransportEvent,
}

/// The running transport of the current attempt; aborted when dropped
struct ActiveTransport {
    transport: Transport,
    task: JoinHandle<()>,
}

impl Drop for ActiveTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Manages the live sample feed: one transport at a time, self-healing
pub struct LiveConnectionManager {
    /// Channel to the driver task
    cmd_tx: mpsc::UnboundedSender<Command>,
    /// Snapshots and samples handed to subscribers
    publisher: Arc<Publisher>,
    /// Effective credential
    credentials: Arc<CredentialStore>,
    /// Pull interval in milliseconds, shared with the driver
    polling_interval_ms: Arc<AtomicU64>,
    _task: JoinHandle<()>,
}

impl LiveConnectionManager {
    /// Create a new manager and start the first connection attempt
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: LiveConfig,
        transports: Transports,
        connectivity: ConnectivityWatch,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        let polling_interval = clamp_polling_interval(config.polling_interval);
        let initial_transport =
            select_transport(config.push_supported, credentials.has_credential());

        let fsm = LinkStateMachine::new(initial_transport);
        let publisher = Arc::new(Publisher::new(fsm.snapshot()));
        let polling_interval_ms = Arc::new(AtomicU64::new(polling_interval.as_millis() as u64));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            online: connectivity.is_online(),
            config,
            transports,
            credentials: credentials.clone(),
            publisher: publisher.clone(),
            fsm,
            polling_interval,
            attempt: 0,
            generation: 0,
            active: None,
            backoff_deadline: None,
            debounce_deadline: None,
            settle_deadline: None,
            events_tx,
        };

        // Spawn the driver loop
        let task = tokio::spawn(driver.run(cmd_rx, events_rx, connectivity));

        Self {
            cmd_tx,
            publisher,
            credentials,
            polling_interval_ms,
            _task: task,
        }
    }

    /// Create a manager talking HTTP to the endpoints in `config`
    pub fn with_http_transports(
        config: LiveConfig,
        connectivity: ConnectivityWatch,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self, TransportError> {
        let push: Arc<dyn PushConnector> = Arc::new(SseConnector::from_config(&config)?);
        let pull: Arc<dyn PullConnector> = Arc::new(PollingConnector::from_config(&config)?);

        Ok(Self::new(
            config,
            Transports::new(push, pull),
            connectivity,
            credentials,
        ))
    }

    /// Subscribe to received samples
    pub fn subscribe_samples(&self) -> SampleStream {
        self.publisher.subscribe_samples()
    }

    /// Subscribe to connection state changes, starting with the current state
    pub fn subscribe_state(&self) -> StateStream {
        self.publisher.subscribe_state()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.publisher.state()
    }

    /// Most recently received sample
    pub fn latest_sample(&self) -> Option<Sample> {
        self.publisher.latest_sample()
    }

    /// Change the pull interval (at least 500 ms) and return the value applied
    ///
    /// Reconnects when the pull transport is active.
    pub fn set_polling_interval(&self, interval: Duration) -> Duration {
        let interval = clamp_polling_interval(interval);
        self.polling_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
        self.send(Command::SetPollingInterval(interval));
        interval
    }

    /// Current pull interval
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms.load(Ordering::SeqCst))
    }

    /// Store or clear the user credential and reconnect
    ///
    /// The new key is used right away; writing it to storage happens on a
    /// blocking thread when a runtime is available.
    pub fn set_credential(&self, key: Option<String>) {
        self.credentials.update(key);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let credentials = self.credentials.clone();
                runtime.spawn_blocking(move || credentials.persist());
            }
            Err(_) => self.credentials.persist(),
        }

        self.send(Command::CredentialChanged);
    }

    /// Effective credential (user-set, else the configured default)
    pub fn credential(&self) -> Option<String> {
        self.credentials.resolve()
    }

    /// Reconnect after the pull transport gave up
    ///
    /// Only honored while disconnected on the pull transport; returns whether
    /// the request was accepted.
    pub fn retry(&self) -> bool {
        if self.publisher.is_closed() || !self.publisher.state().can_retry() {
            return false;
        }
        self.send(Command::Retry);
        true
    }

    /// Stop the feed
    ///
    /// Both streams end and nothing is emitted after this returns, even if a
    /// transport callback is already in flight.
    pub fn shutdown(&self) {
        if self.publisher.close() {
            info!("[LIVE] Shutting down");
        }
        self.send(Command::Shutdown);
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    pub fn is_shut_down(&self) -> bool {
        self.publisher.is_closed()
    }

    fn send(&self, command: Command) {
        // The driver only goes away after shutdown
        let _ = self.cmd_tx.send(command);
    }
}

impl Drop for LiveConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Push is used only when the runtime supports it and no key has to be attached
fn select_transport(push_supported: bool, has_credential: bool) -> Transport {
    if push_supported && !has_credential {
        Transport::Push
    } else {
        Transport::Pull
    }
}

/// Single owner of the connection state
struct Driver {
    config: LiveConfig,
    transports: Transports,
    credentials: Arc<CredentialStore>,
    publisher: Arc<Publisher>,
    fsm: LinkStateMachine,
    polling_interval: Duration,
    /// Device connectivity as last reported
    online: bool,
    /// Consecutive failures since the last received sample
    attempt: u32,
    /// Identifies the current attempt; events from older ones are dropped
    generation: u64,
    active: Option<ActiveTransport>,
    backoff_deadline: Option<Instant>,
    debounce_deadline: Option<Instant>,
    settle_deadline: Option<Instant>,
    events_tx: mpsc::UnboundedSender<AttemptEvent>,
}

impl Driver {
    /// Main driver loop
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut events_rx: mpsc::UnboundedReceiver<AttemptEvent>,
        mut connectivity: ConnectivityWatch,
    ) {
        let mut connectivity_open = true;

        self.connect();

        loop {
            let backoff = self.backoff_deadline;
            let debounce = self.debounce_deadline;
            let settle = self.settle_deadline;

            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },

                online = connectivity.changed(), if connectivity_open => match online {
                    Some(true) => {
                        self.online = true;
                        self.request_reconnect("network online");
                    }
                    Some(false) => self.go_offline(),
                    None => {
                        debug!("[LIVE] Connectivity signal dropped");
                        connectivity_open = false;
                    }
                },

                Some(event) = events_rx.recv() => self.handle_transport_event(event),

                _ = sleep_until_deadline(backoff), if backoff.is_some() => {
                    self.backoff_deadline = None;
                    self.request_reconnect("backoff elapsed");
                }

                _ = sleep_until_deadline(debounce), if debounce.is_some() => {
                    self.debounce_deadline = None;
                    self.teardown();
                    self.settle_deadline = Some(Instant::now() + self.config.reconnect_settle);
                }

                _ = sleep_until_deadline(settle), if settle.is_some() => {
                    self.settle_deadline = None;
                    self.connect();
                }
            }
        }

        self.teardown();
        self.publisher.close();
        info!("[LIVE] Connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Retry => {
                if self.fsm.snapshot().can_retry() {
                    info!("[LIVE] Manual retry requested");
                    self.request_reconnect("manual retry");
                } else {
                    debug!("[LIVE] Ignoring retry in state {}", self.fsm.state().status());
                }
            }
            Command::SetPollingInterval(interval) => {
                self.polling_interval = interval;
                if self.fsm.state().transport() == Transport::Pull {
                    self.request_reconnect("polling interval changed");
                }
            }
            Command::CredentialChanged => self.request_reconnect("credential changed"),
            Command::Shutdown => {}
        }
    }

    /// Funnel for every reconnect trigger; a burst collapses into one cycle
    fn request_reconnect(&mut self, reason: &str) {
        debug!("[LIVE] Reconnect requested: {}", reason);
        self.debounce_deadline = Some(Instant::now() + self.config.reconnect_debounce);
    }

    /// Stop the active transport and forget its pending retry
    fn teardown(&mut self) {
        self.generation += 1;
        self.backoff_deadline = None;

        if let Some(active) = self.active.take() {
            debug!("[LIVE] Tearing down {} transport", active.transport);
        }
    }

    fn go_offline(&mut self) {
        self.online = false;
        self.teardown();
        self.debounce_deadline = None;
        self.settle_deadline = None;
        self.apply(LinkEvent::WentOffline);
    }

    /// Start a connection attempt on the currently preferred transport
    fn connect(&mut self) {
        self.teardown();

        if !self.online {
            self.apply(LinkEvent::WentOffline);
            return;
        }

        let transport =
            select_transport(self.config.push_supported, self.credentials.has_credential());
        let credential = self.credentials.resolve();
        let generation = self.generation;
        let events_tx = self.events_tx.clone();

        self.apply(LinkEvent::AttemptStarted(transport));
        info!("[LIVE] Connecting via {}", transport);

        let task = match transport {
            Transport::Push => tokio::spawn(push_task(
                self.transports.push.clone(),
                credential,
                generation,
                events_tx,
            )),
            Transport::Pull => tokio::spawn(pull_task(
                self.transports.pull.clone(),
                credential,
                self.polling_interval,
                generation,
                events_tx,
            )),
        };

        self.active = Some(ActiveTransport { transport, task });
    }

    fn handle_transport_event(&mut self, event: AttemptEvent) {
        if event.generation != self.generation || self.active.is_none() {
            debug!("[LIVE] Dropping event from a torn-down transport");
            return;
        }

        match event.event {
            TransportEvent::Payload(payload) => match decode_sample(&payload) {
                Ok(sample) => {
                    self.attempt = 0;
                    self.apply(LinkEvent::SampleReceived);
                    self.publisher.publish_sample(sample);
                }
                Err(e) => warn!("[LIVE] Dropping unparseable message: {}", e),
            },
            TransportEvent::Failed(error) => self.handle_failure(error),
        }
    }

    fn handle_failure(&mut self, error: TransportError) {
        let transport = self.fsm.state().transport();
        self.teardown();

        if matches!(error, TransportError::NotFound) && transport == Transport::Pull {
            warn!("[LIVE] Live endpoint not found; waiting for manual retry");
            self.apply(LinkEvent::NotFound);
            return;
        }

        warn!("[LIVE] {} transport failed: {}", transport, error);

        if !self.online {
            self.apply(LinkEvent::WentOffline);
            return;
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = backoff_delay_secs(self.attempt);

        self.apply(LinkEvent::TransportFailed {
            error: error.to_string(),
            retry_in_seconds: Some(delay),
        });
        self.backoff_deadline = Some(Instant::now() + Duration::from_secs(delay));
        info!("[LIVE] Retrying in {}s (attempt {})", delay, self.attempt);
    }

    /// Run an event through the state machine and publish the result
    fn apply(&mut self, event: LinkEvent) {
        let from = self.fsm.state().status();

        match self.fsm.process_event(event) {
            TransitionResult::Changed(state) => {
                debug_assert!(is_valid_transition(from, state.status));
                if from != state.status {
                    info!("[LIVE] {} -> {} ({})", from, state.status, state.transport);
                }
                self.publisher.publish_state(state);
            }
            TransitionResult::Unchanged => {}
            TransitionResult::Invalid { from, event } => {
                warn!("[LIVE] Ignoring {:?} while {}", event, from);
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

/// Push transport: forward every message until the stream fails
async fn push_task(
    connector: Arc<dyn PushConnector>,
    credential: Option<String>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<AttemptEvent>,
) {
    let send = |event| {
        let _ = events_tx.send(AttemptEvent { generation, event });
    };

    let mut stream = match connector.open(credential.as_deref()).await {
        Ok(stream) => stream,
        Err(e) => {
            send(TransportEvent::Failed(e));
            return;
        }
    };
    debug!("[LIVE] {} stream open", connector.name());

    while let Some(item) = stream.next().await {
        match item {
            Ok(payload) => send(TransportEvent::Payload(payload)),
            Err(e) => {
                send(TransportEvent::Failed(e));
                return;
            }
        }
    }

    send(TransportEvent::Failed(TransportError::StreamClosed));
}

/// Pull transport: request the latest sample on a fixed interval, first tick immediately
async fn pull_task(
    connector: Arc<dyn PullConnector>,
    credential: Option<String>,
    period: Duration,
    generation: u64,
    events_tx: mpsc::UnboundedSender<AttemptEvent>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        debug!("[LIVE] {} request", connector.name());

        let event = match connector.fetch_latest(credential.as_deref()).await {
            Ok(body) => TransportEvent::Payload(body),
            Err(e) => {
                let _ = events_tx.send(AttemptEvent {
                    generation,
                    event: TransportEvent::Failed(e),
                });
                return;
            }
        };

        if events_tx.send(AttemptEvent { generation, event }).is_err() {
            return;
        }
    }
}
