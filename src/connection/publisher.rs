//! Subscriber side of the live connection
//!
//! State snapshots fan out to one unbounded channel per subscriber so every
//! change is observed in order. Samples go through a latest-value channel:
//! a slow reader only ever sees the newest sample.
//!
//! Every stream shares the publisher's closed flag, so nothing (not even a
//! value queued before the close) is handed out once it is set.

use futures::stream::{self, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use treadmill_shared::{ConnectionState, Sample};

struct Inner {
    state: ConnectionState,
    observers: Vec<mpsc::UnboundedSender<ConnectionState>>,
    samples: Option<watch::Sender<Option<Sample>>>,
}

/// Owner of everything subscribers can observe
pub(crate) struct Publisher {
    inner: Mutex<Inner>,
    /// Set once by `close`, read by every stream
    closed: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(initial: ConnectionState) -> Self {
        let (samples, _) = watch::channel(None);

        Self {
            inner: Mutex::new(Inner {
                state: initial,
                observers: Vec::new(),
                samples: Some(samples),
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current snapshot
    pub fn state(&self) -> ConnectionState {
        self.lock().state.clone()
    }

    /// Most recent sample, if any arrived yet
    pub fn latest_sample(&self) -> Option<Sample> {
        self.lock()
            .samples
            .as_ref()
            .and_then(|tx| tx.borrow().clone())
    }

    /// Publish a new snapshot; returns false when closed or unchanged
    pub fn publish_state(&self, state: ConnectionState) -> bool {
        let mut inner = self.lock();
        if self.is_closed() || inner.state == state {
            return false;
        }

        inner
            .observers
            .retain(|observer| observer.send(state.clone()).is_ok());
        inner.state = state;
        true
    }

    /// Publish a sample; returns false when closed
    pub fn publish_sample(&self, sample: Sample) -> bool {
        let inner = self.lock();
        match (&inner.samples, self.is_closed()) {
            (Some(tx), false) => {
                tx.send_replace(Some(sample));
                true
            }
            _ => false,
        }
    }

    /// Subscribe to state snapshots, starting with the current one
    pub fn subscribe_state(&self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut inner = self.lock();
        if !self.is_closed() && tx.send(inner.state.clone()).is_ok() {
            inner.observers.push(tx);
        }

        StateStream {
            rx,
            closed: self.closed.clone(),
        }
    }

    /// Subscribe to samples, starting with the latest one if present
    pub fn subscribe_samples(&self) -> SampleStream {
        let rx = match &self.lock().samples {
            Some(tx) => tx.subscribe(),
            // Sender already dropped: the receiver reports closed right away
            None => watch::channel(None).1,
        };

        SampleStream {
            rx,
            primed: false,
            closed: self.closed.clone(),
        }
    }

    /// Stop all emissions and end every subscriber stream
    ///
    /// Returns false if already closed.
    pub fn close(&self) -> bool {
        let mut inner = self.lock();
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        inner.observers.clear();
        inner.samples = None;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Ordered sequence of connection state snapshots
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<ConnectionState>,
    closed: Arc<AtomicBool>,
}

impl StateStream {
    /// Wait for the next snapshot; `None` after shutdown
    pub async fn next(&mut self) -> Option<ConnectionState> {
        let state = self.rx.recv().await?;
        self.live().then_some(state)
    }

    /// Take a snapshot that is already queued, without waiting
    pub fn try_next(&mut self) -> Option<ConnectionState> {
        let state = self.rx.try_recv().ok()?;
        self.live().then_some(state)
    }

    /// Drops whatever is still queued once the publisher closed
    fn live(&mut self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            self.rx.close();
            while self.rx.try_recv().is_ok() {}
            return false;
        }
        true
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = ConnectionState> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut states| async move {
            states.next().await.map(|state| (state, states))
        }))
    }
}

/// Sequence of received samples (latest value only)
pub struct SampleStream {
    rx: watch::Receiver<Option<Sample>>,
    /// Whether the value present at subscription time was already considered
    primed: bool,
    closed: Arc<AtomicBool>,
}

impl SampleStream {
    /// Wait for the next sample; `None` after shutdown
    pub async fn next(&mut self) -> Option<Sample> {
        let sample = self.next_value().await?;
        (!self.closed.load(Ordering::SeqCst)).then_some(sample)
    }

    async fn next_value(&mut self) -> Option<Sample> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        if !self.primed {
            self.primed = true;
            if let Some(sample) = self.rx.borrow_and_update().clone() {
                return Some(sample);
            }
        }

        loop {
            self.rx.changed().await.ok()?;
            if let Some(sample) = self.rx.borrow_and_update().clone() {
                return Some(sample);
            }
        }
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl Stream<Item = Sample> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut samples| async move {
            samples.next().await.map(|sample| (sample, samples))
        }))
    }
}
