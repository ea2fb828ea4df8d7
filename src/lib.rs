//! Live treadmill telemetry client
//!
//! [`LiveConnectionManager`] keeps a single live feed open against the
//! backend, using the server-sent event stream when possible and falling
//! back to polling the latest sample when a key must be attached.

pub mod config;
pub mod connection;
pub mod credential;
pub mod network;
pub mod transport;

pub use config::{ConfigError, LiveConfig};
pub use connection::{LiveConnectionManager, SampleStream, StateStream};
pub use credential::CredentialStore;
pub use network::{connectivity, ConnectivitySignal, ConnectivityWatch};
pub use treadmill_shared::{ConnectionState, ConnectionStatus, Sample, Transport};
