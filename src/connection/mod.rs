//! Live connection management
//!
//! This module handles:
//! - Choosing between the push stream and interval polling
//! - Exponential backoff and debounced reconnection
//! - Offline handling driven by a connectivity signal
//! - Fan-out of samples and state snapshots to subscribers

mod manager;
mod publisher;

pub use manager::LiveConnectionManager;
pub use publisher::{SampleStream, StateStream};
