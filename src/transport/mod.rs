pub mod polling;
pub mod sse;
pub mod traits;

pub use polling::PollingConnector;
pub use sse::{message_stream, SseConnector};
pub use traits::{PullConnector, PushConnector, PushStream, TransportError, Transports};
