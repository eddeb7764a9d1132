//! WebSocket connection management
//!
//! - [`transport`] — `Connector`/`FrameSink` seam and the tokio-tungstenite implementation
//! - [`manager`] — `ConnectionManager`: connection ids, reconnection, heartbeat expiry
//! - [`backoff`] — capped exponential reconnect policy
//! - [`heartbeat`] — liveness windows for idle and streaming sessions

pub mod backoff;
pub mod heartbeat;
pub mod manager;
#[cfg(test)]
pub mod mock;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use heartbeat::HeartbeatSupervisor;
pub use manager::{
    connection_url, CloseOutcome, ConnectionConfig, ConnectionManager, ConnectionState,
    ConnectionStatus, TransportMessage,
};
pub use transport::{Connector, FrameSink, TransportEvent, WsConnector, DEFAULT_CONNECT_TIMEOUT};
