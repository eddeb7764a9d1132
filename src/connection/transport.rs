//! Transport seam between the session engine and the WebSocket
//!
//! The engine only talks to [`Connector`] and [`FrameSink`], so tests can
//! drive it with an in-memory transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// Something a transport reports back to its owner
pub enum TransportEvent {
    /// The handshake completed; outbound frames go through the sink
    Opened(Box<dyn FrameSink>),
    /// One inbound text frame
    Frame(String),
    /// The transport is gone. `clean` is true only for a normal (1000) close
    /// initiated by the peer.
    Closed { clean: bool, reason: String },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Opened(_) => f.write_str("Opened"),
            TransportEvent::Frame(text) => f.debug_tuple("Frame").field(text).finish(),
            TransportEvent::Closed { clean, reason } => f
                .debug_struct("Closed")
                .field("clean", clean)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Write half of an open transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the transport. Errors are swallowed: the connection is being
    /// abandoned either way.
    async fn close(&mut self);
}

/// Opens transports. The returned stream yields every inbound event and
/// ends after a single `Closed`.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, BoxStream<'static, TransportEvent>)>;
}

// ============================================================================
// WebSocket implementation
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on TCP connect plus the WebSocket handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Production connector backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, BoxStream<'static, TransportEvent>)> {
        let (ws_stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "WebSocket connect to {} timed out after {}ms",
                    url,
                    self.connect_timeout.as_millis()
                )
            })?
            .with_context(|| format!("WebSocket connect to {} failed", url))?;
        debug!(url = %url, "WebSocket handshake complete");

        let (write, read) = ws_stream.split();
        let sink: Box<dyn FrameSink> = Box::new(WsSink { inner: write });
        Ok((sink, read_events(read)))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .context("Failed to write WebSocket frame")
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "client closing".into(),
        };
        if let Err(e) = self.inner.send(Message::Close(Some(frame))).await {
            trace!(error = %e, "Close frame not delivered");
        }
        let _ = self.inner.close().await;
    }
}

/// Map the raw read half to transport events, ending with exactly one
/// `Closed`.
fn read_events(read: SplitStream<WsStream>) -> BoxStream<'static, TransportEvent> {
    futures::stream::unfold(Some(read), |state| async move {
        let mut read = state?;
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some((TransportEvent::Frame(text.as_str().to_owned()), Some(read)));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (clean, reason) = match frame {
                        Some(frame) => (
                            frame.code == CloseCode::Normal,
                            format!("{} {}", u16::from(frame.code), frame.reason.as_str()),
                        ),
                        None => (false, "close without status".to_string()),
                    };
                    return Some((TransportEvent::Closed { clean, reason }, None));
                }
                // Ping/pong are answered by tungstenite; binary frames are not part of the protocol
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Some((
                        TransportEvent::Closed {
                            clean: false,
                            reason: e.to_string(),
                        },
                        None,
                    ));
                }
                None => {
                    return Some((
                        TransportEvent::Closed {
                            clean: false,
                            reason: "stream ended without close frame".to_string(),
                        },
                        None,
                    ));
                }
            }
        }
    })
    .boxed()
}
