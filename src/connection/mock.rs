//! In-memory transport for engine tests

use super::transport::{Connector, FrameSink, TransportEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct MockState {
    attempts: u32,
    fail_remaining: u32,
    fail_always: bool,
}

/// Connector handing out in-memory connections. Each successful connect
/// produces a [`MockServer`] on the paired [`MockListener`].
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    accepted: mpsc::UnboundedSender<MockServer>,
}

pub struct MockListener {
    state: Arc<Mutex<MockState>>,
    accepted: mpsc::UnboundedReceiver<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Self, MockListener) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: state.clone(),
                accepted: tx,
            },
            MockListener {
                state,
                accepted: rx,
            },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, BoxStream<'static, TransportEvent>)> {
        {
            let mut state = self.state.lock().unwrap();
            state.attempts += 1;
            if state.fail_always {
                return Err(anyhow!("connection refused"));
            }
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(anyhow!("connection refused"));
            }
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sink = MockSink {
            sent: sent_tx,
            events: events_tx.clone(),
            closed: false,
        };
        let server = MockServer {
            url: url.to_string(),
            sent: sent_rx,
            events: events_tx,
        };
        let _ = self.accepted.send(server);
        Ok((
            Box::new(sink),
            UnboundedReceiverStream::new(events_rx).boxed(),
        ))
    }
}

impl MockListener {
    /// Wait for the next successful connection.
    pub async fn accept(&mut self) -> MockServer {
        tokio::time::timeout(RECV_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Non-blocking check for a pending connection
    pub fn try_accept(&mut self) -> Option<MockServer> {
        self.accepted.try_recv().ok()
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().fail_remaining = count;
    }

    pub fn fail_always(&self, fail: bool) {
        self.state.lock().unwrap().fail_always = fail;
    }
}

struct MockSink {
    sent: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if self.closed {
            return Err(anyhow!("sink closed"));
        }
        self.sent.send(text).map_err(|_| anyhow!("peer gone"))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.events.send(TransportEvent::Closed {
                clean: true,
                reason: "closed by client".to_string(),
            });
        }
    }
}

/// Server side of one mock connection
pub struct MockServer {
    pub url: String,
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockServer {
    /// Next frame the client wrote, parsed as JSON.
    pub async fn recv(&mut self) -> Value {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.sent.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client sink dropped");
        serde_json::from_str(&text).expect("client frame is not JSON")
    }

    /// Next client frame of the given type, skipping heartbeat acks.
    pub async fn recv_kind(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["type"] == kind {
                return frame;
            }
            assert_eq!(
                frame["type"], "heartbeat_ack",
                "expected {} but client sent {}",
                kind, frame
            );
        }
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.sent
            .try_recv()
            .ok()
            .map(|text| serde_json::from_str(&text).expect("client frame is not JSON"))
    }

    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Frame(text.to_string()));
    }

    pub fn close(&self, clean: bool) {
        let _ = self.events.send(TransportEvent::Closed {
            clean,
            reason: if clean { "1000 bye" } else { "1006 abnormal" }.to_string(),
        });
    }
}
