//! Connection lifecycle: connect, backoff, heartbeat expiry
//!
//! Every transport the manager opens gets a fresh connection id. Events are
//! tagged with the id of the transport that produced them, and anything
//! tagged with a superseded id is discarded, so a late close from an old
//! socket can never tear down its replacement.

use super::backoff::ReconnectPolicy;
use super::heartbeat::HeartbeatSupervisor;
use super::transport::{Connector, FrameSink, TransportEvent};
use crate::chat::generation::GenerationState;
use crate::protocol::ClientFrame;
use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Transport-level state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Status as surfaced to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32, delay_ms: u64 },
    Disconnected,
    Failed { attempts: u32 },
}

/// What happened after a transport went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Peer closed normally; no reconnection
    Clean,
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Attempts exhausted; stays closed until a manual reconnect
    Failed { attempts: u32 },
}

impl CloseOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseOutcome::Clean)
    }
}

/// A transport event tagged with the id of the connection that produced it
#[derive(Debug)]
pub struct TransportMessage {
    pub connection_id: u64,
    pub event: TransportEvent,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    pub idle_heartbeat: Duration,
    pub streaming_heartbeat: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            idle_heartbeat: super::heartbeat::DEFAULT_IDLE_WINDOW,
            streaming_heartbeat: super::heartbeat::DEFAULT_STREAMING_WINDOW,
        }
    }
}

/// Owns the single live transport of a session.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    events_tx: mpsc::UnboundedSender<TransportMessage>,
    connection_id: u64,
    state: ConnectionState,
    sink: Option<Box<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    attempt: u32,
    reconnect_at: Option<Instant>,
    heartbeat: HeartbeatSupervisor,
    status: ConnectionStatus,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &ConnectionConfig,
        events_tx: mpsc::UnboundedSender<TransportMessage>,
    ) -> Self {
        Self {
            connector,
            policy: config.reconnect,
            events_tx,
            connection_id: 0,
            state: ConnectionState::Closed,
            sink: None,
            reader: None,
            attempt: 0,
            reconnect_at: None,
            heartbeat: HeartbeatSupervisor::new(config.idle_heartbeat, config.streaming_heartbeat),
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Consecutive failed attempts since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Whether events tagged with `connection_id` belong to the live transport
    pub fn accepts(&self, connection_id: u64) -> bool {
        connection_id == self.connection_id && self.state != ConnectionState::Closed
    }

    /// Open a new transport unless one is already open or being opened.
    ///
    /// Returns false when the call was a no-op.
    pub async fn connect(&mut self, url: String) -> bool {
        if self.state != ConnectionState::Closed {
            debug!(state = ?self.state, "Connect ignored, transport already active");
            return false;
        }
        self.release_transport().await;

        self.connection_id += 1;
        self.state = ConnectionState::Connecting;
        self.reconnect_at = None;
        self.status = ConnectionStatus::Connecting {
            attempt: self.attempt,
        };

        let connection_id = self.connection_id;
        let connector = self.connector.clone();
        let tx = self.events_tx.clone();
        info!(connection_id, attempt = self.attempt, url = %url, "Connecting");

        self.reader = Some(tokio::spawn(async move {
            match connector.connect(&url).await {
                Ok((sink, mut events)) => {
                    let opened = TransportMessage {
                        connection_id,
                        event: TransportEvent::Opened(sink),
                    };
                    if tx.send(opened).is_err() {
                        return;
                    }
                    while let Some(event) = events.next().await {
                        let closing = matches!(event, TransportEvent::Closed { .. });
                        if tx.send(TransportMessage { connection_id, event }).is_err() || closing {
                            return;
                        }
                    }
                    let _ = tx.send(TransportMessage {
                        connection_id,
                        event: TransportEvent::Closed {
                            clean: false,
                            reason: "event stream ended".to_string(),
                        },
                    });
                }
                Err(e) => {
                    let _ = tx.send(TransportMessage {
                        connection_id,
                        event: TransportEvent::Closed {
                            clean: false,
                            reason: format!("{:#}", e),
                        },
                    });
                }
            }
        }));
        true
    }

    /// Drop whatever transport exists, reset the attempt counter and connect
    /// again. Used for manual reconnects and conversation switches.
    pub async fn restart(&mut self, url: String) -> bool {
        self.release_transport().await;
        self.state = ConnectionState::Closed;
        self.heartbeat.stop();
        self.attempt = 0;
        self.connect(url).await
    }

    /// Handshake finished. Returns false if the transport was superseded, in
    /// which case its sink is closed and dropped.
    pub async fn on_opened(
        &mut self,
        connection_id: u64,
        mut sink: Box<dyn FrameSink>,
        now: Instant,
    ) -> bool {
        if !self.accepts(connection_id) {
            debug!(connection_id, current = self.connection_id, "Closing superseded transport");
            sink.close().await;
            return false;
        }
        self.sink = Some(sink);
        self.state = ConnectionState::Open;
        self.attempt = 0;
        self.reconnect_at = None;
        self.heartbeat.start(now);
        self.status = ConnectionStatus::Connected;
        info!(connection_id, "Connection open");
        true
    }

    /// The transport went away. `None` if the event belongs to a superseded
    /// transport and must be ignored.
    pub fn on_closed(
        &mut self,
        connection_id: u64,
        clean: bool,
        reason: &str,
        now: Instant,
    ) -> Option<CloseOutcome> {
        if !self.accepts(connection_id) {
            debug!(connection_id, reason, "Ignoring close from superseded transport");
            return None;
        }
        self.sink = None;
        self.reader = None;
        self.state = ConnectionState::Closed;
        self.heartbeat.stop();

        if clean {
            info!(connection_id, reason, "Connection closed cleanly");
            self.reconnect_at = None;
            self.status = ConnectionStatus::Disconnected;
            return Some(CloseOutcome::Clean);
        }
        warn!(connection_id, reason, "Connection lost");
        Some(self.schedule_reconnect(now))
    }

    fn schedule_reconnect(&mut self, now: Instant) -> CloseOutcome {
        let next = self.attempt + 1;
        match self.policy.delay_for(next) {
            Some(delay) => {
                self.attempt = next;
                self.reconnect_at = Some(now + delay);
                self.status = ConnectionStatus::Reconnecting {
                    attempt: next,
                    delay_ms: delay.as_millis() as u64,
                };
                info!(attempt = next, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                CloseOutcome::ReconnectScheduled {
                    attempt: next,
                    delay,
                }
            }
            None => {
                self.reconnect_at = None;
                self.status = ConnectionStatus::Failed {
                    attempts: self.attempt,
                };
                warn!(attempts = self.attempt, "Reconnect attempts exhausted, giving up");
                CloseOutcome::Failed {
                    attempts: self.attempt,
                }
            }
        }
    }

    /// Consume a due reconnect timer. True when the caller should connect now.
    pub fn take_due_reconnect(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn record_heartbeat(&mut self, now: Instant) {
        self.heartbeat.record(now);
    }

    /// Heartbeat deadline of the open transport, if any
    pub fn heartbeat_deadline(&self, generation: GenerationState) -> Option<Instant> {
        if self.state != ConnectionState::Open {
            return None;
        }
        self.heartbeat.deadline(generation)
    }

    pub fn heartbeat_expired(&self, now: Instant, generation: GenerationState) -> bool {
        self.state == ConnectionState::Open && self.heartbeat.is_expired(now, generation)
    }

    /// Tear down a transport that stopped sending heartbeats. Treated as an
    /// unclean close.
    pub async fn expire_heartbeat(&mut self, now: Instant) -> CloseOutcome {
        warn!(
            connection_id = self.connection_id,
            "No heartbeat within window, forcing reconnect"
        );
        self.release_transport().await;
        self.state = ConnectionState::Closed;
        self.heartbeat.stop();
        self.schedule_reconnect(now)
    }

    /// Write one frame to the open transport.
    pub async fn send(&mut self, frame: &ClientFrame) -> Result<()> {
        let sink = self
            .sink
            .as_deref_mut()
            .ok_or_else(|| anyhow!("connection is not open"))?;
        let text = frame.encode().context("Failed to encode client frame")?;
        sink.send_text(text).await
    }

    /// Sink of the open transport, for draining queued frames
    pub fn sink_mut(&mut self) -> Option<&mut (dyn FrameSink + 'static)> {
        if self.state != ConnectionState::Open {
            return None;
        }
        self.sink.as_deref_mut()
    }

    /// Close deliberately. No reconnect follows.
    pub async fn shutdown(&mut self) {
        self.release_transport().await;
        self.state = ConnectionState::Closed;
        self.heartbeat.stop();
        self.reconnect_at = None;
        self.status = ConnectionStatus::Disconnected;
    }

    /// Close the current sink and invalidate its connection id so late
    /// events from it are discarded.
    async fn release_transport(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.state != ConnectionState::Closed {
            self.connection_id += 1;
        }
    }
}

/// Build the WebSocket URL for a session. Absent parameters are omitted.
pub fn connection_url(
    base: &str,
    conversation_id: Option<&str>,
    project_id: Option<&str>,
) -> String {
    let params: Vec<String> = [("conversation_id", conversation_id), ("project_id", project_id)]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| format!("{}={}", key, urlencoding::encode(v))))
        .collect();
    if params.is_empty() {
        return base.to_string();
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}{}", base, separator, params.join("&"))
}
