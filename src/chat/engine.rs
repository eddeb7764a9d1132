//! Session engine: the single task that owns all mutable session state
//!
//! User commands, transport events and timer deadlines are processed one at
//! a time by [`SessionEngine::run`]. Nothing else mutates the session, so
//! handlers never interleave. Views interact through a [`SessionHandle`]:
//! commands go in over an mpsc channel, [`SessionEvent`]s come out over the
//! broadcast [`EventBus`].

use super::draft::{Draft, DraftDebouncer, DraftStore};
use super::generation::{GenerationState, GenerationStateMachine, PendingTransition};
use super::outbound::OutboundQueue;
use super::session::Session;
use crate::connection::{
    CloseOutcome, ConnectionConfig, ConnectionManager, ConnectionState, Connector,
    TransportEvent, TransportMessage,
};
use crate::events::{EventBus, EventEmitter, SessionEvent};
use crate::protocol::ClientFrame;
use crate::stream::{FrameRouter, ReassemblyConfig, RouteOutcome, RoutedFrame};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Appended to the visible response when the user stops a generation
pub const STOPPED_MARKER: &str = "\n\n[Generation stopped by user]";

/// Requests from the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SendMessage(String),
    StopGeneration,
    RequestSync,
    /// Current contents of the input box
    InputChanged(String),
    DismissDraft,
    NewChat,
    Reconnect,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ws_url: String,
    pub connection: ConnectionConfig,
    pub reassembly: ReassemblyConfig,
    pub watchdog: Duration,
    pub draft_debounce: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/ws/chat".to_string(),
            connection: ConnectionConfig::default(),
            reassembly: ReassemblyConfig::default(),
            watchdog: super::generation::DEFAULT_WATCHDOG,
            draft_debounce: super::draft::DEFAULT_DEBOUNCE,
        }
    }
}

/// Cloneable front door to a running engine
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    bus: EventBus,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.bus.subscribe()
    }

    pub fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("session engine has stopped"))
    }

    pub fn send_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::SendMessage(text.into()))
    }

    pub fn stop_generation(&self) -> Result<()> {
        self.send(SessionCommand::StopGeneration)
    }

    pub fn request_sync(&self) -> Result<()> {
        self.send(SessionCommand::RequestSync)
    }

    pub fn input_changed(&self, text: impl Into<String>) -> Result<()> {
        self.send(SessionCommand::InputChanged(text.into()))
    }

    pub fn dismiss_draft(&self) -> Result<()> {
        self.send(SessionCommand::DismissDraft)
    }

    pub fn new_chat(&self) -> Result<()> {
        self.send(SessionCommand::NewChat)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.send(SessionCommand::Reconnect)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown)
    }
}

pub struct SessionEngine {
    ws_url: String,
    session: Session,
    connection: ConnectionManager,
    router: FrameRouter,
    generation: GenerationStateMachine,
    outbound: OutboundQueue,
    draft_store: DraftStore,
    drafts: DraftDebouncer,
    bus: EventBus,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    transport_rx: mpsc::UnboundedReceiver<TransportMessage>,
    /// Message to send as soon as the connection opens
    pending_intent: Option<String>,
    /// Latest input box contents
    input: String,
    /// Response text accumulated for the running generation
    response: String,
    /// Conversation id assigned during the running generation
    conversation_created: bool,
    sync_outstanding: bool,
    /// A message went out after the outstanding sync request
    message_since_sync: bool,
}

impl SessionEngine {
    /// Build an engine and its handle. Nothing runs until [`run`](Self::run)
    /// is awaited, so subscribers can attach before the first event.
    pub fn new(
        config: EngineConfig,
        session: Session,
        connector: Arc<dyn Connector>,
        draft_store: DraftStore,
    ) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let bus = EventBus::default();

        let engine = Self {
            ws_url: config.ws_url,
            session,
            connection: ConnectionManager::new(connector, &config.connection, transport_tx),
            router: FrameRouter::new(config.reassembly),
            generation: GenerationStateMachine::new(config.watchdog),
            outbound: OutboundQueue::new(),
            drafts: DraftDebouncer::new(draft_store.clone(), config.draft_debounce),
            draft_store,
            bus: bus.clone(),
            commands: command_rx,
            transport_rx,
            pending_intent: None,
            input: String::new(),
            response: String::new(),
            conversation_created: false,
            sync_outstanding: false,
            message_since_sync: false,
        };
        let handle = SessionHandle {
            commands: command_tx,
            bus,
        };
        (engine, handle)
    }

    /// Queue a message to be sent once the connection is open.
    pub fn with_prefill(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.pending_intent = Some(text);
        }
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        self.restore_draft().await;
        self.open_connection().await;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => {
                    let keep_running = match command {
                        Some(command) => self.handle_command(command).await,
                        None => false,
                    };
                    if !keep_running {
                        break;
                    }
                }
                Some(message) = self.transport_rx.recv() => {
                    self.handle_transport(message).await;
                }
                _ = sleep_until(deadline) => {
                    self.handle_deadlines(Instant::now()).await;
                }
            }
        }

        info!("Session engine shutting down");
        self.connection.shutdown().await;
        self.bus.emit_status(self.connection.status().clone());
        if !self.input.trim().is_empty() {
            self.drafts.trigger(self.draft_of_input());
        }
        self.drafts.shutdown().await;
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        debug!(?command, "Command received");
        match command {
            SessionCommand::SendMessage(text) => self.send_user_message(text).await,
            SessionCommand::StopGeneration => self.stop_generation().await,
            SessionCommand::RequestSync => self.request_sync().await,
            SessionCommand::InputChanged(text) => {
                self.input = text;
                self.drafts.trigger(self.draft_of_input());
            }
            SessionCommand::DismissDraft => {
                self.input.clear();
                self.drafts.clear();
            }
            SessionCommand::NewChat => self.new_chat().await,
            SessionCommand::Reconnect => self.reconnect().await,
            SessionCommand::Shutdown => return false,
        }
        true
    }

    async fn send_user_message(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            self.bus.emit_rejected("send_message", "message is empty");
            return;
        }
        if let Err(e) = self.generation.can_send() {
            debug!(error = %e, "Send rejected");
            self.bus.emit_rejected("send_message", &e.to_string());
            return;
        }
        // The generation starts once the frame is actually on the wire
        self.outbound.enqueue(self.session.message_frame(&text));
        self.input.clear();
        self.drafts.clear();

        if self.connection.state() == ConnectionState::Closed
            && self.connection.reconnect_at().is_none()
        {
            info!("Connection closed with no retry pending, reconnecting to deliver message");
            self.reconnect().await;
        } else {
            self.flush_outbound().await;
        }
    }

    async fn stop_generation(&mut self) {
        let pending = match self.generation.request_stop(Instant::now()) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(error = %e, "Stop rejected");
                self.bus.emit_rejected("stop_generation", &e.to_string());
                return;
            }
        };
        self.emit_generation();

        self.outbound.enqueue(self.session.stop_frame());
        self.flush_outbound().await;

        self.response.push_str(STOPPED_MARKER);
        self.bus.emit(SessionEvent::ContentDelta {
            text: STOPPED_MARKER.to_string(),
        });
        self.bus.emit(SessionEvent::ResponseCompleted {
            content: std::mem::take(&mut self.response),
            stopped: true,
        });
        self.complete(pending);
    }

    async fn request_sync(&mut self) {
        if !self.connection.is_open() {
            debug!("Sync requested while offline, it will run on open");
            return;
        }
        self.send_sync().await;
    }

    async fn new_chat(&mut self) {
        let pending = self.generation.abort(Instant::now());
        self.apply(pending);
        self.session.reset_conversation();
        self.router.reset_stream();
        self.response.clear();
        self.conversation_created = false;
        info!("Starting new conversation");
        self.reconnect().await;
        self.restore_draft().await;
    }

    async fn reconnect(&mut self) {
        let url = self.session.url(&self.ws_url);
        if self.connection.restart(url).await {
            self.bus.emit_status(self.connection.status().clone());
        }
    }

    // ========================================================================
    // Transport
    // ========================================================================

    async fn open_connection(&mut self) {
        let url = self.session.url(&self.ws_url);
        if self.connection.connect(url).await {
            self.bus.emit_status(self.connection.status().clone());
        }
    }

    async fn handle_transport(&mut self, message: TransportMessage) {
        let TransportMessage {
            connection_id,
            event,
        } = message;
        let now = Instant::now();
        match event {
            TransportEvent::Opened(sink) => {
                if self.connection.on_opened(connection_id, sink, now).await {
                    self.on_open().await;
                }
            }
            TransportEvent::Frame(text) => {
                if self.connection.accepts(connection_id) {
                    self.handle_frame(&text, now).await;
                } else {
                    debug!(connection_id, "Dropping frame from superseded connection");
                }
            }
            TransportEvent::Closed { clean, reason } => {
                if let Some(outcome) = self.connection.on_closed(connection_id, clean, &reason, now)
                {
                    self.on_disconnected(outcome, now);
                }
            }
        }
    }

    async fn on_open(&mut self) {
        self.bus.emit_status(self.connection.status().clone());
        self.router.reset_stream();
        self.send_sync().await;
        self.flush_outbound().await;

        if let Some(text) = self.pending_intent.take() {
            debug!("Delivering queued message intent");
            self.send_user_message(text).await;
        }
    }

    fn on_disconnected(&mut self, outcome: CloseOutcome, now: Instant) {
        self.bus.emit_status(self.connection.status().clone());
        self.router.reset_stream();
        self.sync_outstanding = false;
        self.message_since_sync = false;

        if self.generation.is_generating() {
            warn!(state = ?self.generation.state(), "Connection lost mid-generation");
            let pending = self.generation.abort(now);
            self.apply(pending);
            self.response.clear();
        }
        if self.outbound.has_pending_message() {
            debug!(queued = self.outbound.len(), "Unsent message waits for the next open");
        }

        if !outcome.is_clean() && !self.input.trim().is_empty() {
            self.drafts.trigger(self.draft_of_input());
        }
    }

    async fn send_sync(&mut self) {
        let frame = self.session.sync_frame();
        match self.connection.send(&frame).await {
            Ok(()) => {
                self.sync_outstanding = true;
                self.message_since_sync = false;
            }
            Err(e) => warn!(error = %format!("{:#}", e), "Failed to request state sync"),
        }
    }

    async fn flush_outbound(&mut self) {
        if self.outbound.is_empty() {
            return;
        }
        let Some(sink) = self.connection.sink_mut() else {
            debug!(queued = self.outbound.len(), "Connection not open, keeping frames queued");
            return;
        };
        let sent = self.outbound.flush(sink).await;
        if !sent
            .iter()
            .any(|frame| matches!(frame, ClientFrame::Message { .. }))
        {
            return;
        }
        if self.sync_outstanding {
            self.message_since_sync = true;
        }
        self.start_generation(Instant::now());
    }

    /// A user message went out: the response to it is now streaming.
    fn start_generation(&mut self, now: Instant) {
        let pending = match self.generation.begin_send(now) {
            Ok(pending) => pending,
            Err(e) => {
                debug!(error = %e, "Message delivered while a generation is already running");
                return;
            }
        };
        self.emit_generation();
        self.router.reset_stream();
        self.response.clear();
        self.conversation_created = false;
        self.complete(pending);
    }

    // ========================================================================
    // Inbound frames
    // ========================================================================

    async fn handle_frame(&mut self, text: &str, now: Instant) {
        let frame = match self.router.route(text, now) {
            RouteOutcome::Deliver(frame) => frame,
            RouteOutcome::Buffered => return,
            RouteOutcome::Dropped(reason) => {
                debug!(?reason, "Frame dropped");
                return;
            }
        };

        match frame {
            RoutedFrame::Heartbeat => {
                self.connection.record_heartbeat(now);
                if let Err(e) = self.connection.send(&ClientFrame::HeartbeatAck).await {
                    warn!(error = %format!("{:#}", e), "Failed to acknowledge heartbeat");
                }
            }
            RoutedFrame::HistorySnapshot {
                messages,
                conversation_id,
            } => {
                if let Some(id) = conversation_id {
                    self.assign_conversation(&id);
                }
                debug!(count = messages.len(), "History snapshot received");
                self.bus.emit(SessionEvent::HistoryLoaded { messages });
            }
            RoutedFrame::CompleteMessage(message) => {
                if let Some(id) = message.conversation_id.clone() {
                    self.assign_conversation(&id);
                }
                self.bus.emit(SessionEvent::MessageReceived { message });
            }
            RoutedFrame::ContentDelta {
                text,
                is_final,
                conversation_id,
            } => {
                if let Some(id) = conversation_id {
                    self.assign_conversation(&id);
                }
                if self.generation.stop_applied() {
                    debug!(bytes = text.len(), "Discarding content after local stop");
                } else if !text.is_empty() {
                    self.response.push_str(&text);
                    self.bus.emit(SessionEvent::ContentDelta { text });
                }
                if is_final {
                    self.finish_response(now);
                }
            }
            RoutedFrame::Notification {
                notification_type,
                phase,
                content,
                is_final,
            } => {
                self.bus.emit(SessionEvent::Notification {
                    notification_type,
                    phase,
                    content,
                });
                if is_final {
                    self.finish_response(now);
                }
            }
            RoutedFrame::ToolProgress(payload) => {
                self.bus.emit(SessionEvent::ToolProgress { payload });
            }
            RoutedFrame::UsageUpdated(payload) => {
                self.bus.emit(SessionEvent::UsageUpdated { payload });
            }
            RoutedFrame::StopConfirmed => {
                let pending = self.generation.on_stop_confirmed(now);
                if pending.is_some() {
                    self.bus.emit(SessionEvent::ResponseCompleted {
                        content: std::mem::take(&mut self.response),
                        stopped: true,
                    });
                }
                self.apply(pending);
            }
            RoutedFrame::SyncResponse {
                is_streaming,
                conversation_id,
            } => {
                if let Some(id) = conversation_id {
                    self.assign_conversation(&id);
                }
                self.sync_outstanding = false;
                let raced = std::mem::take(&mut self.message_since_sync);
                if raced && !is_streaming {
                    debug!("Sync response predates the message just sent, keeping local state");
                    return;
                }
                let pending = self.generation.reconcile(is_streaming, now);
                if pending.is_some() && !is_streaming {
                    self.response.clear();
                }
                self.apply(pending);
            }
            RoutedFrame::Error { message, code } => {
                warn!(message = %message, code = ?code, "Server reported an error");
                self.bus.emit(SessionEvent::ServerError { message, code });
                let pending = self.generation.abort(now);
                self.apply(pending);
                self.response.clear();
            }
        }
    }

    fn finish_response(&mut self, now: Instant) {
        let was_streaming = self.generation.state() == GenerationState::Streaming;
        let pending = self.generation.on_final_chunk(now);
        if was_streaming || !self.response.is_empty() {
            self.bus.emit(SessionEvent::ResponseCompleted {
                content: std::mem::take(&mut self.response),
                stopped: false,
            });
        }
        self.apply(pending);
        if std::mem::take(&mut self.conversation_created) {
            self.bus.emit(SessionEvent::ConversationListInvalidated);
        }
    }

    fn assign_conversation(&mut self, conversation_id: &str) {
        if self.session.assign_conversation(conversation_id) {
            info!(conversation_id, "Conversation assigned");
            self.conversation_created = true;
            self.bus.emit(SessionEvent::ConversationAssigned {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connection.reconnect_at(),
            self.connection.heartbeat_deadline(self.generation.state()),
            self.generation.watchdog_deadline(),
            self.router.next_sweep(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_deadlines(&mut self, now: Instant) {
        if self.generation.check_watchdog(now) {
            self.emit_generation();
        }

        let evicted = self.router.sweep(now);
        if !evicted.is_empty() {
            debug!(?evicted, "Fragment buffers expired");
        }

        if self.connection.heartbeat_expired(now, self.generation.state()) {
            let outcome = self.connection.expire_heartbeat(now).await;
            self.on_disconnected(outcome, now);
        }

        if self.connection.take_due_reconnect(now) {
            self.open_connection().await;
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn emit_generation(&self) {
        self.bus
            .emit_generation(self.generation.state(), self.generation.button());
    }

    fn complete(&mut self, pending: PendingTransition) {
        self.generation.complete(pending);
        self.emit_generation();
    }

    /// Run a transition that has no side effects of its own.
    fn apply(&mut self, pending: Option<PendingTransition>) {
        if let Some(pending) = pending {
            self.emit_generation();
            self.complete(pending);
        }
    }

    fn draft_of_input(&self) -> Draft {
        Draft::new(self.input.clone(), self.session.conversation_id.clone())
    }

    async fn restore_draft(&mut self) {
        let conversation_id = self.session.conversation_id.clone();
        match self
            .draft_store
            .restore(conversation_id.as_deref(), Utc::now())
            .await
        {
            Ok(Some(draft)) => {
                info!(saved_at = %draft.timestamp, "Restoring saved draft");
                self.input = draft.text.clone();
                self.bus.emit(SessionEvent::DraftRestored { text: draft.text });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %format!("{:#}", e), "Failed to restore draft"),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
