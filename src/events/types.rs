//! Session event types delivered to UI subscribers

use crate::chat::generation::{ButtonState, GenerationState};
use crate::connection::ConnectionStatus;
use crate::protocol::MessageFrame;
use crate::stream::NotificationPhase;
use serde::Serialize;
use serde_json::{Map, Value};

/// Everything the engine reports to the presentation layer
///
/// Must be Clone for `tokio::sync::broadcast`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Text appended to the response being generated
    ContentDelta { text: String },
    /// Response finished, either naturally or by a user stop
    ResponseCompleted { content: String, stopped: bool },
    /// Out-of-band notification; `early` means show an indicator only
    Notification {
        notification_type: String,
        phase: NotificationPhase,
        content: String,
    },
    GenerationStateChanged {
        state: GenerationState,
        button: ButtonState,
    },
    ConnectionStatusChanged { status: ConnectionStatus },
    HistoryLoaded { messages: Vec<Value> },
    MessageReceived { message: MessageFrame },
    ToolProgress { payload: Map<String, Value> },
    UsageUpdated { payload: Map<String, Value> },
    ServerError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// The server assigned (or switched) the active conversation
    ConversationAssigned { conversation_id: String },
    /// Conversation lists should be reloaded
    ConversationListInvalidated,
    /// A saved draft matches the active conversation
    DraftRestored { text: String },
    /// A user action was refused (busy, transitioning, empty input)
    ActionRejected { action: String, reason: String },
}

impl SessionEvent {
    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::ContentDelta { .. } => "content_delta",
            SessionEvent::ResponseCompleted { .. } => "response_completed",
            SessionEvent::Notification { .. } => "notification",
            SessionEvent::GenerationStateChanged { .. } => "generation_state_changed",
            SessionEvent::ConnectionStatusChanged { .. } => "connection_status_changed",
            SessionEvent::HistoryLoaded { .. } => "history_loaded",
            SessionEvent::MessageReceived { .. } => "message_received",
            SessionEvent::ToolProgress { .. } => "tool_progress",
            SessionEvent::UsageUpdated { .. } => "usage_updated",
            SessionEvent::ServerError { .. } => "server_error",
            SessionEvent::ConversationAssigned { .. } => "conversation_assigned",
            SessionEvent::ConversationListInvalidated => "conversation_list_invalidated",
            SessionEvent::DraftRestored { .. } => "draft_restored",
            SessionEvent::ActionRejected { .. } => "action_rejected",
        }
    }
}

/// Sink for session events
///
/// Implemented by [`EventBus`](super::EventBus); emitting never blocks.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: SessionEvent);

    fn emit_generation(&self, state: GenerationState, button: ButtonState) {
        self.emit(SessionEvent::GenerationStateChanged { state, button });
    }

    fn emit_status(&self, status: ConnectionStatus) {
        self.emit(SessionEvent::ConnectionStatusChanged { status });
    }

    fn emit_rejected(&self, action: &str, reason: &str) {
        self.emit(SessionEvent::ActionRejected {
            action: action.to_string(),
            reason: reason.to_string(),
        });
    }
}
