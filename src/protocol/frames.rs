//! Frame types for the chat WebSocket protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised while decoding an inbound frame.
///
/// None of these are fatal to the session: the router logs and drops the frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` frame: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Inbound frames (server → client)
// ============================================================================

/// All frames the server can send, tagged by `type`.
///
/// Unrecognized tags deserialize to [`InboundFrame::Unknown`] so newer servers
/// never break older clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Full snapshot of the conversation so far
    ChatHistory(ChatHistoryFrame),
    /// A complete (non-streamed) message
    Message(MessageFrame),
    /// Streaming delta: content, notification, or one fragment of either
    AiChunk(AiChunkFrame),
    /// Progress report from a running tool
    ToolProgress(PayloadFrame),
    /// Server acknowledged a `stop_generation` request
    StopConfirmed(StopConfirmedFrame),
    /// Liveness keepalive; must be acknowledged
    Heartbeat(HeartbeatFrame),
    /// Authoritative streaming state, answer to `sync_state`
    SyncStateResponse(SyncStateResponseFrame),
    /// Server-side failure
    Error(ErrorFrame),
    /// Token accounting changed for the conversation
    TokenUsageUpdated(PayloadFrame),
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Wire name of the frame kind (used in logs)
    pub fn kind(&self) -> &'static str {
        match self {
            InboundFrame::ChatHistory(_) => "chat_history",
            InboundFrame::Message(_) => "message",
            InboundFrame::AiChunk(_) => "ai_chunk",
            InboundFrame::ToolProgress(_) => "tool_progress",
            InboundFrame::StopConfirmed(_) => "stop_confirmed",
            InboundFrame::Heartbeat(_) => "heartbeat",
            InboundFrame::SyncStateResponse(_) => "sync_state_response",
            InboundFrame::Error(_) => "error",
            InboundFrame::TokenUsageUpdated(_) => "token_usage_updated",
            InboundFrame::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ChatHistoryFrame {
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessageFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Everything else the server attached (artifacts, timestamps, ids)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One `ai_chunk` frame.
///
/// Fragmented payloads set `is_chunked` and carry their position in
/// `chunk_sequence` (0-based index) and `total_chunks`; all fragments of one
/// payload share the same `sequence`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AiChunkFrame {
    #[serde(default)]
    pub chunk: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_notification: bool,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub early_notification: bool,
    #[serde(default)]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub is_chunked: bool,
    #[serde(default)]
    pub chunk_sequence: Option<usize>,
    #[serde(default)]
    pub total_chunks: Option<usize>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Opaque payload forwarded to the UI as-is
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct PayloadFrame {
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct StopConfirmedFrame {
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HeartbeatFrame {
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SyncStateResponseFrame {
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ErrorFrame {
    #[serde(default, alias = "error")]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// A decoded frame together with the raw `type` tag it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub kind: String,
    pub frame: InboundFrame,
}

/// Decode one text frame.
///
/// The `type` tag is read first so that an unknown kind is reported by name and
/// a known kind with bad fields is reported as [`FrameError::Malformed`].
pub fn decode(text: &str) -> Result<DecodedFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();

    let frame = serde_json::from_value::<InboundFrame>(value).map_err(|source| {
        FrameError::Malformed {
            kind: kind.clone(),
            source,
        }
    })?;

    Ok(DecodedFrame { kind, frame })
}

// ============================================================================
// Outbound frames (client → server)
// ============================================================================

/// Control frames sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// A user message starting a new generation
    Message {
        message: String,
        conversation_id: Option<String>,
        project_id: Option<String>,
        provider: String,
        user_role: String,
        turbo_mode: bool,
    },
    /// Ask the server to stop the running generation
    StopGeneration {
        conversation_id: Option<String>,
        project_id: Option<String>,
    },
    /// Ask the server for its authoritative streaming state
    SyncState { conversation_id: Option<String> },
    /// Acknowledge a heartbeat
    HeartbeatAck,
}

impl ClientFrame {
    /// Wire name of the frame kind
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Message { .. } => "message",
            ClientFrame::StopGeneration { .. } => "stop_generation",
            ClientFrame::SyncState { .. } => "sync_state",
            ClientFrame::HeartbeatAck => "heartbeat_ack",
        }
    }

    /// Serialize to the JSON text sent on the socket
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
