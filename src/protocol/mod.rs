//! JSON frames exchanged over the chat WebSocket
//!
//! Every frame is a JSON object carrying a `type` discriminator. Inbound frames
//! are decoded exactly once at the socket boundary into [`InboundFrame`];
//! outbound control frames are built as [`ClientFrame`] values.

pub mod frames;

pub use frames::{
    decode, AiChunkFrame, ChatHistoryFrame, ClientFrame, DecodedFrame, ErrorFrame, FrameError,
    HeartbeatFrame, InboundFrame, MessageFrame, StopConfirmedFrame, SyncStateResponseFrame,
};
