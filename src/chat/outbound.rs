//! FIFO of client frames waiting for an open transport

use crate::connection::FrameSink;
use crate::protocol::ClientFrame;
use std::collections::VecDeque;
use tracing::{debug, error, warn};

#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<ClientFrame>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, frame: ClientFrame) {
        debug!(kind = frame.kind(), queued = self.pending.len() + 1, "Frame queued");
        self.pending.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether a user message is still waiting to go out
    pub fn has_pending_message(&self) -> bool {
        self.pending
            .iter()
            .any(|frame| matches!(frame, ClientFrame::Message { .. }))
    }

    /// Send queued frames in order. A frame leaves the queue only after the
    /// sink accepted it; the first failure stops the drain. Returns the
    /// frames that went out.
    pub async fn flush(&mut self, sink: &mut dyn FrameSink) -> Vec<ClientFrame> {
        let mut sent = Vec::new();
        while let Some(frame) = self.pending.front() {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(kind = frame.kind(), error = %e, "Dropping unencodable frame");
                    self.pending.pop_front();
                    continue;
                }
            };
            if let Err(e) = sink.send_text(text).await {
                warn!(
                    kind = frame.kind(),
                    remaining = self.pending.len(),
                    error = %e,
                    "Send failed, keeping frame queued"
                );
                break;
            }
            if let Some(frame) = self.pending.pop_front() {
                sent.push(frame);
            }
        }
        sent
    }
}
