//! Classifies inbound frames and resolves streaming deltas
//!
//! Every text frame from the socket goes through [`FrameRouter::route`]:
//!
//! ```text
//! text ──► decode ──► InboundFrame ──┬─► control / snapshot / error ──► Deliver
//!                                    └─► ai_chunk ──► (fragment? reassemble) ──► SequenceGate ──► Deliver
//! ```
//!
//! Fragments are reassembled before the gate sees their sequence number, since
//! all fragments of one payload share a sequence id. A fragment whose sequence
//! is already behind the cursor is dropped before it can open a buffer.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::reassembly::{ChunkReassembler, FragmentError, ReassemblyConfig};
use super::sequence::{Admission, SequenceGate};
use crate::protocol::{decode, AiChunkFrame, FrameError, InboundFrame, MessageFrame};

/// Phase of an out-of-band notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPhase {
    /// Operation started: show a transient indicator, keep the focused view
    Early,
    /// Operation finished: safe to switch views or load the artifact
    Complete,
}

/// A frame that survived classification, ordering and reassembly
#[derive(Debug, Clone, PartialEq)]
pub enum RoutedFrame {
    HistorySnapshot {
        messages: Vec<Value>,
        conversation_id: Option<String>,
    },
    CompleteMessage(MessageFrame),
    ContentDelta {
        text: String,
        is_final: bool,
        conversation_id: Option<String>,
    },
    Notification {
        notification_type: String,
        phase: NotificationPhase,
        content: String,
        is_final: bool,
    },
    ToolProgress(Map<String, Value>),
    StopConfirmed,
    Heartbeat,
    SyncResponse {
        is_streaming: bool,
        conversation_id: Option<String>,
    },
    Error {
        message: String,
        code: Option<String>,
    },
    UsageUpdated(Map<String, Value>),
}

/// Why a frame never reached a handler
#[derive(Debug)]
pub enum DropReason {
    Undecodable(FrameError),
    UnknownKind(String),
    StaleSequence { sequence: u64, expected: u64 },
    BadFragment(FragmentError),
    FragmentWithoutPosition,
}

/// Outcome of routing one raw frame
#[derive(Debug)]
pub enum RouteOutcome {
    Deliver(RoutedFrame),
    /// Fragment stored; more fragments are needed
    Buffered,
    Dropped(DropReason),
}

/// Owns the sequence gate and the fragment reassembler for one session.
#[derive(Debug, Default)]
pub struct FrameRouter {
    gate: SequenceGate,
    reassembler: ChunkReassembler,
    /// Sequence ids for which some fragment already carried `is_final`
    final_fragments: HashSet<u64>,
}

impl FrameRouter {
    pub fn new(reassembly: ReassemblyConfig) -> Self {
        Self {
            gate: SequenceGate::new(),
            reassembler: ChunkReassembler::new(reassembly),
            final_fragments: HashSet::new(),
        }
    }

    pub fn gate(&self) -> &SequenceGate {
        &self.gate
    }

    pub fn reassembler(&self) -> &ChunkReassembler {
        &self.reassembler
    }

    /// Decode and classify one raw text frame.
    pub fn route(&mut self, text: &str, now: Instant) -> RouteOutcome {
        let decoded = match decode(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return RouteOutcome::Dropped(DropReason::Undecodable(e));
            }
        };

        let routed = match decoded.frame {
            InboundFrame::ChatHistory(history) => RoutedFrame::HistorySnapshot {
                messages: history.messages,
                conversation_id: history.conversation_id,
            },
            InboundFrame::Message(message) => RoutedFrame::CompleteMessage(message),
            InboundFrame::AiChunk(chunk) => return self.route_chunk(chunk, now),
            InboundFrame::ToolProgress(progress) => RoutedFrame::ToolProgress(progress.payload),
            InboundFrame::StopConfirmed(_) => RoutedFrame::StopConfirmed,
            InboundFrame::Heartbeat(_) => RoutedFrame::Heartbeat,
            InboundFrame::SyncStateResponse(sync) => RoutedFrame::SyncResponse {
                is_streaming: sync.is_streaming,
                conversation_id: sync.conversation_id,
            },
            InboundFrame::Error(err) => RoutedFrame::Error {
                message: err.message,
                code: err.code,
            },
            InboundFrame::TokenUsageUpdated(usage) => RoutedFrame::UsageUpdated(usage.payload),
            InboundFrame::Unknown => {
                warn!(kind = %decoded.kind, "Ignoring unknown frame kind");
                return RouteOutcome::Dropped(DropReason::UnknownKind(decoded.kind));
            }
        };

        RouteOutcome::Deliver(routed)
    }

    fn route_chunk(&mut self, chunk: AiChunkFrame, now: Instant) -> RouteOutcome {
        let mut is_final = chunk.is_final;

        let text = if chunk.is_chunked {
            let (Some(sequence_id), Some(index), Some(total)) =
                (chunk.sequence, chunk.chunk_sequence, chunk.total_chunks)
            else {
                warn!(
                    sequence = ?chunk.sequence,
                    index = ?chunk.chunk_sequence,
                    total = ?chunk.total_chunks,
                    "Dropping fragment without sequence/index/total"
                );
                return RouteOutcome::Dropped(DropReason::FragmentWithoutPosition);
            };

            // An open buffer means the sequence was admitted by its first
            // fragment; later frames moving the cursor must not orphan it.
            let opens_payload = !self.reassembler.is_pending(sequence_id);
            if opens_payload && self.gate.is_stale(sequence_id) {
                return self.drop_stale(sequence_id);
            }

            let assembled = match self
                .reassembler
                .ingest(sequence_id, index, total, &chunk.chunk, now)
            {
                Ok(assembled) => assembled,
                Err(e) => {
                    warn!(sequence_id, error = %e, "Dropping inconsistent fragment");
                    return RouteOutcome::Dropped(DropReason::BadFragment(e));
                }
            };
            if opens_payload {
                self.gate.admit(sequence_id);
            }

            match assembled {
                Some(assembled) => {
                    is_final |= self.final_fragments.remove(&sequence_id);
                    assembled
                }
                None => {
                    if chunk.is_final {
                        self.final_fragments.insert(sequence_id);
                    }
                    return RouteOutcome::Buffered;
                }
            }
        } else {
            if let Some(sequence) = chunk.sequence {
                let expected = self.gate.expected();
                if let Admission::Stale = self.gate.admit(sequence) {
                    return self.drop_stale_with(sequence, expected);
                }
            }
            chunk.chunk
        };

        let routed = if chunk.is_notification {
            RoutedFrame::Notification {
                notification_type: chunk.notification_type.unwrap_or_default(),
                phase: if chunk.early_notification {
                    NotificationPhase::Early
                } else {
                    NotificationPhase::Complete
                },
                content: text,
                is_final,
            }
        } else {
            RoutedFrame::ContentDelta {
                text,
                is_final,
                conversation_id: chunk.conversation_id,
            }
        };
        RouteOutcome::Deliver(routed)
    }

    fn drop_stale(&self, sequence: u64) -> RouteOutcome {
        self.drop_stale_with(sequence, self.gate.expected())
    }

    fn drop_stale_with(&self, sequence: u64, expected: u64) -> RouteOutcome {
        debug!(sequence, expected, "Dropping stale frame");
        RouteOutcome::Dropped(DropReason::StaleSequence { sequence, expected })
    }

    /// Evict abandoned fragment buffers. Returns the evicted sequence ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<u64> {
        let evicted = self.reassembler.sweep(now);
        for id in &evicted {
            self.final_fragments.remove(id);
        }
        evicted
    }

    /// Earliest instant at which a fragment buffer could expire
    pub fn next_sweep(&self) -> Option<Instant> {
        self.reassembler.next_expiry()
    }

    /// Forget all ordering and fragment state (new stream).
    pub fn reset_stream(&mut self) {
        self.gate.reset();
        self.reassembler.clear();
        self.final_fragments.clear();
    }
}
