//! Inbound stream processing
//!
//! ## Modules
//!
//! - [`sequence`] — `SequenceGate`: stale/duplicate/gap detection on `sequence`
//! - [`reassembly`] — `ChunkReassembler`: rebuilds fragmented payloads, TTL eviction
//! - [`router`] — `FrameRouter`: decode, classify, gate and reassemble inbound frames

pub mod reassembly;
pub mod router;
pub mod sequence;

pub use reassembly::{ChunkReassembler, FragmentError, ReassemblyConfig};
pub use router::{DropReason, FrameRouter, NotificationPhase, RouteOutcome, RoutedFrame};
pub use sequence::{Admission, SequenceGate};
