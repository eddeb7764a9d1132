//! Chat session: generation lifecycle, outbound queue, drafts and the
//! engine that ties them to a connection
//!
//! Provides the `SessionEngine` actor and its `SessionHandle`, which views use
//! to send messages, stop generations and observe `SessionEvent`s.

pub mod draft;
pub mod engine;
pub mod generation;
pub mod outbound;
pub mod session;

#[cfg(test)]
mod tests;

pub use draft::{Draft, DraftDebouncer, DraftStore};
pub use engine::{EngineConfig, SessionCommand, SessionEngine, SessionHandle, STOPPED_MARKER};
pub use generation::{ButtonState, GenerationError, GenerationState, GenerationStateMachine};
pub use outbound::OutboundQueue;
pub use session::Session;
