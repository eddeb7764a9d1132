//! Session event system for UI subscribers
//!
//! This module provides:
//! - `SessionEvent` — typed events emitted by the session engine
//! - `EventBus` — broadcast channel distributing events to any number of views

mod bus;
mod types;

pub use bus::EventBus;
pub use types::{EventEmitter, SessionEvent};
