//! Generation lifecycle and the send/stop control
//!
//! The control has a third, transient state between "send" and "stop". Every
//! change goes through [`GenerationStateMachine`] in two phases: a `begin_*`
//! call returns a [`PendingTransition`] that the caller completes after the
//! side effects ran. If a side effect fails and the transition is never
//! completed, the watchdog restores the idle state.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Idle,
    Streaming,
    StopRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonState {
    Send,
    Stop,
    Transitioning,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("a response is already being generated")]
    Busy,
    #[error("the send/stop control is mid-transition")]
    Transitioning,
    #[error("no response is being generated")]
    NotStreaming,
}

/// A started control transition. Must be handed back to
/// [`GenerationStateMachine::complete`].
#[must_use = "an uncompleted transition leaves the control disabled until the watchdog fires"]
#[derive(Debug)]
pub struct PendingTransition {
    target: ButtonState,
    applies_stop: bool,
}

impl PendingTransition {
    pub fn target(&self) -> ButtonState {
        self.target
    }
}

#[derive(Debug)]
pub struct GenerationStateMachine {
    state: GenerationState,
    button: ButtonState,
    /// The local half of a stop (UI reset) already ran
    stop_applied: bool,
    transition_started: Option<Instant>,
    watchdog: Duration,
}

impl Default for GenerationStateMachine {
    fn default() -> Self {
        Self::new(DEFAULT_WATCHDOG)
    }
}

impl GenerationStateMachine {
    pub fn new(watchdog: Duration) -> Self {
        Self {
            state: GenerationState::Idle,
            button: ButtonState::Send,
            stop_applied: false,
            transition_started: None,
            watchdog,
        }
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn button(&self) -> ButtonState {
        self.button
    }

    /// Input is only accepted while the control shows "send".
    pub fn input_enabled(&self) -> bool {
        self.button == ButtonState::Send
    }

    pub fn is_generating(&self) -> bool {
        self.state != GenerationState::Idle
    }

    /// A stop was requested and the UI already reset for it
    pub fn stop_applied(&self) -> bool {
        self.state == GenerationState::StopRequested && self.stop_applied
    }

    fn begin(&mut self, target: ButtonState, now: Instant) -> PendingTransition {
        self.button = ButtonState::Transitioning;
        self.transition_started = Some(now);
        PendingTransition {
            target,
            applies_stop: false,
        }
    }

    /// Finish a transition once its side effects ran.
    pub fn complete(&mut self, pending: PendingTransition) -> ButtonState {
        if self.button != ButtonState::Transitioning {
            debug!(target = ?pending.target, "Transition already resolved, ignoring completion");
            return self.button;
        }
        self.button = pending.target;
        self.transition_started = None;
        if pending.applies_stop && self.state == GenerationState::StopRequested {
            self.stop_applied = true;
        }
        self.button
    }

    /// Whether a new message may be sent now.
    ///
    /// Allowed from idle, and from a stop whose local reset already ran: the
    /// abandoned generation's confirmation is not worth waiting for.
    pub fn can_send(&self) -> Result<(), GenerationError> {
        if self.button == ButtonState::Transitioning {
            return Err(GenerationError::Transitioning);
        }
        match self.state {
            GenerationState::Idle => Ok(()),
            GenerationState::StopRequested if self.stop_applied => Ok(()),
            _ => Err(GenerationError::Busy),
        }
    }

    /// A user message reached the server.
    pub fn begin_send(&mut self, now: Instant) -> Result<PendingTransition, GenerationError> {
        self.can_send()?;
        self.state = GenerationState::Streaming;
        self.stop_applied = false;
        Ok(self.begin(ButtonState::Stop, now))
    }

    /// User stops the running generation.
    pub fn request_stop(&mut self, now: Instant) -> Result<PendingTransition, GenerationError> {
        if self.button == ButtonState::Transitioning {
            return Err(GenerationError::Transitioning);
        }
        if self.state != GenerationState::Streaming {
            return Err(GenerationError::NotStreaming);
        }
        self.state = GenerationState::StopRequested;
        let mut pending = self.begin(ButtonState::Send, now);
        pending.applies_stop = true;
        Ok(pending)
    }

    /// Final chunk of the response arrived.
    pub fn on_final_chunk(&mut self, now: Instant) -> Option<PendingTransition> {
        match self.state {
            GenerationState::Idle => None,
            GenerationState::Streaming => {
                self.state = GenerationState::Idle;
                Some(self.begin(ButtonState::Send, now))
            }
            GenerationState::StopRequested => self.settle_stop(now),
        }
    }

    /// Server confirmed the stop. A confirmation that arrives when no stop is
    /// outstanding is a no-op.
    pub fn on_stop_confirmed(&mut self, now: Instant) -> Option<PendingTransition> {
        match self.state {
            GenerationState::StopRequested => self.settle_stop(now),
            _ => {
                debug!(state = ?self.state, "Stop confirmation with no stop outstanding");
                None
            }
        }
    }

    fn settle_stop(&mut self, now: Instant) -> Option<PendingTransition> {
        self.state = GenerationState::Idle;
        if self.stop_applied {
            self.stop_applied = false;
            return None;
        }
        Some(self.begin(ButtonState::Send, now))
    }

    /// Connection lost or server error: back to idle from anywhere.
    pub fn abort(&mut self, now: Instant) -> Option<PendingTransition> {
        self.state = GenerationState::Idle;
        self.stop_applied = false;
        if self.button == ButtonState::Send {
            return None;
        }
        Some(self.begin(ButtonState::Send, now))
    }

    /// Align with the server's authoritative streaming flag.
    pub fn reconcile(&mut self, server_streaming: bool, now: Instant) -> Option<PendingTransition> {
        match (server_streaming, self.state) {
            (true, GenerationState::Idle) => {
                debug!("Server is still streaming, resuming generation state");
                self.state = GenerationState::Streaming;
                self.stop_applied = false;
                Some(self.begin(ButtonState::Stop, now))
            }
            (false, GenerationState::Streaming) | (false, GenerationState::StopRequested) => {
                debug!(state = ?self.state, "Server is idle, resetting generation state");
                self.abort(now)
            }
            _ => None,
        }
    }

    /// Instant at which a stuck transition is forcibly resolved. None when
    /// nothing is pending or the window is too large to represent.
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.transition_started
            .and_then(|started| started.checked_add(self.watchdog))
    }

    /// Force idle if a transition has been pending too long. Returns true
    /// when the watchdog fired.
    pub fn check_watchdog(&mut self, now: Instant) -> bool {
        match self.watchdog_deadline() {
            Some(deadline) if now >= deadline && self.button == ButtonState::Transitioning => {
                warn!(
                    state = ?self.state,
                    waited_secs = self.watchdog.as_secs(),
                    "Control stuck mid-transition, forcing idle"
                );
                self.state = GenerationState::Idle;
                self.button = ButtonState::Send;
                self.stop_applied = false;
                self.transition_started = None;
                true
            }
            _ => false,
        }
    }
}
