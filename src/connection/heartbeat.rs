//! Heartbeat supervision
//!
//! The server sends `heartbeat` frames; the client acknowledges each one and
//! tracks when it last saw one. A socket that stays quiet past the window is
//! treated as dead even if the OS still reports it open.

use std::time::Duration;
use tokio::time::Instant;

use crate::chat::generation::GenerationState;

pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(60);

/// Streams may legitimately pause longer between keepalives
pub const DEFAULT_STREAMING_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct HeartbeatSupervisor {
    idle_window: Duration,
    streaming_window: Duration,
    last_heartbeat: Option<Instant>,
}

impl Default for HeartbeatSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_WINDOW, DEFAULT_STREAMING_WINDOW)
    }
}

impl HeartbeatSupervisor {
    pub fn new(idle_window: Duration, streaming_window: Duration) -> Self {
        Self {
            idle_window,
            streaming_window,
            last_heartbeat: None,
        }
    }

    /// Begin supervising a freshly opened transport.
    pub fn start(&mut self, now: Instant) {
        self.last_heartbeat = Some(now);
    }

    pub fn stop(&mut self) {
        self.last_heartbeat = None;
    }

    pub fn record(&mut self, now: Instant) {
        if self.last_heartbeat.is_some() {
            self.last_heartbeat = Some(now);
        }
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Window applicable to the current generation state
    pub fn window_for(&self, state: GenerationState) -> Duration {
        match state {
            GenerationState::Idle => self.idle_window,
            GenerationState::Streaming | GenerationState::StopRequested => self.streaming_window,
        }
    }

    /// Instant after which the transport counts as dead, if supervising
    pub fn deadline(&self, state: GenerationState) -> Option<Instant> {
        self.last_heartbeat
            .and_then(|last| last.checked_add(self.window_for(state)))
    }

    pub fn is_expired(&self, now: Instant, state: GenerationState) -> bool {
        self.deadline(state).is_some_and(|deadline| now >= deadline)
    }
}
