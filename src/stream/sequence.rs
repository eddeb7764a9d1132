//! Best-effort ordering and duplicate detection for streamed frames
//!
//! The gate never asks the server to retransmit. A gap is accepted and
//! recorded so that content keeps flowing; only frames older than the cursor
//! are dropped.

use tracing::warn;

/// Result of admitting one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Exactly the expected sequence
    Accept,
    /// Older than the cursor (duplicate or reordered); drop the frame
    Stale,
    /// Newer than the cursor; frames in between are missing
    Gap { expected: u64, missing: u64 },
}

impl Admission {
    /// Whether the frame should reach content handlers
    pub fn delivers(&self) -> bool {
        !matches!(self, Admission::Stale)
    }
}

/// Owns the sequence cursor for one session.
#[derive(Debug, Default)]
pub struct SequenceGate {
    expected: u64,
    gaps_observed: u64,
    stale_dropped: u64,
}

impl SequenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence number the gate expects
    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Number of gaps seen since the last reset
    pub fn gaps_observed(&self) -> u64 {
        self.gaps_observed
    }

    /// Number of stale frames dropped since the last reset
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    /// True when `sequence` would be rejected, without touching the cursor
    pub fn is_stale(&self, sequence: u64) -> bool {
        sequence < self.expected
    }

    /// Admit a frame and advance the cursor accordingly.
    pub fn admit(&mut self, sequence: u64) -> Admission {
        if sequence < self.expected {
            self.stale_dropped += 1;
            return Admission::Stale;
        }

        if sequence == self.expected {
            self.expected += 1;
            return Admission::Accept;
        }

        let expected = self.expected;
        let missing = sequence - expected;
        self.gaps_observed += 1;
        self.expected = sequence + 1;
        warn!(
            expected,
            received = sequence,
            missing,
            "Sequence gap detected, continuing without retransmission"
        );
        Admission::Gap { expected, missing }
    }

    /// Start a fresh stream (new generation, new connection or new chat).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
