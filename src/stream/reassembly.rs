//! Fragment reassembly for payloads split across several frames
//!
//! Fragments may arrive in any order. Output is always the concatenation in
//! index order, produced exactly once when the last missing index arrives.
//! Buffers that stop receiving fragments are evicted by [`ChunkReassembler::sweep`]
//! after the configured inactivity window.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default inactivity window before an incomplete buffer is evicted
pub const DEFAULT_FRAGMENT_TTL: Duration = Duration::from_secs(120);

/// Default cap on concurrently open buffers
pub const DEFAULT_MAX_BUFFERS: usize = 64;

/// Inconsistent fragment metadata. The offending fragment is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FragmentError {
    #[error("fragment declares zero total chunks")]
    EmptyTotal,
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("fragment total changed from {expected} to {received} for sequence {sequence_id}")]
    TotalMismatch {
        sequence_id: u64,
        expected: usize,
        received: usize,
    },
}

/// Reclamation policy for abandoned buffers
#[derive(Debug, Clone, Copy)]
pub struct ReassemblyConfig {
    pub ttl: Duration,
    pub max_buffers: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_FRAGMENT_TTL,
            max_buffers: DEFAULT_MAX_BUFFERS,
        }
    }
}

#[derive(Debug)]
struct FragmentBuffer {
    chunks: BTreeMap<usize, String>,
    total_expected: usize,
    last_activity: Instant,
}

impl FragmentBuffer {
    fn received_count(&self) -> usize {
        self.chunks.len()
    }
}

/// One buffer per logical sequence id.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    buffers: HashMap<u64, FragmentBuffer>,
    config: ReassemblyConfig,
}

impl ChunkReassembler {
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            buffers: HashMap::new(),
            config,
        }
    }

    /// Number of incomplete buffers currently held
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// Whether a buffer is open for `sequence_id`
    pub fn is_pending(&self, sequence_id: u64) -> bool {
        self.buffers.contains_key(&sequence_id)
    }

    /// Add one fragment.
    ///
    /// Returns `Ok(Some(payload))` when this fragment completes the set, at
    /// which point the buffer is freed. A repeated index replaces the earlier
    /// fragment and does not count twice.
    pub fn ingest(
        &mut self,
        sequence_id: u64,
        index: usize,
        total: usize,
        payload: &str,
        now: Instant,
    ) -> Result<Option<String>, FragmentError> {
        if total == 0 {
            return Err(FragmentError::EmptyTotal);
        }
        if index >= total {
            return Err(FragmentError::IndexOutOfRange { index, total });
        }

        if let Some(existing) = self.buffers.get(&sequence_id) {
            if existing.total_expected != total {
                return Err(FragmentError::TotalMismatch {
                    sequence_id,
                    expected: existing.total_expected,
                    received: total,
                });
            }
        } else {
            // Single-fragment payloads never need a buffer
            if total == 1 {
                return Ok(Some(payload.to_string()));
            }
            self.make_room();
        }

        let buffer = self
            .buffers
            .entry(sequence_id)
            .or_insert_with(|| FragmentBuffer {
                chunks: BTreeMap::new(),
                total_expected: total,
                last_activity: now,
            });

        if buffer.chunks.insert(index, payload.to_string()).is_some() {
            debug!(sequence_id, index, "Duplicate fragment replaced");
        }
        buffer.last_activity = now;

        if buffer.received_count() < buffer.total_expected {
            return Ok(None);
        }

        let buffer = match self.buffers.remove(&sequence_id) {
            Some(buffer) => buffer,
            None => return Ok(None),
        };
        let assembled: String = buffer.chunks.into_values().collect();
        debug!(
            sequence_id,
            total,
            bytes = assembled.len(),
            "Fragmented payload reassembled"
        );
        Ok(Some(assembled))
    }

    /// Evict buffers idle for longer than the TTL. Returns the evicted ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<u64> {
        let ttl = self.config.ttl;
        let mut evicted: Vec<u64> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| now.saturating_duration_since(buffer.last_activity) >= ttl)
            .map(|(id, _)| *id)
            .collect();
        evicted.sort_unstable();

        for id in &evicted {
            if let Some(buffer) = self.buffers.remove(id) {
                warn!(
                    sequence_id = id,
                    received = buffer.received_count(),
                    total = buffer.total_expected,
                    "Evicting abandoned fragment buffer"
                );
            }
        }
        evicted
    }

    /// Earliest instant at which [`sweep`](Self::sweep) could evict something.
    /// A TTL too large to represent never expires.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.buffers
            .values()
            .filter_map(|buffer| buffer.last_activity.checked_add(self.config.ttl))
            .min()
    }

    /// Drop every buffer (the stream feeding them is gone).
    pub fn clear(&mut self) {
        if !self.buffers.is_empty() {
            debug!(count = self.buffers.len(), "Discarding incomplete fragment buffers");
        }
        self.buffers.clear();
    }

    fn make_room(&mut self) {
        if self.buffers.len() < self.config.max_buffers {
            return;
        }
        let oldest = self
            .buffers
            .iter()
            .min_by_key(|(_, buffer)| buffer.last_activity)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.buffers.remove(&id);
            warn!(
                sequence_id = id,
                max_buffers = self.config.max_buffers,
                "Fragment buffer limit reached, evicting oldest"
            );
        }
    }
}
