use std::time::Duration;

use crate::HEADER_LEN;
use crate::LENGTH_PREFIX;
use crate::MIN_SEGMENT_SIZE;

/// Tuning knobs for one pipe half.
///
/// Both halves of a pipe may use different configs; segment sizes are read
/// back from the segment itself when opening.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Usable bytes in the initial segment, and the floor for continuations.
    pub min_segment_size: usize,
    /// Empty polls the reader spins through before blocking on the signal.
    pub spin_cycles: u32,
    /// Upper bound on a single blocking wait; the reader re-checks its stop
    /// flag and the sequence number at least this often.
    pub poll_interval: Duration,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            min_segment_size: MIN_SEGMENT_SIZE,
            spin_cycles: 1000,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl PipeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the usable size of the initial segment.
    ///
    /// Clamped so that at least one byte of payload plus a sentinel fits.
    pub fn with_min_segment_size(mut self, bytes: usize) -> Self {
        self.min_segment_size = bytes.max(2 * LENGTH_PREFIX + 1);
        self
    }

    pub fn with_spin_cycles(mut self, cycles: u32) -> Self {
        self.spin_cycles = cycles;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Total mapped size of a segment that must hold `capacity` message bytes.
    pub(crate) fn segment_size(capacity: usize) -> usize {
        HEADER_LEN + capacity
    }
}
