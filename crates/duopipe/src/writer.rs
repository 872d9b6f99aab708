//! The writing half of a pipe.

use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::trace;

use crate::Error;
use crate::GROWTH_FACTOR;
use crate::HEADER_LEN;
use crate::LENGTH_PREFIX;
use crate::PipeConfig;
use crate::Result;
use crate::segment::Segment;
use crate::segment_name;
use crate::signal::WakeSignal;
use crate::validate_base;

/// Writes length-prefixed messages into a chain of shared memory segments.
///
/// Not `Sync`: a pipe has exactly one writer. Callers that share an
/// `OutPipe` between threads wrap it in a mutex.
#[derive(Debug)]
pub struct OutPipe {
    base: String,
    config: PipeConfig,
    segment: Segment,
    index: u32,
    offset: usize,
    sequence: i32,
    /// Segments the writer has moved past but the reader may still be on.
    retired: Vec<Segment>,
    signal: WakeSignal,
    messages_written: u64,
    bytes_written: u64,
}

impl OutPipe {
    /// Opens the writing half of pipe `base`.
    ///
    /// With `create` the initial segment and the wake signal are created
    /// (and unlinked again on drop); otherwise they must already exist.
    pub fn open(base: &str, create: bool, config: PipeConfig) -> Result<Self> {
        validate_base(base)?;
        let name = segment_name(base, 0);
        let (segment, signal) = if create {
            let size = PipeConfig::segment_size(config.min_segment_size);
            (Segment::create(&name, size)?, WakeSignal::create(base)?)
        } else {
            (Segment::open(&name)?, WakeSignal::open(base)?)
        };
        let sequence = segment.sequence().load(Ordering::Acquire);

        debug!(pipe = base, create, size = segment.size(), "opened pipe writer");
        Ok(Self {
            base: base.to_string(),
            config,
            segment,
            index: 0,
            offset: HEADER_LEN,
            sequence,
            retired: Vec::new(),
            signal,
            messages_written: 0,
            bytes_written: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.base
    }

    /// Appends one message and wakes the reader.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let len = u32::try_from(payload.len()).map_err(|_| Error::MessageTooLarge(payload.len()))?;

        if !self.fits(payload.len()) {
            self.continue_in_new_segment(payload.len())?;
        }

        self.segment.write_u32(self.offset, len)?;
        self.segment.write(self.offset + LENGTH_PREFIX, payload)?;
        self.offset += LENGTH_PREFIX + payload.len();
        self.publish();

        self.messages_written += 1;
        self.bytes_written += payload.len() as u64;
        trace!(pipe = %self.base, seq = self.sequence, len, "wrote message");
        Ok(())
    }

    /// Room for the message and, after it, a sentinel.
    fn fits(&self, len: usize) -> bool {
        self.offset + LENGTH_PREFIX + len + LENGTH_PREFIX <= self.segment.size()
    }

    fn publish(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
        self.segment.sequence().store(self.sequence, Ordering::Release);
        self.signal.notify();
    }

    /// Moves to a fresh segment large enough for `len`, leaving a sentinel
    /// in the current one.
    fn continue_in_new_segment(&mut self, len: usize) -> Result<()> {
        let index = self.index + 1;
        let capacity = len.saturating_mul(GROWTH_FACTOR).max(self.config.min_segment_size);
        let next = Segment::create_replacing(&segment_name(&self.base, index), PipeConfig::segment_size(capacity))?;

        // The successor starts at the sentinel's sequence number, so a reader
        // arriving there sees nothing new until the next real message.
        next.sequence().store(self.sequence.wrapping_add(1), Ordering::Release);

        self.segment.write_u32(self.offset, 0)?;
        self.publish();

        let previous = std::mem::replace(&mut self.segment, next);
        self.retired.push(previous);
        self.index = index;
        self.offset = HEADER_LEN;

        debug!(pipe = %self.base, index, capacity, "continued in new segment");
        self.release_consumed();
        Ok(())
    }

    /// Drops retired segments the reader has flagged as consumed.
    fn release_consumed(&mut self) {
        let before = self.retired.len();
        self.retired.retain(|segment| segment.consumed().load(Ordering::Acquire) == 0);
        let released = before - self.retired.len();
        if released > 0 {
            trace!(pipe = %self.base, released, "released consumed segments");
        }
    }

    /// Retired segments still waiting for the reader.
    pub fn pending_segments(&mut self) -> usize {
        self.release_consumed();
        self.retired.len()
    }

    pub fn messages_written(&self) -> u64 {
        self.messages_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Index of the segment currently being written.
    pub fn segment_index(&self) -> u32 {
        self.index
    }
}
