//! # Duopipe
//!
//! A one-directional message pipe between two processes, built on POSIX
//! shared memory.
//!
//! ## Philosophy
//!
//! - **One writer, one reader**: there is no cross-process lock. The writer
//!   owns the cursor into the current segment; the reader owns its own.
//! - **Publish, then wake**: a message is copied in, the sequence number in
//!   the segment header is published with release ordering, and only then is
//!   the wake signal bumped. A reader that observes the sequence observes the
//!   bytes.
//! - **Grow by continuation**: segments never move. When a message does not
//!   fit, the writer creates a larger successor, leaves a zero-length
//!   sentinel behind, and carries on. The reader follows the sentinel.
//!
//! ## Layout
//!
//! ```text
//! segment  /{base}.{n}   [sequence: i32][consumed: u8][pad: 3][message]*
//! message                [length: u32 LE][payload: length]
//! signal   /{base}.signal [wake counter: u32]
//! ```
//!
//! A message of length zero is the continuation sentinel: the next message is
//! at the start of `/{base}.{n + 1}`. The reader sets `consumed` on a segment
//! once it has moved past it so the writer can release it.
//!
//! ## Invariants
//!
//! - Messages are delivered exactly once, in write order, across any number
//!   of continuations.
//! - The sequence number counts every message including sentinels and never
//!   goes backwards from the reader's point of view.
//! - Empty payloads are rejected by the writer; length zero is reserved.

#[cfg(not(unix))]
compile_error!("duopipe requires POSIX shared memory");

#[cfg(test)]
mod tests;

mod config;
mod reader;
mod segment;
mod signal;
mod writer;

pub use config::PipeConfig;
pub use reader::InPipe;
pub use segment::Segment;
pub use signal::WakeSignal;
pub use writer::OutPipe;

/// Offset of the published sequence number within a segment.
pub const SEQUENCE_OFFSET: usize = 0;
/// Offset of the consumed flag within a segment.
pub const CONSUMED_OFFSET: usize = 4;
/// Size of the segment header; the first message starts here.
pub const HEADER_LEN: usize = 8;
/// Size of the length prefix in front of every message.
pub const LENGTH_PREFIX: usize = 4;
/// Default usable capacity of a segment.
pub const MIN_SEGMENT_SIZE: usize = 0x10000;
/// A continuation segment holds this many copies of the message that triggered it.
pub const GROWTH_FACTOR: usize = 10;

/// POSIX caps shared memory names at `NAME_MAX`.
const MAX_NAME_LEN: usize = 255;

/// Errors raised by the shared memory pipe.
#[derive(Debug)]
pub enum Error {
    /// Base or segment name is not a valid shared memory name.
    InvalidName(String),
    /// `shm_open` or `ftruncate` failed while creating a segment.
    SegmentCreate(std::io::Error),
    /// `shm_open` or `fstat` failed while opening a segment.
    SegmentOpen(std::io::Error),
    /// The named segment does not exist.
    NotFound(String),
    /// Another creator already holds the name.
    AlreadyExists(String),
    /// `mmap` failed.
    Mmap(std::io::Error),
    /// Zero-length payloads are reserved for the continuation sentinel.
    EmptyMessage,
    /// Payload does not fit a `u32` length prefix.
    MessageTooLarge(usize),
    /// A read or write would leave the mapped region.
    OutOfBounds { offset: usize, len: usize, size: usize },
    /// The reader thread could not be started.
    Spawn(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "Invalid segment name: {}", name),
            Self::SegmentCreate(e) => write!(f, "Failed to create segment: {}", e),
            Self::SegmentOpen(e) => write!(f, "Failed to open segment: {}", e),
            Self::NotFound(name) => write!(f, "Segment not found: {}", name),
            Self::AlreadyExists(name) => write!(f, "Segment already exists: {}", name),
            Self::Mmap(e) => write!(f, "Failed to map segment: {}", e),
            Self::EmptyMessage => write!(f, "Empty messages cannot be written"),
            Self::MessageTooLarge(len) => write!(f, "Message of {} bytes is too large", len),
            Self::OutOfBounds { offset, len, size } => {
                write!(f, "Access of {} bytes at {} exceeds segment of {} bytes", len, offset, size)
            }
            Self::Spawn(e) => write!(f, "Failed to spawn reader thread: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) | Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks that `base` can be turned into segment and signal names.
pub(crate) fn validate_base(base: &str) -> Result<()> {
    if base.is_empty() || base.contains('/') || base.contains('\0') {
        return Err(Error::InvalidName(base.to_string()));
    }
    // "/" + "." + a u32 index is the longest decoration.
    if base.len() + 2 + 10 > MAX_NAME_LEN {
        return Err(Error::InvalidName(base.to_string()));
    }
    Ok(())
}

/// Name of the `index`-th segment of the pipe `base`.
pub fn segment_name(base: &str, index: u32) -> String {
    format!("/{}.{}", base, index)
}

/// Name of the wake signal shared by both halves of the pipe `base`.
pub fn signal_name(base: &str) -> String {
    format!("/{}.signal", base)
}
