//! The reading half of a pipe and its dedicated thread.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::HEADER_LEN;
use crate::LENGTH_PREFIX;
use crate::PipeConfig;
use crate::Result;
use crate::segment::Segment;
use crate::segment_name;
use crate::signal::WakeSignal;
use crate::validate_base;

/// State shared between an `InPipe` handle and its reader thread.
struct ReaderShared {
    stop: AtomicBool,
    received: AtomicU64,
    signal: WakeSignal,
}

/// The reader's position in the segment chain. Owned by the reader thread.
struct Cursor {
    base: String,
    segment: Segment,
    index: u32,
    offset: usize,
    last: i32,
}

impl Cursor {
    /// Returns the next message, following continuation sentinels.
    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let latest = self.segment.sequence().load(Ordering::Acquire);
            if latest == self.last {
                return Ok(None);
            }

            let len = self.segment.read_u32(self.offset)? as usize;
            self.last = self.last.wrapping_add(1);

            if len == 0 {
                self.follow_sentinel()?;
                continue;
            }

            let payload = self.segment.read(self.offset + LENGTH_PREFIX, len)?;
            self.offset += LENGTH_PREFIX + len;
            return Ok(Some(payload));
        }
    }

    fn follow_sentinel(&mut self) -> Result<()> {
        let index = self.index + 1;
        let next = Segment::open(&segment_name(&self.base, index))?;
        self.segment.consumed().store(1, Ordering::Release);
        drop(std::mem::replace(&mut self.segment, next));
        self.index = index;
        self.offset = HEADER_LEN;
        debug!(pipe = %self.base, index, "followed continuation");
        Ok(())
    }
}

/// Receives messages from a pipe on a dedicated thread.
///
/// Every message is handed to the callback in write order, exactly once.
/// Dropping the `InPipe` stops and joins the thread.
pub struct InPipe {
    base: String,
    shared: Arc<ReaderShared>,
    thread: Option<JoinHandle<()>>,
}

impl InPipe {
    /// Opens the reading half of pipe `base` and starts the reader thread.
    ///
    /// With `create` the initial segment and the wake signal are created;
    /// otherwise they must already exist.
    pub fn open<F>(base: &str, create: bool, config: PipeConfig, on_message: F) -> Result<Self>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        Self::open_with_failure(base, create, config, on_message, |_| {})
    }

    /// Like `open`, and calls `on_failure` if the reader thread stops on a
    /// malformed stream. It is not called after `close`.
    pub fn open_with_failure<F, G>(
        base: &str,
        create: bool,
        config: PipeConfig,
        on_message: F,
        on_failure: G,
    ) -> Result<Self>
    where
        F: FnMut(Vec<u8>) + Send + 'static,
        G: FnOnce(crate::Error) + Send + 'static,
    {
        validate_base(base)?;
        let name = segment_name(base, 0);
        let (segment, signal) = if create {
            let size = PipeConfig::segment_size(config.min_segment_size);
            (Segment::create(&name, size)?, WakeSignal::create(base)?)
        } else {
            (Segment::open(&name)?, WakeSignal::open(base)?)
        };

        // Sequences start at zero, so anything written before this reader
        // attached is still delivered.
        let cursor = Cursor {
            base: base.to_string(),
            last: 0,
            segment,
            index: 0,
            offset: HEADER_LEN,
        };
        let shared = Arc::new(ReaderShared {
            stop: AtomicBool::new(false),
            received: AtomicU64::new(0),
            signal,
        });

        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(format!("duopipe-reader:{}", base))
            .spawn(move || {
                if let Err(e) = run(cursor, thread_shared, config, on_message) {
                    on_failure(e);
                }
            })
            .map_err(crate::Error::Spawn)?;

        debug!(pipe = base, create, "opened pipe reader");
        Ok(Self { base: base.to_string(), shared, thread: Some(thread) })
    }

    pub fn name(&self) -> &str {
        &self.base
    }

    /// Messages delivered to the callback so far.
    pub fn messages_received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops the reader thread. Idempotent.
    ///
    /// Called from the reader thread itself (e.g. by a callback that tears
    /// the pipe down) the thread is detached instead of joined.
    pub fn close(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        self.shared.signal.interrupt();

        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!(pipe = %self.base, "reader thread panicked");
        }
        debug!(pipe = %self.base, "closed pipe reader");
    }
}

impl Drop for InPipe {
    fn drop(&mut self) {
        self.close();
    }
}

fn run<F>(mut cursor: Cursor, shared: Arc<ReaderShared>, config: PipeConfig, mut on_message: F) -> Result<()>
where
    F: FnMut(Vec<u8>),
{
    let mut idle = 0u32;
    while !shared.stop.load(Ordering::Acquire) {
        let observed = shared.signal.load();
        match cursor.next() {
            Ok(Some(payload)) => {
                idle = 0;
                shared.received.fetch_add(1, Ordering::Relaxed);
                trace!(pipe = %cursor.base, seq = cursor.last, len = payload.len(), "read message");
                on_message(payload);
            }
            Ok(None) if idle < config.spin_cycles => {
                idle += 1;
                std::hint::spin_loop();
            }
            Ok(None) => shared.signal.wait(observed, config.poll_interval),
            Err(e) => {
                warn!(pipe = %cursor.base, error = %e, "reader stopped on malformed stream");
                return Err(e);
            }
        }
    }
    Ok(())
}
