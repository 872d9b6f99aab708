//! Cross-process wake signal.
//!
//! A single `u32` counter in its own shared memory segment. The writer bumps
//! it after publishing a message; the reader blocks on it with a futex wait.
//!
//! The futex ops are the SHARED variants (`FUTEX_WAIT` = 0, `FUTEX_WAKE` = 1).
//! The `_PRIVATE` variants only work within one process and would never wake
//! a reader in the peer.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::HEADER_LEN;
use crate::Result;
use crate::segment::Segment;
use crate::signal_name;
use crate::validate_base;

/// The wake counter shared by the two halves of one pipe.
#[derive(Debug)]
pub struct WakeSignal {
    segment: Segment,
}

impl WakeSignal {
    /// Creates the signal for pipe `base`. Unlinked when dropped.
    pub fn create(base: &str) -> Result<Self> {
        validate_base(base)?;
        let segment = Segment::create(&signal_name(base), HEADER_LEN)?;
        Ok(Self { segment })
    }

    /// Opens the signal created by the peer.
    pub fn open(base: &str) -> Result<Self> {
        validate_base(base)?;
        let segment = Segment::open(&signal_name(base))?;
        Ok(Self { segment })
    }

    fn word(&self) -> &AtomicU32 {
        self.segment.word()
    }

    /// Current counter value. Load this before checking for work, then pass
    /// it to `wait` so a notify in between is never lost.
    pub fn load(&self) -> u32 {
        self.word().load(Ordering::Acquire)
    }

    /// Bumps the counter and wakes every waiter.
    pub fn notify(&self) {
        self.word().fetch_add(1, Ordering::Release);
        futex_wake_all(self.word());
    }

    /// Wakes waiters without signalling new work; used to interrupt a reader
    /// that is shutting down.
    pub fn interrupt(&self) {
        futex_wake_all(self.word());
    }

    /// Blocks while the counter still equals `observed`, for at most `timeout`.
    pub fn wait(&self, observed: u32, timeout: Duration) {
        futex_wait(self.word(), observed, timeout);
    }
}

#[cfg(target_os = "linux")]
const FUTEX_WAIT: libc::c_int = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: libc::c_int = 1;

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: `word` is a live reference into a shared mapping and `ts` lives
    // for the duration of the call. EAGAIN, EINTR and ETIMEDOUT all mean
    // "go look again", so the result is ignored.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
            std::ptr::null::<u32>(),
            0i32,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake_all(word: &AtomicU32) {
    // SAFETY: same address the waiters use; the remaining arguments are unused.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0i32,
        );
    }
}

// Elsewhere the reader degrades to polling the counter.
#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while word.load(Ordering::Acquire) == expected && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_micros(200));
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake_all(_word: &AtomicU32) {}
