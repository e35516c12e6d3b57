//! Cross-process spinlock and state word kept in the index control block.
//!
//! Both words are plain `AtomicU32`s inside the shared mapping, so every
//! process attached to the table contends on the same lock. Acquire/Release
//! ordering on the lock word is what makes one process's writes to the
//! bucket table and arena visible to the next holder.
//!
//! A process that dies while holding the lock leaves it held; there is no
//! owner-death recovery.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::error::AttachError;
use crate::layout::control;

const UNLOCKED: u32 = 0;

/// Busy-spins before falling back to yielding the CPU.
const SPIN_LIMIT: u32 = 128;

/// How long a non-creator waits for the creator to publish the segment.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);
const READY_POLL_ATTEMPTS: u32 = 5_000;

/// Lifecycle of a table as recorded in shared memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentState {
    /// Freshly created, contents not yet initialized.
    Uninitialized,
    Ready,
    /// A process unlinked the table; handles still mapped to it are invalid.
    Destroyed,
}

impl SegmentState {
    const UNINITIALIZED: u32 = 0;
    const READY: u32 = 0x5348_4d31;
    const DESTROYED: u32 = 0xdead_5348;

    fn to_word(self) -> u32 {
        match self {
            SegmentState::Uninitialized => Self::UNINITIALIZED,
            SegmentState::Ready => Self::READY,
            SegmentState::Destroyed => Self::DESTROYED,
        }
    }

    fn from_word(word: u32) -> Self {
        match word {
            Self::READY => SegmentState::Ready,
            Self::DESTROYED => SegmentState::Destroyed,
            _ => SegmentState::Uninitialized,
        }
    }
}

/// Accessor for the lock and state words at the start of the index segment.
pub(crate) struct ControlBlock {
    base: NonNull<u8>,
}

impl ControlBlock {
    /// # Safety
    /// `base` must point at the start of a mapped index segment at least
    /// [`control::SIZE`] bytes long that outlives the control block.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self { base }
    }

    #[inline]
    fn lock_word(&self) -> &AtomicU32 {
        unsafe { &*(self.base.as_ptr().add(control::LOCK_OFFSET) as *const AtomicU32) }
    }

    #[inline]
    fn state_word(&self) -> &AtomicU32 {
        unsafe { &*(self.base.as_ptr().add(control::STATE_OFFSET) as *const AtomicU32) }
    }

    /// Blocks until the lock is held by this caller.
    pub fn lock(&self) -> SpinGuard<'_> {
        let lock = self.lock_word();
        let owner = std::process::id().max(1);
        let mut spins = 0u32;
        loop {
            match lock.compare_exchange_weak(UNLOCKED, owner, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return SpinGuard { lock },
                Err(_) if spins < SPIN_LIMIT => {
                    spins += 1;
                    std::hint::spin_loop();
                }
                Err(_) => {
                    if spins == SPIN_LIMIT {
                        spins += 1;
                        trace!(holder = ?self.holder(), "table lock contended");
                    }
                    thread::yield_now();
                }
            }
        }
    }

    /// Pid of the current lock holder, if any.
    pub fn holder(&self) -> Option<u32> {
        match self.lock_word().load(Ordering::Relaxed) {
            UNLOCKED => None,
            pid => Some(pid),
        }
    }

    pub fn state(&self) -> SegmentState {
        SegmentState::from_word(self.state_word().load(Ordering::Acquire))
    }

    /// Stores `state` with Release ordering, after everything written before
    /// it.
    pub fn publish(&self, state: SegmentState) {
        self.state_word().store(state.to_word(), Ordering::Release);
    }

    /// Waits for the creator of the segment to publish it.
    ///
    /// Returns the first state other than `Uninitialized`, or `NotReady` if
    /// the creator does not finish in time.
    pub fn wait_published(&self, segment: &str) -> Result<SegmentState, AttachError> {
        for attempt in 0..READY_POLL_ATTEMPTS {
            match self.state() {
                SegmentState::Uninitialized => {
                    if attempt == 0 {
                        trace!(segment, "waiting for creator to initialize segment");
                    }
                    thread::sleep(READY_POLL_INTERVAL);
                }
                state => return Ok(state),
            }
        }
        Err(AttachError::NotReady {
            segment: segment.to_string(),
        })
    }
}

/// Holds the table lock; releases it when dropped, on every exit path.
pub(crate) struct SpinGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.store(UNLOCKED, Ordering::Release);
    }
}
