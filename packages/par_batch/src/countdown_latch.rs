//! The countdown latch contract and the lock-free counter shared by its implementations.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::{Error, EventCountdownLatch, Result, SpinCountdownLatch, SpinWait, Timeout};

/// A synchronization primitive that releases waiting threads once an internal counter reaches
/// zero.
///
/// A latch is **active** while its count is above zero and **set** once the count reaches zero.
/// Set is terminal: nothing can move a set latch back to active.
///
/// | Operation | Active | Set |
/// |---|---|---|
/// | `signal_many(n)`, `n <= remaining` | count decreases; `Ok(true)` if it reached zero | - |
/// | `signal_many(n)`, `n > remaining` | [`Error::LatchUnderflow`], count unchanged | [`Error::LatchUnderflow`] |
/// | `try_add_count(n)` | count increases; [`Error::LatchOverflow`] on overflow | no-op, `Ok(false)` |
/// | `wait(timeout)` | blocks until set or [`Error::Timeout`] | returns immediately |
///
/// Exactly one signalling call observes the transition to set, even under contention.
pub trait CountdownLatch: Debug + Send + Sync {
    /// Decrements the count by one.
    ///
    /// Returns `Ok(true)` if this call moved the latch to the set state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LatchUnderflow`] if the latch is already set.
    fn signal(&self) -> Result<bool> {
        self.signal_many(1)
    }

    /// Decrements the count by `count`, all or nothing.
    ///
    /// Returns `Ok(true)` if this call moved the latch to the set state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `count` is zero and [`Error::LatchUnderflow`] if
    /// `count` exceeds the remaining count. The count is not modified on error.
    fn signal_many(&self, count: usize) -> Result<bool>;

    /// Raises the count by `count` if the latch is still active.
    ///
    /// Adding to a latch that is already set does nothing: late registrations are harmless but
    /// can never bring a set latch back to life.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LatchOverflow`] if the new count would not fit in a `usize`.
    fn add_count(&self, count: usize) -> Result<()> {
        self.try_add_count(count).map(|_| ())
    }

    /// Same as [`add_count()`][Self::add_count] but reports whether the count was raised
    /// (`Ok(false)` if the latch was already set).
    ///
    /// # Errors
    ///
    /// Returns [`Error::LatchOverflow`] if the new count would not fit in a `usize`.
    fn try_add_count(&self, count: usize) -> Result<bool>;

    /// Blocks the calling thread until the latch is set or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the latch was not set in time.
    fn wait(&self, timeout: Timeout) -> Result<()>;

    /// The current count. Zero once the latch is set.
    fn remaining(&self) -> usize;

    /// Whether the latch has been set.
    fn is_set(&self) -> bool;

    /// Time elapsed since the latch was created.
    fn elapsed(&self) -> Duration;
}

/// Selects which [`CountdownLatch`] implementation a parallel operation waits on.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum LatchKind {
    /// [`EventCountdownLatch`]: blocks on an OS-backed event. Suited to long waits.
    #[default]
    Event,

    /// [`SpinCountdownLatch`]: polls with [`SpinWait`]. Suited to short waits.
    Spin,
}

impl LatchKind {
    /// Creates a latch of this kind with the given initial count.
    #[must_use]
    pub fn create(self, count: usize) -> Arc<dyn CountdownLatch> {
        match self {
            Self::Event => Arc::new(EventCountdownLatch::new(count)),
            Self::Spin => Arc::new(SpinCountdownLatch::new(count)),
        }
    }
}

/// Lock-free counter behind both latch implementations.
///
/// The counter reports the transition to zero; the owning latch reacts to it.
#[derive(Debug)]
pub(crate) struct LatchCounter {
    remaining: AtomicUsize,
    created_at: Instant,
}

impl LatchCounter {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            created_at: Instant::now(),
        }
    }

    /// Returns `Ok(true)` if this call brought the count to zero.
    pub(crate) fn decrement(&self, count: usize) -> Result<bool> {
        if count == 0 {
            return Err(Error::invalid_argument(
                "count",
                "a latch must be signaled at least once",
            ));
        }

        let mut spinner = SpinWait::new();

        loop {
            let remaining = self.remaining.load(Ordering::Acquire);

            let Some(new_remaining) = remaining.checked_sub(count) else {
                return Err(Error::LatchUnderflow {
                    requested: count,
                    remaining,
                });
            };

            // Release so that work done before signalling is visible to whoever observes the
            // latch as set; Acquire so that the last signaller sees all earlier signallers' work.
            if self
                .remaining
                .compare_exchange(
                    remaining,
                    new_remaining,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(new_remaining == 0);
            }

            spinner.spin_once();
        }
    }

    /// Returns `Ok(false)` without touching the count if it is already zero.
    pub(crate) fn increment(&self, count: usize) -> Result<bool> {
        let mut spinner = SpinWait::new();

        loop {
            let remaining = self.remaining.load(Ordering::Acquire);

            if remaining == 0 {
                return Ok(false);
            }

            if count == 0 {
                return Ok(true);
            }

            let Some(new_remaining) = remaining.checked_add(count) else {
                return Err(Error::LatchOverflow {
                    remaining,
                    requested: count,
                });
            };

            if self
                .remaining
                .compare_exchange(
                    remaining,
                    new_remaining,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(true);
            }

            spinner.spin_once();
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}
