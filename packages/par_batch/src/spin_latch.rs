use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::trace;

use crate::{CountdownLatch, Error, LatchCounter, Result, SpinWait, Timeout};

/// A [`CountdownLatch`] whose waiters poll a flag with [`SpinWait`] instead of blocking on an
/// OS object.
///
/// No kernel object is created, so this variant is cheap to construct and fast to release. It
/// suits waits that are expected to be short, such as a counter that keeps receiving
/// [`add_count()`][CountdownLatch::add_count] registrations up to the moment it drains. Long
/// waits burn CPU until the spin strategy degrades to sleeping.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use par_batch::{CountdownLatch, SpinCountdownLatch, Timeout};
///
/// let latch = SpinCountdownLatch::new(1);
/// latch.add_count(1).unwrap();
///
/// latch.signal_many(2).unwrap();
/// latch.wait(Timeout::After(Duration::from_secs(1))).unwrap();
/// ```
#[derive(Debug)]
pub struct SpinCountdownLatch {
    counter: LatchCounter,
    is_set: AtomicBool,
}

impl SpinCountdownLatch {
    /// Creates a latch with the given initial count. A count of zero creates a set latch.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            counter: LatchCounter::new(count),
            is_set: AtomicBool::new(count == 0),
        }
    }

    fn on_set(&self) {
        trace!(elapsed = ?self.counter.elapsed(), "spin latch set");

        // Release pairs with the Acquire in `is_set()` so waiters see everything the
        // signallers did before signalling.
        self.is_set.store(true, Ordering::Release);
    }
}

impl CountdownLatch for SpinCountdownLatch {
    fn signal_many(&self, count: usize) -> Result<bool> {
        let released = self.counter.decrement(count)?;

        if released {
            self.on_set();
        }

        Ok(released)
    }

    fn try_add_count(&self, count: usize) -> Result<bool> {
        self.counter.increment(count)
    }

    fn wait(&self, timeout: Timeout) -> Result<()> {
        if self.is_set() {
            return Ok(());
        }

        let started = self.counter.elapsed();

        if SpinWait::spin_until(|| self.is_set(), timeout) {
            return Ok(());
        }

        // The flag may have flipped between the last poll and the budget running out.
        if self.is_set() {
            return Ok(());
        }

        Err(Error::Timeout {
            waited: self.counter.elapsed().saturating_sub(started),
        })
    }

    fn remaining(&self) -> usize {
        self.counter.remaining()
    }

    fn is_set(&self) -> bool {
        self.is_set.load(Ordering::Acquire)
    }

    fn elapsed(&self) -> Duration {
        self.counter.elapsed()
    }
}
