use std::any::type_name;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rsevents::{Awaitable, EventState, ManualResetEvent};
use tracing::trace;

use crate::{CountdownLatch, Error, LatchCounter, Result, Timeout};

/// A [`CountdownLatch`] whose waiters block on an OS-backed manual-reset event.
///
/// Blocked waiters consume no CPU, which makes this the right choice when waits are expected
/// to last long or when many threads wait at once.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use par_batch::{CountdownLatch, EventCountdownLatch, Timeout};
///
/// let latch = Arc::new(EventCountdownLatch::new(2));
///
/// for _ in 0..2 {
///     let latch = Arc::clone(&latch);
///     thread::spawn(move || {
///         latch.signal().unwrap();
///     });
/// }
///
/// latch.wait(Timeout::Infinite).unwrap();
/// assert!(latch.is_set());
/// ```
pub struct EventCountdownLatch {
    counter: LatchCounter,
    event: ManualResetEvent,

    // Only becomes true after the event is set, so a caller that sees it can wait without
    // blocking.
    is_set: AtomicBool,
}

impl fmt::Debug for EventCountdownLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("counter", &self.counter)
            .field("is_set", &self.is_set.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventCountdownLatch {
    /// Creates a latch with the given initial count. A count of zero creates a set latch.
    #[must_use]
    pub fn new(count: usize) -> Self {
        let initial_state = if count == 0 {
            EventState::Set
        } else {
            EventState::Unset
        };

        Self {
            counter: LatchCounter::new(count),
            event: ManualResetEvent::new(initial_state),
            is_set: AtomicBool::new(count == 0),
        }
    }

    fn on_set(&self) {
        trace!(elapsed = ?self.counter.elapsed(), "event latch set");
        self.event.set();
        self.is_set.store(true, Ordering::Release);
    }
}

impl CountdownLatch for EventCountdownLatch {
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
        match timeout.as_duration() {
            None => {
                self.event.wait();
                Ok(())
            }
            Some(limit) => {
                if self.event.wait_for(limit) {
                    Ok(())
                } else {
                    Err(Error::Timeout { waited: limit })
                }
            }
        }
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
