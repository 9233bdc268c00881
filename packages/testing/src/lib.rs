#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing, benchmarks and examples of `par_batch`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// The test body runs on a separate thread. If it does not complete within the timeout, the
/// calling test panics instead of hanging the test run. Panics in the body are propagated.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test body is executed directly, so that mutation testing can detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {timeout:?} timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Runs `f` and returns its result together with how long it took.
pub fn timed<F, R>(f: F) -> (R, Duration)
where
    F: FnOnce() -> R,
{
    let started = Instant::now();
    let result = f();
    (result, started.elapsed())
}

/// Asserts that a blocking wait lasted at least `expected` and did not overshoot it wildly.
///
/// The upper bound is generous because CI machines are noisy; it exists to catch waits that
/// ignore their timeout entirely, not to measure scheduler precision.
///
/// # Panics
///
/// Panics if `elapsed` is below `expected` or above `expected` plus two seconds.
pub fn assert_waited(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected,
        "waited {elapsed:?}, expected at least {expected:?}"
    );

    let ceiling = expected.saturating_add(Duration::from_secs(2));
    assert!(
        elapsed <= ceiling,
        "waited {elapsed:?}, expected at most {ceiling:?}"
    );
}

/// Tracks how many callers are inside some region at the same time, and the peak of that.
///
/// Cloning a probe yields another handle to the same counters, so it can be moved into the
/// bodies of parallel work.
///
/// # Example
///
/// ```rust
/// use testing::ConcurrencyProbe;
///
/// let probe = ConcurrencyProbe::new();
///
/// {
///     let _outer = probe.enter();
///     let _inner = probe.enter();
/// }
///
/// assert_eq!(probe.peak(), 2);
/// assert_eq!(probe.current(), 0);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    counters: Arc<ProbeCounters>,
}

#[derive(Debug, Default)]
struct ProbeCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
    entered: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the caller as inside the region until the returned guard is dropped.
    #[must_use]
    pub fn enter(&self) -> ProbeGuard<'_> {
        let now = self
            .counters
            .current
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1);

        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        self.counters.entered.fetch_add(1, Ordering::SeqCst);

        ProbeGuard { probe: self }
    }

    /// Callers inside the region right now.
    #[must_use]
    pub fn current(&self) -> usize {
        self.counters.current.load(Ordering::SeqCst)
    }

    /// The largest number of callers ever inside the region at the same time.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Total number of times the region was entered.
    #[must_use]
    pub fn entered(&self) -> usize {
        self.counters.entered.load(Ordering::SeqCst)
    }
}

/// Keeps a caller counted as inside a [`ConcurrencyProbe`] region while alive.
#[derive(Debug)]
pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_returns_result() {
        assert_eq!(with_watchdog(|| 42), 42);
    }

    #[test]
    #[should_panic]
    fn watchdog_propagates_panic() {
        with_watchdog(|| panic!("inner failure"));
    }

    #[test]
    fn timed_measures_sleep() {
        let ((), elapsed) = timed(|| thread::sleep(Duration::from_millis(5)));

        assert_waited(elapsed, Duration::from_millis(5));
    }

    #[test]
    #[should_panic]
    fn short_wait_is_rejected() {
        assert_waited(Duration::from_millis(1), Duration::from_millis(50));
    }

    #[test]
    fn probe_tracks_peak_across_threads() {
        let probe = ConcurrencyProbe::new();
        let barrier = Arc::new(std::sync::Barrier::new(3));

        let handles = (0..3)
            .map(|_| {
                let probe = probe.clone();
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    let _guard = probe.enter();
                    barrier.wait();
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(probe.peak(), 3);
        assert_eq!(probe.current(), 0);
        assert_eq!(probe.entered(), 3);
    }
}
