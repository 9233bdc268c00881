//! Adaptive busy-waiting that degrades from CPU spinning to yielding and sleeping.

use std::hint;
use std::num::NonZero;
use std::sync::LazyLock;
use std::thread;
use std::time::{Duration, Instant};

use many_cpus::SystemHardware;
use new_zealand::nz;

use crate::Timeout;

/// Upper bound on the number of pure-spin steps, regardless of processor count.
///
/// This also bounds the shift in the spin iteration count so it cannot overflow.
const MAX_SPIN_STEPS: u32 = 10;

/// Once spinning has given way to scheduler cooperation, every this-many-th step sleeps.
const SLEEP_EVERY: u32 = 20;

/// Once spinning has given way to scheduler cooperation, every this-many-th step (that is not
/// a sleep step) yields. The remaining steps give up the time slice with a zero-length sleep.
const YIELD_EVERY: u32 = 5;

const SLEEP_DURATION: Duration = Duration::from_millis(1);

static PROCESSORS: LazyLock<ProcessorFacts> = LazyLock::new(ProcessorFacts::detect);

/// Processor facts that the backoff staircase is derived from. Fixed for the life of the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ProcessorFacts {
    pub(crate) core_count: NonZero<usize>,
    pub(crate) logical_processor_count: NonZero<usize>,
}

impl ProcessorFacts {
    /// The facts for the processors this process is allowed to run on.
    pub(crate) fn current() -> Self {
        *PROCESSORS
    }

    #[cfg_attr(test, mutants::skip)] // Depends on the machine the tests run on.
    fn detect() -> Self {
        // The processor set honors affinity and resource quotas, so it is the number of
        // processors we can actually keep busy at the same time.
        let processors = SystemHardware::current().processors();
        let available = NonZero::new(processors.len()).unwrap_or(nz!(1));

        Self {
            core_count: available,
            logical_processor_count: available,
        }
    }

    fn is_single_processor(self) -> bool {
        self.logical_processor_count.get() == 1
    }

    fn spin_threshold(self) -> u32 {
        u32::try_from(self.logical_processor_count.get())
            .unwrap_or(u32::MAX)
            .min(MAX_SPIN_STEPS)
    }
}

/// One step of the backoff staircase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SpinAction {
    /// Burn this many iterations of the processor's spin-loop hint.
    Spin(usize),

    /// Let the OS scheduler run something else, without sleeping.
    Yield,

    /// Give up the rest of the time slice via a zero-length sleep.
    SleepZero,

    /// Sleep for a short fixed duration.
    Sleep,
}

/// Adaptive spin-wait strategy for lock-free retry loops and condition polling.
///
/// Each call to [`spin_once()`][Self::spin_once] performs one wait action and advances the
/// internal counter. The first steps busy-spin for an exponentially growing number of
/// iterations, which keeps latency low when the awaited condition is about to become true.
/// Beyond a threshold derived from the processor count (or immediately on single-processor
/// machines) the strategy cooperates with the OS scheduler instead: most steps give up the
/// time slice with a zero-length sleep, every 5th step yields and every 20th step sleeps for a
/// millisecond.
///
/// A `SpinWait` is owned by a single call stack and is not meant to be shared.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// use par_batch::SpinWait;
///
/// let ready = AtomicBool::new(true);
/// let mut spinner = SpinWait::new();
///
/// while !ready.load(Ordering::Acquire) {
///     spinner.spin_once();
/// }
/// ```
#[derive(Debug)]
pub struct SpinWait {
    count: u32,
    processors: ProcessorFacts,
}

impl SpinWait {
    /// Creates a spin-wait strategy at the start of its staircase.
    #[must_use]
    pub fn new() -> Self {
        Self::with_processors(ProcessorFacts::current())
    }

    pub(crate) fn with_processors(processors: ProcessorFacts) -> Self {
        Self {
            count: 0,
            processors,
        }
    }

    /// Number of steps taken since creation or the last [`reset()`][Self::reset].
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the next call to [`spin_once()`][Self::spin_once] will defer to the OS
    /// scheduler rather than busy-spin.
    #[must_use]
    pub fn next_will_yield(&self) -> bool {
        self.processors.is_single_processor() || self.count > self.processors.spin_threshold()
    }

    /// Performs exactly one wait action and advances to the next step.
    pub fn spin_once(&mut self) {
        match self.next_action() {
            SpinAction::Spin(iterations) => {
                for _ in 0..iterations {
                    hint::spin_loop();
                }
            }
            SpinAction::Yield => thread::yield_now(),
            SpinAction::SleepZero => thread::sleep(Duration::ZERO),
            SpinAction::Sleep => thread::sleep(SLEEP_DURATION),
        }

        self.count = self.count.saturating_add(1);
    }

    /// Returns to the start of the staircase.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Repeatedly evaluates `predicate`, spinning between evaluations, until it returns `true`
    /// or `timeout` elapses.
    ///
    /// Returns `true` if the predicate was satisfied. A zero timeout returns `false` without
    /// evaluating the predicate at all.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use par_batch::{SpinWait, Timeout};
    ///
    /// let satisfied = SpinWait::spin_until(|| false, Timeout::After(Duration::from_millis(5)));
    /// assert!(!satisfied);
    /// ```
    pub fn spin_until(mut predicate: impl FnMut() -> bool, timeout: Timeout) -> bool {
        if timeout.is_zero() {
            return false;
        }

        let started = Instant::now();
        let mut spinner = Self::new();

        loop {
            if predicate() {
                return true;
            }

            if timeout.is_exceeded_by(started.elapsed()) {
                return false;
            }

            spinner.spin_once();
        }
    }

    pub(crate) fn next_action(&self) -> SpinAction {
        if !self.next_will_yield() {
            // The threshold caps `count` at MAX_SPIN_STEPS, so the shift stays small.
            let iterations = self
                .processors
                .core_count
                .get()
                .checked_shl(self.count)
                .unwrap_or(usize::MAX);

            return SpinAction::Spin(iterations);
        }

        let step = if self.processors.is_single_processor() {
            self.count
        } else {
            self.count
                .saturating_sub(self.processors.spin_threshold())
                .saturating_sub(1)
        };

        if step % SLEEP_EVERY == SLEEP_EVERY - 1 {
            SpinAction::Sleep
        } else if step % YIELD_EVERY == YIELD_EVERY - 1 {
            SpinAction::Yield
        } else {
            SpinAction::SleepZero
        }
    }
}

impl Default for SpinWait {
    fn default() -> Self {
        Self::new()
    }
}
