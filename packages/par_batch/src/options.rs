use std::num::NonZero;

use new_zealand::nz;

use crate::{DEFAULT_TIMEOUT, LatchKind, Timeout};

/// Default maximum number of work items in flight at the same time.
pub const DEFAULT_PARTITION_SIZE: NonZero<usize> = nz!(64);

/// Configuration of a single parallel operation.
///
/// Every setting has a default; override only what you need:
///
/// ```
/// use std::time::Duration;
///
/// use new_zealand::nz;
/// use par_batch::{LatchKind, ParallelOptions};
///
/// let options = ParallelOptions::new()
///     .with_partition_size(nz!(8))
///     .with_timeout(Duration::from_secs(5))
///     .with_latch_kind(LatchKind::Spin);
///
/// assert_eq!(options.partition_size().get(), 8);
/// ```
#[derive(Clone, Debug)]
pub struct ParallelOptions {
    partition_size: NonZero<usize>,
    timeout: Timeout,
    latch_kind: LatchKind,
    tune_pool: bool,
    fail_fast: bool,
}

impl ParallelOptions {
    /// Creates options with all defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            partition_size: DEFAULT_PARTITION_SIZE,
            timeout: DEFAULT_TIMEOUT,
            latch_kind: LatchKind::default(),
            tune_pool: true,
            fail_fast: false,
        }
    }

    /// Sets the maximum number of work items in flight at the same time. The source is consumed
    /// in partitions of this many elements and a partition must fully complete before the next
    /// one starts.
    ///
    /// Default is [`DEFAULT_PARTITION_SIZE`].
    #[must_use]
    pub fn with_partition_size(mut self, partition_size: NonZero<usize>) -> Self {
        self.partition_size = partition_size;
        self
    }

    /// Sets how long to wait for each partition to complete. Every partition gets the full
    /// budget afresh.
    ///
    /// Default is [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Sets how the orchestrating thread waits for a partition to complete.
    ///
    /// Default is [`LatchKind::Event`].
    #[must_use]
    pub fn with_latch_kind(mut self, latch_kind: LatchKind) -> Self {
        self.latch_kind = latch_kind;
        self
    }

    /// Sets whether the worker pool limits are temporarily raised so that a whole partition can
    /// run at once. Prior limits are restored when the operation ends.
    ///
    /// Default is `true`.
    #[must_use]
    pub fn with_tune_pool(mut self, tune_pool: bool) -> Self {
        self.tune_pool = tune_pool;
        self
    }

    /// Sets whether the operation stops starting new partitions once a partition had failures.
    ///
    /// Default is `false`: every partition runs and all failures are reported together.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// The configured partition size.
    #[must_use]
    pub fn partition_size(&self) -> NonZero<usize> {
        self.partition_size
    }

    /// The configured per-partition timeout.
    #[must_use]
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// The configured latch kind.
    #[must_use]
    pub fn latch_kind(&self) -> LatchKind {
        self.latch_kind
    }

    /// Whether pool tuning is enabled.
    #[must_use]
    pub fn tune_pool(&self) -> bool {
        self.tune_pool
    }

    /// Whether fail-fast is enabled.
    #[must_use]
    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::new()
    }
}
