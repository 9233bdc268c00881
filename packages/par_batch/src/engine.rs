use std::any::type_name;
use std::fmt;
use std::iter::{self, FusedIterator};
use std::num::NonZero;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::{
    AggregatedFailure, BoxError, Error, FailureList, OrderedResultCollector, ParallelOptions,
    PartitionScheduler, Payload, PoolTuning, Result, ThreadPool, WorkItem, WorkerPool,
};

/// Runs a body over every element of a source on a worker pool, with bounded concurrency.
///
/// The source is consumed in partitions of [`ParallelOptions::partition_size()`] elements. All
/// elements of a partition are dispatched to the pool at once, then the calling thread waits
/// until every one of them has completed before taking the next partition. At most one
/// partition is ever in flight, which bounds the number of concurrently running bodies.
///
/// The calling thread is blocked for the duration of the operation and does not execute any
/// bodies itself.
///
/// # Failures
///
/// A body may fail by returning an error or by panicking. Failures do not interrupt the
/// partition they occur in; once the operation is done, every failure is reported together as
/// [`Error::Aggregated`], ordered by the position of the failed element in the source.
///
/// A partition that does not complete in time ends the operation with
/// [`Error::PartitionTimeout`], which takes precedence over failures. Failures collected up to
/// that point are carried inside the timeout error.
///
/// # Example
///
/// ```
/// use par_batch::{ExecutionEngine, ParallelOptions};
///
/// let engine = ExecutionEngine::new();
///
/// let lengths = engine
///     .parallel_for_each_with_result(
///         ["a", "bb", "ccc"],
///         &ParallelOptions::default(),
///         |word: &str| Ok(word.len()),
///     )
///     .unwrap();
///
/// assert_eq!(lengths, [1, 2, 3]);
/// ```
pub struct ExecutionEngine<P = ThreadPool>
where
    P: WorkerPool,
{
    pool: P,
}

impl ExecutionEngine<ThreadPool> {
    /// Creates an engine backed by a [`ThreadPool`] with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool(ThreadPool::new())
    }
}

impl Default for ExecutionEngine<ThreadPool> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ExecutionEngine<P>
where
    P: WorkerPool,
{
    /// Creates an engine that dispatches work to `pool`.
    #[must_use]
    pub fn with_pool(pool: P) -> Self {
        Self { pool }
    }

    /// The pool this engine dispatches work to.
    #[must_use]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Calls `body` for `initial`, `initial + step`, `initial + 2 * step` and so on, for as long
    /// as the index has not reached `bound` (exclusive). A negative `step` counts down. The
    /// sequence also ends if the next index would overflow.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `step` is zero, before any work is scheduled.
    /// Otherwise fails as [`parallel_for_each()`][Self::parallel_for_each] does.
    pub fn parallel_for<F>(
        &self,
        initial: i64,
        bound: i64,
        step: i64,
        options: &ParallelOptions,
        body: F,
    ) -> Result<()>
    where
        F: Fn(i64) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let indexes = IndexSequence::new(initial, bound, step)?;
        self.parallel_for_each(indexes, options, body)
    }

    /// Like [`parallel_for()`][Self::parallel_for] but collects the value returned for each
    /// index, in index order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `step` is zero, before any work is scheduled.
    /// Otherwise fails as [`parallel_for_each_with_result()`][Self::parallel_for_each_with_result]
    /// does.
    pub fn parallel_for_with_result<R, F>(
        &self,
        initial: i64,
        bound: i64,
        step: i64,
        options: &ParallelOptions,
        body: F,
    ) -> Result<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(i64) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
    {
        let indexes = IndexSequence::new(initial, bound, step)?;
        self.parallel_for_each_with_result(indexes, options, body)
    }

    /// Calls `body` for every element of `source` and returns the results in source order,
    /// regardless of the order in which the bodies completed.
    ///
    /// # Errors
    ///
    /// * [`Error::PartitionTimeout`] if a partition does not complete within the configured
    ///   timeout. Bodies already dispatched keep running in the background. Failures collected
    ///   before the timeout are available via [`Error::failures()`].
    /// * [`Error::Aggregated`] if any body returned an error or panicked.
    /// * [`Error::InvalidArgument`] if the worker pool rejects the tuned worker limits.
    pub fn parallel_for_each_with_result<S, R, F>(
        &self,
        source: S,
        options: &ParallelOptions,
        body: F,
    ) -> Result<Vec<R>>
    where
        S: IntoIterator,
        S::Item: Send + 'static,
        R: Send + 'static,
        F: Fn(S::Item) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
    {
        let results = Arc::new(OrderedResultCollector::new());
        self.execute(source, options, body, Some(Arc::clone(&results)))?;
        results.drain()
    }

    /// Calls `body` for every element of `source` for its side effects.
    ///
    /// # Errors
    ///
    /// * [`Error::PartitionTimeout`] if a partition does not complete within the configured
    ///   timeout. Bodies already dispatched keep running in the background. Failures collected
    ///   before the timeout are available via [`Error::failures()`].
    /// * [`Error::Aggregated`] if any body returned an error or panicked.
    /// * [`Error::InvalidArgument`] if the worker pool rejects the tuned worker limits.
    pub fn parallel_for_each<S, F>(&self, source: S, options: &ParallelOptions, body: F) -> Result<()>
    where
        S: IntoIterator,
        S::Item: Send + 'static,
        F: Fn(S::Item) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.execute(source, options, body, None)
    }

    fn execute<S, R, F>(
        &self,
        source: S,
        options: &ParallelOptions,
        body: F,
        results: Option<Arc<OrderedResultCollector<u64, R>>>,
    ) -> Result<()>
    where
        S: IntoIterator,
        S::Item: Send + 'static,
        R: Send + 'static,
        F: Fn(S::Item) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
    {
        let partition_size = options.partition_size();
        let mut scheduler = PartitionScheduler::new(source, partition_size);

        let Some(first) = scheduler.next_partition() else {
            debug!("source is empty; nothing to schedule");
            return Ok(());
        };

        debug!(
            partition_size = partition_size.get(),
            timeout = ?options.timeout(),
            latch_kind = ?options.latch_kind(),
            "parallel operation starting"
        );

        // No partition is longer than the first one, so that is all the workers we can use.
        let _tuning = if options.tune_pool() {
            let workers = NonZero::new(first.len()).unwrap_or(partition_size);
            Some(PoolTuning::raise(&self.pool, workers)?)
        } else {
            None
        };

        let body = Arc::new(body);
        let failures = Arc::new(FailureList::default());
        let mut sorter: u64 = 0;

        let partitions = iter::once(first).chain(iter::from_fn(|| scheduler.next_partition()));

        for partition in partitions {
            let partition_index = partition.index();
            let latch = options.latch_kind().create(partition.len());

            debug!(
                partition = partition_index,
                len = partition.len(),
                "dispatching partition"
            );

            for element in partition {
                let sort_key = sorter;
                sorter = sorter.saturating_add(1);

                let payload: Payload<R> = Box::new({
                    let body = Arc::clone(&body);
                    move || body(element)
                });

                trace!(sort_key, "submitting work item");

                self.pool.submit(
                    WorkItem::new(
                        sort_key,
                        payload,
                        Arc::clone(&latch),
                        results.clone(),
                        Arc::clone(&failures),
                    )
                    .into_job(),
                );
            }

            if let Err(e) = latch.wait(options.timeout()) {
                let prior = failures.take_aggregated();

                warn!(
                    partition = partition_index,
                    remaining = latch.remaining(),
                    failed = prior.as_ref().map_or(0, AggregatedFailure::len),
                    error = %e,
                    "partition did not complete in time"
                );

                return Err(match e {
                    Error::Timeout { waited } => Error::PartitionTimeout {
                        partition: partition_index,
                        waited,
                        failures: prior,
                    },
                    other => other,
                });
            }

            if options.fail_fast() && !failures.is_empty() {
                debug!(
                    partition = partition_index,
                    "partition had failures; not starting further partitions"
                );
                break;
            }
        }

        if let Some(aggregated) = failures.take_aggregated() {
            debug!(
                failed = aggregated.len(),
                submitted = sorter,
                "parallel operation failed"
            );
            return Err(Error::Aggregated(aggregated));
        }

        debug!(
            submitted = sorter,
            partitions = scheduler.partitions_taken(),
            "parallel operation completed"
        );

        Ok(())
    }
}

impl<P> fmt::Debug for ExecutionEngine<P>
where
    P: WorkerPool,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

/// `initial, initial + step, ...` up to but excluding `bound`, stopping early on overflow.
#[derive(Clone, Debug)]
struct IndexSequence {
    next: Option<i64>,
    bound: i64,
    step: i64,
}

impl IndexSequence {
    fn new(initial: i64, bound: i64, step: i64) -> Result<Self> {
        if step == 0 {
            return Err(Error::invalid_argument("step", "step must not be zero"));
        }

        Ok(Self {
            next: Some(initial),
            bound,
            step,
        })
    }
}

impl Iterator for IndexSequence {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let current = self.next?;

        let in_range = if self.step > 0 {
            current < self.bound
        } else {
            current > self.bound
        };

        if !in_range {
            self.next = None;
            return None;
        }

        self.next = current.checked_add(self.step);
        Some(current)
    }
}

impl FusedIterator for IndexSequence {}
