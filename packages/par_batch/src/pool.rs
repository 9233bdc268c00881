//! Worker pool that parallel operations dispatch their work items to.

use std::any::type_name;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle as ThreadJoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::spin_wait::ProcessorFacts;
use crate::{Error, Result};

/// A unit of work submitted to a [`WorkerPool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_THREAD_NAME_PREFIX: &str = "par_batch-worker";
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// The capability to run jobs on some worker thread, eventually.
///
/// [`ExecutionEngine`][crate::ExecutionEngine] only ever submits jobs and, when asked to tune
/// the pool, temporarily adjusts its worker limits. [`ThreadPool`] is the implementation
/// provided by this crate.
#[cfg_attr(test, mockall::automock)]
pub trait WorkerPool: Send + Sync {
    /// Queues `job` for execution on a worker thread.
    fn submit(&self, job: Job);

    /// The current worker limits.
    fn worker_limits(&self) -> WorkerLimits;

    /// Replaces the worker limits.
    ///
    /// # Errors
    ///
    /// Implementations may reject limits they cannot honor with [`Error::InvalidArgument`].
    fn set_worker_limits(&self, limits: WorkerLimits) -> Result<()>;
}

impl<P> WorkerPool for Arc<P>
where
    P: WorkerPool + ?Sized,
{
    fn submit(&self, job: Job) {
        (**self).submit(job);
    }

    fn worker_limits(&self) -> WorkerLimits {
        (**self).worker_limits()
    }

    fn set_worker_limits(&self, limits: WorkerLimits) -> Result<()> {
        (**self).set_worker_limits(limits)
    }
}

/// The minimum number of workers a pool keeps alive and the maximum it may run at once.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WorkerLimits {
    min: usize,
    max: NonZero<usize>,
}

impl WorkerLimits {
    /// Creates worker limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `min` exceeds `max`.
    pub fn new(min: usize, max: NonZero<usize>) -> Result<Self> {
        if min > max.get() {
            return Err(Error::invalid_argument(
                "min",
                format!("minimum worker count {min} exceeds maximum {max}"),
            ));
        }

        Ok(Self { min, max })
    }

    /// Workers kept alive even when idle.
    #[must_use]
    pub fn min(&self) -> usize {
        self.min
    }

    /// Workers allowed to exist at the same time.
    #[must_use]
    pub fn max(&self) -> NonZero<usize> {
        self.max
    }

    /// Limits that keep and allow at least `workers` workers.
    #[must_use]
    pub(crate) fn raised_to(self, workers: NonZero<usize>) -> Self {
        Self {
            min: self.min.max(workers.get()),
            max: self.max.max(workers),
        }
    }
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            min: 0,
            max: ProcessorFacts::current().logical_processor_count,
        }
    }
}

/// Temporarily raised worker limits, restored to their prior value on drop.
///
/// Restoration happens on every exit path of the owning scope: success, early return on error
/// or unwinding.
pub(crate) struct PoolTuning<'p, P>
where
    P: WorkerPool + ?Sized,
{
    pool: &'p P,
    prior: WorkerLimits,
    changed: bool,
}

impl<'p, P> PoolTuning<'p, P>
where
    P: WorkerPool + ?Sized,
{
    pub(crate) fn raise(pool: &'p P, workers: NonZero<usize>) -> Result<Self> {
        let prior = pool.worker_limits();
        let desired = prior.raised_to(workers);
        let changed = desired != prior;

        if changed {
            pool.set_worker_limits(desired)?;
            debug!(?prior, ?desired, "raised worker limits");
        }

        Ok(Self {
            pool,
            prior,
            changed,
        })
    }
}

impl<P> Drop for PoolTuning<'_, P>
where
    P: WorkerPool + ?Sized,
{
    fn drop(&mut self) {
        if !self.changed {
            return;
        }

        match self.pool.set_worker_limits(self.prior) {
            Ok(()) => debug!(prior = ?self.prior, "restored worker limits"),
            Err(e) => error!(prior = ?self.prior, error = %e, "failed to restore worker limits"),
        }
    }
}

impl<P> fmt::Debug for PoolTuning<'_, P>
where
    P: WorkerPool + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("prior", &self.prior)
            .field("changed", &self.changed)
            .finish_non_exhaustive()
    }
}

struct PoolInner {
    // `None` once the pool is shutting down. Dropping the sender disconnects the queue, which
    // tells workers to exit once it is drained.
    sender: RwLock<Option<Sender<Job>>>,
    receiver: Receiver<Job>,

    limits: RwLock<WorkerLimits>,
    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    next_worker_index: AtomicUsize,

    thread_name_prefix: String,
    idle_timeout: Duration,

    worker_handles: Mutex<Vec<ThreadJoinHandle<()>>>,
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("limits", &*self.limits.read())
            .field("live_workers", &self.live_workers.load(Ordering::Relaxed))
            .field("idle_workers", &self.idle_workers.load(Ordering::Relaxed))
            .field("thread_name_prefix", &self.thread_name_prefix)
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    /// Spawns one worker if that would not exceed the maximum and the pool is not shutting
    /// down. Returns whether it did.
    fn try_spawn_worker(self: &Arc<Self>) -> bool {
        let max = self.limits.read().max.get();

        // Held until the handle is registered, so `shut_down()` either sees the new handle or
        // we see that the sender is gone.
        let sender = self.sender.read();

        if sender.is_none() {
            trace!("pool is shutting down; not spawning a worker");
            return false;
        }

        // SeqCst on the worker counters pairs with the counter updates in `worker_loop` so that
        // a submitter and a retiring worker cannot both conclude that the other will run a job.
        let reserved = self
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then(|| live.saturating_add(1))
            })
            .is_ok();

        if !reserved {
            return false;
        }

        let worker_index = self.next_worker_index.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);

        let handle = thread::Builder::new()
            .name(format!("{}-{worker_index}", self.thread_name_prefix))
            .spawn(move || {
                debug!(worker_index, "worker thread started");
                worker_loop(&inner, worker_index);
                debug!(worker_index, "worker thread exiting");
            })
            .expect("failed to spawn worker thread: thread spawning failure is not supported");

        let mut handles = self.worker_handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        drop(handles);
        drop(sender);

        true
    }

    fn ensure_min_workers(self: &Arc<Self>) {
        let min = self.limits.read().min;

        while self.live_workers.load(Ordering::SeqCst) < min {
            if !self.try_spawn_worker() {
                break;
            }
        }
    }

    /// Gives up one worker slot if more than `floor` workers are alive. Returns whether it did.
    fn try_retire(&self, floor: usize) -> bool {
        self.live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > floor).then(|| live.saturating_sub(1))
            })
            .is_ok()
    }

    fn submit(self: &Arc<Self>, job: Job) {
        let queued = {
            let sender = self.sender.read();

            let Some(sender) = sender.as_ref() else {
                warn!("job submitted to a pool that is shutting down; dropping it");
                return;
            };

            if sender.send(job).is_err() {
                // We hold the receiver ourselves, so the queue cannot be disconnected.
                error!("worker queue rejected a job");
                return;
            }

            sender.len()
        };

        if queued > self.idle_workers.load(Ordering::SeqCst) {
            self.try_spawn_worker();
        }
    }

    fn shut_down(&self) {
        // Waits for any in-progress spawn to register its handle. No spawn succeeds afterwards.
        drop(self.sender.write().take());

        let handles = mem::take(&mut *self.worker_handles.lock());

        for handle in handles {
            if let Err(payload) = handle.join() {
                // Workers run every job inside a panic trap and should never panic. If one does,
                // something is very wrong with the pool itself, so we do not swallow it.
                panic::resume_unwind(payload);
            }
        }
    }
}

fn worker_loop(inner: &Arc<PoolInner>, worker_index: usize) {
    loop {
        inner.idle_workers.fetch_add(1, Ordering::SeqCst);
        let received = inner.receiver.recv_timeout(inner.idle_timeout);
        inner.idle_workers.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(job) => {
                run_job(job, worker_index);

                // The maximum may have been lowered while we were busy.
                let max = inner.limits.read().max.get();
                if inner.try_retire(max) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let min = inner.limits.read().min;
                if inner.try_retire(min) {
                    // A job may have been queued just as we gave up our slot, at a moment when
                    // the submitter still counted us as idle.
                    if !inner.receiver.is_empty() {
                        inner.try_spawn_worker();
                    }

                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                inner.live_workers.fetch_sub(1, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn run_job(job: Job, worker_index: usize) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(worker_index, "job panicked; worker continues");
    } else {
        trace!(worker_index, "job completed");
    }
}

/// An elastic pool of worker threads with adjustable [`WorkerLimits`].
///
/// Workers are started on demand when jobs are queued and no worker is idle, up to the maximum,
/// and at least the minimum number of workers is kept alive. Workers above the minimum exit
/// after staying idle for the idle timeout. Lowering the maximum retires surplus workers as they
/// finish their current job.
///
/// # Lifetime
///
/// When the pool is dropped, queued jobs are still executed, then all worker threads exit and
/// the drop blocks until they have.
///
/// # Example
///
/// ```
/// use std::sync::mpsc;
///
/// use par_batch::{ThreadPool, WorkerPool};
///
/// let pool = ThreadPool::new();
/// let (tx, rx) = mpsc::channel();
///
/// pool.submit(Box::new(move || tx.send(42).unwrap()));
///
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
#[derive(Debug)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Creates a pool with default settings: no idle workers are kept and at most as many
    /// workers run as there are processors available to the process.
    ///
    /// Use [`ThreadPool::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the pool.
    #[must_use]
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    /// Number of worker threads currently alive.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::SeqCst)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, job: Job) {
        self.inner.submit(job);
    }

    fn worker_limits(&self) -> WorkerLimits {
        *self.inner.limits.read()
    }

    fn set_worker_limits(&self, limits: WorkerLimits) -> Result<()> {
        *self.inner.limits.write() = limits;
        self.inner.ensure_min_workers();
        Ok(())
    }
}

impl Drop for ThreadPool {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // If the thread is panicking, we are probably in a dirty state and shutting down
            // may make the problem worse by hiding the original panic, so just do nothing.
            return;
        }

        self.inner.shut_down();
    }
}

/// Builder for configuring a [`ThreadPool`].
#[derive(Debug)]
pub struct ThreadPoolBuilder {
    limits: WorkerLimits,
    thread_name_prefix: String,
    idle_timeout: Duration,
}

impl ThreadPoolBuilder {
    fn new() -> Self {
        Self {
            limits: WorkerLimits::default(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Sets the minimum and maximum number of workers.
    ///
    /// Default is no minimum and a maximum equal to the number of processors available to the
    /// process.
    #[must_use]
    pub fn worker_limits(mut self, limits: WorkerLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the prefix of worker thread names. Each worker appends its own index.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets how long a worker above the minimum stays idle before exiting.
    ///
    /// Default is 10 seconds.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Builds the pool, starting the minimum number of workers.
    #[must_use]
    pub fn build(self) -> ThreadPool {
        let (sender, receiver) = channel::unbounded();

        let inner = Arc::new(PoolInner {
            sender: RwLock::new(Some(sender)),
            receiver,
            limits: RwLock::new(self.limits),
            live_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            next_worker_index: AtomicUsize::new(0),
            thread_name_prefix: self.thread_name_prefix,
            idle_timeout: self.idle_timeout,
            worker_handles: Mutex::new(Vec::new()),
        });

        inner.ensure_min_workers();

        ThreadPool { inner }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Barrier;
    use std::sync::mpsc;

    use many_cpus::SystemHardware;
    use new_zealand::nz;
    use static_assertions::assert_impl_all;
    use testing::{ConcurrencyProbe, with_watchdog};

    use super::*;
    use crate::ErrorKind;

    assert_impl_all!(ThreadPool: Send, Sync);

    #[test]
    fn limits_reject_min_above_max() {
        let error = WorkerLimits::new(3, nz!(2)).unwrap_err();

        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn raised_limits_never_lower() {
        let limits = WorkerLimits::new(2, nz!(8)).unwrap();

        assert_eq!(limits.raised_to(nz!(4)), WorkerLimits::new(4, nz!(8)).unwrap());
        assert_eq!(
            limits.raised_to(nz!(16)),
            WorkerLimits::new(16, nz!(16)).unwrap()
        );
        assert_eq!(limits.raised_to(nz!(1)), limits);
    }

    #[cfg_attr(miri, ignore)] // Queries the real hardware.
    #[test]
    fn default_limits_allow_one_worker_per_processor() {
        let limits = WorkerLimits::default();

        assert_eq!(limits.min(), 0);
        assert_eq!(
            limits.max().get(),
            SystemHardware::current().processors().len()
        );
    }

    #[test]
    fn tuning_restores_prior_limits_on_drop() {
        let mut pool = MockWorkerPool::new();
        let prior = WorkerLimits::new(0, nz!(2)).unwrap();
        let raised = WorkerLimits::new(4, nz!(4)).unwrap();

        pool.expect_worker_limits().times(1).return_const(prior);
        pool.expect_set_worker_limits()
            .withf(move |limits| *limits == raised)
            .times(1)
            .returning(|_| Ok(()));
        pool.expect_set_worker_limits()
            .withf(move |limits| *limits == prior)
            .times(1)
            .returning(|_| Ok(()));

        let tuning = PoolTuning::raise(&pool, nz!(4)).unwrap();
        drop(tuning);
    }

    #[test]
    fn tuning_leaves_sufficient_limits_alone() {
        let mut pool = MockWorkerPool::new();
        let prior = WorkerLimits::new(8, nz!(8)).unwrap();

        pool.expect_worker_limits().times(1).return_const(prior);
        pool.expect_set_worker_limits().never();

        let tuning = PoolTuning::raise(&pool, nz!(4)).unwrap();
        drop(tuning);
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for real worker threads.
    #[test]
    fn runs_submitted_jobs() {
        with_watchdog(|| {
            let pool = ThreadPool::new();
            let (tx, rx) = mpsc::channel();

            for i in 0..10 {
                let tx = tx.clone();
                pool.submit(Box::new(move || tx.send(i).unwrap()));
            }

            let mut received = rx.iter().take(10).collect::<Vec<_>>();
            received.sort_unstable();

            assert_eq!(received, (0..10).collect::<Vec<_>>());
        });
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for real worker threads.
    #[test]
    fn never_exceeds_max_workers() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .worker_limits(WorkerLimits::new(0, nz!(2)).unwrap())
                .build();

            let probe = ConcurrencyProbe::new();
            let (tx, rx) = mpsc::channel();

            for _ in 0..8 {
                let probe = probe.clone();
                let tx = tx.clone();

                pool.submit(Box::new(move || {
                    {
                        let _inside = probe.enter();
                        thread::sleep(Duration::from_millis(5));
                    }
                    tx.send(()).unwrap();
                }));
            }

            rx.iter().take(8).for_each(drop);

            assert_eq!(probe.entered(), 8);
            assert!(probe.peak() <= 2);
            assert!(pool.live_workers() <= 2);
        });
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for real worker threads.
    #[test]
    fn min_workers_start_eagerly() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .worker_limits(WorkerLimits::new(3, nz!(4)).unwrap())
                .build();

            assert_eq!(pool.live_workers(), 3);

            pool.set_worker_limits(WorkerLimits::new(4, nz!(4)).unwrap())
                .unwrap();
            assert_eq!(pool.live_workers(), 4);
        });
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for real worker threads.
    #[test]
    fn idle_workers_above_min_retire() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .worker_limits(WorkerLimits::new(0, nz!(2)).unwrap())
                .idle_timeout(Duration::from_millis(20))
                .build();

            let (tx, rx) = mpsc::channel();
            pool.submit(Box::new(move || tx.send(()).unwrap()));
            rx.recv().unwrap();

            while pool.live_workers() > 0 {
                thread::sleep(Duration::from_millis(5));
            }
        });
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for real worker threads.
    #[test]
    fn panicking_job_does_not_kill_pool() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .worker_limits(WorkerLimits::new(1, nz!(1)).unwrap())
                .build();

            pool.submit(Box::new(|| panic!("job failure")));

            let (tx, rx) = mpsc::channel();
            pool.submit(Box::new(move || tx.send(7).unwrap()));

            assert_eq!(rx.recv().unwrap(), 7);
            assert_eq!(pool.live_workers(), 1);
        });
    }

    #[cfg_attr(miri, ignore)] // Miri is too slow for real worker threads.
    #[test]
    fn drop_runs_queued_jobs() {
        with_watchdog(|| {
            let pool = ThreadPool::builder()
                .worker_limits(WorkerLimits::new(1, nz!(1)).unwrap())
                .build();

            let gate = Arc::new(Barrier::new(2));
            let completed = Arc::new(AtomicUsize::new(0));

            pool.submit(Box::new({
                let gate = Arc::clone(&gate);
                move || {
                    gate.wait();
                }
            }));

            for _ in 0..3 {
                let completed = Arc::clone(&completed);
                pool.submit(Box::new(move || {
                    completed.fetch_add(1, Ordering::SeqCst);
                }));
            }

            gate.wait();
            drop(pool);

            assert_eq!(completed.load(Ordering::SeqCst), 3);
        });
    }

    #[test]
    fn no_workers_spawn_after_shutdown() {
        let pool = ThreadPool::builder()
            .worker_limits(WorkerLimits::new(0, nz!(2)).unwrap())
            .build();

        pool.inner.shut_down();

        assert!(!pool.inner.try_spawn_worker());

        // Raising the minimum would normally start workers eagerly.
        pool.set_worker_limits(WorkerLimits::new(2, nz!(2)).unwrap())
            .unwrap();

        assert_eq!(pool.live_workers(), 0);
        assert!(pool.inner.worker_handles.lock().is_empty());
    }

    #[test]
    fn shared_pool_is_a_pool() {
        let mut pool = MockWorkerPool::new();
        pool.expect_submit().times(1).returning(|job| job());

        let shared = Arc::new(pool);
        let (tx, rx) = mpsc::channel();
        shared.submit(Box::new(move || tx.send(1).unwrap()));

        assert_eq!(rx.recv().unwrap(), 1);
    }
}
