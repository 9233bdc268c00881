//! The smallest unit of work handed to a worker.

use std::any::type_name;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::error;

use crate::{
    BoxError, CountdownLatch, FailureList, Job, OrderedResultCollector, PanicError, WorkFailure,
};

pub(crate) type Payload<R> = Box<dyn FnOnce() -> Result<R, BoxError> + Send + 'static>;

/// A callable together with everything it must report to when it finishes.
///
/// The work item owns direct handles to the latch, result collector and failure list of the
/// operation that created it. Whatever the callable does (return a value, return an error or
/// panic), the latch is signalled exactly once afterwards.
pub(crate) struct WorkItem<R> {
    sort_key: u64,
    payload: Payload<R>,
    latch: Arc<dyn CountdownLatch>,
    results: Option<Arc<OrderedResultCollector<u64, R>>>,
    failures: Arc<FailureList>,
}

impl<R> WorkItem<R>
where
    R: Send + 'static,
{
    pub(crate) fn new(
        sort_key: u64,
        payload: Payload<R>,
        latch: Arc<dyn CountdownLatch>,
        results: Option<Arc<OrderedResultCollector<u64, R>>>,
        failures: Arc<FailureList>,
    ) -> Self {
        Self {
            sort_key,
            payload,
            latch,
            results,
            failures,
        }
    }

    pub(crate) fn run(self) {
        let Self {
            sort_key,
            payload,
            latch,
            results,
            failures,
        } = self;

        // Runs on every exit path, including a panic escaping the bookkeeping below.
        let _signal_on_exit = scopeguard::guard(latch, move |latch| {
            if let Err(e) = latch.signal() {
                // Nobody to return this to from a worker thread. The orchestrator will observe
                // the consequences (a latch that never sets or sets early).
                error!(sort_key, error = %e, "work item failed to signal its latch");
            }
        });

        match panic::catch_unwind(AssertUnwindSafe(payload)) {
            Ok(Ok(value)) => {
                if let Some(results) = results {
                    if let Err(e) = results.insert(sort_key, value) {
                        failures.push(WorkFailure::new(sort_key, Box::new(e)));
                    }
                }
            }
            Ok(Err(cause)) => {
                failures.push(WorkFailure::new(sort_key, cause));
            }
            Err(panic_payload) => {
                failures.push(WorkFailure::new(
                    sort_key,
                    Box::new(PanicError::from_payload(&*panic_payload)),
                ));
            }
        }
    }

    pub(crate) fn into_job(self) -> Job {
        Box::new(move || self.run())
    }
}

impl<R> fmt::Debug for WorkItem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("sort_key", &self.sort_key)
            .field("latch", &self.latch)
            .field("collects_result", &self.results.is_some())
            .finish_non_exhaustive()
    }
}
