//! Collecting failures from concurrent workers into one reportable error.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::mem;

use parking_lot::Mutex;
use thiserror::Error;

use crate::BoxError;

/// The failure of a single work item.
#[derive(Debug)]
pub struct WorkFailure {
    sort_key: u64,
    cause: BoxError,
}

impl WorkFailure {
    pub(crate) fn new(sort_key: u64, cause: BoxError) -> Self {
        Self { sort_key, cause }
    }

    /// The submission position of the failed work item, counted from zero across the whole
    /// operation.
    #[must_use]
    pub fn sort_key(&self) -> u64 {
        self.sort_key
    }

    /// The error returned (or the panic raised) by the work item.
    #[must_use]
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.cause
    }

    /// Takes ownership of the underlying error.
    #[must_use]
    pub fn into_cause(self) -> BoxError {
        self.cause
    }
}

/// A work item panicked instead of returning.
#[derive(Debug, Error)]
#[error("work item panicked: {message}")]
pub struct PanicError {
    message: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());

        Self { message }
    }

    /// The panic message, if the payload was a string.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One or more work items of a parallel operation failed.
///
/// Every failure is kept, ordered by the sort key of the work item that produced it, so that no
/// concurrent failure is lost to whichever happened to be reported first.
#[derive(Debug)]
pub struct AggregatedFailure {
    causes: Vec<WorkFailure>,
}

impl AggregatedFailure {
    pub(crate) fn new(mut causes: Vec<WorkFailure>) -> Self {
        causes.sort_by_key(WorkFailure::sort_key);
        Self { causes }
    }

    /// All failures, in submission order.
    #[must_use]
    pub fn causes(&self) -> &[WorkFailure] {
        &self.causes
    }

    /// Number of failed work items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.causes.len()
    }

    /// Always `false` for an aggregated failure returned by this crate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.causes.is_empty()
    }

    /// Takes ownership of all failures.
    #[must_use]
    pub fn into_causes(self) -> Vec<WorkFailure> {
        self.causes
    }
}

impl fmt::Display for AggregatedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} work item(s) failed", self.causes.len())?;

        if let Some(first) = self.causes.first() {
            write!(f, "; first failure at item {}: {}", first.sort_key, first.cause)?;
        }

        Ok(())
    }
}

impl StdError for AggregatedFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.causes
            .first()
            .map(|failure| &*failure.cause as &(dyn StdError + 'static))
    }
}

/// Failures pushed by worker threads while a parallel operation runs.
#[derive(Debug, Default)]
pub(crate) struct FailureList {
    failures: Mutex<Vec<WorkFailure>>,
}

impl FailureList {
    pub(crate) fn push(&self, failure: WorkFailure) {
        self.failures.lock().push(failure);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.failures.lock().is_empty()
    }

    /// Takes everything collected so far, or `None` if nothing failed.
    pub(crate) fn take_aggregated(&self) -> Option<AggregatedFailure> {
        let failures = mem::take(&mut *self.failures.lock());

        if failures.is_empty() {
            None
        } else {
            Some(AggregatedFailure::new(failures))
        }
    }
}
