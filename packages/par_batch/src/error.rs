use std::time::Duration;

use thiserror::Error;

use crate::AggregatedFailure;

/// A type-erased error produced by a work item body.
///
/// Any error type that converts into this may be returned from a body passed to
/// [`ExecutionEngine`][crate::ExecutionEngine].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when using the primitives and the execution engine in this crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument was rejected before any work was scheduled.
    #[error("invalid argument '{argument}': {problem}")]
    InvalidArgument {
        /// Name of the rejected argument.
        argument: &'static str,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// A countdown latch was asked to decrement below zero.
    #[error("invalid attempt to decrement latch by {requested} when only {remaining} remain")]
    LatchUnderflow {
        /// The amount the caller attempted to subtract.
        requested: usize,

        /// The count the latch held at the time of the attempt.
        remaining: usize,
    },

    /// Raising the count of a countdown latch would overflow its counter.
    #[error("adding {requested} to latch count {remaining} would overflow")]
    LatchOverflow {
        /// The count the latch held at the time of the attempt.
        remaining: usize,

        /// The amount the caller attempted to add.
        requested: usize,
    },

    /// A result was inserted into an ordered collector under a key that is already present.
    #[error("a result with sort key {key} was already collected")]
    DuplicateKey {
        /// Debug representation of the duplicate key.
        key: String,
    },

    /// An ordered collector was used after its results were drained.
    #[error("the collector has already been drained")]
    CollectorDrained,

    /// A wait exceeded its time budget.
    #[error("wait timed out after {waited:?}")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// A partition of a parallel operation did not complete within its time budget.
    ///
    /// Work items that had already failed when the wait gave up are not lost: they are carried
    /// in `failures` and exposed as the error source.
    #[error("partition {partition} did not complete within {waited:?}")]
    PartitionTimeout {
        /// Zero-based index of the partition that did not complete.
        partition: usize,

        /// How long the orchestrating thread waited for the partition.
        waited: Duration,

        /// Failures collected before the wait gave up, if any.
        #[source]
        failures: Option<AggregatedFailure>,
    },

    /// One or more work items failed.
    #[error(transparent)]
    Aggregated(#[from] AggregatedFailure),
}

/// Broad classification of an [`Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Input rejected before any work was scheduled.
    InvalidArgument,

    /// A primitive was misused. This indicates a defect in the caller, not a transient condition.
    InvalidOperation,

    /// A wait exceeded its budget. The work may still be running.
    Timeout,

    /// One or more work items failed.
    Aggregated,
}

impl Error {
    /// Returns the broad classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::LatchUnderflow { .. }
            | Self::LatchOverflow { .. }
            | Self::DuplicateKey { .. }
            | Self::CollectorDrained => ErrorKind::InvalidOperation,
            Self::Timeout { .. } | Self::PartitionTimeout { .. } => ErrorKind::Timeout,
            Self::Aggregated(_) => ErrorKind::Aggregated,
        }
    }

    /// Work item failures carried by this error, ordered by sort key.
    ///
    /// Present for [`Error::Aggregated`] and for an [`Error::PartitionTimeout`] that was
    /// preceded by failures.
    #[must_use]
    pub fn failures(&self) -> Option<&AggregatedFailure> {
        match self {
            Self::Aggregated(aggregated) => Some(aggregated),
            Self::PartitionTimeout { failures, .. } => failures.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn invalid_argument(argument: &'static str, problem: impl Into<String>) -> Self {
        Self::InvalidArgument {
            argument,
            problem: problem.into(),
        }
    }
}

/// A specialized `Result` type for operations in this crate, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
