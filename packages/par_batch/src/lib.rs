#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Bounded-concurrency parallel loops over arbitrary sources, with ordered results.
//!
//! This crate runs a body over every element of a source (an iterator, a range of indexes) on a
//! pool of worker threads, while never keeping more than a configured number of work items in
//! flight. The source is split into partitions and each partition must complete before the next
//! one is dispatched, so sources of any length, including lazily produced ones, can be processed
//! without flooding the pool.
//!
//! # Quick start
//!
//! ```rust
//! use new_zealand::nz;
//! use par_batch::{ExecutionEngine, ParallelOptions};
//!
//! let engine = ExecutionEngine::new();
//! let options = ParallelOptions::new().with_partition_size(nz!(4));
//!
//! let squares = engine
//!     .parallel_for_with_result(0, 10, 1, &options, |i| Ok(i * i))
//!     .unwrap();
//!
//! assert_eq!(squares, [0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
//! ```
//!
//! # Key features
//!
//! - **Bounded concurrency**: at most [`ParallelOptions::partition_size()`] bodies run at once.
//! - **Ordered results**: results come back in source order, whatever order the bodies finished
//!   in.
//! - **Complete failure reporting**: errors and panics from bodies are collected into one
//!   [`AggregatedFailure`] instead of only the first one being reported.
//! - **Choice of waiting strategy**: the orchestrating thread waits for each partition either on
//!   an OS event or by adaptive spinning ([`LatchKind`]).
//!
//! # Building blocks
//!
//! The synchronization primitives the engine is made of are public and usable on their own:
//! [`CountdownLatch`] with its [`EventCountdownLatch`] and [`SpinCountdownLatch`]
//! implementations, the adaptive [`SpinWait`] backoff, [`PartitionScheduler`] and
//! [`OrderedResultCollector`].
//!
//! # Worker pools
//!
//! By default the engine owns a [`ThreadPool`]. Any type implementing [`WorkerPool`] can be used
//! instead via [`ExecutionEngine::with_pool()`].

mod collector;
mod countdown_latch;
mod engine;
mod error;
mod event_latch;
mod failure;
mod options;
mod partition;
mod pool;
mod spin_latch;
mod spin_wait;
mod timeout;
mod work_item;

pub use collector::*;
pub(crate) use countdown_latch::LatchCounter;
pub use countdown_latch::{CountdownLatch, LatchKind};
pub use engine::*;
pub(crate) use error::Result;
pub use error::{BoxError, Error, ErrorKind};
pub use event_latch::*;
pub(crate) use failure::FailureList;
pub use failure::{AggregatedFailure, PanicError, WorkFailure};
pub use options::*;
pub use partition::*;
pub(crate) use pool::PoolTuning;
pub use pool::*;
pub use spin_latch::*;
pub use spin_wait::*;
pub use timeout::*;
pub(crate) use work_item::{Payload, WorkItem};
