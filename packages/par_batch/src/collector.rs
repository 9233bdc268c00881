//! Reassembling concurrently produced results into submission order.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::mem;

use parking_lot::Mutex;

use crate::{Error, Result};

/// A thread-safe sorted map from a submission key to a result.
///
/// Any number of worker threads may [`insert()`][Self::insert] concurrently. Once all expected
/// inserts have happened (typically established by waiting on a
/// [`CountdownLatch`][crate::CountdownLatch]), the owner calls [`drain()`][Self::drain] exactly
/// once to obtain the values in ascending key order. When keys are assigned from a strictly
/// increasing submission counter, this restores input order no matter in which order the
/// workers finished.
///
/// # Example
///
/// ```
/// use par_batch::OrderedResultCollector;
///
/// let collector = OrderedResultCollector::new();
///
/// collector.insert(2, "c").unwrap();
/// collector.insert(0, "a").unwrap();
/// collector.insert(1, "b").unwrap();
///
/// assert_eq!(collector.drain().unwrap(), ["a", "b", "c"]);
/// ```
#[derive(Debug)]
pub struct OrderedResultCollector<K, R> {
    state: Mutex<CollectorState<K, R>>,
}

#[derive(Debug)]
struct CollectorState<K, R> {
    entries: BTreeMap<K, R>,
    drained: bool,
}

impl<K, R> OrderedResultCollector<K, R>
where
    K: Ord + Debug,
{
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CollectorState {
                entries: BTreeMap::new(),
                drained: false,
            }),
        }
    }

    /// Records `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateKey`] if a value is already recorded under `key` (the existing
    /// value is kept) and [`Error::CollectorDrained`] if the collector was already drained.
    pub fn insert(&self, key: K, value: R) -> Result<()> {
        let mut state = self.state.lock();

        if state.drained {
            return Err(Error::CollectorDrained);
        }

        if state.entries.contains_key(&key) {
            return Err(Error::DuplicateKey {
                key: format!("{key:?}"),
            });
        }

        state.entries.insert(key, value);
        Ok(())
    }

    /// Number of values recorded and not yet drained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether no values are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Removes all recorded values, returning them in ascending key order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CollectorDrained`] if the collector was already drained.
    pub fn drain(&self) -> Result<Vec<R>> {
        let mut state = self.state.lock();

        if state.drained {
            return Err(Error::CollectorDrained);
        }

        state.drained = true;
        Ok(mem::take(&mut state.entries).into_values().collect())
    }
}

impl<K, R> Default for OrderedResultCollector<K, R>
where
    K: Ord + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}
