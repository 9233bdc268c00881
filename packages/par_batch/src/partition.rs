//! Splitting a forward-only source into bounded batches.

use std::any::type_name;
use std::fmt;
use std::iter::{FusedIterator, Peekable};
use std::num::NonZero;
use std::vec;

/// Splits a source sequence into successive partitions of at most `partition_size` elements.
///
/// The source is consumed strictly once, left to right, and is never rewound, so any iterator
/// works, including unbounded ones. Each partition buffers its elements so that its actual
/// length is known up front, which lets callers size a latch to the real batch length (the
/// final partition may be shorter than the configured maximum).
///
/// # Example
///
/// ```
/// use new_zealand::nz;
/// use par_batch::PartitionScheduler;
///
/// let mut scheduler = PartitionScheduler::new(0..7, nz!(3));
///
/// let lengths: Vec<usize> = scheduler.by_ref().map(|p| p.len()).collect();
/// assert_eq!(lengths, [3, 3, 1]);
/// assert!(!scheduler.has_more_partitions());
/// ```
pub struct PartitionScheduler<I>
where
    I: Iterator,
{
    source: Peekable<I>,
    partition_size: NonZero<usize>,
    partitions_taken: usize,
    items_taken: usize,
}

impl<I> PartitionScheduler<I>
where
    I: Iterator,
{
    /// Creates a scheduler over `source` that yields partitions of at most `partition_size`
    /// elements.
    #[must_use]
    pub fn new<S>(source: S, partition_size: NonZero<usize>) -> Self
    where
        S: IntoIterator<IntoIter = I>,
    {
        Self {
            source: source.into_iter().peekable(),
            partition_size,
            partitions_taken: 0,
            items_taken: 0,
        }
    }

    /// The configured maximum partition length.
    #[must_use]
    pub fn partition_size(&self) -> NonZero<usize> {
        self.partition_size
    }

    /// Whether the source has at least one more element to hand out.
    ///
    /// This may pull one element from the source and hold on to it for the next partition.
    pub fn has_more_partitions(&mut self) -> bool {
        self.source.peek().is_some()
    }

    /// Number of partitions handed out so far.
    #[must_use]
    pub fn partitions_taken(&self) -> usize {
        self.partitions_taken
    }

    /// Number of source elements handed out so far, across all partitions.
    #[must_use]
    pub fn items_taken(&self) -> usize {
        self.items_taken
    }

    /// Takes the next partition from the source, or `None` once the source is exhausted.
    pub fn next_partition(&mut self) -> Option<Partition<I::Item>> {
        let first = self.source.next()?;

        let mut items = Vec::with_capacity(self.partition_size.get());
        items.push(first);
        items.extend(
            self.source
                .by_ref()
                .take(self.partition_size.get().saturating_sub(1)),
        );

        let partition = Partition {
            index: self.partitions_taken,
            first_item: self.items_taken,
            len: items.len(),
            has_more: self.source.peek().is_some(),
            items: items.into_iter(),
        };

        self.partitions_taken = self.partitions_taken.saturating_add(1);
        self.items_taken = self.items_taken.saturating_add(partition.len);

        Some(partition)
    }
}

impl<I> fmt::Debug for PartitionScheduler<I>
where
    I: Iterator,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("partition_size", &self.partition_size)
            .field("partitions_taken", &self.partitions_taken)
            .field("items_taken", &self.items_taken)
            .finish_non_exhaustive()
    }
}

impl<I> Iterator for PartitionScheduler<I>
where
    I: Iterator,
{
    type Item = Partition<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_partition()
    }
}

impl<I> FusedIterator for PartitionScheduler<I> where I: FusedIterator {}

/// One batch of elements taken from a [`PartitionScheduler`].
///
/// Iterating a partition hands out its elements by value, in source order.
#[derive(Debug)]
pub struct Partition<T> {
    index: usize,
    first_item: usize,
    len: usize,
    has_more: bool,
    items: vec::IntoIter<T>,
}

impl<T> Partition<T> {
    /// Zero-based position of this partition among all partitions of the source.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Zero-based position in the source of the first element of this partition.
    #[must_use]
    pub fn first_item(&self) -> usize {
        self.first_item
    }

    /// Number of elements in this partition, including those already taken from it.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether this partition holds no elements. Partitions handed out by a scheduler never do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of elements not yet taken from this partition.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items.len()
    }

    /// Whether the source had more elements after this partition was taken.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.has_more
    }
}

impl<T> Iterator for Partition<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<T> ExactSizeIterator for Partition<T> {}

impl<T> FusedIterator for Partition<T> {}
