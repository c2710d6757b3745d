//! Sequence-numbered event buffers and buffer lineage.
//!
//! Every pipeline stage exchanges [`EventBuffer`] values. A buffer carries
//! its records plus a [`BufferHeader`]: sequence number, time window and an
//! optional parent buffer. The header is non-generic so metadata can be read
//! through [`AnyEventBuffer`] without knowing the record type.
//!
//! A buffer built with [`EventBuffer::from_parent`] inherits the parent's
//! sequence number and time window and takes ownership of the parent. The
//! parent chain therefore lives exactly as long as the youngest buffer
//! derived from it and is dropped with it.

use crate::{Error, Result};
use std::fmt;

/// Capacity granularity in records.
pub const CAPACITY_QUANTUM: usize = 1024;

/// Type-erased view of a buffer, used for lineage and metadata access.
pub trait AnyEventBuffer: Send {
    /// Returns the buffer metadata.
    fn header(&self) -> &BufferHeader;

    /// Returns the number of committed records.
    fn len(&self) -> usize;

    /// Returns true when no record has been committed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Metadata shared by every buffer regardless of record type.
pub struct BufferHeader {
    seq_n: u64,
    t_min: i64,
    t_max: Option<i64>,
    parent: Option<Box<dyn AnyEventBuffer>>,
}

impl BufferHeader {
    /// Creates the header of a lineage root.
    #[must_use]
    pub fn root(seq_n: u64, t_min: i64) -> Self {
        Self {
            seq_n,
            t_min,
            t_max: None,
            parent: None,
        }
    }

    /// Creates a header derived from `parent`, taking ownership of it.
    #[must_use]
    pub fn derived(parent: Box<dyn AnyEventBuffer>) -> Self {
        let (seq_n, t_min, t_max) = {
            let p = parent.header();
            (p.seq_n, p.t_min, p.t_max)
        };
        Self {
            seq_n,
            t_min,
            t_max,
            parent: Some(parent),
        }
    }

    /// Sequence number of the lineage.
    #[inline]
    #[must_use]
    pub fn seq_n(&self) -> u64 {
        self.seq_n
    }

    /// Start of the time window (clock periods).
    #[inline]
    #[must_use]
    pub fn t_min(&self) -> i64 {
        self.t_min
    }

    /// End of the time window, `None` until the buffer is finalized.
    #[inline]
    #[must_use]
    pub fn t_max(&self) -> Option<i64> {
        self.t_max
    }

    /// Returns true once `t_max` has been set.
    #[inline]
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.t_max.is_some()
    }

    /// Closes the time window.
    ///
    /// # Errors
    /// Returns [`Error::TMaxAlreadySet`] if the window was already closed.
    pub fn set_t_max(&mut self, t_max: i64) -> Result<()> {
        if let Some(existing) = self.t_max {
            return Err(Error::TMaxAlreadySet {
                seq_n: self.seq_n,
                t_max: existing,
            });
        }
        self.t_max = Some(t_max);
        Ok(())
    }

    /// Immediate parent, if this buffer was derived from another.
    #[must_use]
    pub fn parent(&self) -> Option<&dyn AnyEventBuffer> {
        self.parent.as_deref()
    }

    /// Number of ancestors kept alive by this buffer.
    #[must_use]
    pub fn lineage_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(buffer) = current {
            depth += 1;
            current = buffer.header().parent();
        }
        depth
    }

    fn take_parent(&mut self) -> Option<Box<dyn AnyEventBuffer>> {
        self.parent.take()
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("seq_n", &self.seq_n)
            .field("t_min", &self.t_min)
            .field("t_max", &self.t_max)
            .field("lineage_depth", &self.lineage_depth())
            .finish()
    }
}

/// A growable buffer of fixed-layout event records.
///
/// Storage is kept fully initialized up to the capacity, so a write slot
/// can be handed out before it is committed. Capacity never shrinks.
pub struct EventBuffer<T> {
    header: BufferHeader,
    slots: Vec<T>,
    used: usize,
    reallocations: usize,
}

/// Rounds a capacity hint up to the next quantum.
#[inline]
fn initial_capacity(hint: usize) -> usize {
    ((hint / CAPACITY_QUANTUM) + 1) * CAPACITY_QUANTUM
}

/// Growth step for a full buffer: about a tenth of the current capacity,
/// at least one quantum.
#[inline]
fn growth_increment(capacity: usize) -> usize {
    ((capacity / (10 * CAPACITY_QUANTUM)) + 1) * CAPACITY_QUANTUM
}

impl<T: Copy + Default> EventBuffer<T> {
    /// Creates a lineage root with an explicit sequence number and `t_min`.
    #[must_use]
    pub fn new(capacity_hint: usize, seq_n: u64, t_min: i64) -> Self {
        Self::with_header(capacity_hint, BufferHeader::root(seq_n, t_min))
    }

    /// Creates a buffer derived from `parent`.
    ///
    /// The new buffer inherits sequence number and time window and keeps
    /// the parent chain alive until it is itself dropped.
    #[must_use]
    pub fn from_parent<P>(capacity_hint: usize, parent: EventBuffer<P>) -> Self
    where
        P: Send + 'static,
    {
        Self::from_boxed_parent(capacity_hint, Box::new(parent))
    }

    /// Creates a buffer derived from an already type-erased parent.
    #[must_use]
    pub fn from_boxed_parent(capacity_hint: usize, parent: Box<dyn AnyEventBuffer>) -> Self {
        Self::with_header(capacity_hint, BufferHeader::derived(parent))
    }

    /// Builds a buffer derived from `parent` while the parent's records are
    /// still readable.
    ///
    /// `fill` receives the parent and the new, empty buffer. Once it
    /// returns, the parent is moved into the new buffer's lineage. The
    /// header seen inside `fill` is provisional: the final one is derived
    /// from the parent, so `fill` must not set `t_max`.
    #[must_use]
    pub fn derive_from<P, F>(capacity_hint: usize, parent: EventBuffer<P>, fill: F) -> Self
    where
        P: Send + 'static,
        F: FnOnce(&EventBuffer<P>, &mut Self),
    {
        let mut child = Self::new(capacity_hint, parent.seq_n(), parent.t_min());
        fill(&parent, &mut child);
        child.header = BufferHeader::derived(Box::new(parent));
        child
    }

    fn with_header(capacity_hint: usize, header: BufferHeader) -> Self {
        Self {
            header,
            slots: vec![T::default(); initial_capacity(capacity_hint)],
            used: 0,
            reallocations: 0,
        }
    }

    /// Grows the capacity to at least `capacity`. No-op if already large enough.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.slots.len() {
            return;
        }
        self.resize_storage(capacity);
    }

    fn resize_storage(&mut self, capacity: usize) {
        self.slots.resize(capacity, T::default());
        self.reallocations += 1;
    }

    fn grow(&mut self) {
        let capacity = self.slots.len() + growth_increment(self.slots.len());
        self.resize_storage(capacity);
    }

    /// Returns the next unused record, growing the buffer first if it is full.
    ///
    /// The slot is not counted until [`Self::commit_slot`] is called.
    #[inline]
    pub fn write_slot(&mut self) -> &mut T {
        if self.used >= self.slots.len() {
            self.grow();
        }
        &mut self.slots[self.used]
    }

    /// Commits the slot last returned by [`Self::write_slot`].
    #[inline]
    pub fn commit_slot(&mut self) {
        if self.used >= self.slots.len() {
            self.grow();
        }
        self.used += 1;
    }

    /// Appends one record.
    #[inline]
    pub fn push(&mut self, record: T) {
        *self.write_slot() = record;
        self.commit_slot();
    }

    /// Appends every record of `records`.
    pub fn extend_from_slice(&mut self, records: &[T]) {
        let needed = self.used + records.len();
        if needed > self.slots.len() {
            let mut capacity = self.slots.len();
            while capacity < needed {
                capacity += growth_increment(capacity);
            }
            self.resize_storage(capacity);
        }
        self.slots[self.used..needed].copy_from_slice(records);
        self.used = needed;
    }
}

impl<T> EventBuffer<T> {
    /// Returns the committed record at `index`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `index >= len()`.
    pub fn get(&self, index: usize) -> Result<&T> {
        self.as_slice().get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.used,
        })
    }

    /// Mutable variant of [`Self::get`].
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] if `index >= len()`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut T> {
        let len = self.used;
        self.slots[..len]
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, len })
    }

    /// Returns the most recently committed record.
    ///
    /// # Errors
    /// Returns [`Error::EmptyBuffer`] if nothing has been committed.
    pub fn last(&self) -> Result<&T> {
        self.as_slice().last().ok_or(Error::EmptyBuffer {
            seq_n: self.header.seq_n,
        })
    }

    /// Number of committed records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.used
    }

    /// Returns true when no record has been committed.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Number of records the buffer can hold without growing.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of times the storage has been grown.
    #[inline]
    #[must_use]
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    /// Committed records as a slice.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.slots[..self.used]
    }

    /// Committed records as a mutable slice.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.slots[..self.used]
    }

    /// Iterates over committed records.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Buffer metadata.
    #[inline]
    #[must_use]
    pub fn header(&self) -> &BufferHeader {
        &self.header
    }

    /// Sequence number.
    #[inline]
    #[must_use]
    pub fn seq_n(&self) -> u64 {
        self.header.seq_n()
    }

    /// Start of the time window.
    #[inline]
    #[must_use]
    pub fn t_min(&self) -> i64 {
        self.header.t_min()
    }

    /// End of the time window, `None` until finalized.
    #[inline]
    #[must_use]
    pub fn t_max(&self) -> Option<i64> {
        self.header.t_max()
    }

    /// Closes the time window once all records have been committed.
    ///
    /// # Errors
    /// Returns [`Error::TMaxAlreadySet`] on a second call.
    pub fn set_t_max(&mut self, t_max: i64) -> Result<()> {
        self.header.set_t_max(t_max)
    }

    /// Immediate parent buffer, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&dyn AnyEventBuffer> {
        self.header.parent()
    }

    /// Number of ancestors kept alive by this buffer.
    #[must_use]
    pub fn lineage_depth(&self) -> usize {
        self.header.lineage_depth()
    }

    /// Drops this buffer's records and hands back its parent chain.
    #[must_use]
    pub fn into_parent(mut self) -> Option<Box<dyn AnyEventBuffer>> {
        self.header.take_parent()
    }
}

impl<T: Send + 'static> AnyEventBuffer for EventBuffer<T> {
    fn header(&self) -> &BufferHeader {
        &self.header
    }

    fn len(&self) -> usize {
        self.used
    }
}

impl<'a, T> IntoIterator for &'a EventBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> fmt::Debug for EventBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBuffer")
            .field("header", &self.header)
            .field("len", &self.used)
            .field("capacity", &self.slots.len())
            .finish_non_exhaustive()
    }
}
