//! Pipeline stage contracts.
//!
//! Stages exchange whole [`EventBuffer`] values and never share them:
//! handing a buffer to a sink transfers ownership.
//!
//! Two disciplines exist:
//! - **Unordered** stages ([`UnorderedHandler`]) transform each buffer
//!   independently and may run on many workers at once. Output order is
//!   restored from sequence numbers by [`SequenceReorder`].
//! - **Overlapped** stages ([`OverlappedHandler`]) see buffers strictly in
//!   sequence order, together with the trailing records of the previous
//!   buffer, so they can join records across a buffer boundary.

use crate::buffer::EventBuffer;
use crate::hit::Timestamped;
use crate::{Error, Result};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Consumer of completed buffers.
pub trait EventSink<T>: Send {
    /// Takes ownership of one buffer.
    fn push_events(&mut self, buffer: EventBuffer<T>);

    /// Signals the end of the stream.
    fn finish(&mut self) {}
}

impl<T, S> EventSink<T> for Box<S>
where
    S: EventSink<T> + ?Sized,
{
    fn push_events(&mut self, buffer: EventBuffer<T>) {
        (**self).push_events(buffer);
    }

    fn finish(&mut self) {
        (**self).finish();
    }
}

impl<T, S> EventSink<T> for &mut S
where
    S: EventSink<T> + ?Sized,
{
    fn push_events(&mut self, buffer: EventBuffer<T>) {
        (**self).push_events(buffer);
    }

    fn finish(&mut self) {
        (**self).finish();
    }
}

/// A stage that transforms buffers independently of each other.
///
/// Implementations derive the output buffer from the input (see
/// [`EventBuffer::from_parent`]) so the sequence number and time window
/// survive out-of-order processing. Returning `None` means "no output".
pub trait UnorderedHandler<I, O>: Send + Sync {
    /// Transforms one input buffer.
    fn handle_events(&self, input: EventBuffer<I>) -> Option<EventBuffer<O>>;
}

/// A stage that needs buffers in strict sequence order.
pub trait OverlappedHandler<I, O>: Send {
    /// Transforms one input buffer.
    ///
    /// `tail` holds the records of the previous buffer that fall inside the
    /// stage's overlap window before that buffer's `t_max`. It is empty for
    /// the first buffer of a stream.
    fn handle_events(&mut self, tail: &[I], input: EventBuffer<I>) -> Option<EventBuffer<O>>;
}

/// Sink adaptor that releases buffers in sequence-number order.
///
/// Buffers that arrive early are held until every lower sequence number has
/// been delivered or explicitly skipped. The first sequence number of the
/// stream must be known up front: arrival order says nothing about it.
pub struct SequenceReorder<T, S> {
    sink: S,
    next: u64,
    held: BTreeMap<u64, Option<EventBuffer<T>>>,
}

impl<T, S> SequenceReorder<T, S>
where
    S: EventSink<T>,
{
    /// Creates a reorderer expecting `first` as the first sequence number.
    pub fn starting_at(first: u64, sink: S) -> Self {
        Self {
            sink,
            next: first,
            held: BTreeMap::new(),
        }
    }

    /// Next sequence number to be released.
    #[must_use]
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Number of buffers waiting for a gap to close.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Offers the result for `seq_n`. `None` marks the sequence number as
    /// producing no output.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateSequence`] if `seq_n` was already released
    /// or is already held.
    pub fn offer(&mut self, seq_n: u64, buffer: Option<EventBuffer<T>>) -> Result<()> {
        if seq_n < self.next || self.held.contains_key(&seq_n) {
            return Err(Error::DuplicateSequence(seq_n));
        }
        self.held.insert(seq_n, buffer);
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        while let Some(entry) = self.held.remove(&self.next) {
            if let Some(buffer) = entry {
                self.sink.push_events(buffer);
            }
            self.next += 1;
        }
    }

    /// Releases every held buffer in order, even across gaps, then
    /// finishes the wrapped sink.
    pub fn finish(&mut self) {
        if !self.held.is_empty() {
            log::warn!(
                "flushing {} buffer(s) past a sequence gap at {}",
                self.held.len(),
                self.next
            );
        }
        let held = std::mem::take(&mut self.held);
        for (seq_n, entry) in held {
            if let Some(buffer) = entry {
                self.sink.push_events(buffer);
            }
            self.next = seq_n + 1;
        }
        self.sink.finish();
    }

    /// Returns the wrapped sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}

/// Runs an [`UnorderedHandler`] on the rayon pool.
///
/// Input buffers may arrive in any order. They are gathered into batches of
/// `batch_size` and transformed in parallel; outputs reach the downstream
/// sink in sequence order starting from the stream's first sequence number.
pub struct UnorderedStage<I, O, H, S> {
    handler: H,
    pending: Vec<EventBuffer<I>>,
    batch_size: usize,
    reorder: SequenceReorder<O, S>,
}

impl<I, O, H, S> UnorderedStage<I, O, H, S>
where
    I: Send,
    O: Send,
    H: UnorderedHandler<I, O>,
    S: EventSink<O>,
{
    /// Creates a stage whose stream starts at sequence number `first`, with
    /// a batch size equal to the rayon pool width.
    pub fn starting_at(first: u64, handler: H, sink: S) -> Self {
        Self::with_batch_size(first, handler, sink, rayon::current_num_threads())
    }

    /// Creates a stage that runs `batch_size` buffers per parallel round.
    /// Values below 1 are clamped to 1.
    pub fn with_batch_size(first: u64, handler: H, sink: S, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            handler,
            pending: Vec::with_capacity(batch_size),
            batch_size,
            reorder: SequenceReorder::starting_at(first, sink),
        }
    }

    /// The wrapped handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn run_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let handler = &self.handler;
        let results: Vec<(u64, Option<EventBuffer<O>>)> = self
            .pending
            .par_drain(..)
            .map(|buffer| (buffer.seq_n(), handler.handle_events(buffer)))
            .collect();
        for (seq_n, output) in results {
            if let Err(err) = self.reorder.offer(seq_n, output) {
                log::error!("unordered stage dropped a buffer: {err}");
            }
        }
    }

    /// Returns the downstream sink.
    pub fn into_inner(self) -> S {
        self.reorder.into_inner()
    }
}

impl<I, O, H, S> EventSink<I> for UnorderedStage<I, O, H, S>
where
    I: Send,
    O: Send,
    H: UnorderedHandler<I, O>,
    S: EventSink<O>,
{
    fn push_events(&mut self, buffer: EventBuffer<I>) {
        self.pending.push(buffer);
        if self.pending.len() >= self.batch_size {
            self.run_pending();
        }
    }

    fn finish(&mut self) {
        self.run_pending();
        self.reorder.finish();
    }
}

/// Runs an [`OverlappedHandler`] with strict sequence-order delivery.
///
/// The first buffer fixes the starting sequence number; every later buffer
/// must carry exactly the next one.
pub struct OverlappedStage<I, O, H, S> {
    handler: H,
    sink: S,
    overlap_window: i64,
    tail: Vec<I>,
    expected: Option<u64>,
    _output: std::marker::PhantomData<fn() -> O>,
}

impl<I, O, H, S> OverlappedStage<I, O, H, S>
where
    I: Copy + Timestamped + Send,
    O: Send,
    H: OverlappedHandler<I, O>,
    S: EventSink<O>,
{
    /// Creates a stage keeping records within `overlap_window` clock periods
    /// of the previous buffer's end.
    pub fn new(handler: H, sink: S, overlap_window: i64) -> Self {
        Self {
            handler,
            sink,
            overlap_window: overlap_window.max(0),
            tail: Vec::new(),
            expected: None,
            _output: std::marker::PhantomData,
        }
    }

    /// Next sequence number the stage accepts.
    #[must_use]
    pub fn next_expected(&self) -> Option<u64> {
        self.expected
    }

    /// Hands one buffer to the stage.
    ///
    /// # Errors
    /// Returns [`Error::OutOfOrder`] if the buffer is not the next in
    /// sequence. The buffer is dropped and the stage state is unchanged.
    pub fn submit(&mut self, buffer: EventBuffer<I>) -> Result<()> {
        let seq_n = buffer.seq_n();
        if let Some(expected) = self.expected {
            if seq_n != expected {
                return Err(Error::OutOfOrder {
                    expected,
                    got: seq_n,
                });
            }
        }
        self.expected = Some(seq_n + 1);

        let next_tail = self.trailing_records(&buffer);
        let output = self.handler.handle_events(&self.tail, buffer);
        self.tail = next_tail;

        if let Some(output) = output {
            self.sink.push_events(output);
        }
        Ok(())
    }

    fn trailing_records(&self, buffer: &EventBuffer<I>) -> Vec<I> {
        let end = match (buffer.t_max(), buffer.last()) {
            (Some(t_max), _) => t_max,
            (None, Ok(last)) => last.time(),
            (None, Err(_)) => return Vec::new(),
        };
        let start = end - self.overlap_window;
        buffer
            .iter()
            .filter(|record| record.time() >= start)
            .copied()
            .collect()
    }

    /// Returns the downstream sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}

impl<I, O, H, S> EventSink<I> for OverlappedStage<I, O, H, S>
where
    I: Copy + Timestamped + Send,
    O: Send,
    H: OverlappedHandler<I, O>,
    S: EventSink<O>,
{
    fn push_events(&mut self, buffer: EventBuffer<I>) {
        if let Err(err) = self.submit(buffer) {
            panic!("overlapped stage contract violated: {err}");
        }
    }

    fn finish(&mut self) {
        self.tail.clear();
        self.sink.finish();
    }
}

/// Terminal sink that keeps every buffer it receives.
#[derive(Debug)]
pub struct CollectSink<T> {
    buffers: Vec<EventBuffer<T>>,
    finished: bool,
}

impl<T> Default for CollectSink<T> {
    fn default() -> Self {
        Self {
            buffers: Vec::new(),
            finished: false,
        }
    }
}

impl<T> CollectSink<T> {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers received so far, in arrival order.
    #[must_use]
    pub fn buffers(&self) -> &[EventBuffer<T>] {
        &self.buffers
    }

    /// Sequence numbers received so far, in arrival order.
    #[must_use]
    pub fn sequence(&self) -> Vec<u64> {
        self.buffers.iter().map(EventBuffer::seq_n).collect()
    }

    /// Total number of records across all buffers.
    #[must_use]
    pub fn total_records(&self) -> usize {
        self.buffers.iter().map(EventBuffer::len).sum()
    }

    /// Returns true once `finish` has been called.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consumes the collector and returns its buffers.
    #[must_use]
    pub fn into_buffers(self) -> Vec<EventBuffer<T>> {
        self.buffers
    }
}

impl<T: Copy> CollectSink<T> {
    /// Copies every record of every buffer into one vector.
    #[must_use]
    pub fn records(&self) -> Vec<T> {
        self.buffers
            .iter()
            .flat_map(|buffer| buffer.iter().copied())
            .collect()
    }
}

impl<T: Send> EventSink<T> for CollectSink<T> {
    fn push_events(&mut self, buffer: EventBuffer<T>) {
        self.buffers.push(buffer);
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

/// Terminal sink that only counts what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink {
    /// Buffers received.
    pub buffers: usize,
    /// Records received.
    pub records: usize,
}

impl<T> EventSink<T> for NullSink {
    fn push_events(&mut self, buffer: EventBuffer<T>) {
        self.buffers += 1;
        self.records += buffer.len();
    }
}
