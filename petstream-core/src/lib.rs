//! petstream-core: Event buffers and pipeline contracts for PET detector data.
//!
//! This crate provides the buffer type exchanged by every processing stage,
//! the buffer lineage model, the unordered/overlapped stage contracts and
//! the hit records produced by the raw decoder.
//!

pub mod buffer;
pub mod error;
pub mod hit;
pub mod pipeline;

pub use buffer::{AnyEventBuffer, BufferHeader, EventBuffer, CAPACITY_QUANTUM};
pub use error::{Error, Result};
pub use hit::{ChannelMode, Measurement, RawHit, Timestamped, CLOCKS_PER_FRAME};
pub use pipeline::{
    CollectSink, EventSink, NullSink, OverlappedHandler, OverlappedStage, SequenceReorder,
    UnorderedHandler, UnorderedStage,
};
