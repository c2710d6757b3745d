//! petstream-io: Acquisition file I/O for petstream.
//!
//! This crate reads step-indexed acquisition files, segments each step into
//! raw buffers and drives the decoder pipeline. It also writes acquisitions
//! and decoded hits.
//!

pub mod datafile;
mod error;
pub mod header;
pub mod index;
mod reader;
mod writer;

pub use datafile::{BlockReader, MappedFileReader, DEFAULT_BLOCK_BYTES};
pub use error::{Error, Result};
pub use header::FileHeader;
pub use index::{read_index, rebuild_index, write_index, StepDescriptor};
pub use reader::{
    data_path, index_path, RawReader, ReaderOptions, ReaderState, StepReport, DATA_EXTENSION,
    INDEX_EXTENSION,
};
pub use writer::{AcquisitionWriter, HitFormat, RawHitWriter, BINARY_HIT_BYTES};
