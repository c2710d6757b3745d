//! Data file access: memory-mapped scanning and block-buffered frame reads.

use crate::{Error, Result};
use memmap2::Mmap;
use petstream_raw::{FrameHeader, WORD_SIZE};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Default size of one read block.
pub const DEFAULT_BLOCK_BYTES: usize = 1 << 20;

/// A memory-mapped file reader.
///
/// Used to scan whole data files without loading them into memory.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

/// Reads whole frames from a byte range through a fixed-size block buffer.
///
/// The block is refilled from the underlying reader as frames are consumed.
/// Frames larger than the block grow it to fit.
pub struct BlockReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    filled: usize,
    offset: u64,
    remaining: u64,
}

impl<R: Read + Seek> BlockReader<R> {
    /// Positions `inner` at `begin` and limits reads to `begin..end`.
    ///
    /// # Errors
    /// Returns an error if seeking fails.
    pub fn new(mut inner: R, begin: u64, end: u64, block_bytes: usize) -> Result<Self> {
        inner.seek(SeekFrom::Start(begin))?;
        Ok(Self {
            inner,
            buf: vec![0; block_bytes.max(FrameHeader::BYTES)],
            pos: 0,
            filled: 0,
            offset: begin,
            remaining: end.saturating_sub(begin),
        })
    }
}

impl<R: Read> BlockReader<R> {
    /// Absolute file offset of the next unread byte.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Makes at least `needed` bytes available if the range allows it.
    /// Returns the number of bytes available.
    fn fill_to(&mut self, needed: usize) -> Result<usize> {
        if self.filled - self.pos >= needed {
            return Ok(self.filled - self.pos);
        }

        self.buf.copy_within(self.pos..self.filled, 0);
        self.filled -= self.pos;
        self.pos = 0;
        if self.buf.len() < needed {
            self.buf.resize(needed, 0);
        }

        while self.filled < needed && self.remaining > 0 {
            let space = self.buf.len() - self.filled;
            let want = usize::try_from(self.remaining).map_or(space, |r| r.min(space));
            match self.inner.read(&mut self.buf[self.filled..self.filled + want]) {
                Ok(0) => break,
                Ok(read) => {
                    self.filled += read;
                    self.remaining -= read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(self.filled - self.pos)
    }

    /// Reads the next frame.
    ///
    /// Returns the frame header and the bytes of its event words, or `None`
    /// at the end of the range.
    ///
    /// # Errors
    /// Returns [`Error::Truncated`] if the range ends inside a frame or the
    /// file ends before the range does.
    pub fn next_frame(&mut self) -> Result<Option<(FrameHeader, &[u8])>> {
        let available = self.fill_to(FrameHeader::BYTES)?;
        if available == 0 && self.remaining == 0 {
            return Ok(None);
        }
        if available < FrameHeader::BYTES {
            return Err(Error::Truncated {
                offset: self.offset,
                needed: FrameHeader::BYTES,
                available,
            });
        }

        let mut raw = [0u8; FrameHeader::BYTES];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + FrameHeader::BYTES]);
        let header = FrameHeader::from_le_bytes(raw);

        let total = header.frame_bytes();
        let available = self.fill_to(total)?;
        if available < total {
            return Err(Error::Truncated {
                offset: self.offset,
                needed: total,
                available,
            });
        }

        let events = self.pos + FrameHeader::BYTES..self.pos + total;
        self.pos += total;
        self.offset += total as u64;
        Ok(Some((header, &self.buf[events])))
    }
}

/// Iterates over the little-endian words of a frame's event bytes.
pub fn event_words(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.chunks_exact(WORD_SIZE).map(|chunk| {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(chunk);
        u64::from_le_bytes(word)
    })
}
