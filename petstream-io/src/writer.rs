//! File writers for acquisitions and decoded hits.

use crate::header::FileHeader;
use crate::index::{write_index, StepDescriptor};
use crate::reader::{data_path, index_path};
use crate::{Error, Result};
use petstream_core::{EventBuffer, EventSink, RawHit};
use petstream_raw::{EventWord, FrameHeader};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Writes an acquisition data file and its step index.
///
/// Used to produce acquisitions for tests and tools. Frames are appended to
/// the current step; each step records its byte range and frame range.
pub struct AcquisitionWriter {
    data: BufWriter<File>,
    index_path: PathBuf,
    offset: u64,
    steps: Vec<StepDescriptor>,
    open_step: Option<StepDescriptor>,
}

impl AcquisitionWriter {
    /// Creates `<prefix>.rawf` and writes `header`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn create<P: AsRef<Path>>(prefix: P, header: &FileHeader) -> Result<Self> {
        let mut data = BufWriter::new(File::create(data_path(&prefix))?);
        header.write(&mut data)?;
        Ok(Self {
            data,
            index_path: index_path(&prefix),
            offset: header.encoded_len(),
            steps: Vec::new(),
            open_step: None,
        })
    }

    /// Starts a new step with the given scan values, closing the open one.
    pub fn begin_step(&mut self, value1: f32, value2: f32) {
        self.end_step();
        self.open_step = Some(StepDescriptor {
            begin: self.offset,
            end: self.offset,
            first_frame: u64::MAX,
            end_frame: 0,
            value1,
            value2,
        });
    }

    /// Closes the open step, if any.
    pub fn end_step(&mut self) {
        if let Some(mut step) = self.open_step.take() {
            step.end = self.offset;
            if step.first_frame > step.end_frame {
                step.first_frame = 0;
                step.end_frame = 0;
            }
            self.steps.push(step);
        }
    }

    /// Appends one frame.
    ///
    /// # Errors
    /// Returns an error if writing fails or the frame holds more than
    /// `u16::MAX` events.
    pub fn write_frame(&mut self, frame_id: u64, frame_lost: bool, events: &[EventWord]) -> Result<()> {
        let n_events = u16::try_from(events.len()).map_err(|_| {
            Error::InvalidFormat(format!("{} events do not fit in one frame", events.len()))
        })?;
        let header = FrameHeader {
            frame_id,
            n_events,
            frame_lost,
        };
        for word in header.encode() {
            self.data.write_all(&word.to_le_bytes())?;
        }
        for event in events {
            self.data.write_all(&event.raw().to_le_bytes())?;
        }
        self.offset += header.frame_bytes() as u64;

        if let Some(step) = self.open_step.as_mut() {
            step.first_frame = step.first_frame.min(frame_id);
            step.end_frame = step.end_frame.max(frame_id.saturating_add(1));
        }
        Ok(())
    }

    /// Appends raw bytes without framing.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.data.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Current data file size in bytes.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Closes the open step and writes the index file.
    ///
    /// # Errors
    /// Returns an error if flushing or writing the index fails.
    pub fn finish(mut self) -> Result<Vec<StepDescriptor>> {
        self.end_step();
        self.data.flush()?;
        let mut index = BufWriter::new(File::create(&self.index_path)?);
        write_index(&mut index, &self.steps)?;
        index.flush()?;
        Ok(self.steps)
    }

    /// Closes the data file without writing an index.
    ///
    /// # Errors
    /// Returns an error if flushing fails.
    pub fn finish_without_index(mut self) -> Result<Vec<StepDescriptor>> {
        self.end_step();
        self.data.flush()?;
        Ok(self.steps)
    }
}

/// Output encoding for [`RawHitWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HitFormat {
    /// Comma-separated text with a header line.
    #[default]
    Csv,
    /// Fixed-size little-endian records.
    Binary,
}

impl HitFormat {
    /// Picks the format from a file extension: `.csv` is text, anything else
    /// is binary.
    #[must_use]
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => HitFormat::Csv,
            _ => HitFormat::Binary,
        }
    }
}

/// Size of one binary hit record in bytes.
pub const BINARY_HIT_BYTES: usize = 38;

/// Sink writing decoded hits to a file.
///
/// Sinks cannot report errors to the reader, so the first write error is
/// kept and later buffers are dropped; [`Self::close`] returns it.
pub struct RawHitWriter {
    writer: BufWriter<File>,
    format: HitFormat,
    hits: u64,
    error: Option<std::io::Error>,
}

impl RawHitWriter {
    /// Creates a new hit writer.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the CSV header
    /// cannot be written.
    pub fn create<P: AsRef<Path>>(path: P, format: HitFormat) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        if format == HitFormat::Csv {
            writeln!(
                writer,
                "channel_id,tac_id,frame_id,t_coarse,e_coarse,t_fine,e_fine,time,time_end,mode"
            )?;
        }
        Ok(Self {
            writer,
            format,
            hits: 0,
            error: None,
        })
    }

    /// Number of hits written so far.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Writes hits directly.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write_hits(&mut self, hits: &[RawHit]) -> Result<()> {
        for hit in hits {
            match self.format {
                HitFormat::Csv => writeln!(
                    self.writer,
                    "{},{},{},{},{},{},{},{},{},{}",
                    hit.channel_id,
                    hit.tac_id,
                    hit.frame_id,
                    hit.t_coarse,
                    hit.e_coarse,
                    hit.t_fine,
                    hit.e_fine,
                    hit.time,
                    hit.time_end,
                    if hit.is_qdc() { "qdc" } else { "tot" }
                )?,
                HitFormat::Binary => {
                    // channel u32, tac u8, mode u8, four u16 fields, frame u64,
                    // time i64, time_end i64
                    self.writer.write_all(&hit.channel_id.to_le_bytes())?;
                    self.writer.write_all(&[hit.tac_id, u8::from(hit.is_qdc())])?;
                    for field in [hit.t_coarse, hit.e_coarse, hit.t_fine, hit.e_fine] {
                        self.writer.write_all(&field.to_le_bytes())?;
                    }
                    self.writer.write_all(&hit.frame_id.to_le_bytes())?;
                    self.writer.write_all(&hit.time.to_le_bytes())?;
                    self.writer.write_all(&hit.time_end.to_le_bytes())?;
                }
            }
        }
        self.hits += hits.len() as u64;
        Ok(())
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if flushing fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and returns the number of hits written, or the first error
    /// seen while acting as a sink.
    ///
    /// # Errors
    /// Returns the deferred write error or a flush error.
    pub fn close(mut self) -> Result<u64> {
        if let Some(err) = self.error.take() {
            return Err(Error::Io(err));
        }
        self.writer.flush()?;
        Ok(self.hits)
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(err) = result {
            log::error!("hit writer failed: {err}");
            if self.error.is_none() {
                self.error = Some(match err {
                    Error::Io(err) => err,
                    other => std::io::Error::other(other.to_string()),
                });
            }
        }
    }
}

impl EventSink<RawHit> for RawHitWriter {
    fn push_events(&mut self, buffer: EventBuffer<RawHit>) {
        if self.error.is_some() {
            return;
        }
        let result = self.write_hits(buffer.as_slice());
        self.record(result);
    }

    fn finish(&mut self) {
        if self.error.is_none() {
            let result = self.flush();
            self.record(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petstream_core::ChannelMode;
    use tempfile::NamedTempFile;

    fn hits() -> Vec<RawHit> {
        vec![
            RawHit {
                channel_id: 12,
                tac_id: 1,
                frame_id: 4,
                t_coarse: 10,
                e_coarse: 30,
                t_fine: 200,
                e_fine: 321,
                time: 4106,
                time_end: 4126,
                mode: ChannelMode::Qdc,
            },
            RawHit {
                channel_id: 13,
                time: -5,
                time_end: 15,
                mode: ChannelMode::Tot,
                ..RawHit::default()
            },
        ]
    }

    #[test]
    fn test_write_hits_csv() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = RawHitWriter::create(file.path(), HitFormat::Csv).unwrap();
        let mut buffer = EventBuffer::new(2, 0, 0);
        buffer.extend_from_slice(&hits());
        writer.push_events(buffer);
        writer.finish();
        assert_eq!(writer.close().unwrap(), 2);

        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("channel_id,tac_id,frame_id"));
        assert_eq!(lines[1], "12,1,4,10,30,200,321,4106,4126,qdc");
        assert_eq!(lines[2], "13,0,0,0,0,0,0,-5,15,tot");
    }

    #[test]
    fn test_write_hits_binary() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = RawHitWriter::create(file.path(), HitFormat::Binary).unwrap();
        writer.write_hits(&hits()).unwrap();
        assert_eq!(writer.close().unwrap(), 2);

        let data = std::fs::read(file.path()).unwrap();
        assert_eq!(data.len(), 2 * BINARY_HIT_BYTES);
        assert_eq!(&data[..4], &12u32.to_le_bytes());
        assert_eq!(data[5], 1);
        assert_eq!(&data[30..38], &4126i64.to_le_bytes());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(HitFormat::from_path("out.CSV"), HitFormat::Csv);
        assert_eq!(HitFormat::from_path("out.bin"), HitFormat::Binary);
        assert_eq!(HitFormat::from_path("out"), HitFormat::Binary);
    }

    #[test]
    fn test_acquisition_writer_steps() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("run");
        let header = FileHeader::default();
        let mut writer = AcquisitionWriter::create(&prefix, &header).unwrap();

        writer.begin_step(1.0, 2.0);
        writer.write_frame(5, false, &[EventWord::new(1)]).unwrap();
        writer.write_frame(6, false, &[]).unwrap();
        writer.begin_step(3.0, 4.0);
        writer.write_frame(7, true, &[EventWord::new(2), EventWord::new(3)]).unwrap();
        let steps = writer.finish().unwrap();

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].begin, header.encoded_len());
        assert_eq!(steps[0].end, steps[1].begin);
        assert_eq!((steps[0].first_frame, steps[0].end_frame), (5, 7));
        assert_eq!((steps[1].first_frame, steps[1].end_frame), (7, 8));
        assert_eq!(steps[1].end - steps[1].begin, 16 + 16);

        let data_len = std::fs::metadata(data_path(&prefix)).unwrap().len();
        assert_eq!(data_len, steps[1].end);
        assert!(index_path(&prefix).exists());
    }
}
