//! Step index files.
//!
//! An index file holds one tab-separated line per acquisition step:
//!
//! ```text
//! begin  end  first_frame  end_frame  value1  value2
//! ```
//!
//! `begin`/`end` are byte offsets into the data file and delimit the step.
//! Only frames with `first_frame <= frame_id < end_frame` belong to the step.

use crate::datafile::MappedFileReader;
use crate::{Error, Result};
use petstream_raw::FrameHeader;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;

/// One acquisition step: a byte range of the data file plus scan values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepDescriptor {
    /// Start offset in bytes (inclusive).
    pub begin: u64,
    /// End offset in bytes (exclusive).
    pub end: u64,
    /// First frame id of the step (inclusive).
    pub first_frame: u64,
    /// Frame id after the last frame of the step (exclusive).
    pub end_frame: u64,
    /// First scan parameter.
    pub value1: f32,
    /// Second scan parameter.
    pub value2: f32,
}

impl StepDescriptor {
    /// Length of the step in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    /// Returns true if `frame_id` belongs to the step.
    #[inline]
    #[must_use]
    pub fn contains_frame(&self, frame_id: u64) -> bool {
        (self.first_frame..self.end_frame).contains(&frame_id)
    }

    /// Both scan values.
    #[must_use]
    pub fn values(&self) -> (f32, f32) {
        (self.value1, self.value2)
    }
}

impl fmt::Display for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.begin, self.end, self.first_frame, self.end_frame, self.value1, self.value2
        )
    }
}

fn field<T: FromStr>(fields: &[&str], i: usize, name: &str) -> std::result::Result<T, String> {
    fields[i]
        .parse()
        .map_err(|_| format!("{name} '{}' is not a number", fields[i]))
}

impl FromStr for StepDescriptor {
    type Err = String;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(format!("expected 6 fields, found {}", fields.len()));
        }
        let step = Self {
            begin: field(&fields, 0, "begin")?,
            end: field(&fields, 1, "end")?,
            first_frame: field(&fields, 2, "first_frame")?,
            end_frame: field(&fields, 3, "end_frame")?,
            value1: field(&fields, 4, "value1")?,
            value2: field(&fields, 5, "value2")?,
        };
        if step.end < step.begin {
            return Err(format!("end {} before begin {}", step.end, step.begin));
        }
        if step.end_frame < step.first_frame {
            return Err(format!(
                "end_frame {} before first_frame {}",
                step.end_frame, step.first_frame
            ));
        }
        Ok(step)
    }
}

/// Parses an index file. Blank lines are ignored.
///
/// # Errors
/// Returns [`Error::InvalidIndex`] for any other malformed line.
pub fn read_index<R: BufRead>(reader: R) -> Result<Vec<StepDescriptor>> {
    let mut steps = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let step: StepDescriptor = line
            .parse()
            .map_err(|reason| Error::InvalidIndex { line: i + 1, reason })?;
        steps.push(step);
    }
    Ok(steps)
}

/// Writes steps in index file format.
///
/// # Errors
/// Returns an error if writing fails.
pub fn write_index<W: Write>(writer: &mut W, steps: &[StepDescriptor]) -> Result<()> {
    for step in steps {
        writeln!(writer, "{step}")?;
    }
    Ok(())
}

/// Builds a single-step index by scanning the frames of a data file.
///
/// The step spans every complete frame after the header; scan values are 0.
/// Returns no step when the file holds no frames. Trailing bytes that do not
/// form a complete frame are left outside the step.
#[must_use]
pub fn rebuild_index(data: &MappedFileReader, header_len: u64) -> Vec<StepDescriptor> {
    let bytes = data.as_bytes();
    let start = usize::try_from(header_len).unwrap_or(usize::MAX).min(bytes.len());

    let mut offset = start;
    let mut first_frame = u64::MAX;
    let mut last_frame = 0u64;
    let mut frames = 0usize;

    while offset + FrameHeader::BYTES <= bytes.len() {
        let mut raw = [0u8; FrameHeader::BYTES];
        raw.copy_from_slice(&bytes[offset..offset + FrameHeader::BYTES]);
        let header = FrameHeader::from_le_bytes(raw);
        let frame_end = offset + header.frame_bytes();
        if frame_end > bytes.len() {
            break;
        }
        first_frame = first_frame.min(header.frame_id);
        last_frame = last_frame.max(header.frame_id);
        frames += 1;
        offset = frame_end;
    }

    if offset < bytes.len() {
        log::warn!(
            "{}: {} trailing byte(s) after the last complete frame",
            data.path().display(),
            bytes.len() - offset
        );
    }
    if frames == 0 {
        return Vec::new();
    }

    log::debug!("rebuilt index over {frames} frame(s), frames {first_frame}..={last_frame}");
    vec![StepDescriptor {
        begin: start as u64,
        end: offset as u64,
        first_frame,
        end_frame: last_frame + 1,
        value1: 0.0,
        value2: 0.0,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_read_index() {
        let text = "64\t1024\t0\t10\t1.5\t-2\n\n  \n1024\t2048\t10\t20\t3\t0\n";
        let steps = read_index(Cursor::new(text)).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].begin, 64);
        assert_eq!(steps[0].end, 1024);
        assert_eq!(steps[0].values(), (1.5, -2.0));
        assert_eq!(steps[1].first_frame, 10);
        assert_eq!(steps[1].byte_len(), 1024);
    }

    #[test]
    fn test_malformed_line() {
        let err = read_index(Cursor::new("64\t1024\t0\t10\t1.5\n")).unwrap_err();
        assert!(matches!(err, Error::InvalidIndex { line: 1, .. }));

        let err = read_index(Cursor::new("\n64\t1024\t0\tten\t1\t2\n")).unwrap_err();
        assert!(matches!(err, Error::InvalidIndex { line: 2, .. }));

        let err = read_index(Cursor::new("2048\t1024\t0\t10\t1\t2\n")).unwrap_err();
        assert!(matches!(err, Error::InvalidIndex { .. }));
    }

    #[test]
    fn test_write_then_read() {
        let steps = vec![
            StepDescriptor {
                begin: 64,
                end: 800,
                first_frame: 0,
                end_frame: 4,
                value1: 0.25,
                value2: 7.0,
            },
            StepDescriptor {
                begin: 800,
                end: 900,
                first_frame: 4,
                end_frame: 5,
                value1: 0.5,
                value2: 7.0,
            },
        ];
        let mut text = Vec::new();
        write_index(&mut text, &steps).unwrap();
        assert_eq!(read_index(Cursor::new(text)).unwrap(), steps);
    }

    #[test]
    fn test_contains_frame() {
        let step = StepDescriptor {
            first_frame: 10,
            end_frame: 12,
            ..StepDescriptor::default()
        };
        assert!(!step.contains_frame(9));
        assert!(step.contains_frame(10));
        assert!(step.contains_frame(11));
        assert!(!step.contains_frame(12));
    }
}
