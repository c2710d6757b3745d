//! Raw event word decoder stage.

use crate::mode::ChannelModeTable;
use crate::timeref::FrameClock;
use crate::word::EventWord;
use crate::DecodeError;
use petstream_core::{ChannelMode, EventBuffer, RawHit, UnorderedHandler, CLOCKS_PER_FRAME};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trailing-edge times further than this before the leading edge wrapped
/// around the frame.
const WRAP_THRESHOLD: i64 = -256;

/// Undecoded record as read from the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UndecodedHit {
    /// Absolute frame id the word was read from.
    pub frame_id: u64,
    /// Opaque event word.
    pub event_word: EventWord,
}

impl UndecodedHit {
    /// Creates a record from a frame id and a raw word.
    #[inline]
    #[must_use]
    pub fn new(frame_id: u64, raw: u64) -> Self {
        Self {
            frame_id,
            event_word: EventWord::new(raw),
        }
    }
}

/// Decode counters shared between the decoder workers and the reader.
#[derive(Debug, Default)]
pub struct DecodeStats {
    hits: AtomicU64,
    errors: AtomicU64,
    buffers: AtomicU64,
}

/// Point-in-time copy of [`DecodeStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeSnapshot {
    /// Hits decoded.
    pub hits: u64,
    /// Records rejected.
    pub errors: u64,
    /// Buffers processed.
    pub buffers: u64,
}

impl DecodeStats {
    /// Current counter values.
    #[must_use]
    pub fn snapshot(&self) -> DecodeSnapshot {
        DecodeSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            buffers: self.buffers.load(Ordering::Relaxed),
        }
    }

    /// Number of records rejected so far.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn record(&self, hits: usize, errors: u64) {
        self.hits.fetch_add(hits as u64, Ordering::Relaxed);
        self.errors.fetch_add(errors, Ordering::Relaxed);
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Turns buffers of [`UndecodedHit`] into buffers of [`RawHit`].
///
/// Invalid records are skipped and counted in [`DecodeStats`]; the rest of
/// the buffer is still decoded.
#[derive(Debug, Clone)]
pub struct Decoder {
    modes: Arc<ChannelModeTable>,
    clock: FrameClock,
    stats: Arc<DecodeStats>,
}

impl Decoder {
    /// Creates a decoder with fresh counters.
    #[must_use]
    pub fn new(modes: Arc<ChannelModeTable>, clock: FrameClock) -> Self {
        Self::with_stats(modes, clock, Arc::new(DecodeStats::default()))
    }

    /// Creates a decoder reporting into existing counters.
    #[must_use]
    pub fn with_stats(
        modes: Arc<ChannelModeTable>,
        clock: FrameClock,
        stats: Arc<DecodeStats>,
    ) -> Self {
        Self {
            modes,
            clock,
            stats,
        }
    }

    /// Shared decode counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<DecodeStats> {
        &self.stats
    }

    /// Decodes a single record.
    ///
    /// # Errors
    /// Returns [`DecodeError::ChannelOutOfRange`] if the channel id is not
    /// below the configured channel limit.
    #[inline]
    pub fn decode(&self, record: &UndecodedHit) -> Result<RawHit, DecodeError> {
        let word = record.event_word;
        let channel_id = word.channel_id();
        let mode = self.modes.mode(channel_id)?;

        let frame_start = self.clock.frame_start(record.frame_id);
        let time = frame_start + i64::from(word.t_coarse());
        let mut time_end = frame_start + i64::from(word.e_coarse());
        if time_end - time < WRAP_THRESHOLD {
            time_end += CLOCKS_PER_FRAME;
        }

        Ok(RawHit {
            channel_id,
            tac_id: word.tac_id(),
            frame_id: record.frame_id,
            t_coarse: word.t_coarse(),
            e_coarse: word.e_coarse(),
            t_fine: word.t_fine(),
            e_fine: word.e_fine(),
            time,
            time_end,
            mode,
        })
    }

    /// Mode the decoder would assign to `channel_id`.
    ///
    /// # Errors
    /// Returns [`DecodeError::ChannelOutOfRange`] for channels above the limit.
    pub fn mode(&self, channel_id: u32) -> Result<ChannelMode, DecodeError> {
        self.modes.mode(channel_id)
    }
}

impl UnorderedHandler<UndecodedHit, RawHit> for Decoder {
    fn handle_events(&self, input: EventBuffer<UndecodedHit>) -> Option<EventBuffer<RawHit>> {
        let mut errors = 0u64;
        let mut first_error = None;
        let output = EventBuffer::derive_from(input.len(), input, |raw, hits| {
            for record in raw {
                match self.decode(record) {
                    Ok(hit) => hits.push(hit),
                    Err(err) => {
                        errors += 1;
                        first_error.get_or_insert(err);
                    }
                }
            }
        });

        self.stats.record(output.len(), errors);
        if let Some(err) = first_error {
            log::warn!(
                "buffer {}: skipped {errors} undecodable record(s), first: {err}",
                output.seq_n()
            );
        }
        log::debug!("buffer {}: decoded {} hit(s)", output.seq_n(), output.len());

        if output.is_empty() {
            None
        } else {
            Some(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeref::TimeReference;
    use petstream_core::Measurement;

    fn table(limit: u32) -> Arc<ChannelModeTable> {
        let mut table = ChannelModeTable::new(limit, ChannelMode::Tot);
        table.set(1, ChannelMode::Qdc).unwrap();
        Arc::new(table)
    }

    fn record(frame_id: u64, channel: u32, t_coarse: u16, e_coarse: u16, e_fine: u16) -> UndecodedHit {
        UndecodedHit {
            frame_id,
            event_word: EventWord::from_fields(channel, 2, t_coarse, e_coarse, 100, e_fine),
        }
    }

    #[test]
    fn test_decode_qdc() {
        let decoder = Decoder::new(table(16), FrameClock::default());
        let hit = decoder.decode(&record(3, 1, 10, 60, 412)).unwrap();
        assert_eq!(hit.channel_id, 1);
        assert_eq!(hit.tac_id, 2);
        assert_eq!(hit.frame_id, 3);
        assert_eq!(hit.t_fine, 100);
        assert_eq!(hit.time, 3 * 1024 + 10);
        assert_eq!(hit.time_end, 3 * 1024 + 60);
        assert_eq!(hit.mode, ChannelMode::Qdc);
        assert_eq!(hit.measurement(), Measurement::Charge(412));
    }

    #[test]
    fn test_decode_tot() {
        let decoder = Decoder::new(table(16), FrameClock::default());
        let hit = decoder.decode(&record(0, 2, 100, 140, 7)).unwrap();
        assert_eq!(hit.mode, ChannelMode::Tot);
        assert_eq!(hit.measurement(), Measurement::Width(40));
    }

    #[test]
    fn test_trailing_edge_wraps_frame() {
        let decoder = Decoder::new(table(16), FrameClock::default());
        let hit = decoder.decode(&record(0, 2, 1000, 20, 0)).unwrap();
        assert_eq!(hit.time, 1000);
        assert_eq!(hit.time_end, 1024 + 20);
        assert_eq!(hit.measurement(), Measurement::Width(44));

        // Small negative differences are kept as-is.
        let hit = decoder.decode(&record(0, 2, 300, 100, 0)).unwrap();
        assert_eq!(hit.time_end - hit.time, -200);
    }

    #[test]
    fn test_channel_limit_boundary() {
        let decoder = Decoder::new(table(16), FrameClock::default());
        assert!(decoder.decode(&record(0, 15, 0, 0, 0)).is_ok());
        assert_eq!(
            decoder.decode(&record(0, 16, 0, 0, 0)),
            Err(DecodeError::ChannelOutOfRange {
                channel_id: 16,
                limit: 16
            })
        );
    }

    #[test]
    fn test_step_reference_times() {
        let clock = FrameClock::resolve(&TimeReference::Step, 0, 100);
        let decoder = Decoder::new(table(16), clock);
        let hit = decoder.decode(&record(101, 0, 5, 5, 0)).unwrap();
        assert_eq!(hit.time, 1024 + 5);
    }

    #[test]
    fn test_handler_skips_and_counts() {
        let decoder = Decoder::new(table(16), FrameClock::default());
        let mut input = EventBuffer::new(4, 9, 0);
        input.push(record(0, 1, 1, 2, 3));
        input.push(record(0, 99, 1, 2, 3));
        input.push(record(1, 4, 1, 2, 3));
        input.set_t_max(2048).unwrap();

        let output = decoder.handle_events(input).unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output.seq_n(), 9);
        assert_eq!(output.t_max(), Some(2048));
        assert_eq!(output.lineage_depth(), 1);
        assert_eq!(output.get(1).unwrap().channel_id, 4);

        let stats = decoder.stats().snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.buffers, 1);
    }

    #[test]
    fn test_handler_empty_output() {
        let decoder = Decoder::new(table(4), FrameClock::default());
        let mut input = EventBuffer::new(1, 0, 0);
        input.push(record(0, 40, 0, 0, 0));
        assert!(decoder.handle_events(input).is_none());
        assert_eq!(decoder.stats().errors(), 1);
    }
}
