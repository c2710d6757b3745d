//! Per-channel operating mode table.

use crate::word::MAX_NUMBER_CHANNELS;
use crate::DecodeError;
use petstream_core::ChannelMode;

/// Maps global channel ids to their operating mode.
///
/// Storage is sized lazily up to the highest configured channel; every
/// other channel below the limit takes `default_mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelModeTable {
    limit: u32,
    default_mode: ChannelMode,
    modes: Vec<ChannelMode>,
}

impl Default for ChannelModeTable {
    fn default() -> Self {
        Self::new(MAX_NUMBER_CHANNELS, ChannelMode::Tot)
    }
}

impl ChannelModeTable {
    /// Creates a table accepting channel ids in `0..limit`.
    ///
    /// `limit` is clamped to `1..=MAX_NUMBER_CHANNELS`.
    #[must_use]
    pub fn new(limit: u32, default_mode: ChannelMode) -> Self {
        Self {
            limit: limit.clamp(1, MAX_NUMBER_CHANNELS),
            default_mode,
            modes: Vec::new(),
        }
    }

    /// Exclusive upper bound of valid channel ids.
    #[inline]
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Mode of channels without an explicit entry.
    #[inline]
    #[must_use]
    pub fn default_mode(&self) -> ChannelMode {
        self.default_mode
    }

    /// Sets the mode of one channel.
    ///
    /// # Errors
    /// Returns [`DecodeError::ChannelOutOfRange`] if `channel_id >= limit`.
    pub fn set(&mut self, channel_id: u32, mode: ChannelMode) -> Result<(), DecodeError> {
        self.check(channel_id)?;
        let index = channel_id as usize;
        if index >= self.modes.len() {
            self.modes.resize(index + 1, self.default_mode);
        }
        self.modes[index] = mode;
        Ok(())
    }

    /// Mode of one channel.
    ///
    /// # Errors
    /// Returns [`DecodeError::ChannelOutOfRange`] if `channel_id >= limit`.
    #[inline]
    pub fn mode(&self, channel_id: u32) -> Result<ChannelMode, DecodeError> {
        self.check(channel_id)?;
        Ok(self
            .modes
            .get(channel_id as usize)
            .copied()
            .unwrap_or(self.default_mode))
    }

    /// Returns true if the channel is in charge-integration mode.
    /// Channels outside the limit report false.
    #[must_use]
    pub fn is_qdc(&self, channel_id: u32) -> bool {
        self.mode(channel_id).is_ok_and(ChannelMode::is_qdc)
    }

    /// Returns true if any valid channel is in time-over-threshold mode.
    #[must_use]
    pub fn any_tot(&self) -> bool {
        let unconfigured = (self.modes.len() as u64) < u64::from(self.limit);
        self.modes.iter().any(|mode| !mode.is_qdc())
            || (unconfigured && !self.default_mode.is_qdc())
    }

    /// Number of channels explicitly stored (including default-filled gaps).
    #[must_use]
    pub fn stored(&self) -> usize {
        self.modes.len()
    }

    /// Number of channels below the limit in charge-integration mode.
    #[must_use]
    pub fn qdc_channel_count(&self) -> u64 {
        let stored_qdc = self.modes.iter().filter(|mode| mode.is_qdc()).count() as u64;
        if self.default_mode.is_qdc() {
            stored_qdc + u64::from(self.limit) - self.modes.len() as u64
        } else {
            stored_qdc
        }
    }

    #[inline]
    fn check(&self, channel_id: u32) -> Result<(), DecodeError> {
        if channel_id >= self.limit {
            return Err(DecodeError::ChannelOutOfRange {
                channel_id,
                limit: self.limit,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_is_explicit() {
        let table = ChannelModeTable::new(64, ChannelMode::Qdc);
        assert_eq!(table.mode(10), Ok(ChannelMode::Qdc));
        assert!(table.is_qdc(63));
        assert!(!table.any_tot());
        assert_eq!(table.qdc_channel_count(), 64);
        assert_eq!(table.stored(), 0);
    }

    #[test]
    fn test_set_grows_lazily() {
        let mut table = ChannelModeTable::new(1000, ChannelMode::Tot);
        table.set(500, ChannelMode::Qdc).unwrap();
        assert_eq!(table.stored(), 501);
        assert!(table.is_qdc(500));
        assert!(!table.is_qdc(499));
        assert!(!table.is_qdc(900));
        assert!(table.any_tot());
        assert_eq!(table.qdc_channel_count(), 1);
    }

    #[test]
    fn test_limit_boundary() {
        let mut table = ChannelModeTable::new(128, ChannelMode::Tot);
        assert!(table.mode(127).is_ok());
        assert_eq!(
            table.mode(128),
            Err(DecodeError::ChannelOutOfRange {
                channel_id: 128,
                limit: 128
            })
        );
        assert!(table.set(128, ChannelMode::Qdc).is_err());
        assert!(!table.is_qdc(128));
    }

    #[test]
    fn test_any_tot_when_all_qdc() {
        let mut table = ChannelModeTable::new(4, ChannelMode::Tot);
        for channel in 0..4 {
            table.set(channel, ChannelMode::Qdc).unwrap();
        }
        assert!(!table.any_tot());
        table.set(2, ChannelMode::Tot).unwrap();
        assert!(table.any_tot());
    }

    #[test]
    fn test_limit_clamped() {
        assert_eq!(ChannelModeTable::new(0, ChannelMode::Tot).limit(), 1);
        assert_eq!(
            ChannelModeTable::new(u32::MAX, ChannelMode::Tot).limit(),
            MAX_NUMBER_CHANNELS
        );
        assert_eq!(ChannelModeTable::default().limit(), 4_194_304);
    }
}
