//! petstream-raw: Front-end word layout, channel modes and decoder.
//!
//! This crate provides the PET front-end data format and the decoding
//! logic that turns raw event words into timestamped hits.
//!
//! # Key Components
//!
//! - [`EventWord`] / [`FrameHeader`] - Bit field extraction for data words
//! - [`ChannelModeTable`] - QDC/TOT operating mode per channel
//! - [`TimeReference`] - Origin of decoded timestamps
//! - [`Decoder`] - Unordered stage from [`UndecodedHit`] to `RawHit`
//! - [`AcquisitionConfig`] - JSON-loadable acquisition overrides

mod decoder;
mod error;
pub mod mode;
pub mod timeref;
pub mod word;

pub use decoder::{DecodeSnapshot, DecodeStats, Decoder, UndecodedHit};
pub use error::{DecodeError, Error, Result};
pub use mode::ChannelModeTable;
pub use timeref::{frame_clock, FrameClock, TimeReference, UserClock};
pub use word::{EventWord, FrameHeader, FRAME_ID_MASK, MAX_NUMBER_CHANNELS, WORD_SIZE};

// Re-export core types for convenience
pub use petstream_core::{ChannelMode, RawHit};

use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Acquisition-level overrides applied on top of the data file header.
#[derive(Clone, Debug, Default)]
pub struct AcquisitionConfig {
    /// Origin of decoded timestamps.
    pub time_reference: TimeReference,
    /// Channel limit override; the file header value is used when `None`.
    pub channel_limit: Option<u32>,
    /// Channels forced to charge-integration mode.
    pub qdc_channels: Vec<u32>,
    /// Channels forced to time-over-threshold mode.
    pub tot_channels: Vec<u32>,
    /// Abort a step once more than this many records failed to decode.
    pub max_decode_errors: Option<u64>,
}

#[derive(Deserialize)]
struct JsonConfig {
    acquisition: JsonAcquisition,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonAcquisition {
    time_reference: Option<String>,
    channel_limit: Option<u32>,
    channel_modes: JsonChannelModes,
    max_decode_errors: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct JsonChannelModes {
    qdc: Vec<u32>,
    tot: Vec<u32>,
}

impl AcquisitionConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, is not valid JSON or
    /// fails [`Self::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let json_config: JsonConfig = serde_json::from_reader(BufReader::new(file))?;
        Self::from_json_config(json_config)
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the string is not valid JSON or fails
    /// [`Self::validate`].
    pub fn from_json(json: &str) -> Result<Self> {
        let json_config: JsonConfig = serde_json::from_str(json)?;
        Self::from_json_config(json_config)
    }

    fn from_json_config(config: JsonConfig) -> Result<Self> {
        let acquisition = config.acquisition;
        let time_reference = match acquisition.time_reference {
            Some(name) => name.parse::<TimeReference>()?,
            None => TimeReference::default(),
        };
        let config = Self {
            time_reference,
            channel_limit: acquisition.channel_limit,
            qdc_channels: acquisition.channel_modes.qdc,
            tot_channels: acquisition.channel_modes.tot,
            max_decode_errors: acquisition.max_decode_errors,
        };
        config.validate()?;
        Ok(config)
    }

    /// Sets the time reference.
    #[must_use]
    pub fn with_time_reference(mut self, time_reference: TimeReference) -> Self {
        self.time_reference = time_reference;
        self
    }

    /// Overrides the channel limit.
    #[must_use]
    pub fn with_channel_limit(mut self, limit: u32) -> Self {
        self.channel_limit = Some(limit);
        self
    }

    /// Forces channels into charge-integration mode.
    #[must_use]
    pub fn with_qdc_channels(mut self, channels: impl IntoIterator<Item = u32>) -> Self {
        self.qdc_channels.extend(channels);
        self
    }

    /// Forces channels into time-over-threshold mode.
    #[must_use]
    pub fn with_tot_channels(mut self, channels: impl IntoIterator<Item = u32>) -> Self {
        self.tot_channels.extend(channels);
        self
    }

    /// Sets the decode error threshold.
    #[must_use]
    pub fn with_max_decode_errors(mut self, max: u64) -> Self {
        self.max_decode_errors = Some(max);
        self
    }

    /// Checks limits and channel overrides for consistency.
    ///
    /// Override channels are only checked against the limit override; the
    /// header limit is checked in [`Self::apply_to`].
    ///
    /// # Errors
    /// Returns [`Error::Config`] on an out-of-range limit or a channel listed
    /// in both mode lists.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.channel_limit {
            if limit == 0 || limit > MAX_NUMBER_CHANNELS {
                return Err(Error::Config(format!(
                    "channel limit {limit} outside 1..={MAX_NUMBER_CHANNELS}"
                )));
            }
            if let Some(channel) = self
                .qdc_channels
                .iter()
                .chain(&self.tot_channels)
                .find(|&&channel| channel >= limit)
            {
                return Err(Error::Config(format!(
                    "channel {channel} is not below channel limit {limit}"
                )));
            }
        }

        let qdc: HashSet<u32> = self.qdc_channels.iter().copied().collect();
        if let Some(channel) = self.tot_channels.iter().find(|&&c| qdc.contains(&c)) {
            return Err(Error::Config(format!(
                "channel {channel} configured as both QDC and TOT"
            )));
        }
        Ok(())
    }

    /// Channel limit to use given the limit recorded in the file header.
    #[must_use]
    pub fn effective_channel_limit(&self, header_limit: u32) -> u32 {
        self.channel_limit.unwrap_or(header_limit)
    }

    /// Applies the mode overrides to `table`.
    ///
    /// # Errors
    /// Returns [`Error::Decode`] if an override channel is outside the table.
    pub fn apply_to(&self, table: &mut ChannelModeTable) -> Result<()> {
        for &channel in &self.qdc_channels {
            table.set(channel, ChannelMode::Qdc)?;
        }
        for &channel in &self.tot_channels {
            table.set(channel, ChannelMode::Tot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AcquisitionConfig::default();
        assert!(matches!(config.time_reference, TimeReference::Sync));
        assert_eq!(config.channel_limit, None);
        assert_eq!(config.effective_channel_limit(512), 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_loading() {
        let json = r#"{
            "acquisition": {
                "time_reference": "step",
                "channel_limit": 256,
                "channel_modes": {
                    "qdc": [1, 2, 3],
                    "tot": [200]
                },
                "max_decode_errors": 10
            }
        }"#;
        let config = AcquisitionConfig::from_json(json).unwrap();
        assert!(matches!(config.time_reference, TimeReference::Step));
        assert_eq!(config.channel_limit, Some(256));
        assert_eq!(config.qdc_channels, vec![1, 2, 3]);
        assert_eq!(config.tot_channels, vec![200]);
        assert_eq!(config.max_decode_errors, Some(10));
        assert_eq!(config.effective_channel_limit(4096), 256);
    }

    #[test]
    fn test_json_defaults() {
        let config = AcquisitionConfig::from_json(r#"{"acquisition": {}}"#).unwrap();
        assert!(matches!(config.time_reference, TimeReference::Sync));
        assert!(config.qdc_channels.is_empty());
        assert_eq!(config.max_decode_errors, None);
    }

    #[test]
    fn test_json_rejects_bad_values() {
        assert!(matches!(
            AcquisitionConfig::from_json(r#"{"acquisition": {"time_reference": "tdc"}}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            AcquisitionConfig::from_json(r#"{"acquisition": {"channel_limit": 0}}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            AcquisitionConfig::from_json(
                r#"{"acquisition": {"channel_limit": 8, "channel_modes": {"qdc": [8]}}}"#
            ),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            AcquisitionConfig::from_json("{"),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_conflicting_modes() {
        let config = AcquisitionConfig::default()
            .with_qdc_channels([4, 5])
            .with_tot_channels([5]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_to_table() {
        let config = AcquisitionConfig::default()
            .with_qdc_channels([3])
            .with_tot_channels([7]);
        let mut table = ChannelModeTable::new(16, ChannelMode::Qdc);
        config.apply_to(&mut table).unwrap();
        assert!(table.is_qdc(3));
        assert!(!table.is_qdc(7));
        assert!(table.is_qdc(8));

        let config = AcquisitionConfig::default().with_qdc_channels([16]);
        assert!(matches!(
            config.apply_to(&mut table),
            Err(Error::Decode(DecodeError::ChannelOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acquisition.json");
        std::fs::write(
            &path,
            r#"{"acquisition": {"time_reference": "wall", "max_decode_errors": 0}}"#,
        )
        .unwrap();
        let config = AcquisitionConfig::from_file(&path).unwrap();
        assert!(matches!(config.time_reference, TimeReference::Wall));
        assert_eq!(config.max_decode_errors, Some(0));

        assert!(matches!(
            AcquisitionConfig::from_file(dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }
}
