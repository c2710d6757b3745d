//! Data file header.

use crate::{Error, Result};
use petstream_core::ChannelMode;
use petstream_raw::{ChannelModeTable, MAX_NUMBER_CHANNELS, WORD_SIZE};
use std::io::{Read, Write};

/// File magic, stored as the first word.
pub const MAGIC: [u8; 8] = *b"PETSRAWF";

/// Supported format version.
pub const FORMAT_VERSION: u16 = 1;

/// Number of fixed header words before the mode entries.
pub const FIXED_WORDS: usize = 8;

const QDC_FLAG: u64 = 1 << 63;
const TRIGGER_PRESENT: u64 = 1 << 63;
const ENTRY_CHANNEL_MASK: u64 = (1 << 22) - 1;

/// Mode entries reserved up front; larger tables grow as entries are read.
const PREALLOCATED_ENTRIES: usize = 4096;

/// Acquisition metadata stored at the start of a data file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    /// System clock frequency in Hz.
    pub frequency: u32,
    /// Mode of channels without an explicit entry.
    pub default_mode: ChannelMode,
    /// Synchronization epoch in seconds since the Unix epoch.
    pub sync_epoch: f64,
    /// Trigger id, when the acquisition was triggered.
    pub trigger_id: Option<u16>,
    /// DAQ time at file creation, in clocks since the sync epoch.
    pub file_creation_daq_time: u64,
    /// Exclusive upper bound of channel ids.
    pub channel_limit: u32,
    /// Explicit per-channel modes.
    pub channel_modes: Vec<(u32, ChannelMode)>,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            frequency: 200_000_000,
            default_mode: ChannelMode::Tot,
            sync_epoch: 0.0,
            trigger_id: None,
            file_creation_daq_time: 0,
            channel_limit: MAX_NUMBER_CHANNELS,
            channel_modes: Vec::new(),
        }
    }
}

fn read_word<R: Read>(reader: &mut R, what: &str) -> Result<u64> {
    let mut bytes = [0u8; WORD_SIZE];
    reader.read_exact(&mut bytes).map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::InvalidFormat(format!("file ends inside header ({what})"))
        } else {
            Error::Io(err)
        }
    })?;
    Ok(u64::from_le_bytes(bytes))
}

impl FileHeader {
    /// Reads and validates a header.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] on a wrong magic, unsupported version,
    /// truncated header or out-of-range channel entries.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = read_word(reader, "magic")?;
        if magic.to_le_bytes() != MAGIC {
            return Err(Error::InvalidFormat(
                "not an acquisition data file (bad magic)".to_string(),
            ));
        }

        let word = read_word(reader, "frequency")?;
        let version = (word >> 48) as u16;
        if version != FORMAT_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported format version {version}"
            )));
        }
        let frequency = word as u32;
        let default_mode = ChannelMode::from_qdc_flag(word & (1 << 32) != 0);

        let sync_epoch = f64::from_bits(read_word(reader, "sync epoch")?);
        let trigger = read_word(reader, "trigger")?;
        let trigger_id = (trigger & TRIGGER_PRESENT != 0).then_some(trigger as u16);
        let file_creation_daq_time = read_word(reader, "creation time")?;

        let channel_limit = match read_word(reader, "channel limit")? {
            0 => MAX_NUMBER_CHANNELS,
            limit if limit > u64::from(MAX_NUMBER_CHANNELS) => {
                return Err(Error::InvalidFormat(format!(
                    "channel limit {limit} exceeds {MAX_NUMBER_CHANNELS}"
                )));
            }
            limit => limit as u32,
        };

        let n_entries = read_word(reader, "mode entry count")?;
        if n_entries > u64::from(channel_limit) {
            return Err(Error::InvalidFormat(format!(
                "{n_entries} mode entries for {channel_limit} channels"
            )));
        }
        let _reserved = read_word(reader, "reserved")?;

        let reserve = usize::try_from(n_entries).map_or(0, |n| n.min(PREALLOCATED_ENTRIES));
        let mut channel_modes = Vec::with_capacity(reserve);
        for _ in 0..n_entries {
            let entry = read_word(reader, "mode entry")?;
            let channel_id = (entry & ENTRY_CHANNEL_MASK) as u32;
            if channel_id >= channel_limit {
                return Err(Error::InvalidFormat(format!(
                    "mode entry for channel {channel_id} beyond limit {channel_limit}"
                )));
            }
            channel_modes.push((channel_id, ChannelMode::from_qdc_flag(entry & QDC_FLAG != 0)));
        }

        Ok(Self {
            frequency,
            default_mode,
            sync_epoch,
            trigger_id,
            file_creation_daq_time,
            channel_limit,
            channel_modes,
        })
    }

    /// Writes the header.
    ///
    /// # Errors
    /// Returns an error if writing fails.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let qdc_default = if self.default_mode.is_qdc() { 1 << 32 } else { 0 };
        let trigger = self
            .trigger_id
            .map_or(0, |id| TRIGGER_PRESENT | u64::from(id));
        let limit = if self.channel_limit == MAX_NUMBER_CHANNELS {
            0
        } else {
            u64::from(self.channel_limit)
        };

        let words = [
            u64::from_le_bytes(MAGIC),
            u64::from(self.frequency) | qdc_default | (u64::from(FORMAT_VERSION) << 48),
            self.sync_epoch.to_bits(),
            trigger,
            self.file_creation_daq_time,
            limit,
            self.channel_modes.len() as u64,
            0,
        ];
        for word in words {
            writer.write_all(&word.to_le_bytes())?;
        }
        for &(channel_id, mode) in &self.channel_modes {
            let flag = if mode.is_qdc() { QDC_FLAG } else { 0 };
            let entry = (u64::from(channel_id) & ENTRY_CHANNEL_MASK) | flag;
            writer.write_all(&entry.to_le_bytes())?;
        }
        Ok(())
    }

    /// Size of the encoded header in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> u64 {
        ((FIXED_WORDS + self.channel_modes.len()) * WORD_SIZE) as u64
    }

    /// Builds the channel mode table for `channel_limit`.
    ///
    /// Entries at or beyond the limit are dropped with a warning.
    #[must_use]
    pub fn mode_table(&self, channel_limit: u32) -> ChannelModeTable {
        let mut table = ChannelModeTable::new(channel_limit, self.default_mode);
        for &(channel_id, mode) in &self.channel_modes {
            if table.set(channel_id, mode).is_err() {
                log::warn!(
                    "ignoring mode entry for channel {channel_id}: outside limit {}",
                    table.limit()
                );
            }
        }
        table
    }
}
