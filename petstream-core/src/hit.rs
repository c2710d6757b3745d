//! Hit record types shared by every pipeline stage.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Number of clock periods in one front-end frame.
pub const CLOCKS_PER_FRAME: i64 = 1024;

/// Operating mode of a front-end channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ChannelMode {
    /// Charge integration: the event word carries an integrated charge.
    Qdc,
    /// Time over threshold: the event word carries a pulse width.
    #[default]
    Tot,
}

impl ChannelMode {
    /// Returns true for charge-integration mode.
    #[inline]
    #[must_use]
    pub fn is_qdc(self) -> bool {
        matches!(self, ChannelMode::Qdc)
    }

    /// Maps the header mode flag (set = QDC) to a mode.
    #[inline]
    #[must_use]
    pub fn from_qdc_flag(qdc: bool) -> Self {
        if qdc {
            ChannelMode::Qdc
        } else {
            ChannelMode::Tot
        }
    }
}

/// Mode-dependent energy measurement of a raw hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Measurement {
    /// Integrated charge in ADC counts.
    Charge(u16),
    /// Pulse width in clock periods.
    Width(i64),
}

/// Records that carry a timestamp in clock periods.
///
/// Overlapped stages use this to select the trailing window of the
/// previous buffer.
pub trait Timestamped {
    /// Returns the record time in clock periods.
    fn time(&self) -> i64;
}

/// A decoded, uncalibrated front-end hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawHit {
    /// Global channel identifier.
    pub channel_id: u32,
    /// TDC/QDC analog channel used by the hit.
    pub tac_id: u8,
    /// Absolute frame identifier the hit was read from.
    pub frame_id: u64,
    /// Coarse time of the leading edge (clock periods within the frame).
    pub t_coarse: u16,
    /// Coarse time of the trailing edge or integration end.
    pub e_coarse: u16,
    /// Fine time of the leading edge (TDC counts).
    pub t_fine: u16,
    /// Fine energy: charge (QDC) or trailing-edge fine time (TOT).
    pub e_fine: u16,
    /// Leading-edge time in clock periods relative to the time reference.
    pub time: i64,
    /// Trailing-edge time in clock periods relative to the time reference.
    pub time_end: i64,
    /// Operating mode the hit was decoded with.
    pub mode: ChannelMode,
}

impl RawHit {
    /// Returns the mode-dependent measurement carried by this hit.
    #[inline]
    #[must_use]
    pub fn measurement(&self) -> Measurement {
        match self.mode {
            ChannelMode::Qdc => Measurement::Charge(self.e_fine),
            ChannelMode::Tot => Measurement::Width(self.time_end - self.time),
        }
    }

    /// Returns true when the hit was decoded in charge-integration mode.
    #[inline]
    #[must_use]
    pub fn is_qdc(&self) -> bool {
        self.mode.is_qdc()
    }
}

impl Timestamped for RawHit {
    #[inline]
    fn time(&self) -> i64 {
        self.time
    }
}
