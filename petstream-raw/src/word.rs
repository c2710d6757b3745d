//! Front-end frame and event word layouts.
//!
//! Data files are sequences of 64-bit little-endian words. A frame starts
//! with two header words followed by one word per event:
//!
//! ```text
//! header A  [35:0]  frame id
//! header B  [15:0]  event count   [16] frame lost
//! event     [9:0] e_fine  [19:10] t_fine  [29:20] e_coarse  [39:30] t_coarse
//!           [41:40] tac id  [63:42] channel id
//! ```

/// Width of the channel id field.
pub const CHANNEL_ID_BITS: u32 = 22;

/// Number of channel ids the event word can address.
pub const MAX_NUMBER_CHANNELS: u32 = 1 << CHANNEL_ID_BITS;

/// Mask of the 36-bit frame id.
pub const FRAME_ID_MASK: u64 = (1 << 36) - 1;

/// Size of one word in bytes.
pub const WORD_SIZE: usize = 8;

const FIELD_10_BITS: u64 = 0x3FF;

/// A raw 64-bit event word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventWord(pub u64);

impl EventWord {
    /// Wraps a raw word.
    #[inline]
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Packs the event fields into a word. Fields are truncated to width.
    #[inline]
    #[must_use]
    pub fn from_fields(
        channel_id: u32,
        tac_id: u8,
        t_coarse: u16,
        e_coarse: u16,
        t_fine: u16,
        e_fine: u16,
    ) -> Self {
        let channel = u64::from(channel_id) & (u64::from(MAX_NUMBER_CHANNELS) - 1);
        Self(
            (channel << 42)
                | ((u64::from(tac_id) & 0x3) << 40)
                | ((u64::from(t_coarse) & FIELD_10_BITS) << 30)
                | ((u64::from(e_coarse) & FIELD_10_BITS) << 20)
                | ((u64::from(t_fine) & FIELD_10_BITS) << 10)
                | (u64::from(e_fine) & FIELD_10_BITS),
        )
    }

    /// Raw word value.
    #[inline]
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Global channel id.
    #[inline]
    #[must_use]
    pub fn channel_id(self) -> u32 {
        (self.0 >> 42) as u32
    }

    /// TAC id.
    #[inline]
    #[must_use]
    pub fn tac_id(self) -> u8 {
        ((self.0 >> 40) & 0x3) as u8
    }

    /// Leading-edge coarse time.
    #[inline]
    #[must_use]
    pub fn t_coarse(self) -> u16 {
        ((self.0 >> 30) & FIELD_10_BITS) as u16
    }

    /// Trailing-edge or integration-end coarse time.
    #[inline]
    #[must_use]
    pub fn e_coarse(self) -> u16 {
        ((self.0 >> 20) & FIELD_10_BITS) as u16
    }

    /// Leading-edge fine time.
    #[inline]
    #[must_use]
    pub fn t_fine(self) -> u16 {
        ((self.0 >> 10) & FIELD_10_BITS) as u16
    }

    /// Charge (QDC) or trailing-edge fine time (TOT).
    #[inline]
    #[must_use]
    pub fn e_fine(self) -> u16 {
        (self.0 & FIELD_10_BITS) as u16
    }
}

/// Header of one data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Absolute frame id (36 bits).
    pub frame_id: u64,
    /// Number of event words that follow.
    pub n_events: u16,
    /// Set when the front-end dropped events in this frame.
    pub frame_lost: bool,
}

impl FrameHeader {
    /// Number of header words.
    pub const WORDS: usize = 2;

    /// Size of the header in bytes.
    pub const BYTES: usize = Self::WORDS * WORD_SIZE;

    /// Parses the two header words.
    #[inline]
    #[must_use]
    pub fn parse(word_a: u64, word_b: u64) -> Self {
        Self {
            frame_id: word_a & FRAME_ID_MASK,
            n_events: (word_b & 0xFFFF) as u16,
            frame_lost: (word_b & 0x1_0000) != 0,
        }
    }

    /// Parses the header from 16 little-endian bytes.
    #[inline]
    #[must_use]
    pub fn from_le_bytes(bytes: [u8; Self::BYTES]) -> Self {
        let mut a = [0u8; WORD_SIZE];
        let mut b = [0u8; WORD_SIZE];
        a.copy_from_slice(&bytes[..WORD_SIZE]);
        b.copy_from_slice(&bytes[WORD_SIZE..]);
        Self::parse(u64::from_le_bytes(a), u64::from_le_bytes(b))
    }

    /// Encodes the header words.
    #[inline]
    #[must_use]
    pub fn encode(&self) -> [u64; Self::WORDS] {
        let lost = if self.frame_lost { 0x1_0000 } else { 0 };
        [
            self.frame_id & FRAME_ID_MASK,
            u64::from(self.n_events) | lost,
        ]
    }

    /// Size of the whole frame (header plus events) in bytes.
    #[inline]
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        Self::BYTES + usize::from(self.n_events) * WORD_SIZE
    }
}
