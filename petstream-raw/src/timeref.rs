//! Time reference selection.
//!
//! Hit times are expressed in clock periods. One frame spans
//! [`CLOCKS_PER_FRAME`] clocks and the frame counter starts at the
//! synchronization epoch, so `frame_id * 1024` is the frame start relative
//! to that epoch. The time reference chooses which origin is subtracted.

use crate::word::FRAME_ID_MASK;
use crate::Error;
use petstream_core::CLOCKS_PER_FRAME;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Caller-supplied mapping from frame id to frame start time.
#[derive(Clone)]
pub struct UserClock(Arc<dyn Fn(u64) -> i64 + Send + Sync>);

impl UserClock {
    /// Wraps a frame-id to clock-period mapping.
    pub fn new<F>(frame_start: F) -> Self
    where
        F: Fn(u64) -> i64 + Send + Sync + 'static,
    {
        Self(Arc::new(frame_start))
    }

    /// Start time of `frame_id`.
    #[inline]
    #[must_use]
    pub fn frame_start(&self, frame_id: u64) -> i64 {
        (self.0)(frame_id)
    }
}

impl fmt::Debug for UserClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UserClock(..)")
    }
}

/// Origin of hit timestamps, fixed for the lifetime of a reader.
#[derive(Debug, Clone, Default)]
pub enum TimeReference {
    /// Relative to the synchronization epoch recorded in the file.
    #[default]
    Sync,
    /// Relative to the DAQ time at which the file was created.
    Wall,
    /// Relative to the first frame of the current step.
    Step,
    /// Translated by caller-supplied logic.
    User(UserClock),
}

impl TimeReference {
    /// Short lowercase name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            TimeReference::Sync => "sync",
            TimeReference::Wall => "wall",
            TimeReference::Step => "step",
            TimeReference::User(_) => "user",
        }
    }
}

impl fmt::Display for TimeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TimeReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(TimeReference::Sync),
            "wall" => Ok(TimeReference::Wall),
            "step" => Ok(TimeReference::Step),
            "user" => Err(Error::Config(
                "the user time reference needs a clock function and cannot be parsed".to_string(),
            )),
            other => Err(Error::Config(format!("unknown time reference '{other}'"))),
        }
    }
}

#[derive(Debug, Clone)]
enum Origin {
    Offset(i64),
    User(UserClock),
}

/// Frame-to-time translation resolved for one step.
#[derive(Debug, Clone)]
pub struct FrameClock {
    origin: Origin,
}

impl FrameClock {
    /// Resolves `reference` for a step starting at `step_first_frame`.
    ///
    /// `file_creation_daq_time` is in clock periods since the sync epoch.
    #[must_use]
    pub fn resolve(
        reference: &TimeReference,
        file_creation_daq_time: u64,
        step_first_frame: u64,
    ) -> Self {
        let origin = match reference {
            TimeReference::Sync => Origin::Offset(0),
            TimeReference::Wall => {
                Origin::Offset(i64::try_from(file_creation_daq_time).unwrap_or(i64::MAX))
            }
            TimeReference::Step => Origin::Offset(frame_clock(step_first_frame)),
            TimeReference::User(clock) => Origin::User(clock.clone()),
        };
        Self { origin }
    }

    /// Start time of `frame_id` in clock periods.
    #[inline]
    #[must_use]
    pub fn frame_start(&self, frame_id: u64) -> i64 {
        match &self.origin {
            Origin::Offset(offset) => frame_clock(frame_id) - offset,
            Origin::User(clock) => clock.frame_start(frame_id),
        }
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self {
            origin: Origin::Offset(0),
        }
    }
}

/// Clock count at the start of `frame_id`, relative to the sync epoch.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn frame_clock(frame_id: u64) -> i64 {
    // 36-bit frame ids times 1024 always fit in i64.
    ((frame_id & FRAME_ID_MASK) as i64) * CLOCKS_PER_FRAME
}
