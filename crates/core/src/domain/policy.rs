//! Ceiling policy
//!
//! Pure, deterministic decision functions. Nothing in here touches the
//! device or logs; callers feed in a fresh [`LevelSnapshot`] and act on the
//! returned [`Decision`].

use crate::domain::event::EnforcementEvent;
use crate::domain::level::LevelSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ceiling expressed as a percentage of the stream maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct CeilingPercent(u8);

impl CeilingPercent {
    pub const MIN: u8 = 0;
    pub const MAX: u8 = 100;
    pub const DEFAULT: u8 = 50;

    /// Out-of-range values are clamped into `0..=100`
    pub fn new(percent: i64) -> Self {
        Self(percent.clamp(Self::MIN as i64, Self::MAX as i64) as u8)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for CeilingPercent {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl From<u8> for CeilingPercent {
    fn from(value: u8) -> Self {
        Self::new(value as i64)
    }
}

impl From<CeilingPercent> for u8 {
    fn from(value: CeilingPercent) -> Self {
        value.0
    }
}

impl fmt::Display for CeilingPercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Highest level the media stream may sit at: `floor(max * percent / 100)`
pub fn allowed_level(max: u32, percent: CeilingPercent) -> u32 {
    (max as u64 * percent.get() as u64 / 100) as u32
}

/// Boundary rule for intercepted volume-up attempts
///
/// The level read back from the host can trail the OS counter by one step
/// while a key is held, so an interceptor that blocks exactly at the
/// boundary lets one extra step through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Block only once `current >= allowed`
    ReactiveAtBoundary,
    /// Block once `current >= allowed - 1`
    #[default]
    PreventiveAtBoundary,
    /// `allowed - 1` for key repeats only; a fresh press reads an up to
    /// date level and may take the last step
    RepeatGated,
}

impl TieBreak {
    fn blocks(self, current: u32, allowed: u32, repeat_count: u32) -> bool {
        let one_short = current.saturating_add(1) >= allowed;
        match self {
            TieBreak::ReactiveAtBoundary => current >= allowed,
            TieBreak::PreventiveAtBoundary => one_short,
            TieBreak::RepeatGated => current >= allowed || (repeat_count > 0 && one_short),
        }
    }
}

/// Outcome of one policy evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Nothing to do
    Allow,
    /// Write `to` back to the level source
    Clamp { to: u32 },
    /// Consume the key event; clamp as well when the level already overshot
    Block { clamp_to: Option<u32> },
}

impl Decision {
    /// Level the caller must write, if any
    pub fn correction(&self) -> Option<u32> {
        match *self {
            Decision::Allow => None,
            Decision::Clamp { to } => Some(to),
            Decision::Block { clamp_to } => clamp_to,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Decision::Block { .. })
    }
}

/// Decide what to do about `event` given the current level
pub fn decide(current: u32, allowed: u32, event: &EnforcementEvent, tie_break: TieBreak) -> Decision {
    match event {
        EnforcementEvent::VolumeObserved { .. } => {
            if current > allowed {
                Decision::Clamp { to: allowed }
            } else {
                Decision::Allow
            }
        }
        EnforcementEvent::VolumeUpAttempted { repeat_count, .. } => {
            if tie_break.blocks(current, allowed, *repeat_count) {
                Decision::Block {
                    clamp_to: (current > allowed).then_some(allowed),
                }
            } else {
                Decision::Allow
            }
        }
        EnforcementEvent::VolumeDownAttempted { .. } => Decision::Allow,
    }
}

/// Convenience wrapper over a snapshot
pub fn evaluate(
    snapshot: LevelSnapshot,
    percent: CeilingPercent,
    event: &EnforcementEvent,
    tie_break: TieBreak,
) -> (u32, Decision) {
    let allowed = allowed_level(snapshot.max, percent);
    (allowed, decide(snapshot.current, allowed, event, tie_break))
}
