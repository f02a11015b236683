//! Level source abstractions
//!
//! This module defines the interface to the controlled audio stream. The
//! engine never owns the device volume; it reads it fresh on every
//! evaluation and issues corrective writes through [`LevelSource`].
//! Platform implementations live in the `infra` crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while reading or writing the stream level
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LevelError {
    /// The level source could not be queried right now
    #[error("Level source unavailable: {0}")]
    Unavailable(String),

    /// The host refused the corrective write
    #[error("Level write rejected: {0}")]
    WriteRejected(String),

    /// The host reported a maximum level of zero
    #[error("Invalid maximum level: {0}")]
    InvalidMax(u32),
}

pub type Result<T> = std::result::Result<T, LevelError>;

/// Audio stream a volume notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    /// The primary media stream, the only one under a ceiling
    Media,
    /// Any other stream (ring, alarm, notification...)
    Other(i32),
}

/// Feedback behaviour for a level write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetLevelFlags {
    pub show_ui: bool,
    pub play_sound: bool,
}

impl SetLevelFlags {
    /// No on-screen slider, no feedback beep. Used for every corrective write.
    pub const SILENT: Self = Self {
        show_ui: false,
        play_sound: false,
    };
}

/// Point-in-time reading of the media stream
///
/// Never cached past a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    pub current: u32,
    pub max: u32,
}

impl LevelSnapshot {
    pub fn new(current: u32, max: u32) -> Self {
        Self { current, max }
    }
}

/// Trait for the controlled audio stream
///
/// Implementations must be cheap: calls happen inside the evaluation
/// critical section.
pub trait LevelSource: Send + Sync {
    /// Current level of the media stream
    fn current_level(&self) -> Result<u32>;

    /// Maximum level of the media stream
    fn max_level(&self) -> Result<u32>;

    /// Apply a new level to the media stream
    fn set_level(&self, level: u32, flags: SetLevelFlags) -> Result<()>;

    /// Read both values into a snapshot
    fn snapshot(&self) -> Result<LevelSnapshot> {
        let max = self.max_level()?;
        if max == 0 {
            return Err(LevelError::InvalidMax(max));
        }
        let current = self.current_level()?;
        Ok(LevelSnapshot { current, max })
    }
}
