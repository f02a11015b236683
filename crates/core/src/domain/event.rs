//! Raw host notifications and the canonical enforcement events derived from them

use crate::domain::level::StreamType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Host channel a raw notification arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalChannel {
    /// Periodic polling timer
    PollTick,
    /// Settings-change watch on the stored volume value
    SettingsChange,
    /// System "volume changed" broadcast
    Broadcast,
    /// Raw key / media-button interception
    KeyInterception,
    /// Forced re-check after the ceiling itself changed
    CeilingUpdate,
}

impl SignalChannel {
    /// Backstop channels are never debounced
    pub fn bypasses_debounce(self) -> bool {
        matches!(self, SignalChannel::PollTick | SignalChannel::CeilingUpdate)
    }
}

impl fmt::Display for SignalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalChannel::PollTick => "poll_tick",
            SignalChannel::SettingsChange => "settings_change",
            SignalChannel::Broadcast => "broadcast",
            SignalChannel::KeyInterception => "key_interception",
            SignalChannel::CeilingUpdate => "ceiling_update",
        };
        f.write_str(name)
    }
}

/// Raw "volume may have changed" notification from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSignal {
    pub channel: SignalChannel,
    /// `None` when the host did not tag the notification with a stream
    pub stream: Option<StreamType>,
    pub received_at: Instant,
}

impl RawSignal {
    pub fn new(channel: SignalChannel, stream: Option<StreamType>, received_at: Instant) -> Self {
        Self {
            channel,
            stream,
            received_at,
        }
    }

    /// Untagged notifications are treated as media stream changes
    pub fn concerns_media(&self) -> bool {
        matches!(self.stream, None | Some(StreamType::Media))
    }
}

/// Key code of an intercepted key event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyCode {
    VolumeUp,
    VolumeDown,
    Other(u32),
}

/// Key action of an intercepted key event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAction {
    Down,
    Up,
}

/// Raw key or media-button event, seen before the OS handles it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawKeyEvent {
    pub key: KeyCode,
    pub action: KeyAction,
    pub repeat_count: u32,
    pub received_at: Instant,
}

impl RawKeyEvent {
    pub fn new(key: KeyCode, action: KeyAction, repeat_count: u32, received_at: Instant) -> Self {
        Self {
            key,
            action,
            repeat_count,
            received_at,
        }
    }
}

/// Answer returned to the originator of a raw key event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    /// Swallow the event; the OS never sees it
    Consumed,
    /// Let the OS handle the event normally
    Propagate,
}

/// Canonical event consumed exactly once by the active authority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementEvent {
    VolumeObserved { at: Instant },
    VolumeUpAttempted { repeat_count: u32, at: Instant },
    VolumeDownAttempted { at: Instant },
}

impl EnforcementEvent {
    pub fn at(&self) -> Instant {
        match *self {
            EnforcementEvent::VolumeObserved { at }
            | EnforcementEvent::VolumeUpAttempted { at, .. }
            | EnforcementEvent::VolumeDownAttempted { at } => at,
        }
    }

    /// Attempts come from intercepted keys, observations from everything else
    pub fn is_attempt(&self) -> bool {
        !matches!(self, EnforcementEvent::VolumeObserved { .. })
    }
}
