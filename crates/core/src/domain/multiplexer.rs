//! Signal multiplexer
//!
//! Turns raw notifications from independent host channels into a single
//! stream of [`EnforcementEvent`]s for the registered authority:
//! - stream filtering (only the media stream, untagged counts as media)
//! - duplicate and out-of-order suppression
//! - debounce window for the change-notification channels
//! - echo suppression while the authority performs its own corrective write
//!
//! Dispatch is synchronous on the caller's thread. Callers keep one
//! delivery thread/task per channel so each channel stays in receipt order.

use crate::domain::event::{EnforcementEvent, KeyAction, KeyCode, RawKeyEvent, RawSignal, Verdict};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Consumer of normalized events
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: EnforcementEvent) -> Verdict;
}

/// Which event families a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub observations: bool,
    pub keys: bool,
}

impl Interest {
    pub const OBSERVATIONS: Self = Self {
        observations: true,
        keys: false,
    };

    pub const ALL: Self = Self {
        observations: true,
        keys: true,
    };
}

/// Handle returned by [`SignalMultiplexer::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: SubscriptionId,
    interest: Interest,
    sink: Arc<dyn EventSink>,
}

#[derive(Debug, Default)]
struct ObservationWindow {
    last_accepted: Option<Instant>,
    last_debounced: Option<Instant>,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MultiplexerStats {
    pub delivered: u64,
    pub coalesced: u64,
    pub filtered: u64,
    pub echoes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    coalesced: AtomicU64,
    filtered: AtomicU64,
    echoes: AtomicU64,
}

/// Single-subscriber fan-in of host notifications
pub struct SignalMultiplexer {
    debounce: Duration,
    registration: RwLock<Option<Registration>>,
    next_id: AtomicU64,
    window: Mutex<ObservationWindow>,
    self_write: AtomicBool,
    counters: Counters,
}

impl SignalMultiplexer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            registration: RwLock::new(None),
            next_id: AtomicU64::new(1),
            window: Mutex::new(ObservationWindow::default()),
            self_write: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Register the active authority. Replaces any previous subscriber.
    pub fn subscribe(&self, interest: Interest, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slot = self
            .registration
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.as_ref() {
            warn!(
                previous = previous.id.0,
                next = id.0,
                "Replacing an existing multiplexer subscription"
            );
        }
        *slot = Some(Registration { id, interest, sink });
        debug!(id = id.0, keys = interest.keys, "Multiplexer subscription registered");
        id
    }

    /// Remove a subscription; stale ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut slot = self
            .registration
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map(|r| r.id) == Some(id) {
            *slot = None;
            debug!(id = id.0, "Multiplexer subscription removed");
            true
        } else {
            false
        }
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.id)
            == Some(id)
    }

    pub fn has_subscriber(&self) -> bool {
        self.registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drop every subscription, e.g. when the host revoked our listeners
    pub fn clear(&self) {
        *self
            .registration
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn sink_for(&self, wants: impl Fn(Interest) -> bool) -> Option<Arc<dyn EventSink>> {
        self.registration
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|r| wants(r.interest))
            .map(|r| Arc::clone(&r.sink))
    }

    /// Normalize an observation notification, updating the window
    pub fn normalize_signal(&self, signal: RawSignal) -> Option<EnforcementEvent> {
        if !signal.concerns_media() {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            trace!(channel = %signal.channel, stream = ?signal.stream, "Ignoring non-media notification");
            return None;
        }

        if self.self_write.load(Ordering::Acquire) {
            self.counters.echoes.fetch_add(1, Ordering::AcqRel);
            trace!(channel = %signal.channel, "Dropping echo of our own correction");
            return None;
        }

        let at = signal.received_at;
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);

        if window.last_accepted.is_some_and(|last| at <= last) {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!(channel = %signal.channel, "Duplicate or superseded notification");
            return None;
        }

        if !signal.channel.bypasses_debounce() && !self.debounce.is_zero() {
            if let Some(last) = window.last_debounced {
                if at.duration_since(last) < self.debounce {
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!(channel = %signal.channel, "Notification inside debounce window");
                    return None;
                }
            }
            window.last_debounced = Some(at);
        }

        window.last_accepted = Some(at);
        Some(EnforcementEvent::VolumeObserved { at })
    }

    /// Normalize a raw key event; other keys produce nothing
    pub fn normalize_key(&self, key: RawKeyEvent) -> Option<EnforcementEvent> {
        let at = key.received_at;
        match key.key {
            KeyCode::VolumeUp => Some(EnforcementEvent::VolumeUpAttempted {
                repeat_count: key.repeat_count,
                at,
            }),
            KeyCode::VolumeDown => Some(EnforcementEvent::VolumeDownAttempted { at }),
            KeyCode::Other(_) => None,
        }
    }

    /// True when a newer observation was accepted after `event`
    pub fn is_superseded(&self, event: &EnforcementEvent) -> bool {
        match event {
            EnforcementEvent::VolumeObserved { at } => self
                .window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_accepted
                .is_some_and(|last| *at < last),
            _ => false,
        }
    }

    /// Input port for observation channels. Returns whether an event was delivered.
    pub fn on_signal(&self, signal: RawSignal) -> bool {
        let Some(sink) = self.sink_for(|i| i.observations) else {
            trace!(channel = %signal.channel, "No authority registered for observations");
            return false;
        };
        let Some(event) = self.normalize_signal(signal) else {
            return false;
        };
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        sink.deliver(event);
        true
    }

    /// Input port for intercepted keys. Every call gets exactly one verdict.
    pub fn on_key(&self, key: RawKeyEvent) -> Verdict {
        let Some(event) = self.normalize_key(key) else {
            return Verdict::Propagate;
        };
        let Some(sink) = self.sink_for(|i| i.keys) else {
            return Verdict::Propagate;
        };
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let verdict = sink.deliver(event);
        if verdict == Verdict::Consumed && key.action == KeyAction::Down {
            debug!(repeat = key.repeat_count, "Volume up key consumed");
        }
        verdict
    }

    /// Mark the span of a corrective write; observations during it are echoes
    ///
    /// The guard reports whether anything was swallowed, so the writer can
    /// re-read once in case a real change raced the write.
    pub fn self_write(&self) -> SelfWriteGuard<'_> {
        let echoes_before = self.counters.echoes.load(Ordering::Acquire);
        self.self_write.store(true, Ordering::Release);
        SelfWriteGuard {
            mux: self,
            echoes_before,
        }
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            echoes: self.counters.echoes.load(Ordering::Relaxed),
        }
    }
}

impl Default for SignalMultiplexer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

/// Clears the self-write flag on drop
pub struct SelfWriteGuard<'a> {
    mux: &'a SignalMultiplexer,
    echoes_before: u64,
}

impl SelfWriteGuard<'_> {
    /// True when a notification was dropped as an echo since the guard was taken
    pub fn swallowed(&self) -> bool {
        self.mux.counters.echoes.load(Ordering::Acquire) > self.echoes_before
    }
}

impl Drop for SelfWriteGuard<'_> {
    fn drop(&mut self) {
        self.mux.self_write.store(false, Ordering::Release);
    }
}
