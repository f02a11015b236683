//! In-process simulated device and host
//!
//! Models the OS media volume counter together with the host behaviours the
//! engine has to cope with:
//! - slow, failing or stale level reads
//! - rejected writes
//! - a revocable interception grant and background-start restrictions
//! - the "volume changed" notifications that follow every level change

use super::{HostChannels, InterceptionHook};
use crossbeam::channel::{unbounded, Sender};
use earguard_core::domain::level::Result as LevelResult;
use earguard_core::domain::{
    AuthorityKind, HostEnvironment, HostError, KeyAction, KeyCode, LevelError, LevelSource,
    LifecycleTrigger, RawKeyEvent, RawSignal, SetLevelFlags, SignalChannel, StreamType, Verdict,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Simulated device volume and host environment
pub struct SimulatedHost {
    current: AtomicU32,
    previous: AtomicU32,
    max: u32,
    read_delay_us: AtomicU64,
    stale_reads: AtomicBool,
    lagging: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    granted: AtomicBool,
    restricted: AtomicBool,
    preventive_restricted: AtomicBool,
    privilege_denied: AtomicBool,
    writes: AtomicU64,
    hook: RwLock<Option<InterceptionHook>>,
    settings_tx: Sender<RawSignal>,
    broadcast_tx: Sender<RawSignal>,
    lifecycle_tx: Sender<LifecycleTrigger>,
    channels: Mutex<Option<HostChannels>>,
}

impl SimulatedHost {
    /// Create a device with `max` steps currently at `initial`
    pub fn new(max: u32, initial: u32) -> Self {
        let (settings_tx, settings) = unbounded();
        let (broadcast_tx, broadcast) = unbounded();
        let (lifecycle_tx, lifecycle) = unbounded();

        Self {
            current: AtomicU32::new(initial.min(max)),
            previous: AtomicU32::new(initial.min(max)),
            max,
            read_delay_us: AtomicU64::new(0),
            stale_reads: AtomicBool::new(false),
            lagging: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            granted: AtomicBool::new(false),
            restricted: AtomicBool::new(false),
            preventive_restricted: AtomicBool::new(false),
            privilege_denied: AtomicBool::new(false),
            writes: AtomicU64::new(0),
            hook: RwLock::new(None),
            settings_tx,
            broadcast_tx,
            lifecycle_tx,
            channels: Mutex::new(Some(HostChannels {
                settings,
                broadcast,
                lifecycle,
            })),
        }
    }

    /// Hand out the notification receivers. Only the first call gets them.
    pub fn take_channels(&self) -> Option<HostChannels> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Raw counter value, bypassing staleness, delay and failure injection
    pub fn level(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Number of level writes that went through `set_level`
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Slow every level read down by `delay`
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_us
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// While a volume key repeats, reads return the level from one step back
    pub fn set_stale_reads(&self, stale: bool) {
        self.stale_reads.store(stale, Ordering::Release);
        if !stale {
            self.lagging.store(false, Ordering::Release);
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Grant or revoke key interception, notifying the engine on change
    pub fn set_interception_granted(&self, granted: bool) {
        if self.granted.swap(granted, Ordering::AcqRel) != granted {
            info!(granted, "Simulated interception grant changed");
            self.notify(LifecycleTrigger::CapabilityChanged { granted });
        }
    }

    /// Refuse every background start with a foreground-start restriction
    pub fn set_start_restricted(&self, restricted: bool) {
        self.restricted.store(restricted, Ordering::Release);
    }

    /// Refuse only the preventive start with a foreground-start restriction
    pub fn set_preventive_restricted(&self, restricted: bool) {
        self.preventive_restricted.store(restricted, Ordering::Release);
    }

    /// Refuse privileged (preventive) starts even while the grant is held
    pub fn set_privilege_denied(&self, denied: bool) {
        self.privilege_denied.store(denied, Ordering::Release);
    }

    pub fn install_hook(&self, hook: InterceptionHook) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn remove_hook(&self) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Deliver a lifecycle notification to whoever pumps the host channels
    pub fn notify(&self, trigger: LifecycleTrigger) {
        if self.lifecycle_tx.send(trigger).is_err() {
            trace!(?trigger, "No lifecycle listener");
        }
    }

    /// Press a hardware key
    ///
    /// With the grant held, the interception hook sees the event first and
    /// may consume it. Otherwise a volume key moves the level by one step on
    /// its down action, the way the OS would.
    pub fn press_key(&self, key: KeyCode, action: KeyAction, repeat_count: u32) -> Verdict {
        let event = RawKeyEvent::new(key, action, repeat_count, Instant::now());

        if self.granted.load(Ordering::Acquire) {
            let hook = self
                .hook
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(hook) = hook {
                if hook(event) == Verdict::Consumed {
                    trace!(?key, ?action, repeat_count, "Key consumed by interception hook");
                    return Verdict::Consumed;
                }
            }
        }

        if action == KeyAction::Down {
            let current = self.level();
            let next = match key {
                KeyCode::VolumeUp => current.saturating_add(1).min(self.max),
                KeyCode::VolumeDown => current.saturating_sub(1),
                KeyCode::Other(_) => current,
            };
            self.apply(next, repeat_count > 0);
        }
        Verdict::Propagate
    }

    /// Move the level from outside the engine (slider, another app)
    pub fn user_set_level(&self, level: u32) {
        self.apply(level.min(self.max), false);
    }

    /// Broadcast a level change on a stream the engine does not police
    pub fn emit_other_stream_change(&self, stream: i32) {
        let signal = RawSignal::new(
            SignalChannel::Broadcast,
            Some(StreamType::Other(stream)),
            Instant::now(),
        );
        let _ = self.broadcast_tx.send(signal);
    }

    /// `repeating` marks a step taken by a held key
    fn apply(&self, level: u32, repeating: bool) {
        let previous = self.current.swap(level, Ordering::AcqRel);
        self.previous.store(previous, Ordering::Release);
        self.lagging.store(
            repeating && self.stale_reads.load(Ordering::Acquire),
            Ordering::Release,
        );
        if previous != level {
            debug!(from = previous, to = level, "Simulated level changed");
            self.emit_change();
        }
    }

    /// Every level change produces a settings notification and a broadcast
    fn emit_change(&self) {
        let now = Instant::now();
        let settings = RawSignal::new(SignalChannel::SettingsChange, None, now);
        let broadcast = RawSignal::new(SignalChannel::Broadcast, Some(StreamType::Media), now);

        let settings_sent = self.settings_tx.send(settings).is_ok();
        let broadcast_sent = self.broadcast_tx.send(broadcast).is_ok();
        if !(settings_sent && broadcast_sent) {
            trace!("Notification receivers dropped");
        }
    }
}

impl LevelSource for SimulatedHost {
    fn current_level(&self) -> LevelResult<u32> {
        let delay = self.read_delay_us.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_micros(delay));
        }
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(LevelError::Unavailable("injected read failure".to_string()));
        }
        if self.lagging.load(Ordering::Acquire) {
            return Ok(self.previous.load(Ordering::Acquire));
        }
        Ok(self.level())
    }

    fn max_level(&self) -> LevelResult<u32> {
        Ok(self.max)
    }

    fn set_level(&self, level: u32, flags: SetLevelFlags) -> LevelResult<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(LevelError::WriteRejected("injected write failure".to_string()));
        }
        if level > self.max {
            return Err(LevelError::WriteRejected(format!(
                "level {} above maximum {}",
                level, self.max
            )));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        trace!(level, show_ui = flags.show_ui, play_sound = flags.play_sound, "Level write");
        self.apply(level, false);
        Ok(())
    }
}

impl HostEnvironment for SimulatedHost {
    fn interception_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    fn admit(&self, kind: AuthorityKind) -> Result<(), HostError> {
        if self.restricted.load(Ordering::Acquire) {
            return Err(HostError::ForegroundStartRestricted);
        }
        if kind == AuthorityKind::Preventive {
            if self.preventive_restricted.load(Ordering::Acquire) {
                return Err(HostError::ForegroundStartRestricted);
            }
            if self.privilege_denied.load(Ordering::Acquire) {
                return Err(HostError::PrivilegeDenied(
                    "simulated host refuses privileged start".to_string(),
                ));
            }
        }
        Ok(())
    }
}
