//! Watchdog supervisor
//!
//! Keeps the intended authority alive across process lifecycle disruptions.
//! Invoked by an external periodic trigger (default every 15 minutes) and by
//! lifecycle notifications.

use crate::domain::arbiter::{ArbiterState, AuthorityArbiter, Revalidation};
use crate::domain::authority::{AuthorityError, AuthorityState};
use crate::domain::config::{CeilingCache, CeilingStore};
use crate::domain::host::{AuthorityKind, HostError};
use crate::domain::level::LevelSource;
use crate::domain::multiplexer::{MultiplexerStats, SignalMultiplexer};
use crate::domain::policy::allowed_level;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle notifications from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTrigger {
    Boot,
    ProcessStart,
    WatchdogTick,
    /// Device unlocked by the user
    UserPresent,
    UserEnabled,
    UserDisabled,
    CapabilityChanged { granted: bool },
    TaskRemoved,
    LowMemory,
    TrimMemory { level: i32 },
    ScreenOn,
    ScreenOff,
}

impl LifecycleTrigger {
    fn label(&self) -> &'static str {
        match self {
            LifecycleTrigger::Boot => "boot",
            LifecycleTrigger::ProcessStart => "process_start",
            LifecycleTrigger::WatchdogTick => "watchdog_tick",
            LifecycleTrigger::UserPresent => "user_present",
            LifecycleTrigger::UserEnabled => "user_enabled",
            LifecycleTrigger::UserDisabled => "user_disabled",
            LifecycleTrigger::CapabilityChanged { .. } => "capability_changed",
            LifecycleTrigger::TaskRemoved => "task_removed",
            LifecycleTrigger::LowMemory => "low_memory",
            LifecycleTrigger::TrimMemory { .. } => "trim_memory",
            LifecycleTrigger::ScreenOn => "screen_on",
            LifecycleTrigger::ScreenOff => "screen_off",
        }
    }
}

/// What a supervisor pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogOutcome {
    /// Enforcement is switched off; nothing was started
    Disabled,
    /// An authority was (re)started or switched
    Started(ArbiterState),
    /// The right authority was already running
    AlreadyRunning(Revalidation),
    /// Host refused a background start; retry on the next tick
    Deferred(HostError),
    Failed(AuthorityError),
    /// User disabled enforcement; every authority stopped
    Stopped,
    /// Diagnostic-only trigger
    Logged,
}

/// Diagnostic snapshot of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub state: ArbiterState,
    pub authority: Option<AuthorityKind>,
    pub authority_state: AuthorityState,
    pub corrections: u64,
    pub current_level: Option<u32>,
    pub max_level: Option<u32>,
    pub allowed_level: Option<u32>,
    pub percent: u8,
    pub enabled: bool,
    pub interception_granted: bool,
    pub subscribed: bool,
    pub multiplexer: MultiplexerStats,
}

/// Periodic supervisor of the active authority
pub struct WatchdogSupervisor {
    store: Arc<dyn CeilingStore>,
    cache: Arc<CeilingCache>,
    arbiter: Arc<AuthorityArbiter>,
    level: Arc<dyn LevelSource>,
    mux: Arc<SignalMultiplexer>,
    interval: Duration,
}

impl WatchdogSupervisor {
    pub fn new(
        store: Arc<dyn CeilingStore>,
        cache: Arc<CeilingCache>,
        arbiter: Arc<AuthorityArbiter>,
        level: Arc<dyn LevelSource>,
        mux: Arc<SignalMultiplexer>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            arbiter,
            level,
            mux,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn arbiter(&self) -> &Arc<AuthorityArbiter> {
        &self.arbiter
    }

    /// Start the appropriate authority if enforcement is enabled and none runs
    ///
    /// Idempotent: when already running it only re-validates registration
    /// and liveness.
    pub async fn ensure_running(&self, now: Instant) -> WatchdogOutcome {
        let config = self.cache.refresh(self.store.as_ref()).await;
        if !config.enabled {
            debug!("Enforcement disabled, watchdog takes no action");
            return WatchdogOutcome::Disabled;
        }

        let before = self.arbiter.reconcile();
        let revalidation = match self.arbiter.revalidate(now, self.interval) {
            Ok(revalidation) => revalidation,
            Err(e) => return self.start_failed(e),
        };

        match self.arbiter.activate() {
            Ok(state)
                if before != ArbiterState::NoAuthority
                    && state == before
                    && !revalidation.restarted =>
            {
                debug!(?state, "Authority already running");
                WatchdogOutcome::AlreadyRunning(revalidation)
            }
            Ok(state) => {
                info!(?state, "Watchdog started authority");
                WatchdogOutcome::Started(state)
            }
            Err(e) => self.start_failed(e),
        }
    }

    fn start_failed(&self, e: AuthorityError) -> WatchdogOutcome {
        match e {
            AuthorityError::Host(HostError::ForegroundStartRestricted) => {
                warn!("Host refused background start, retrying on next tick");
                WatchdogOutcome::Deferred(HostError::ForegroundStartRestricted)
            }
            e => {
                error!(error = %e, "Failed to start authority");
                WatchdogOutcome::Failed(e)
            }
        }
    }

    /// Dispatch a lifecycle notification
    pub async fn on_lifecycle(&self, trigger: LifecycleTrigger, now: Instant) -> WatchdogOutcome {
        info!(trigger = trigger.label(), "Lifecycle trigger");
        match trigger {
            LifecycleTrigger::Boot
            | LifecycleTrigger::ProcessStart
            | LifecycleTrigger::WatchdogTick => self.ensure_running(now).await,
            LifecycleTrigger::UserPresent => {
                self.log_state(trigger.label());
                self.ensure_running(now).await
            }
            LifecycleTrigger::UserEnabled => {
                if let Err(e) = self.store.set_enabled(true).await {
                    error!(error = %e, "Failed to persist enabled flag");
                }
                self.ensure_running(now).await
            }
            LifecycleTrigger::UserDisabled => {
                if let Err(e) = self.store.set_enabled(false).await {
                    error!(error = %e, "Failed to persist enabled flag");
                }
                self.cache.refresh(self.store.as_ref()).await;
                self.arbiter.deactivate();
                WatchdogOutcome::Stopped
            }
            LifecycleTrigger::CapabilityChanged { granted } => {
                if !self.cache.refresh(self.store.as_ref()).await.enabled {
                    self.arbiter.gate().clear_refusal();
                    return WatchdogOutcome::Disabled;
                }
                match self.arbiter.on_capability_changed(granted) {
                    Ok(ArbiterState::NoAuthority) => self.ensure_running(now).await,
                    Ok(state) => WatchdogOutcome::Started(state),
                    Err(e) => self.start_failed(e),
                }
            }
            LifecycleTrigger::TaskRemoved
            | LifecycleTrigger::LowMemory
            | LifecycleTrigger::TrimMemory { .. }
            | LifecycleTrigger::ScreenOn
            | LifecycleTrigger::ScreenOff => {
                self.log_state(trigger.label());
                WatchdogOutcome::Logged
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        let state = self.arbiter.state();
        let active = self.arbiter.active();
        let ceiling = self.cache.get();
        let snapshot = self.level.snapshot().ok();

        EngineStatus {
            state,
            authority: state.kind(),
            authority_state: active.map_or(AuthorityState::Inactive, |a| a.state()),
            corrections: active.map_or(0, |a| a.corrections()),
            current_level: snapshot.map(|s| s.current),
            max_level: snapshot.map(|s| s.max),
            allowed_level: snapshot.map(|s| allowed_level(s.max, ceiling.percent)),
            percent: ceiling.percent.get(),
            enabled: ceiling.enabled,
            interception_granted: self.arbiter.gate().interception_granted(),
            subscribed: self.mux.has_subscriber(),
            multiplexer: self.mux.stats(),
        }
    }

    /// Structured state dump for diagnosis-only notifications
    pub fn log_state(&self, context: &str) {
        let status = self.status();
        warn!(
            context,
            state = ?status.state,
            authority_state = %status.authority_state,
            subscribed = status.subscribed,
            current = ?status.current_level,
            max = ?status.max_level,
            corrections = status.corrections,
            "Engine state"
        );
    }
}
