//! Engine assembly
//!
//! Wires the multiplexer, both authorities, the arbiter and the watchdog
//! around the three host collaborators.

use crate::domain::arbiter::AuthorityArbiter;
use crate::domain::authority::{Enforcer, PreventiveInterceptor, ReactiveCorrector};
use crate::domain::config::{CeilingCache, CeilingStore, ConfigChange, EngineConfig};
use crate::domain::event::{RawKeyEvent, RawSignal, SignalChannel, Verdict};
use crate::domain::host::{CapabilityGate, HostEnvironment};
use crate::domain::level::LevelSource;
use crate::domain::multiplexer::SignalMultiplexer;
use crate::domain::watchdog::{EngineStatus, LifecycleTrigger, WatchdogOutcome, WatchdogSupervisor};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Host collaborators the engine runs against
#[derive(Clone)]
pub struct Collaborators {
    pub level: Arc<dyn LevelSource>,
    pub host: Arc<dyn HostEnvironment>,
    pub store: Arc<dyn CeilingStore>,
}

/// Fully wired enforcement engine
pub struct EnforcementEngine {
    config: EngineConfig,
    store: Arc<dyn CeilingStore>,
    cache: Arc<CeilingCache>,
    mux: Arc<SignalMultiplexer>,
    arbiter: Arc<AuthorityArbiter>,
    supervisor: Arc<WatchdogSupervisor>,
}

impl EnforcementEngine {
    pub async fn build(collaborators: Collaborators, config: EngineConfig) -> Self {
        let Collaborators { level, host, store } = collaborators;

        let cache = Arc::new(CeilingCache::default());
        let initial = cache.refresh(store.as_ref()).await;
        let mux = Arc::new(SignalMultiplexer::new(config.debounce()));
        let gate = Arc::new(CapabilityGate::new(host));

        let enforcer = || {
            Arc::new(Enforcer::new(
                level.clone(),
                cache.clone(),
                mux.clone(),
                config.tie_break,
            ))
        };
        let reactive = Arc::new(ReactiveCorrector::new(enforcer(), mux.clone(), gate.clone()));
        let preventive = Arc::new(PreventiveInterceptor::new(enforcer(), mux.clone(), gate.clone()));
        let arbiter = Arc::new(AuthorityArbiter::new(reactive, preventive, gate));

        let supervisor = Arc::new(WatchdogSupervisor::new(
            store.clone(),
            cache.clone(),
            arbiter.clone(),
            level,
            mux.clone(),
            config.watchdog_interval(),
        ));

        info!(
            percent = %initial.percent,
            enabled = initial.enabled,
            tie_break = ?config.tie_break,
            debounce_ms = config.debounce_ms,
            "Enforcement engine assembled"
        );

        Self {
            config,
            store,
            cache,
            mux,
            arbiter,
            supervisor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CeilingStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<CeilingCache> {
        &self.cache
    }

    pub fn multiplexer(&self) -> &Arc<SignalMultiplexer> {
        &self.mux
    }

    pub fn arbiter(&self) -> &Arc<AuthorityArbiter> {
        &self.arbiter
    }

    pub fn supervisor(&self) -> &Arc<WatchdogSupervisor> {
        &self.supervisor
    }

    /// Observation input port
    pub fn on_signal(&self, signal: RawSignal) -> bool {
        self.mux.on_signal(signal)
    }

    /// Key interception input port
    pub fn on_key(&self, key: RawKeyEvent) -> Verdict {
        self.mux.on_key(key)
    }

    pub async fn on_lifecycle(&self, trigger: LifecycleTrigger, now: Instant) -> WatchdogOutcome {
        self.supervisor.on_lifecycle(trigger, now).await
    }

    /// Apply a store notification to the cache
    ///
    /// A moved ceiling forces an immediate re-check; a flipped enabled flag
    /// starts or stops enforcement to match the stored value.
    pub async fn on_config_change(&self, change: ConfigChange, now: Instant) -> Option<WatchdogOutcome> {
        let was_enabled = self.cache.enabled();
        let percent_moved = self.cache.apply(change);

        if percent_moved {
            info!(percent = %self.cache.percent(), "Ceiling changed, re-checking level");
            self.mux
                .on_signal(RawSignal::new(SignalChannel::CeilingUpdate, None, now));
        }

        match (was_enabled, self.cache.enabled()) {
            (false, true) => Some(self.supervisor.ensure_running(now).await),
            (true, false) => {
                self.arbiter.deactivate();
                Some(WatchdogOutcome::Stopped)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.supervisor.status()
    }

    /// Stop every authority
    pub fn shutdown(&self) {
        self.arbiter.deactivate();
    }
}
