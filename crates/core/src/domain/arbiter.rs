//! Authority arbiter
//!
//! Picks which authority may run and keeps the two mutually exclusive. The
//! check is repeated on every lifecycle re-entry (process start, watchdog
//! tick, capability change), since the user can toggle the interception
//! grant at any time.

use crate::domain::authority::{Authority, AuthorityError, StartOutcome};
use crate::domain::host::{AuthorityKind, CapabilityGate, HostError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Which authority is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbiterState {
    NoAuthority,
    ReactiveActive,
    PreventiveActive,
}

impl ArbiterState {
    pub fn kind(self) -> Option<AuthorityKind> {
        match self {
            ArbiterState::NoAuthority => None,
            ArbiterState::ReactiveActive => Some(AuthorityKind::Reactive),
            ArbiterState::PreventiveActive => Some(AuthorityKind::Preventive),
        }
    }
}

/// Outcome of a liveness check on the running authority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Revalidation {
    pub reregistered: bool,
    pub restarted: bool,
}

/// Mutual exclusion between the reactive and preventive authorities
pub struct AuthorityArbiter {
    reactive: Arc<dyn Authority>,
    preventive: Arc<dyn Authority>,
    gate: Arc<CapabilityGate>,
    transition: Mutex<()>,
}

impl AuthorityArbiter {
    pub fn new(
        reactive: Arc<dyn Authority>,
        preventive: Arc<dyn Authority>,
        gate: Arc<CapabilityGate>,
    ) -> Self {
        Self {
            reactive,
            preventive,
            gate,
            transition: Mutex::new(()),
        }
    }

    pub fn gate(&self) -> &Arc<CapabilityGate> {
        &self.gate
    }

    pub fn authority(&self, kind: AuthorityKind) -> &Arc<dyn Authority> {
        match kind {
            AuthorityKind::Reactive => &self.reactive,
            AuthorityKind::Preventive => &self.preventive,
        }
    }

    /// Current state, derived from the authorities themselves
    pub fn state(&self) -> ArbiterState {
        if self.preventive.is_active() {
            ArbiterState::PreventiveActive
        } else if self.reactive.is_active() {
            ArbiterState::ReactiveActive
        } else {
            ArbiterState::NoAuthority
        }
    }

    pub fn both_active(&self) -> bool {
        self.reactive.is_active() && self.preventive.is_active()
    }

    pub fn active(&self) -> Option<&Arc<dyn Authority>> {
        self.state().kind().map(|kind| self.authority(kind))
    }

    /// Resolve a double activation in favour of the preventive authority
    pub fn reconcile(&self) -> ArbiterState {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.reconcile_locked()
    }

    fn reconcile_locked(&self) -> ArbiterState {
        if self.both_active() {
            warn!("Both authorities active, stopping the reactive one");
            self.reactive.stop();
        }
        self.state()
    }

    /// Start whichever authority fits the current capability
    ///
    /// The preventive start is attempted while the reactive authority keeps
    /// running; it only stands down once interception is confirmed. Any host
    /// refusal falls back to the reactive authority.
    pub fn activate(&self) -> Result<ArbiterState, AuthorityError> {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.reconcile_locked();
        self.gate.clear_deferral();

        if self.gate.preventive_available() {
            match self.preventive.start() {
                Ok(_) => {
                    self.gate.clear_refusal();
                    if self.reactive.is_active() {
                        info!("Preventive interception active, stopping reactive authority");
                        self.reactive.stop();
                    }
                    return Ok(self.state());
                }
                Err(AuthorityError::Host(HostError::PrivilegeDenied(reason))) => {
                    warn!(%reason, "Privileged start denied, falling back to reactive authority");
                    self.gate.mark_preventive_refused();
                }
                Err(AuthorityError::Host(e)) => {
                    warn!(error = %e, "Privileged start refused, reactive authority covers until the next attempt");
                    self.gate.defer_preventive();
                }
                Err(AuthorityError::PreventiveUnavailable) => {
                    warn!("Interception grant vanished during start, falling back to reactive authority");
                }
            }
        } else if self.preventive.is_active() {
            info!("Interception no longer available, stopping preventive authority");
            self.preventive.stop();
        }

        match self.reactive.start()? {
            StartOutcome::Sticky => {}
            StartOutcome::NotSticky => {
                info!("Reactive authority declined to start");
            }
        }
        Ok(self.state())
    }

    /// Capability toggled outside the engine
    ///
    /// Only reshuffles when something is running; whether anything should
    /// run at all is the watchdog's decision.
    pub fn on_capability_changed(&self, granted: bool) -> Result<ArbiterState, AuthorityError> {
        info!(granted, "Interception capability changed");
        self.gate.clear_refusal();
        if self.state() == ArbiterState::NoAuthority {
            return Ok(ArbiterState::NoAuthority);
        }
        self.activate()
    }

    /// Stop every authority
    pub fn deactivate(&self) -> ArbiterState {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.preventive.stop();
        self.reactive.stop();
        info!("All authorities stopped");
        ArbiterState::NoAuthority
    }

    /// Re-register dropped subscriptions and restart an unresponsive authority
    pub fn revalidate(&self, now: Instant, max_stall: Duration) -> Result<Revalidation, AuthorityError> {
        let Some(active) = self.active().cloned() else {
            return Ok(Revalidation::default());
        };

        let reregistered = active.revalidate();
        if active.probe(now) {
            return Ok(Revalidation {
                reregistered,
                restarted: false,
            });
        }

        let stalled = active
            .last_heartbeat()
            .map_or(true, |hb| now.saturating_duration_since(hb) > max_stall);
        if !stalled {
            return Ok(Revalidation {
                reregistered,
                restarted: false,
            });
        }

        error!(kind = %active.kind(), "Authority unresponsive, restarting");
        {
            let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
            active.abandon();
        }
        self.activate()?;
        Ok(Revalidation {
            reregistered,
            restarted: true,
        })
    }
}
