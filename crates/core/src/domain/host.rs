//! Host environment: interception capability and background-start admission

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised when the host refuses to run an authority
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    /// Background process may not start a long-running foreground task right now
    #[error("Foreground start not allowed from the background")]
    ForegroundStartRestricted,

    /// Privileged key interception was requested but refused
    #[error("Privileged interception denied: {0}")]
    PrivilegeDenied(String),

    /// Any other host failure
    #[error("Host unavailable: {0}")]
    Unavailable(String),
}

/// Enforcement strategy variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityKind {
    /// Observes applied changes and rolls violations back
    Reactive,
    /// Refuses volume keys before the OS applies them
    Preventive,
}

impl fmt::Display for AuthorityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthorityKind::Reactive => f.write_str("reactive"),
            AuthorityKind::Preventive => f.write_str("preventive"),
        }
    }
}

/// Trait for the host side of authority lifecycle
pub trait HostEnvironment: Send + Sync {
    /// Whether privileged key interception is currently granted.
    /// May change at any time outside the engine's control.
    fn interception_granted(&self) -> bool;

    /// Ask the host to admit a long-running authority of `kind`
    fn admit(&self, kind: AuthorityKind) -> Result<(), HostError>;
}

/// Shared view of "may the preventive authority run right now"
///
/// Combines the host grant with the arbiter's knowledge of a refused
/// privileged start, so the reactive authority does not stand down in
/// favour of an interceptor that the host will not run.
pub struct CapabilityGate {
    host: Arc<dyn HostEnvironment>,
    preventive_refused: AtomicBool,
    preventive_deferred: AtomicBool,
}

impl CapabilityGate {
    pub fn new(host: Arc<dyn HostEnvironment>) -> Self {
        Self {
            host,
            preventive_refused: AtomicBool::new(false),
            preventive_deferred: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &Arc<dyn HostEnvironment> {
        &self.host
    }

    pub fn interception_granted(&self) -> bool {
        self.host.interception_granted()
    }

    /// Granted and neither refused nor deferred at the last privileged start attempt
    pub fn preventive_available(&self) -> bool {
        self.host.interception_granted()
            && !self.preventive_refused.load(Ordering::Acquire)
            && !self.preventive_deferred.load(Ordering::Acquire)
    }

    /// Privilege refused; holds until the grant changes
    pub fn mark_preventive_refused(&self) {
        self.preventive_refused.store(true, Ordering::Release);
    }

    /// Host declined the start for now; holds until the next activation attempt
    pub fn defer_preventive(&self) {
        self.preventive_deferred.store(true, Ordering::Release);
    }

    pub fn clear_deferral(&self) {
        self.preventive_deferred.store(false, Ordering::Release);
    }

    /// Called whenever the grant changes or a privileged start succeeds
    pub fn clear_refusal(&self) {
        self.preventive_refused.store(false, Ordering::Release);
        self.preventive_deferred.store(false, Ordering::Release);
    }

    pub fn preventive_refused(&self) -> bool {
        self.preventive_refused.load(Ordering::Acquire)
    }
}
