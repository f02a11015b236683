//! Enforcement authorities
//!
//! Two variants behind one [`Authority`] contract:
//! - [`ReactiveCorrector`] rolls back levels that already went over the ceiling
//! - [`PreventiveInterceptor`] refuses volume-up keys before the OS applies
//!   them, and still clamps observed levels as a backstop
//!
//! Both evaluate through an [`Enforcer`], which owns the critical section
//! around "read level -> decide -> maybe write level".

use crate::domain::config::CeilingCache;
use crate::domain::event::{EnforcementEvent, Verdict};
use crate::domain::host::{AuthorityKind, CapabilityGate, HostError};
use crate::domain::level::{LevelSnapshot, LevelSource, SetLevelFlags};
use crate::domain::multiplexer::{EventSink, Interest, SignalMultiplexer, SubscriptionId};
use crate::domain::policy::{self, CeilingPercent, Decision, TieBreak};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors raised while starting an authority
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    #[error("Host refused to start authority: {0}")]
    Host(#[from] HostError),

    #[error("Preventive interception is not granted")]
    PreventiveUnavailable,
}

/// Lifecycle state of one authority instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityState {
    Inactive,
    Starting,
    Active,
    SelfTerminating,
}

impl fmt::Display for AuthorityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthorityState::Inactive => "inactive",
            AuthorityState::Starting => "starting",
            AuthorityState::Active => "active",
            AuthorityState::SelfTerminating => "self_terminating",
        };
        f.write_str(name)
    }
}

/// Result of a successful `start()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartOutcome {
    /// Running; the host should keep (and restart) it
    Sticky,
    /// Stood down immediately; the host must not restart it
    NotSticky,
}

/// Contract shared by both enforcement variants
pub trait Authority: Send + Sync {
    fn kind(&self) -> AuthorityKind;

    fn start(&self) -> Result<StartOutcome, AuthorityError>;

    /// Unregisters synchronously. No evaluation runs after this returns.
    fn stop(&self);

    /// Unregister without waiting for an in-flight evaluation. The stuck
    /// evaluation may still return later but can no longer write.
    fn abandon(&self);

    fn on_event(&self, event: EnforcementEvent) -> Verdict;

    fn state(&self) -> AuthorityState;

    /// Clamp actions since the last activation
    fn corrections(&self) -> u64;

    /// Re-register with the multiplexer if the subscription went missing.
    /// Returns true when a re-registration was needed.
    fn revalidate(&self) -> bool;

    /// Run one reactive check without waiting on a busy critical section.
    /// Returns false when the critical section was busy or the authority is down.
    fn probe(&self, now: Instant) -> bool;

    /// Time of the last completed evaluation or probe
    fn last_heartbeat(&self) -> Option<Instant>;

    fn is_active(&self) -> bool {
        self.state() == AuthorityState::Active
    }
}

/// Evaluation core shared by both variants
///
/// The heartbeat lives outside the critical section so a supervisor can
/// read it while an evaluation is stuck.
pub struct Enforcer {
    level: Arc<dyn LevelSource>,
    ceiling: Arc<CeilingCache>,
    mux: Arc<SignalMultiplexer>,
    tie_break: TieBreak,
    section: Mutex<()>,
    epoch: Instant,
    /// Nanoseconds since `epoch`, plus one; zero means no heartbeat yet
    heartbeat_ns: AtomicU64,
    corrections: AtomicU64,
    running: AtomicBool,
}

impl Enforcer {
    pub fn new(
        level: Arc<dyn LevelSource>,
        ceiling: Arc<CeilingCache>,
        mux: Arc<SignalMultiplexer>,
        tie_break: TieBreak,
    ) -> Self {
        Self {
            level,
            ceiling,
            mux,
            tie_break,
            section: Mutex::new(()),
            epoch: Instant::now(),
            heartbeat_ns: AtomicU64::new(0),
            corrections: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    /// Same collaborators, new critical section
    pub fn successor(&self) -> Self {
        Self::new(
            self.level.clone(),
            self.ceiling.clone(),
            self.mux.clone(),
            self.tie_break,
        )
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    pub fn corrections(&self) -> u64 {
        self.corrections.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        match self.heartbeat_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(self.epoch + Duration::from_nanos(ns - 1)),
        }
    }

    fn beat(&self, at: Instant) {
        let ns = at.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.heartbeat_ns
            .fetch_max(ns.saturating_add(1), Ordering::AcqRel);
    }

    fn lock_section(&self) -> MutexGuard<'_, ()> {
        self.section.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset the counter and accept evaluations again
    pub fn activate(&self) {
        let _section = self.lock_section();
        self.corrections.store(0, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    /// Refuse further evaluations and wait for an in-flight one to finish
    pub fn deactivate(&self) {
        self.running.store(false, Ordering::Release);
        drop(self.lock_section());
    }

    /// Refuse further evaluations and writes without touching the section
    pub fn abandon(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Serialized evaluation of one event
    pub fn evaluate(&self, event: EnforcementEvent) -> Verdict {
        let _section = self.lock_section();
        if !self.is_running() {
            trace!(?event, "Authority stopped, event discarded");
            return Verdict::Propagate;
        }
        if self.mux.is_superseded(&event) {
            trace!(?event, "Observation superseded by a newer one");
            return Verdict::Propagate;
        }
        self.evaluate_locked(event)
    }

    /// Probe evaluation that never blocks on a busy section
    pub fn try_probe(&self, now: Instant) -> bool {
        let _section = match self.section.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if !self.is_running() {
            return false;
        }
        self.evaluate_locked(EnforcementEvent::VolumeObserved { at: now });
        true
    }

    fn evaluate_locked(&self, event: EnforcementEvent) -> Verdict {
        self.beat(event.at());

        let snapshot = match self.level.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, ?event, "Level read failed, skipping evaluation");
                return Verdict::Propagate;
            }
        };

        let percent = self.ceiling.percent();
        let (allowed, decision) = policy::evaluate(snapshot, percent, &event, self.tie_break);
        trace!(current = snapshot.current, allowed, ?decision, "Evaluated");

        if let Some(target) = decision.correction() {
            self.correct(snapshot, target, percent);
        }

        match decision {
            Decision::Block { .. } => {
                if let EnforcementEvent::VolumeUpAttempted { repeat_count, .. } = event {
                    debug!(
                        current = snapshot.current,
                        allowed,
                        repeat = repeat_count,
                        "Blocking volume up"
                    );
                }
                Verdict::Consumed
            }
            Decision::Allow | Decision::Clamp { .. } => Verdict::Propagate,
        }
    }

    fn correct(&self, snapshot: LevelSnapshot, target: u32, percent: CeilingPercent) {
        if !self.is_running() {
            debug!(from = snapshot.current, to = target, "Enforcer abandoned, corrective write skipped");
            return;
        }
        let started = Instant::now();
        let (result, swallowed) = {
            let echo = self.mux.self_write();
            let result = self.level.set_level(target, SetLevelFlags::SILENT);
            (result, echo.swallowed())
        };
        let elapsed_us = started.elapsed().as_micros() as u64;

        match result {
            Ok(()) => {
                let count = self.corrections.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    correction = count,
                    from = snapshot.current,
                    to = target,
                    max = snapshot.max,
                    %percent,
                    elapsed_us,
                    "Volume corrected"
                );
                if swallowed {
                    self.recheck(percent);
                }
            }
            Err(e) => {
                error!(
                    error = %e,
                    from = snapshot.current,
                    to = target,
                    elapsed_us,
                    "Corrective write failed, will retry on next notification"
                );
            }
        }
    }

    /// One extra read after a write that swallowed notifications, since a
    /// real change may have raced it. Never loops.
    fn recheck(&self, percent: CeilingPercent) {
        let snapshot = match self.level.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Level re-read after correction failed");
                return;
            }
        };
        let allowed = policy::allowed_level(snapshot.max, percent);
        if snapshot.current <= allowed {
            return;
        }

        debug!(current = snapshot.current, allowed, "Level moved during corrective write");
        let _echo = self.mux.self_write();
        match self.level.set_level(allowed, SetLevelFlags::SILENT) {
            Ok(()) => {
                let count = self.corrections.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(correction = count, from = snapshot.current, to = allowed, "Volume corrected");
            }
            Err(e) => {
                error!(error = %e, from = snapshot.current, to = allowed, "Corrective write failed");
            }
        }
    }
}

impl EventSink for Enforcer {
    fn deliver(&self, event: EnforcementEvent) -> Verdict {
        self.evaluate(event)
    }
}

/// Registration bookkeeping common to both variants
struct Registration {
    state: AuthorityState,
    subscription: Option<SubscriptionId>,
}

struct Lifecycle {
    kind: AuthorityKind,
    interest: Interest,
    enforcer: RwLock<Arc<Enforcer>>,
    mux: Arc<SignalMultiplexer>,
    registration: Mutex<Registration>,
}

impl Lifecycle {
    fn new(kind: AuthorityKind, interest: Interest, enforcer: Arc<Enforcer>, mux: Arc<SignalMultiplexer>) -> Self {
        Self {
            kind,
            interest,
            enforcer: RwLock::new(enforcer),
            mux,
            registration: Mutex::new(Registration {
                state: AuthorityState::Inactive,
                subscription: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registration> {
        self.registration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enforcer(&self) -> Arc<Enforcer> {
        self.enforcer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> AuthorityState {
        self.lock().state
    }

    fn set_state(&self, state: AuthorityState) {
        self.lock().state = state;
    }

    /// Subscribe and go active, then run the initial check
    fn go_active(&self, mut registration: MutexGuard<'_, Registration>) {
        let enforcer = self.enforcer();
        enforcer.activate();
        let sink: Arc<dyn EventSink> = enforcer.clone();
        registration.subscription = Some(self.mux.subscribe(self.interest, sink));
        registration.state = AuthorityState::Active;
        drop(registration);

        info!(kind = %self.kind, tie_break = ?enforcer.tie_break(), "Authority active");
        enforcer.try_probe(Instant::now());
    }

    fn stop(&self) {
        let mut registration = self.lock();
        if registration.state == AuthorityState::Inactive && registration.subscription.is_none() {
            return;
        }
        registration.state = AuthorityState::SelfTerminating;
        if let Some(id) = registration.subscription.take() {
            self.mux.unsubscribe(id);
        }
        let enforcer = self.enforcer();
        enforcer.deactivate();
        registration.state = AuthorityState::Inactive;
        info!(
            kind = %self.kind,
            corrections = enforcer.corrections(),
            "Authority stopped"
        );
    }

    /// Swap in a successor enforcer and leave the stuck one behind
    fn abandon(&self) {
        let mut registration = self.lock();
        if registration.state == AuthorityState::Inactive && registration.subscription.is_none() {
            return;
        }
        registration.state = AuthorityState::SelfTerminating;
        if let Some(id) = registration.subscription.take() {
            self.mux.unsubscribe(id);
        }
        let stuck = {
            let mut slot = self.enforcer.write().unwrap_or_else(PoisonError::into_inner);
            let successor = Arc::new(slot.successor());
            std::mem::replace(&mut *slot, successor)
        };
        stuck.abandon();
        registration.state = AuthorityState::Inactive;
        warn!(
            kind = %self.kind,
            corrections = stuck.corrections(),
            "Authority abandoned with an evaluation in flight"
        );
    }

    fn revalidate(&self) -> bool {
        let mut registration = self.lock();
        if registration.state != AuthorityState::Active {
            return false;
        }
        let registered = registration
            .subscription
            .is_some_and(|id| self.mux.is_subscribed(id));
        if registered {
            debug!(kind = %self.kind, "Subscription still registered");
            return false;
        }
        warn!(kind = %self.kind, "Subscription was dropped, re-registering");
        let sink: Arc<dyn EventSink> = self.enforcer();
        registration.subscription = Some(self.mux.subscribe(self.interest, sink));
        true
    }

    fn probe(&self, now: Instant) -> bool {
        self.state() == AuthorityState::Active && self.enforcer().try_probe(now)
    }
}

/// Observes applied changes and rolls back violations
///
/// Needs no privilege. Stands down whenever the preventive variant can run.
pub struct ReactiveCorrector {
    lifecycle: Lifecycle,
    gate: Arc<CapabilityGate>,
}

impl ReactiveCorrector {
    pub fn new(enforcer: Arc<Enforcer>, mux: Arc<SignalMultiplexer>, gate: Arc<CapabilityGate>) -> Self {
        Self {
            lifecycle: Lifecycle::new(AuthorityKind::Reactive, Interest::OBSERVATIONS, enforcer, mux),
            gate,
        }
    }
}

impl Authority for ReactiveCorrector {
    fn kind(&self) -> AuthorityKind {
        AuthorityKind::Reactive
    }

    fn start(&self) -> Result<StartOutcome, AuthorityError> {
        let mut registration = self.lifecycle.lock();
        if registration.state == AuthorityState::Active {
            drop(registration);
            if self.gate.preventive_available() {
                info!("Preventive interception available, reactive authority standing down");
                self.lifecycle.stop();
                return Ok(StartOutcome::NotSticky);
            }
            self.lifecycle.revalidate();
            return Ok(StartOutcome::Sticky);
        }
        registration.state = AuthorityState::Starting;

        if self.gate.preventive_available() {
            registration.state = AuthorityState::SelfTerminating;
            drop(registration);
            info!("Preventive interception available, reactive authority standing down");
            self.lifecycle.stop();
            return Ok(StartOutcome::NotSticky);
        }

        if let Err(e) = self.gate.host().admit(AuthorityKind::Reactive) {
            registration.state = AuthorityState::Inactive;
            return Err(e.into());
        }

        self.lifecycle.go_active(registration);
        Ok(StartOutcome::Sticky)
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }

    fn abandon(&self) {
        self.lifecycle.abandon();
    }

    fn on_event(&self, event: EnforcementEvent) -> Verdict {
        match event {
            EnforcementEvent::VolumeObserved { .. } => self.lifecycle.enforcer().evaluate(event),
            _ => Verdict::Propagate,
        }
    }

    fn state(&self) -> AuthorityState {
        self.lifecycle.state()
    }

    fn corrections(&self) -> u64 {
        self.lifecycle.enforcer().corrections()
    }

    fn revalidate(&self) -> bool {
        self.lifecycle.revalidate()
    }

    fn probe(&self, now: Instant) -> bool {
        self.lifecycle.probe(now)
    }

    fn last_heartbeat(&self) -> Option<Instant> {
        self.lifecycle.enforcer().last_heartbeat()
    }
}

/// Intercepts raw volume keys before the OS applies them
///
/// Requires the host's interception grant. Also evaluates observations, as
/// other apps can still change the level programmatically.
pub struct PreventiveInterceptor {
    lifecycle: Lifecycle,
    gate: Arc<CapabilityGate>,
}

impl PreventiveInterceptor {
    pub fn new(enforcer: Arc<Enforcer>, mux: Arc<SignalMultiplexer>, gate: Arc<CapabilityGate>) -> Self {
        Self {
            lifecycle: Lifecycle::new(AuthorityKind::Preventive, Interest::ALL, enforcer, mux),
            gate,
        }
    }
}

impl Authority for PreventiveInterceptor {
    fn kind(&self) -> AuthorityKind {
        AuthorityKind::Preventive
    }

    fn start(&self) -> Result<StartOutcome, AuthorityError> {
        let mut registration = self.lifecycle.lock();
        if registration.state == AuthorityState::Active {
            drop(registration);
            self.lifecycle.revalidate();
            return Ok(StartOutcome::Sticky);
        }
        registration.state = AuthorityState::Starting;

        if !self.gate.interception_granted() {
            registration.state = AuthorityState::Inactive;
            return Err(AuthorityError::PreventiveUnavailable);
        }

        if let Err(e) = self.gate.host().admit(AuthorityKind::Preventive) {
            registration.state = AuthorityState::Inactive;
            return Err(e.into());
        }

        self.lifecycle.go_active(registration);
        Ok(StartOutcome::Sticky)
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }

    fn abandon(&self) {
        self.lifecycle.abandon();
    }

    fn on_event(&self, event: EnforcementEvent) -> Verdict {
        self.lifecycle.enforcer().evaluate(event)
    }

    fn state(&self) -> AuthorityState {
        self.lifecycle.state()
    }

    fn corrections(&self) -> u64 {
        self.lifecycle.enforcer().corrections()
    }

    fn revalidate(&self) -> bool {
        self.lifecycle.revalidate()
    }

    fn probe(&self, now: Instant) -> bool {
        self.lifecycle.probe(now)
    }

    fn last_heartbeat(&self) -> Option<Instant> {
        self.lifecycle.enforcer().last_heartbeat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::CeilingConfig;
    use crate::domain::event::{RawSignal, SignalChannel};
    use crate::domain::host::HostEnvironment;
    use crate::domain::level::{LevelError, Result as LevelResult};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct TestLevel {
        current: AtomicU32,
        max: u32,
        writes: AtomicU32,
        fail_reads: AtomicBool,
    }

    impl TestLevel {
        fn new(current: u32, max: u32) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicU32::new(current),
                max,
                writes: AtomicU32::new(0),
                fail_reads: AtomicBool::new(false),
            })
        }
    }

    impl LevelSource for TestLevel {
        fn current_level(&self) -> LevelResult<u32> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(LevelError::Unavailable("test".to_string()));
            }
            Ok(self.current.load(Ordering::SeqCst))
        }

        fn max_level(&self) -> LevelResult<u32> {
            Ok(self.max)
        }

        fn set_level(&self, level: u32, _flags: SetLevelFlags) -> LevelResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.current.store(level, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TestHost {
        granted: AtomicBool,
        restricted: AtomicBool,
    }

    impl HostEnvironment for TestHost {
        fn interception_granted(&self) -> bool {
            self.granted.load(Ordering::SeqCst)
        }

        fn admit(&self, _kind: AuthorityKind) -> Result<(), HostError> {
            if self.restricted.load(Ordering::SeqCst) {
                Err(HostError::ForegroundStartRestricted)
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        level: Arc<TestLevel>,
        host: Arc<TestHost>,
        mux: Arc<SignalMultiplexer>,
        reactive: ReactiveCorrector,
        preventive: PreventiveInterceptor,
    }

    fn fixture(current: u32, granted: bool) -> Fixture {
        let level = TestLevel::new(current, 15);
        let host = Arc::new(TestHost {
            granted: AtomicBool::new(granted),
            restricted: AtomicBool::new(false),
        });
        let gate = Arc::new(CapabilityGate::new(host.clone()));
        let mux = Arc::new(SignalMultiplexer::default());
        let ceiling = Arc::new(CeilingCache::new(CeilingConfig {
            percent: CeilingPercent::new(50),
            enabled: true,
        }));
        let enforcer = |tie_break| {
            Arc::new(Enforcer::new(level.clone(), ceiling.clone(), mux.clone(), tie_break))
        };
        Fixture {
            reactive: ReactiveCorrector::new(enforcer(TieBreak::ReactiveAtBoundary), mux.clone(), gate.clone()),
            preventive: PreventiveInterceptor::new(enforcer(TieBreak::PreventiveAtBoundary), mux.clone(), gate),
            level,
            host,
            mux,
        }
    }

    #[test]
    fn test_reactive_start_runs_initial_check() {
        let f = fixture(10, false);
        assert_eq!(f.reactive.start().unwrap(), StartOutcome::Sticky);
        assert_eq!(f.reactive.state(), AuthorityState::Active);
        assert_eq!(f.level.current.load(Ordering::SeqCst), 7);
        assert_eq!(f.reactive.corrections(), 1);
    }

    #[test]
    fn test_reactive_stands_down_when_preventive_available() {
        let f = fixture(3, true);
        assert_eq!(f.reactive.start().unwrap(), StartOutcome::NotSticky);
        assert_eq!(f.reactive.state(), AuthorityState::Inactive);
        assert!(!f.mux.has_subscriber());
    }

    #[test]
    fn test_reactive_start_restricted() {
        let f = fixture(3, false);
        f.host.restricted.store(true, Ordering::SeqCst);
        assert_eq!(
            f.reactive.start(),
            Err(AuthorityError::Host(HostError::ForegroundStartRestricted))
        );
        assert_eq!(f.reactive.state(), AuthorityState::Inactive);
    }

    #[test]
    fn test_reactive_ignores_key_attempts() {
        let f = fixture(7, false);
        f.reactive.start().unwrap();
        let event = EnforcementEvent::VolumeUpAttempted {
            repeat_count: 0,
            at: Instant::now(),
        };
        assert_eq!(f.reactive.on_event(event), Verdict::Propagate);
    }

    #[test]
    fn test_preventive_requires_grant() {
        let f = fixture(3, false);
        assert_eq!(f.preventive.start(), Err(AuthorityError::PreventiveUnavailable));
        assert_eq!(f.preventive.state(), AuthorityState::Inactive);
    }

    #[test]
    fn test_preventive_blocks_and_backstops() {
        let f = fixture(6, true);
        f.preventive.start().unwrap();
        let now = Instant::now();

        let held = EnforcementEvent::VolumeUpAttempted { repeat_count: 3, at: now };
        assert_eq!(f.preventive.on_event(held), Verdict::Consumed);
        assert_eq!(f.level.writes.load(Ordering::SeqCst), 0);

        // Another app pushes the level past the ceiling.
        f.level.current.store(12, Ordering::SeqCst);
        let observed = EnforcementEvent::VolumeObserved {
            at: now + Duration::from_millis(1),
        };
        assert_eq!(f.preventive.on_event(observed), Verdict::Propagate);
        assert_eq!(f.level.current.load(Ordering::SeqCst), 7);
        assert_eq!(f.preventive.corrections(), 1);
    }

    #[test]
    fn test_block_above_ceiling_clamps_once() {
        let f = fixture(6, true);
        f.preventive.start().unwrap();
        f.level.current.store(9, Ordering::SeqCst);

        let up = EnforcementEvent::VolumeUpAttempted {
            repeat_count: 0,
            at: Instant::now(),
        };
        assert_eq!(f.preventive.on_event(up), Verdict::Consumed);
        assert_eq!(f.level.current.load(Ordering::SeqCst), 7);
        assert_eq!(f.level.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_evaluation_after_stop() {
        let f = fixture(3, false);
        f.reactive.start().unwrap();
        f.reactive.stop();

        f.level.current.store(14, Ordering::SeqCst);
        let observed = EnforcementEvent::VolumeObserved { at: Instant::now() };
        f.reactive.on_event(observed);
        assert_eq!(f.level.current.load(Ordering::SeqCst), 14);
        assert!(!f.mux.has_subscriber());
    }

    #[test]
    fn test_read_failure_is_not_fatal() {
        let f = fixture(3, false);
        f.reactive.start().unwrap();
        f.level.fail_reads.store(true, Ordering::SeqCst);

        let now = Instant::now();
        assert_eq!(f.reactive.on_event(EnforcementEvent::VolumeObserved { at: now }), Verdict::Propagate);
        assert_eq!(f.reactive.state(), AuthorityState::Active);

        f.level.fail_reads.store(false, Ordering::SeqCst);
        f.level.current.store(11, Ordering::SeqCst);
        f.reactive.on_event(EnforcementEvent::VolumeObserved {
            at: now + Duration::from_millis(1),
        });
        assert_eq!(f.level.current.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_revalidate_reregisters_dropped_subscription() {
        let f = fixture(3, false);
        f.reactive.start().unwrap();
        assert!(!f.reactive.revalidate());

        f.mux.clear();
        assert!(f.reactive.revalidate());
        assert!(f.mux.has_subscriber());
    }

    #[test]
    fn test_counter_resets_on_activation() {
        let f = fixture(12, false);
        f.reactive.start().unwrap();
        assert_eq!(f.reactive.corrections(), 1);

        f.reactive.stop();
        f.level.current.store(4, Ordering::SeqCst);
        f.reactive.start().unwrap();
        assert_eq!(f.reactive.corrections(), 0);
    }

    #[test]
    fn test_active_reactive_stands_down_on_restart_when_preventive_available() {
        let f = fixture(3, false);
        assert_eq!(f.reactive.start().unwrap(), StartOutcome::Sticky);

        f.host.granted.store(true, Ordering::SeqCst);
        assert_eq!(f.reactive.start().unwrap(), StartOutcome::NotSticky);
        assert_eq!(f.reactive.state(), AuthorityState::Inactive);
        assert!(!f.mux.has_subscriber());
    }

    /// Device where another app raises the level while our write lands
    struct RacingLevel {
        current: AtomicU32,
        raise_to: AtomicU32,
        mux: Arc<SignalMultiplexer>,
    }

    impl LevelSource for RacingLevel {
        fn current_level(&self) -> LevelResult<u32> {
            Ok(self.current.load(Ordering::SeqCst))
        }

        fn max_level(&self) -> LevelResult<u32> {
            Ok(15)
        }

        fn set_level(&self, level: u32, _flags: SetLevelFlags) -> LevelResult<()> {
            self.current.store(level, Ordering::SeqCst);
            let raise = self.raise_to.swap(0, Ordering::SeqCst);
            if raise > 0 {
                self.current.store(raise, Ordering::SeqCst);
                self.mux.on_signal(RawSignal::new(SignalChannel::Broadcast, None, Instant::now()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_change_racing_a_correction_is_clamped() {
        let mux = Arc::new(SignalMultiplexer::default());
        let level = Arc::new(RacingLevel {
            current: AtomicU32::new(3),
            raise_to: AtomicU32::new(0),
            mux: mux.clone(),
        });
        let host = Arc::new(TestHost {
            granted: AtomicBool::new(false),
            restricted: AtomicBool::new(false),
        });
        let ceiling = Arc::new(CeilingCache::new(CeilingConfig {
            percent: CeilingPercent::new(50),
            enabled: true,
        }));
        let enforcer = Arc::new(Enforcer::new(level.clone(), ceiling, mux.clone(), TieBreak::ReactiveAtBoundary));
        let reactive = ReactiveCorrector::new(enforcer, mux.clone(), Arc::new(CapabilityGate::new(host)));
        reactive.start().unwrap();

        level.current.store(11, Ordering::SeqCst);
        level.raise_to.store(13, Ordering::SeqCst);
        assert!(mux.on_signal(RawSignal::new(SignalChannel::Broadcast, None, Instant::now())));

        assert_eq!(level.current.load(Ordering::SeqCst), 7);
        assert_eq!(mux.stats().echoes, 1);
        assert_eq!(reactive.corrections(), 2);
    }

    #[test]
    fn test_abandon_swaps_enforcer() {
        let f = fixture(3, false);
        f.reactive.start().unwrap();
        f.reactive.probe(Instant::now());
        assert!(f.reactive.last_heartbeat().is_some());

        f.reactive.abandon();
        assert_eq!(f.reactive.state(), AuthorityState::Inactive);
        assert!(!f.mux.has_subscriber());
        assert_eq!(f.reactive.last_heartbeat(), None);

        f.level.current.store(12, Ordering::SeqCst);
        f.reactive.start().unwrap();
        assert_eq!(f.level.current.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_abandoned_enforcer_never_writes() {
        let f = fixture(3, false);
        let enforcer = Enforcer::new(
            f.level.clone(),
            Arc::new(CeilingCache::new(CeilingConfig {
                percent: CeilingPercent::new(50),
                enabled: true,
            })),
            f.mux.clone(),
            TieBreak::ReactiveAtBoundary,
        );
        enforcer.activate();
        enforcer.abandon();

        f.level.current.store(12, Ordering::SeqCst);
        enforcer.correct(LevelSnapshot::new(12, 15), 7, CeilingPercent::new(50));
        assert_eq!(f.level.current.load(Ordering::SeqCst), 12);
        assert_eq!(f.level.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_probe_updates_heartbeat() {
        let f = fixture(3, false);
        assert!(!f.reactive.probe(Instant::now()));

        f.reactive.start().unwrap();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(f.reactive.probe(later));
        assert_eq!(f.reactive.last_heartbeat(), Some(later));
    }
}
