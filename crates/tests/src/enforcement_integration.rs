//! Integration tests for the enforcement engine
//!
//! These tests drive the full engine (multiplexer, authorities, arbiter and
//! watchdog) against the simulated host, without the async pumps, so every
//! notification is delivered exactly when the test decides.

use earguard_core::domain::{
    evaluate, ArbiterState, AuthorityKind, CeilingConfig, CeilingPercent, Collaborators, Decision,
    EnforcementEngine, EnforcementEvent, EngineConfig, KeyAction, KeyCode, LevelSnapshot,
    LifecycleTrigger, MemoryCeilingStore, RawKeyEvent, RawSignal, SignalChannel, StreamType,
    TieBreak, Verdict, WatchdogOutcome,
};
use earguard_infra::SimulatedHost;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct Rig {
    host: Arc<SimulatedHost>,
    engine: Arc<EnforcementEngine>,
}

async fn rig(initial: u32, granted: bool, enabled: bool, config: EngineConfig) -> Rig {
    let host = Arc::new(SimulatedHost::new(15, initial));
    host.set_interception_granted(granted);
    let store = Arc::new(MemoryCeilingStore::new(CeilingConfig {
        percent: CeilingPercent::new(50),
        enabled,
    }));

    let engine = Arc::new(
        EnforcementEngine::build(
            Collaborators {
                level: host.clone(),
                host: host.clone(),
                store,
            },
            config,
        )
        .await,
    );

    let hook_engine = engine.clone();
    host.install_hook(Arc::new(move |key| hook_engine.on_key(key)));
    Rig { host, engine }
}

fn media(channel: SignalChannel, at: Instant) -> RawSignal {
    RawSignal::new(channel, Some(StreamType::Media), at)
}

fn corrections(engine: &EnforcementEngine, kind: AuthorityKind) -> u64 {
    engine.arbiter().authority(kind).corrections()
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_reactive_clamp_then_allow() {
    let (allowed, decision) = evaluate(
        LevelSnapshot::new(10, 15),
        CeilingPercent::new(50),
        &EnforcementEvent::VolumeObserved { at: Instant::now() },
        TieBreak::default(),
    );
    assert_eq!(allowed, 7);
    assert_eq!(decision, Decision::Clamp { to: 7 });

    let rig = rig(10, false, true, EngineConfig::default()).await;
    let outcome = rig.engine.supervisor().ensure_running(Instant::now()).await;

    assert_eq!(outcome, WatchdogOutcome::Started(ArbiterState::ReactiveActive));
    assert_eq!(rig.host.level(), 7);
    assert_eq!(rig.host.writes(), 1);
    assert_eq!(corrections(&rig.engine, AuthorityKind::Reactive), 1);

    assert!(rig.engine.on_signal(media(SignalChannel::Broadcast, Instant::now())));
    assert_eq!(rig.host.level(), 7);
    assert_eq!(rig.host.writes(), 1);
}

#[tokio::test]
async fn test_held_key_blocked_at_boundary() {
    let rig = rig(6, true, true, EngineConfig::default()).await;
    let outcome = rig.engine.supervisor().ensure_running(Instant::now()).await;
    assert_eq!(outcome, WatchdogOutcome::Started(ArbiterState::PreventiveActive));

    let held = RawKeyEvent::new(KeyCode::VolumeUp, KeyAction::Down, 3, Instant::now());
    assert_eq!(rig.engine.on_key(held), Verdict::Consumed);

    let released = RawKeyEvent::new(KeyCode::VolumeUp, KeyAction::Up, 0, Instant::now());
    assert_eq!(rig.engine.on_key(released), Verdict::Consumed);

    assert_eq!(rig.host.press_key(KeyCode::VolumeDown, KeyAction::Down, 0), Verdict::Propagate);
    assert_eq!(rig.host.level(), 5);
    assert_eq!(rig.host.writes(), 0);
}

#[tokio::test]
async fn test_disabled_never_starts() {
    let rig = rig(15, false, false, EngineConfig::default()).await;

    for trigger in [
        LifecycleTrigger::Boot,
        LifecycleTrigger::WatchdogTick,
        LifecycleTrigger::UserPresent,
    ] {
        let outcome = rig.engine.on_lifecycle(trigger, Instant::now()).await;
        assert_eq!(outcome, WatchdogOutcome::Disabled);
    }

    assert_eq!(rig.engine.arbiter().state(), ArbiterState::NoAuthority);
    assert!(!rig.engine.on_signal(media(SignalChannel::Broadcast, Instant::now())));
    assert_eq!(rig.host.level(), 15);
}

#[tokio::test]
async fn test_grant_stops_reactive_authority() {
    let rig = rig(10, false, true, EngineConfig::default()).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;
    assert_eq!(corrections(&rig.engine, AuthorityKind::Reactive), 1);

    rig.host.set_interception_granted(true);
    let outcome = rig
        .engine
        .on_lifecycle(
            LifecycleTrigger::CapabilityChanged { granted: true },
            Instant::now(),
        )
        .await;
    assert_eq!(outcome, WatchdogOutcome::Started(ArbiterState::PreventiveActive));
    assert!(!rig.engine.arbiter().authority(AuthorityKind::Reactive).is_active());

    rig.host.user_set_level(12);
    rig.engine.on_signal(media(SignalChannel::Broadcast, Instant::now()));

    assert_eq!(rig.host.level(), 7);
    assert_eq!(corrections(&rig.engine, AuthorityKind::Reactive), 1);
    assert_eq!(corrections(&rig.engine, AuthorityKind::Preventive), 1);
}

// ============================================================================
// DEGRADED HOSTS
// ============================================================================

#[tokio::test]
async fn test_privilege_denied_falls_back_to_reactive() {
    let rig = rig(3, true, true, EngineConfig::default()).await;
    rig.host.set_privilege_denied(true);

    let outcome = rig.engine.supervisor().ensure_running(Instant::now()).await;
    assert_eq!(outcome, WatchdogOutcome::Started(ArbiterState::ReactiveActive));

    let outcome = rig
        .engine
        .on_lifecycle(LifecycleTrigger::WatchdogTick, Instant::now())
        .await;
    assert!(matches!(outcome, WatchdogOutcome::AlreadyRunning(_)));
    assert_eq!(rig.engine.arbiter().state(), ArbiterState::ReactiveActive);
}

#[tokio::test]
async fn test_failed_write_not_counted_and_retried() {
    let rig = rig(7, false, true, EngineConfig::default()).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;

    rig.host.user_set_level(13);
    rig.host.set_fail_writes(true);
    let start = Instant::now();
    rig.engine.on_signal(media(SignalChannel::Broadcast, start));
    assert_eq!(rig.host.level(), 13);
    assert_eq!(corrections(&rig.engine, AuthorityKind::Reactive), 0);

    rig.host.set_fail_writes(false);
    rig.engine
        .on_signal(media(SignalChannel::PollTick, start + Duration::from_millis(1)));
    assert_eq!(rig.host.level(), 7);
    assert_eq!(corrections(&rig.engine, AuthorityKind::Reactive), 1);
}

#[tokio::test]
async fn test_read_failure_skips_evaluation() {
    let rig = rig(7, false, true, EngineConfig::default()).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;

    rig.host.user_set_level(15);
    rig.host.set_fail_reads(true);
    rig.engine.on_signal(media(SignalChannel::Broadcast, Instant::now()));
    assert_eq!(rig.host.level(), 15);

    rig.host.set_fail_reads(false);
    rig.engine
        .on_lifecycle(LifecycleTrigger::WatchdogTick, Instant::now())
        .await;
    assert_eq!(rig.host.level(), 7);
}

// ============================================================================
// SIGNAL HANDLING
// ============================================================================

#[tokio::test]
async fn test_burst_inside_debounce_window_delivers_once() {
    let config = EngineConfig {
        debounce_ms: 50,
        ..EngineConfig::default()
    };
    let rig = rig(3, false, true, config).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;

    let before = rig.engine.multiplexer().stats().delivered;
    let start = Instant::now();
    for i in 0..10 {
        let channel = if i % 2 == 0 {
            SignalChannel::Broadcast
        } else {
            SignalChannel::SettingsChange
        };
        rig.engine
            .on_signal(media(channel, start + Duration::from_millis(i)));
    }

    assert_eq!(rig.engine.multiplexer().stats().delivered - before, 1);
}

#[tokio::test]
async fn test_other_streams_ignored() {
    let rig = rig(3, false, true, EngineConfig::default()).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;

    let signal = RawSignal::new(
        SignalChannel::Broadcast,
        Some(StreamType::Other(2)),
        Instant::now(),
    );
    assert!(!rig.engine.on_signal(signal));
    assert_eq!(rig.engine.multiplexer().stats().filtered, 1);
}

#[tokio::test]
async fn test_concurrent_channels_clamp_once() {
    let rig = rig(7, false, true, EngineConfig::default()).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;
    rig.host.set_read_delay(Duration::from_millis(2));
    rig.host.user_set_level(15);

    let start = Instant::now();
    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let engine = rig.engine.clone();
            thread::spawn(move || {
                let channel = if i % 2 == 0 {
                    SignalChannel::PollTick
                } else {
                    SignalChannel::Broadcast
                };
                engine.on_signal(media(channel, start + Duration::from_micros(i)));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(rig.host.level(), 7);
    assert_eq!(rig.host.writes(), 1);
    assert_eq!(corrections(&rig.engine, AuthorityKind::Reactive), 1);
}

#[tokio::test]
async fn test_restricted_interception_keeps_reactive_enforcing() {
    let rig = rig(3, false, true, EngineConfig::default()).await;
    rig.engine.supervisor().ensure_running(Instant::now()).await;

    rig.host.set_preventive_restricted(true);
    rig.host.set_interception_granted(true);
    let outcome = rig
        .engine
        .on_lifecycle(LifecycleTrigger::CapabilityChanged { granted: true }, Instant::now())
        .await;
    assert_eq!(outcome, WatchdogOutcome::Started(ArbiterState::ReactiveActive));

    rig.host.user_set_level(15);
    assert!(rig.engine.on_signal(media(SignalChannel::Broadcast, Instant::now())));
    assert_eq!(rig.host.level(), 7);

    let outcome = rig
        .engine
        .on_lifecycle(LifecycleTrigger::WatchdogTick, Instant::now())
        .await;
    assert!(matches!(outcome, WatchdogOutcome::AlreadyRunning(_)));

    rig.host.set_preventive_restricted(false);
    let outcome = rig
        .engine
        .on_lifecycle(LifecycleTrigger::WatchdogTick, Instant::now())
        .await;
    assert_eq!(outcome, WatchdogOutcome::Started(ArbiterState::PreventiveActive));
    assert!(!rig.engine.arbiter().both_active());
}

/// Highest level reached while holding volume up from zero with stale reads
async fn held_key_peak(tie_break: TieBreak) -> u32 {
    let config = EngineConfig {
        tie_break,
        ..EngineConfig::default()
    };
    let rig = rig(0, true, true, config).await;
    rig.host.set_stale_reads(true);
    rig.engine.supervisor().ensure_running(Instant::now()).await;

    let mut peak = 0;
    for repeat in 0..12 {
        rig.host.press_key(KeyCode::VolumeUp, KeyAction::Down, repeat);
        peak = peak.max(rig.host.level());
    }
    peak
}

#[tokio::test]
async fn test_boundary_rule_under_stale_reads() {
    assert_eq!(held_key_peak(TieBreak::PreventiveAtBoundary).await, 7);
    assert_eq!(held_key_peak(TieBreak::RepeatGated).await, 7);
    assert_eq!(held_key_peak(TieBreak::ReactiveAtBoundary).await, 8);
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    VolumeUp { repeat_count: u32 },
    WatchdogTick,
    Grant(bool),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u32..5).prop_map(|repeat_count| Step::VolumeUp { repeat_count }),
        3 => Just(Step::WatchdogTick),
        1 => any::<bool>().prop_map(Step::Grant),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn never_two_authorities_active(steps in prop::collection::vec(step(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let rig = rig(0, false, true, EngineConfig::default()).await;
            rig.engine.supervisor().ensure_running(Instant::now()).await;

            for step in steps {
                match step {
                    Step::VolumeUp { repeat_count } => {
                        rig.host.press_key(KeyCode::VolumeUp, KeyAction::Down, repeat_count);
                    }
                    Step::WatchdogTick => {
                        rig.engine
                            .on_lifecycle(LifecycleTrigger::WatchdogTick, Instant::now())
                            .await;
                        prop_assert!(rig.host.level() <= 7);
                    }
                    Step::Grant(granted) => {
                        rig.host.set_interception_granted(granted);
                        rig.engine
                            .on_lifecycle(LifecycleTrigger::CapabilityChanged { granted }, Instant::now())
                            .await;
                    }
                }
                prop_assert!(!rig.engine.arbiter().both_active());
                prop_assert_ne!(rig.engine.arbiter().state(), ArbiterState::NoAuthority);
            }
            Ok(())
        })?;
    }

    #[test]
    fn interception_holds_the_ceiling(presses in 1usize..40) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let rig = rig(0, true, true, EngineConfig::default()).await;
            rig.host.set_stale_reads(true);
            rig.engine.supervisor().ensure_running(Instant::now()).await;

            for repeat in 0..presses {
                rig.host.press_key(KeyCode::VolumeUp, KeyAction::Down, repeat as u32);
                prop_assert!(rig.host.level() <= 7);
            }
            prop_assert_eq!(rig.host.writes(), 0);
            Ok(())
        })?;
    }
}
