//! Domain entities and business rules

pub mod arbiter;
pub mod authority;
pub mod config;
pub mod engine;
pub mod event;
pub mod host;
pub mod level;
pub mod multiplexer;
pub mod policy;
pub mod watchdog;

// Re-export specific items to avoid ambiguous glob imports
pub use arbiter::{ArbiterState, AuthorityArbiter, Revalidation};
pub use authority::{
    Authority, AuthorityError, AuthorityState, Enforcer, PreventiveInterceptor, ReactiveCorrector,
    StartOutcome,
};
pub use config::{
    CeilingCache, CeilingConfig, CeilingStore, ConfigChange, ConfigError, ConfigManager,
    ConfigWatcher, EarguardConfig, EngineConfig, FileCeilingStore, MemoryCeilingStore,
};
pub use engine::{Collaborators, EnforcementEngine};
pub use event::{
    EnforcementEvent, KeyAction, KeyCode, RawKeyEvent, RawSignal, SignalChannel, Verdict,
};
pub use host::{AuthorityKind, CapabilityGate, HostEnvironment, HostError};
pub use level::{LevelError, LevelSnapshot, LevelSource, SetLevelFlags, StreamType};
pub use multiplexer::{EventSink, Interest, MultiplexerStats, SignalMultiplexer, SubscriptionId};
pub use policy::{allowed_level, decide, evaluate, CeilingPercent, Decision, TieBreak};
pub use watchdog::{EngineStatus, LifecycleTrigger, WatchdogOutcome, WatchdogSupervisor};
