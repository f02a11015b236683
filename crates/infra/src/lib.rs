//! Earguard host adapters
//!
//! Bridges host notification channels and timers into the core engine.

pub mod host;
pub mod runtime;

pub use host::*;
pub use runtime::EngineRuntime;
