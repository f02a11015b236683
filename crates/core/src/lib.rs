//! Earguard core: volume ceiling enforcement engine
//!
//! Platform-agnostic domain logic. Host integrations (level sources, key
//! interception, timers) live in the `infra` crate.

pub mod domain;
