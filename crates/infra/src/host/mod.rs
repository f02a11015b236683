//! Host-side adapters for the enforcement engine
//!
//! The host delivers its asynchronous notifications over `crossbeam`
//! channels, one receiver per notification channel, so that each channel
//! can be pumped in receipt order.

pub mod simulated;

pub use simulated::*;

use crossbeam::channel::Receiver;
use earguard_core::domain::{LifecycleTrigger, RawKeyEvent, RawSignal, Verdict};
use std::sync::Arc;

/// Receivers for every notification stream a host produces
pub struct HostChannels {
    /// Settings-store observer notifications
    pub settings: Receiver<RawSignal>,
    /// System "volume changed" broadcasts
    pub broadcast: Receiver<RawSignal>,
    /// Lifecycle notifications (capability changes, memory pressure...)
    pub lifecycle: Receiver<LifecycleTrigger>,
}

/// Callback installed on the key interception path
///
/// Receives every raw key event before the host applies it.
pub type InterceptionHook = Arc<dyn Fn(RawKeyEvent) -> Verdict + Send + Sync>;
