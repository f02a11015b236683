//! Async runtime for the enforcement engine
//!
//! Pumps every host notification channel on its own task so each channel
//! is processed in receipt order, and drives the poll and watchdog timers.

use crate::host::HostChannels;
use anyhow::{Context, Result};
use crossbeam::channel::{bounded, select, Receiver, Sender};
use earguard_core::domain::{
    CeilingStore, ConfigChange, ConfigWatcher, EnforcementEngine, FileCeilingStore,
    LifecycleTrigger, RawSignal, SignalChannel, WatchdogOutcome,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Running engine with its pump and timer tasks
pub struct EngineRuntime {
    engine: Arc<EnforcementEngine>,
    tasks: Vec<JoinHandle<()>>,
    stop: Option<Sender<()>>,
    boot: WatchdogOutcome,
}

impl EngineRuntime {
    /// Start pumping `channels` and boot the engine
    ///
    /// The config listener subscribes before the boot pass so no store
    /// change is lost; the watchdog ticker is scheduled after it.
    pub async fn start(engine: Arc<EnforcementEngine>, channels: HostChannels) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut runtime = Self {
            engine,
            tasks: Vec::new(),
            stop: Some(stop_tx),
            boot: WatchdogOutcome::Logged,
        };

        let HostChannels {
            settings,
            broadcast,
            lifecycle,
        } = channels;
        runtime.spawn_signal_pump(SignalChannel::SettingsChange, settings, stop_rx.clone());
        runtime.spawn_signal_pump(SignalChannel::Broadcast, broadcast, stop_rx.clone());
        runtime.spawn_lifecycle_pump(lifecycle, stop_rx);
        runtime.spawn_config_listener();
        runtime.spawn_poll_ticker();

        runtime.boot = runtime
            .engine
            .on_lifecycle(LifecycleTrigger::Boot, Instant::now())
            .await;
        info!(outcome = ?runtime.boot, "Engine booted");

        runtime.spawn_watchdog_ticker();
        runtime
    }

    pub fn engine(&self) -> &Arc<EnforcementEngine> {
        &self.engine
    }

    /// Result of the boot pass
    pub fn boot_outcome(&self) -> &WatchdogOutcome {
        &self.boot
    }

    fn spawn_signal_pump(
        &mut self,
        channel: SignalChannel,
        signals: Receiver<RawSignal>,
        stop: Receiver<()>,
    ) {
        let mux = self.engine.multiplexer().clone();
        let handle = tokio::task::spawn_blocking(move || {
            debug!(%channel, "Signal pump started");
            loop {
                select! {
                    recv(signals) -> signal => match signal {
                        Ok(signal) => {
                            mux.on_signal(signal);
                        }
                        Err(_) => break,
                    },
                    recv(stop) -> _ => break,
                }
            }
            debug!(%channel, "Signal pump stopped");
        });
        self.tasks.push(handle);
    }

    fn spawn_lifecycle_pump(&mut self, lifecycle: Receiver<LifecycleTrigger>, stop: Receiver<()>) {
        let (tx, mut rx) = mpsc::channel(16);

        self.tasks.push(tokio::task::spawn_blocking(move || loop {
            select! {
                recv(lifecycle) -> trigger => match trigger {
                    Ok(trigger) => {
                        if tx.blocking_send(trigger).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }));

        let engine = self.engine.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(trigger) = rx.recv().await {
                let outcome = engine.on_lifecycle(trigger, Instant::now()).await;
                debug!(?trigger, ?outcome, "Lifecycle trigger handled");
            }
        }));
    }

    fn spawn_config_listener(&mut self) {
        let engine = self.engine.clone();
        let mut changes = engine.store().subscribe();

        self.tasks.push(tokio::spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Config listener lagged, re-reading ceiling");
                        match engine.store().ceiling().await {
                            Ok(ceiling) => ConfigChange::Reloaded(ceiling),
                            Err(e) => {
                                error!(error = %e, "Ceiling read failed, keeping cached value");
                                continue;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(outcome) = engine.on_config_change(change, Instant::now()).await {
                    debug!(?change, ?outcome, "Enabled flag applied");
                }
            }
        }));
    }

    fn spawn_poll_ticker(&mut self) {
        let Some(period) = self.engine.config().poll_interval() else {
            debug!("Polling channel disabled");
            return;
        };
        let mux = self.engine.multiplexer().clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mux = mux.clone();
                let poll = tokio::task::spawn_blocking(move || {
                    mux.on_signal(RawSignal::new(SignalChannel::PollTick, None, Instant::now()))
                });
                if let Err(e) = poll.await {
                    error!(error = %e, "Poll evaluation panicked");
                }
            }
        }));
    }

    fn spawn_watchdog_ticker(&mut self) {
        let engine = self.engine.clone();
        let period = engine.supervisor().interval();
        if period.is_zero() {
            warn!("Watchdog interval is zero, periodic supervision disabled");
            return;
        }
        info!(interval_secs = period.as_secs(), "Watchdog scheduled");

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine
                    .on_lifecycle(LifecycleTrigger::WatchdogTick, Instant::now())
                    .await;
            }
        }));
    }

    /// Reload `store` whenever its file is edited on disk
    pub fn watch_config_file(&mut self, watcher: ConfigWatcher, store: Arc<FileCeilingStore>) {
        let mut events = watcher.subscribe();

        self.tasks.push(tokio::spawn(async move {
            let _watcher = watcher;
            loop {
                match events.recv().await {
                    Ok(path) => match store.reload().await {
                        Ok(changed) => debug!(path = %path.display(), changed, "Config file reloaded"),
                        Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable config edit"),
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Stop every authority, then every task
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down engine runtime");
        self.engine.shutdown();

        // Disconnecting the stop channel releases the blocking pumps.
        drop(self.stop.take());

        for task in self.tasks.drain(..) {
            task.abort();
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => return Err(e).context("Runtime task failed"),
            }
        }
        Ok(())
    }
}
