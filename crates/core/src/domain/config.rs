//! Configuration management for Earguard
//!
//! This module provides:
//! - Configuration structs for the ceiling and the engine tunables
//! - TOML persistence with factory defaults and corrupt-file recovery
//! - The [`CeilingStore`] collaborator interface with change notifications
//! - A lock-free cached copy of the ceiling read by the evaluation path
//! - Hot-reload support via file system watcher

use crate::domain::policy::{CeilingPercent, TieBreak};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("File watch error: {0}")]
    WatchError(#[from] notify::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Guardian-controlled ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeilingConfig {
    /// Ceiling as a percentage of the stream maximum
    #[serde(default)]
    pub percent: CeilingPercent,

    /// Whether enforcement should be running at all
    #[serde(default)]
    pub enabled: bool,
}

impl Default for CeilingConfig {
    fn default() -> Self {
        Self {
            percent: CeilingPercent::default(),
            enabled: false,
        }
    }
}

/// Engine tunables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Boundary rule for intercepted volume-up keys
    pub tie_break: TieBreak,

    /// Debounce window for observation notifications (0 = one evaluation per notification)
    pub debounce_ms: u64,

    /// Polling channel period in milliseconds (0 = disabled)
    pub poll_interval_ms: u64,

    /// Watchdog period in seconds
    pub watchdog_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::PreventiveAtBoundary,
            debounce_ms: 0,
            poll_interval_ms: 1000,
            watchdog_interval_secs: 15 * 60,
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

/// Complete Earguard configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarguardConfig {
    #[serde(default)]
    pub ceiling: CeilingConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl EarguardConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Factory default: 50% ceiling, enforcement off
    pub fn factory_default() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.watchdog_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Change notification emitted by a [`CeilingStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    Percent(CeilingPercent),
    Enabled(bool),
    Reloaded(CeilingConfig),
}

/// Trait for the persisted ceiling preferences
///
/// Authoritative source of the ceiling; the engine only caches it.
#[async_trait::async_trait]
pub trait CeilingStore: Send + Sync {
    async fn ceiling_percent(&self) -> Result<CeilingPercent>;

    /// Values outside `0..=100` are coerced into range
    async fn set_ceiling_percent(&self, percent: i64) -> Result<()>;

    async fn is_enabled(&self) -> Result<bool>;

    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange>;

    async fn ceiling(&self) -> Result<CeilingConfig> {
        Ok(CeilingConfig {
            percent: self.ceiling_percent().await?,
            enabled: self.is_enabled().await?,
        })
    }
}

/// In-memory store, used by tests and the simulator
pub struct MemoryCeilingStore {
    state: RwLock<CeilingConfig>,
    changes: broadcast::Sender<ConfigChange>,
}

impl MemoryCeilingStore {
    pub fn new(initial: CeilingConfig) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            state: RwLock::new(initial),
            changes,
        }
    }

    fn snapshot(&self) -> CeilingConfig {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, change: ConfigChange) {
        // No subscriber is a normal state before the engine starts.
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryCeilingStore {
    fn default() -> Self {
        Self::new(CeilingConfig::default())
    }
}

#[async_trait::async_trait]
impl CeilingStore for MemoryCeilingStore {
    async fn ceiling_percent(&self) -> Result<CeilingPercent> {
        Ok(self.snapshot().percent)
    }

    async fn set_ceiling_percent(&self, percent: i64) -> Result<()> {
        let percent = CeilingPercent::new(percent);
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .percent = percent;
        self.notify(ConfigChange::Percent(percent));
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.snapshot().enabled)
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .enabled = enabled;
        self.notify(ConfigChange::Enabled(enabled));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}

/// Cached ceiling read by the evaluation critical section
///
/// Single writer (the change listener), many readers.
#[derive(Debug)]
pub struct CeilingCache {
    percent: AtomicU8,
    enabled: AtomicBool,
}

impl CeilingCache {
    pub fn new(initial: CeilingConfig) -> Self {
        Self {
            percent: AtomicU8::new(initial.percent.get()),
            enabled: AtomicBool::new(initial.enabled),
        }
    }

    pub fn percent(&self) -> CeilingPercent {
        CeilingPercent::from(self.percent.load(Ordering::Acquire))
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn get(&self) -> CeilingConfig {
        CeilingConfig {
            percent: self.percent(),
            enabled: self.enabled(),
        }
    }

    /// Apply a change notification; returns true when the percent moved
    pub fn apply(&self, change: ConfigChange) -> bool {
        match change {
            ConfigChange::Percent(percent) => {
                self.percent.swap(percent.get(), Ordering::AcqRel) != percent.get()
            }
            ConfigChange::Enabled(enabled) => {
                self.enabled.store(enabled, Ordering::Release);
                false
            }
            ConfigChange::Reloaded(config) => {
                self.enabled.store(config.enabled, Ordering::Release);
                self.percent.swap(config.percent.get(), Ordering::AcqRel) != config.percent.get()
            }
        }
    }

    /// Re-read from the store; a failed read keeps the last cached value
    pub async fn refresh(&self, store: &dyn CeilingStore) -> CeilingConfig {
        match store.ceiling().await {
            Ok(config) => {
                self.apply(ConfigChange::Reloaded(config));
                config
            }
            Err(e) => {
                warn!(error = %e, "Ceiling read failed, keeping cached value");
                self.get()
            }
        }
    }
}

impl Default for CeilingCache {
    fn default() -> Self {
        Self::new(CeilingConfig::default())
    }
}

/// File system watcher for hot-reload
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    config_tx: broadcast::Sender<PathBuf>,
}

impl ConfigWatcher {
    /// Watch `config_path` for external edits
    pub async fn new(config_path: PathBuf) -> Result<Self> {
        use notify::Watcher;

        let (config_tx, _config_rx) = broadcast::channel(32);

        let watch_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::Invalid("Config path has no parent directory".to_string()))?;
        fs::create_dir_all(&watch_dir).await?;

        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let tx_clone = config_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    for path in event.paths {
                        if path.file_name().map(|n| n.to_os_string()) == file_name {
                            if let Err(e) = tx_clone.send(path) {
                                debug!("No listener for config change event: {}", e);
                            }
                        }
                    }
                }
            }
        })?;

        watcher.watch(&watch_dir, notify::RecursiveMode::NonRecursive)?;

        info!(
            path = %config_path.display(),
            "Config watcher started"
        );

        Ok(Self {
            _watcher: watcher,
            config_tx,
        })
    }

    /// Subscribe to config change events
    pub fn subscribe(&self) -> broadcast::Receiver<PathBuf> {
        self.config_tx.subscribe()
    }
}

/// Configuration manager for the main Earguard config
///
/// Manages the configuration file at `~/.config/earguard/config.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager rooted at `config_dir`
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");

        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    ///
    /// Returns `~/.config/earguard` on Linux/Mac
    /// Returns `%APPDATA%\earguard` on Windows
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("earguard"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    /// Get the config file path
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// If the config file doesn't exist, returns factory default.
    /// If the config file is corrupt, logs an error and returns factory default.
    #[instrument(skip(self))]
    pub async fn load(&self) -> EarguardConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = EarguardConfig::factory_default();

            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }

            return config;
        }

        match EarguardConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                EarguardConfig::factory_default()
            }
        }
    }

    /// Save configuration to file
    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &EarguardConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;

        config.save_to_file(&self.config_path).await
    }

    /// Check if config file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}

/// [`CeilingStore`] persisted through a [`ConfigManager`]
pub struct FileCeilingStore {
    manager: ConfigManager,
    state: RwLock<EarguardConfig>,
    changes: broadcast::Sender<ConfigChange>,
}

impl FileCeilingStore {
    pub async fn open(manager: ConfigManager) -> Self {
        let config = manager.load().await;
        let (changes, _) = broadcast::channel(32);
        Self {
            manager,
            state: RwLock::new(config),
            changes,
        }
    }

    pub fn config_path(&self) -> &Path {
        self.manager.config_path()
    }

    pub fn config(&self) -> EarguardConfig {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn engine(&self) -> EngineConfig {
        self.config().engine
    }

    /// Re-read the file after an external edit
    ///
    /// Emits a notification only when the ceiling actually changed, so our
    /// own writes echoing back through the watcher stay silent.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<bool> {
        let loaded = EarguardConfig::load_from_file(self.manager.config_path()).await?;
        let changed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let changed = state.ceiling != loaded.ceiling;
            *state = loaded.clone();
            changed
        };

        if changed {
            info!(
                percent = %loaded.ceiling.percent,
                enabled = loaded.ceiling.enabled,
                "Ceiling changed on disk"
            );
            let _ = self.changes.send(ConfigChange::Reloaded(loaded.ceiling));
        }
        Ok(changed)
    }

    async fn update<F>(&self, edit: F) -> Result<EarguardConfig>
    where
        F: FnOnce(&mut EarguardConfig) + Send,
    {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            edit(&mut state);
            state.clone()
        };
        self.manager.save(&snapshot).await?;
        Ok(snapshot)
    }
}

#[async_trait::async_trait]
impl CeilingStore for FileCeilingStore {
    async fn ceiling_percent(&self) -> Result<CeilingPercent> {
        Ok(self.config().ceiling.percent)
    }

    async fn set_ceiling_percent(&self, percent: i64) -> Result<()> {
        let percent = CeilingPercent::new(percent);
        self.update(|config| config.ceiling.percent = percent).await?;
        info!(%percent, "Ceiling percent saved");
        let _ = self.changes.send(ConfigChange::Percent(percent));
        Ok(())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.config().ceiling.enabled)
    }

    async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.update(|config| config.ceiling.enabled = enabled).await?;
        info!(enabled, "Enforcement flag saved");
        let _ = self.changes.send(ConfigChange::Enabled(enabled));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }
}
