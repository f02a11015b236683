//! Earguard CLI Application

use anyhow::Context;
use clap::{Parser, Subcommand};
use earguard_core::domain::{
    allowed_level, CeilingConfig, CeilingStore, Collaborators, ConfigManager, ConfigWatcher,
    EnforcementEngine, EngineConfig, FileCeilingStore, KeyAction, KeyCode, MemoryCeilingStore,
};
use earguard_infra::{EngineRuntime, SimulatedHost};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "earguard")]
#[command(about = "Keeps the media volume under a configured ceiling", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine against a simulated device until interrupted
    Run {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Print the persisted ceiling as JSON
    Status {
        /// Device maximum used to compute the allowed level
        #[arg(long, default_value_t = 15)]
        max: u32,
    },
    /// Set the ceiling percent (values outside 0..=100 are clamped)
    SetLimit {
        #[arg(allow_negative_numbers = true)]
        percent: i64,
    },
    /// Turn enforcement on
    Enable,
    /// Turn enforcement off
    Disable,
    /// Hold the volume-up key on a simulated device and report what happened
    Simulate {
        #[command(flatten)]
        device: DeviceArgs,

        /// Number of key repeats while the key is held
        #[arg(long, default_value_t = 10)]
        repeats: u32,

        /// Delay between key repeats in milliseconds
        #[arg(long, default_value_t = 100)]
        repeat_ms: u64,
    },
}

#[derive(clap::Args)]
struct DeviceArgs {
    /// Device maximum level
    #[arg(long, default_value_t = 15)]
    max: u32,

    /// Level the device starts at
    #[arg(long, default_value_t = 0)]
    initial: u32,

    /// Grant key interception to the engine
    #[arg(long)]
    grant: bool,
}

#[derive(Serialize)]
struct StatusReport {
    config_path: PathBuf,
    ceiling: CeilingConfig,
    max: u32,
    allowed_level: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => ConfigManager::default_config_dir()?,
    };
    let store = Arc::new(FileCeilingStore::open(ConfigManager::new(config_dir)).await);

    match cli.command {
        Command::Run { device } => run(store, device).await,
        Command::Status { max } => status(&store, max).await,
        Command::SetLimit { percent } => {
            store.set_ceiling_percent(percent).await?;
            info!(percent = %store.ceiling_percent().await?, "Ceiling updated");
            Ok(())
        }
        Command::Enable => {
            store.set_enabled(true).await?;
            Ok(())
        }
        Command::Disable => {
            store.set_enabled(false).await?;
            Ok(())
        }
        Command::Simulate {
            device,
            repeats,
            repeat_ms,
        } => simulate(&store, device, repeats, Duration::from_millis(repeat_ms)).await,
    }
}

fn simulated_host(device: &DeviceArgs) -> anyhow::Result<Arc<SimulatedHost>> {
    anyhow::ensure!(device.max > 0, "Device maximum must be positive");
    let host = Arc::new(SimulatedHost::new(device.max, device.initial));
    host.set_interception_granted(device.grant);
    Ok(host)
}

async fn start(
    host: &Arc<SimulatedHost>,
    store: Arc<dyn CeilingStore>,
    engine_config: EngineConfig,
) -> anyhow::Result<EngineRuntime> {
    let engine = Arc::new(
        EnforcementEngine::build(
            Collaborators {
                level: host.clone(),
                host: host.clone(),
                store,
            },
            engine_config,
        )
        .await,
    );

    let hook_engine = engine.clone();
    host.install_hook(Arc::new(move |key| hook_engine.on_key(key)));

    let channels = host
        .take_channels()
        .context("Host notification channels already taken")?;
    Ok(EngineRuntime::start(engine, channels).await)
}

async fn run(store: Arc<FileCeilingStore>, device: DeviceArgs) -> anyhow::Result<()> {
    info!("Earguard starting...");
    let host = simulated_host(&device)?;
    let mut runtime = start(&host, store.clone(), store.engine()).await?;

    let watcher = ConfigWatcher::new(store.config_path().to_path_buf()).await?;
    runtime.watch_config_file(watcher, store);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;

    let status = runtime.engine().status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    host.remove_hook();
    runtime.shutdown().await
}

async fn status(store: &FileCeilingStore, max: u32) -> anyhow::Result<()> {
    let ceiling = store.ceiling().await?;
    let report = StatusReport {
        config_path: store.config_path().to_path_buf(),
        ceiling,
        max,
        allowed_level: allowed_level(max, ceiling.percent),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Scripted held key against an enabled in-memory copy of the ceiling
async fn simulate(
    store: &FileCeilingStore,
    device: DeviceArgs,
    repeats: u32,
    repeat_every: Duration,
) -> anyhow::Result<()> {
    let host = simulated_host(&device)?;
    let ceiling = CeilingConfig {
        enabled: true,
        ..store.ceiling().await?
    };
    let memory = Arc::new(MemoryCeilingStore::new(ceiling));
    let runtime = start(&host, memory, store.engine()).await?;

    for repeat in 0..=repeats {
        let verdict = host.press_key(KeyCode::VolumeUp, KeyAction::Down, repeat);
        info!(repeat, ?verdict, level = host.level(), "Volume up held");
        tokio::time::sleep(repeat_every).await;
    }
    host.press_key(KeyCode::VolumeUp, KeyAction::Up, 0);
    tokio::time::sleep(repeat_every).await;

    let status = runtime.engine().status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    host.remove_hook();
    runtime.shutdown().await
}
