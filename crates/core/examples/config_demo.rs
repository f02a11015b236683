//! Example demonstrating the ceiling configuration store
//!
//! Run with: cargo run --package earguard-core --example config_demo

use earguard_core::domain::{
    allowed_level, CeilingStore, ConfigChange, ConfigManager, EarguardConfig, FileCeilingStore,
};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("earguard_core=debug,info")
        .init();

    println!("=== Earguard Configuration Demo ===\n");

    let demo_dir = PathBuf::from("demo_config");

    // 1. Opening a store on an empty directory writes the factory default
    println!("1. Opening store in {}...", demo_dir.display());
    let store = FileCeilingStore::open(ConfigManager::new(demo_dir.clone())).await;
    let ceiling = store.ceiling().await?;
    println!(
        "   ✓ Ceiling {} (enabled: {}), written to {}",
        ceiling.percent,
        ceiling.enabled,
        store.config_path().display()
    );

    // 2. Subscribe before changing anything
    let mut changes = store.subscribe();

    // 3. Out-of-range values are coerced
    println!("\n2. Setting ceiling to 140%...");
    store.set_ceiling_percent(140).await?;
    store.set_enabled(true).await?;
    while let Ok(change) = changes.try_recv() {
        match change {
            ConfigChange::Percent(p) => println!("   → percent is now {}", p),
            ConfigChange::Enabled(e) => println!("   → enabled is now {}", e),
            ConfigChange::Reloaded(c) => println!("   → reloaded {:?}", c),
        }
    }

    // 4. Allowed levels for a few device maxima
    println!("\n3. Allowed levels at 40%:");
    store.set_ceiling_percent(40).await?;
    let percent = store.ceiling_percent().await?;
    for max in [7, 15, 25, 100] {
        println!("   max {:>3} → allowed {}", max, allowed_level(max, percent));
    }

    // 5. The file on disk round-trips
    println!("\n4. Reading the file back...");
    let loaded = EarguardConfig::load_from_file(store.config_path()).await?;
    println!(
        "   ✓ percent {}, tie break {:?}, watchdog every {:?}",
        loaded.ceiling.percent,
        loaded.engine.tie_break,
        loaded.engine.watchdog_interval()
    );

    println!("\n=== Demo Complete ===");

    std::fs::remove_dir_all(demo_dir)?;

    Ok(())
}
