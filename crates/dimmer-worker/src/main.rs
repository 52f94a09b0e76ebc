//! Dimmer device worker process
//!
//! Spawned by the host in process mode. Requests arrive on stdin and
//! replies leave on stdout, so all logging goes to stderr.
//!
//! ## Command line flags
//!
//! - `--config <path>`: Config file (default: `~/.config/dimmer/dimmer.yaml`)
//! - `--list`: Print the built-in backends and whether their hardware is present, then exit

use anyhow::{Context, Result};
use dimmer_core::{default_config_path, load_config, serve_stdio, DeviceRegistry, DimmerConfig};
use std::path::PathBuf;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let list_only = args.iter().any(|arg| arg == "--list");
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config: DimmerConfig = load_config(&config_path);
    let registry = DeviceRegistry::from_config(&config.devices);

    if list_only {
        for id in 0..registry.len() {
            if let Some(device) = registry.get(id) {
                let state = if device.query_existence() { "present" } else { "absent" };
                println!("{:>2}  {:<20} {}", id, device.module_name(), state);
            }
        }
        return Ok(());
    }

    log::info!(
        "dimmer-worker {} starting (pid {})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    serve_stdio(registry, config.worker.poll_interval()).context("Device worker failed")?;
    log::info!("dimmer-worker exiting");
    Ok(())
}
