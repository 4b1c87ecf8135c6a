//! upos
//!
//! Command line front end of the UPOS device runtime. Loads a device
//! configuration, opens the configured devices on their simulators and
//! prints what the application would see.

mod console;
mod demo;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use upos_devices::open_simulated;
use upos_runtime::{DeviceRegistry, RuntimeConfig};

use console::ConsoleListener;

#[derive(Parser, Debug)]
#[command(name = "upos")]
#[command(author, version, about = "UPOS device runtime")]
#[command(long_about = "
Opens point-of-sale devices described in a TOML file and drives them
through the UPOS runtime.

EXAMPLES:
    # Validate a configuration
    upos --config devices.toml check

    # Print the configuration as JSON
    upos --config devices.toml check --json

    # Open every device, exercise it and print its events
    upos --config devices.toml demo --properties
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", default_value = "devices.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that every configured device can be built
    Check {
        /// Print the parsed configuration as JSON
        #[arg(long)]
        json: bool,
    },
    /// Open, enable and exercise every configured device
    Demo {
        /// Also print property changes
        #[arg(long)]
        properties: bool,

        /// Only this logical name
        #[arg(long, value_name = "NAME")]
        device: Option<String>,
    },
}

fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level).context("Failed to setup logging")?;

    let config = RuntimeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    info!(
        "Loaded {} device(s) from {}",
        config.devices.len(),
        args.config.display()
    );

    match args.command {
        Command::Check { json } => check(&config, json),
        Command::Demo { properties, device } => demo(&config, properties, device.as_deref()).await,
    }
}

fn check(config: &RuntimeConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
    }
    let mut failed = 0;
    for device in &config.devices {
        match upos_devices::simulate(&device.category, &device.properties) {
            Ok(_) => println!(
                "ok      {:<12} {:<14} {}",
                device.logical_name, device.category, device.physical_id
            ),
            Err(e) => {
                failed += 1;
                println!("FAILED  {:<12} {}", device.logical_name, e);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} device(s) failed the check");
    }
    Ok(())
}

async fn demo(config: &RuntimeConfig, properties: bool, only: Option<&str>) -> Result<()> {
    let registry = DeviceRegistry::with_options(config.runtime.clone());
    let listener = Arc::new(ConsoleListener { properties });

    let devices: Vec<_> = config
        .devices
        .iter()
        .filter(|d| only.is_none_or(|name| d.logical_name == name))
        .collect();
    if devices.is_empty() {
        bail!("No device to run");
    }

    for entry in devices {
        println!("== {} ({})", entry.logical_name, entry.category);
        let (service, handle) = open_simulated(&registry, entry, listener.clone())
            .await
            .with_context(|| format!("Failed to open {}", entry.logical_name))?;

        let (service, outcome) = match demo::enable(&service).await {
            Ok(()) => demo::run(service, &handle).await,
            Err(e) => (service, Err(e)),
        };
        match outcome {
            Ok(()) => println!("  state: {:?}", service.state()),
            Err(e) => error!("{}: {:#}", entry.logical_name, e),
        }
        service.close().await?;
    }
    Ok(())
}
