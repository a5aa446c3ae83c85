//! MQTT bridge - Main Entry Point

use clap::{Parser, Subcommand};
use mqtt_bridge::config::BridgeConfig;
use mqtt_bridge::observability::init_logging_with_verbosity;
use mqtt_bridge::Bridge;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bridge between MQTT devices and the object-graph backend
#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "Bridge between MQTT devices and the object-graph backend")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["mqtt-bridge.toml", "config/mqtt-bridge.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging_with_verbosity(cli.verbose);

    info!("Starting MQTT bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(path)?);
        }
    }

    info!("No configuration file found, using defaults and environment");
    Ok(BridgeConfig::from_env()?)
}

async fn run_bridge(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = Bridge::from_config(config)?;
    let root = bridge.cancellation_token();

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let signals = tokio::spawn(wait_for_shutdown_signal(root.clone(), async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    }));

    if let Err(e) = bridge.start().await {
        bridge.shutdown().await;
        signals.abort();
        if root.is_cancelled() {
            return Ok(());
        }
        return Err(e.into());
    }

    info!("Bridge is running");
    bridge.run().await;

    bridge.shutdown().await;
    signals.abort();
    Ok(())
}

/// Cancel `root` once `signal` resolves
async fn wait_for_shutdown_signal(root: CancellationToken, signal: impl std::future::Future<Output = ()>) {
    tokio::select! {
        _ = root.cancelled() => {}
        _ = signal => root.cancel(),
    }
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        let mut redacted = config.clone();
        if !redacted.core.password.is_empty() {
            redacted.core.password = "***".to_string();
        }
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&redacted)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
