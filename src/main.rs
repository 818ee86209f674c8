//! Gateway Bridge - Main Entry Point
//!
//! Connects the broker-facing backend, subscribes the configured gateways to
//! their downlink topics and logs downlink frames until interrupted.

use clap::{Parser, Subcommand};
use gateway_bridge::config::BridgeConfig;
use gateway_bridge::lifecycle_span;
use gateway_bridge::observability::{init_default_logging, init_logging_from_env, level_from_config};
use gateway_bridge::{Backend, Eui64};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Instrument};

/// Searched in order when no `--config` is given
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["gateway-bridge.toml", "config/gateway-bridge.toml"];

/// Bridge between a LoRa packet forwarder and an MQTT broker
#[derive(Parser)]
#[command(name = "gateway-bridge")]
#[command(about = "Bridge between a LoRa packet forwarder and an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "GATEWAY_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and relay downlinks
    Run {
        /// Gateway to subscribe to downlinks for (may be repeated)
        #[arg(short, long = "gateway", value_name = "EUI")]
        gateways: Vec<Eui64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            init_default_logging();
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    init_logging_from_env(level_from_config(config.general.log_level));
    info!("Starting gateway bridge v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Run { gateways } => run_bridge(config, gateways).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            return Ok(BridgeConfig::load_from_file(&path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS[0]
    )
    .into())
}

async fn run_bridge(
    config: BridgeConfig,
    gateways: Vec<Eui64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = Backend::connect(&config.backend.mqtt)
        .instrument(lifecycle_span!(phase = "connect"))
        .await?;

    for gateway in &gateways {
        if let Err(e) = backend.subscribe_downlink(*gateway).await {
            error!(gateway = %gateway, error = %e, "Failed to subscribe gateway");
        }
    }

    let mut downlinks = backend
        .take_downlink_receiver()
        .ok_or("downlink receiver already taken")?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(gateway_count = gateways.len(), "Bridge is running");

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            frame = downlinks.recv() => match frame {
                Some(frame) => info!(
                    token = frame.token,
                    gateway = %frame.tx_info.mac,
                    size = frame.phy_payload.len(),
                    "Downlink frame received"
                ),
                None => {
                    warn!("Downlink channel closed");
                    break;
                }
            }
        }
    }

    backend
        .close()
        .instrument(lifecycle_span!(phase = "shutdown"))
        .await?;
    Ok(())
}

fn handle_config_command(
    mut config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        if !config.backend.mqtt.password.is_empty() {
            config.backend.mqtt.password = "********".to_string();
        }
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
