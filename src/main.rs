//! vSilo - virtual silo controller
//!
//! Usage:
//!   vsilo [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: environment only)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vsilo::config::Config;
use vsilo::plane::{MqttPlane, Plane};
use vsilo::silo::{Inbound, Silo, SiloIdentity};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// vSilo - mirrors vThings onto a local MQTT broker
#[derive(Parser, Debug)]
#[command(name = "vsilo")]
#[command(version)]
#[command(about = "Virtual silo controller bridging vThings onto a local MQTT broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let identity = SiloIdentity::from(&config.silo);
    info!("Starting vSilo '{}'", identity.silo_id);
    info!("  Tenant: {}", identity.tenant_id);
    info!("  Owner: {}", identity.owner_id);
    if let Some(params) = &config.silo.flavour_params {
        info!("  Flavour params: {}", params);
    }
    info!("  Control broker: {}", config.control.address);
    info!("  Data broker: {}", config.data.address);
    info!("  Local broker: {}", config.local.address);

    let (control, control_rx, control_task) = MqttPlane::spawn(config.control);
    let (data, data_rx, data_task) = MqttPlane::spawn(config.data);
    let (local, local_rx, local_task) = MqttPlane::spawn(config.local);

    let silo = Silo::new(
        identity,
        control as Arc<dyn Plane>,
        data as Arc<dyn Plane>,
        local as Arc<dyn Plane>,
    );
    let inbound = Inbound {
        control: control_rx,
        data: data_rx,
        local: local_rx,
    };

    silo.run(inbound, vec![control_task, data_task, local_task])
        .await?;

    Ok(())
}
