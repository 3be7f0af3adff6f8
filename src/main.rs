//! OEF core broker - main entry point

use oef_core::config::BrokerConfig;
use oef_core::observability::{health::HealthServer, init_logging, metrics::metrics, LogSettings};
use oef_core::server::Broker;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};

/// Agent communication broker
#[derive(Parser)]
#[command(name = "oef-core")]
#[command(about = "Agent communication broker with service discovery and FIPA negotiation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "OEF_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["oef.toml", "config/oef.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_settings = LogSettings::from_env();
    match cli.verbose {
        0 => {}
        1 => log_settings.level = Level::DEBUG,
        _ => {
            log_settings.level = Level::TRACE;
            log_settings.spans = true;
        }
    }
    if let Err(e) = init_logging(&log_settings) {
        eprintln!("Logging already initialised: {e}");
    }

    info!("Starting oef-core v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_broker(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            BrokerConfig::load_from_file(path)?
        }
        None => match DEFAULT_CONFIG_PATHS.into_iter().map(Path::new).find(|p| p.exists()) {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                BrokerConfig::load_from_file(path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                BrokerConfig::default()
            }
        },
    };
    config.validate()?;
    Ok(config)
}

async fn run_broker(config: BrokerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Broker::bind(&config).await?;
    let addr = broker.local_addr()?;

    if config.health.enabled {
        let health_server = Arc::new(HealthServer::new(
            addr.to_string(),
            config.health.port,
            broker.handle(),
        ));
        tokio::spawn(health_server.start());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!(addr = %addr, "Broker is accepting agents");

    broker
        .run_until(async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
            }
        })
        .await;

    let snapshot = metrics().get_metrics();
    info!(
        connections = snapshot.sessions.connections_accepted,
        envelopes = snapshot.routing.envelopes_processed,
        routed = snapshot.routing.messages_routed,
        uptime_seconds = snapshot.uptime_seconds,
        "Final broker statistics"
    );
    Ok(())
}

fn handle_config_command(config: &BrokerConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_toml_string()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
