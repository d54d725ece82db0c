//! omc-consumer: Market data consumer binary
//!
//! Connects to a provider, bootstraps login/directory/dictionaries, opens
//! one streaming item, and prints decoded fields until the run time
//! expires or Ctrl+C.

use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use omc_session::{run_consumer, ConsumerConfig};

#[derive(Parser, Debug)]
#[command(name = "omc-consumer")]
#[command(about = "Market data consumer for OMC")]
struct Args {
    /// Path to YAML consumer configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provider hostname (overrides config file)
    #[arg(long, env = "OMC_HOST")]
    host: Option<String>,

    /// Provider port (overrides config file)
    #[arg(long, env = "OMC_PORT")]
    port: Option<u16>,

    /// Service to consume from (overrides config file)
    #[arg(long, env = "OMC_SERVICE")]
    service: Option<String>,

    /// Item to subscribe to (overrides config file)
    #[arg(long, env = "OMC_ITEM")]
    item: Option<String>,

    /// Run time in seconds (overrides config file)
    #[arg(long, env = "OMC_RUN_TIME_SECS")]
    run_time_secs: Option<u64>,

    /// Directory holding local dictionary files (overrides config file)
    #[arg(long, env = "OMC_DICTIONARY_DIR")]
    dictionary_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let config = ConsumerConfig::load(path)?;
            info!(path = %path.display(), "Loaded consumer configuration");
            config
        }
        None => ConsumerConfig::default(),
    };

    // Command-line flags win over the config file
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(service) = args.service {
        config.service_name = service;
    }
    if let Some(item) = args.item {
        config.item_name = item;
    }
    if let Some(run_time_secs) = args.run_time_secs {
        config.run_time_secs = run_time_secs;
    }
    if let Some(dictionary_dir) = args.dictionary_dir {
        config.dictionary_dir = Some(dictionary_dir);
    }

    info!(
        host = %config.host,
        port = config.port,
        service = %config.service_name,
        item = %config.item_name,
        run_time_secs = config.run_time_secs,
        "omc-consumer starting"
    );

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx.send(true).ok();
    });

    match run_consumer(config, shutdown_rx).await {
        Ok(()) => {
            info!("Consumer stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Consumer error");
            std::process::exit(1);
        }
    }
}
