//! Broker executable: configuration, logging, listeners, shutdown.
//!
//! Exit codes: 0 on a clean signal-driven shutdown, 64 for configuration
//! errors, 71 when a listener cannot bind.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shv_broker::{broker::Broker, config::BrokerConfig, outbound, transport};

const EXIT_CONFIG: i32 = 64;
const EXIT_BIND: i32 = 71;

#[derive(Debug, Parser)]
#[command(name = "shvbroker", version, about = "Silicon Heaven RPC broker")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace. `RUST_LOG` wins when
    /// set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = match &args.config {
        Some(path) => match BrokerConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "configuration error");
                return EXIT_CONFIG;
            }
        },
        None => BrokerConfig::default(),
    };
    let config = Arc::new(config);

    let (broker, handle) = Broker::new(Arc::clone(&config));
    let router = tokio::spawn(broker.run());

    let listeners = match transport::start_listeners(&config.listen, handle.clone()).await {
        Ok(listeners) => listeners,
        Err(err) => {
            error!(%err, "cannot start listening");
            return EXIT_BIND;
        }
    };
    let outbound_tasks = outbound::start_outbound(Arc::clone(&config), handle.clone());

    info!(
        listeners = listeners.len(),
        connections = outbound_tasks.len(),
        "broker running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => error!(%err, "cannot wait for the shutdown signal"),
    }

    for task in listeners.iter().chain(outbound_tasks.iter()) {
        task.abort();
    }
    handle.shutdown().await;
    let _ = router.await;
    info!("broker stopped");
    0
}
