//! Broker binary - routing and fan-out hub for the tracelink fabric

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracelink_broker::{BrokerConfig, server};

#[derive(Parser, Debug)]
#[command(name = "broker")]
#[command(about = "Routing and fan-out broker for tracelink producers and consumers")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "broker.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short = 'P', long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Heartbeat interval in seconds (overrides config)
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Write a default config file and exit
    #[arg(long)]
    create_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracelink_broker=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.create_config {
        BrokerConfig::write_default(&args.config)?;
        info!(path = %args.config.display(), "Wrote default config");
        return Ok(());
    }

    let mut config = BrokerConfig::load_or_default(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(heartbeat) = args.heartbeat {
        config.heartbeat_secs = heartbeat;
    }

    info!(
        port = config.port,
        host = %config.host,
        routes = config.routes.len(),
        "Starting broker"
    );

    // Shut down cleanly on ctrl-c.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, shutting down");
            signal_token.cancel();
        }
    });

    server::run_server(config, shutdown).await?;

    Ok(())
}
