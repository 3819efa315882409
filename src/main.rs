//! Zenoh bridge for host statistics.
//!
//! Samples kernel counters and publishes derived metrics to Zenoh, with
//! an optional WebSocket endpoint for live viewers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use zenoh_bridge_hoststats::config::{BridgeConfig, PublishMode};
use zenoh_bridge_hoststats::connection::ConnectionManager;
use zenoh_bridge_hoststats::engine::Engine;
use zenoh_bridge_hoststats::init_tracing;
use zenoh_bridge_hoststats::publisher::StatsPublisher;
use zenoh_bridge_hoststats::readers::ProcReader;
use zenoh_bridge_hoststats::registry::MetricsRegistry;
use zenoh_bridge_hoststats::stream::StreamServer;
use zenoh_bridge_hoststats::transport::ZenohTransport;

/// Zenoh bridge for host statistics.
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-hoststats")]
#[command(about = "Publishes host statistics to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format). Defaults apply when
    /// the file is absent.
    #[arg(short, long, default_value = "hoststats.json5")]
    config: PathBuf,

    /// Override the broker URL from the configuration.
    #[arg(short = 'u', long)]
    broker_url: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Shortcut for --log-level debug.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        BridgeConfig::load(&args.config)?
    } else {
        BridgeConfig::default()
    };

    if let Some(url) = args.broker_url {
        config.broker.url = url;
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    } else if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_tracing(&config.logging)?;

    let hostname = config.get_hostname();
    let endpoint = config.broker.endpoint()?;
    info!(%endpoint, hostname = %hostname, "starting hoststats bridge");

    let registry = Arc::new(MetricsRegistry::new());
    let reader = ProcReader::new(&config.hoststats.proc_root);
    let publisher = StatsPublisher::new(reader, registry.clone());
    let conn = ConnectionManager::new(ZenohTransport, endpoint);

    if !conn.ensure_connected().await {
        warn!("initial broker connection failed, will retry on publish ticks");
    }

    let engine = Engine::start(
        publisher,
        registry.clone(),
        conn,
        &config.hoststats,
        &hostname,
    );

    // The streaming endpoint serves registry snapshots, which only the
    // snapshot publish mode maintains.
    let stream_task = match (config.hoststats.publish.mode, config.hoststats.stream.listen_port)
    {
        (PublishMode::Snapshot, Some(port)) => {
            let server = StreamServer::new(
                registry,
                Duration::from_secs(config.hoststats.stream.ping_interval_secs),
            );
            Some(tokio::spawn(async move {
                if let Err(e) = server.run(port).await {
                    warn!(error = %e, "stream server exited");
                }
            }))
        }
        (PublishMode::PerCategory, Some(_)) => {
            warn!("stream.listen_port is ignored in per-category mode");
            None
        }
        _ => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(task) = stream_task {
        task.abort();
    }
    engine.shutdown().await;

    Ok(())
}
