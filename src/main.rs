//! Prometheus exporter for Siemens S7 PLCs.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use s7_exporter_prometheus::config::{ExporterConfig, LogFormat};
use s7_exporter_prometheus::http::HttpServer;
use s7_exporter_prometheus::poller::PlcPoller;
use s7_exporter_prometheus::registry::MetricRegistry;
use s7_exporter_prometheus::s7::S7Transport;

/// Prometheus exporter for Siemens S7 PLCs.
#[derive(Parser, Debug)]
#[command(name = "s7-exporter-prometheus")]
#[command(about = "Polls S7 PLC data blocks and exports them as Prometheus gauges")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "targets.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ExporterConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    info!("Starting s7-exporter-prometheus");
    info!("Loaded configuration from {:?}", args.config);

    let listen_addr: SocketAddr = config.prometheus.listen.parse().map_err(|e| {
        anyhow::anyhow!(
            "Invalid listen address '{}': {}",
            config.prometheus.listen,
            e
        )
    })?;

    // All gauge handles exist before the first poll.
    let registry = Arc::new(
        MetricRegistry::build(&config.targets).context("Failed to build metric registry")?,
    );
    info!(
        "Registered {} metric handle(s) for {} target(s)",
        registry.handle_count(),
        config.targets.len()
    );

    let poller = Arc::new(PlcPoller::new(
        config.targets.clone(),
        registry.clone(),
        S7Transport::default(),
        config.poll_interval(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let poll_poller = poller.clone();
    let poll_shutdown = shutdown_rx.clone();
    let poll_task = tokio::spawn(async move {
        poll_poller.run(poll_shutdown).await;
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    shutdown_tx.send(true)?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = poll_task.await;
        let _ = http_task.await;
    })
    .await;

    let stats = poller.stats();
    info!(
        cycles = stats.cycles,
        published = stats.published,
        skipped = stats.skipped,
        unreachable = stats.unreachable,
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}

async fn sigterm() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    }
    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}
