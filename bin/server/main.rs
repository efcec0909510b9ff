//! Log Streaming Server
//!
//! Runs the log streaming subsystem as a standalone HTTP server.

use anyhow::Result;
use clap::Parser;
use runlog_stream::api::{router, ApiState};
use runlog_stream::metrics::LoggingMetrics;
use runlog_stream::{ConnectionRegistry, LogStore, ShutdownCoordinator, StreamConfig};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "runlog-server")]
#[command(about = "SSE log streaming server for execution sessions")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "8080", env = "RUNLOG_PORT")]
    port: u16,

    /// Server host
    #[arg(long, default_value = "0.0.0.0", env = "RUNLOG_HOST")]
    host: String,

    /// Directory holding the per-day JSONL log files
    #[arg(short, long, default_value = "/data/logs", env = "RUNLOG_LOG_DIR")]
    log_dir: String,

    /// Maximum concurrent SSE connections
    #[arg(long, default_value = "100", env = "RUNLOG_MAX_CONNECTIONS")]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runlog_stream=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("Starting Log Streaming Server");
    info!("  Log dir: {}", args.log_dir);
    info!("  Max connections: {}", args.max_connections);
    info!("  Listening on: {}:{}", args.host, args.port);

    let mut config = StreamConfig::default();
    config.admission.max_concurrent_connections = args.max_connections;

    let state = Arc::new(ApiState {
        store: Arc::new(LogStore::new(&args.log_dir)?),
        registry: Arc::new(ConnectionRegistry::new(
            args.max_connections,
            Arc::new(LoggingMetrics),
        )),
        coordinator: Arc::new(ShutdownCoordinator::new()),
        config: config.clone(),
    });

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Endpoints:");
    info!("  GET /health                                      - Health check");
    info!("  GET /api/v1/sessions/:session_id/logs/stream     - Live SSE log tail");

    // On SIGINT: advise every active stream, wait out the grace period so the
    // advisories flush, then let the server close remaining connections.
    let coordinator = Arc::clone(&state.coordinator);
    let session_config = config.session.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(%err, "failed to listen for shutdown signal");
                return;
            }
            let reached = coordinator.drain_all(
                "Server is restarting",
                session_config.shutdown_reconnect_delay_ms,
            );
            info!(reached, "shutdown advisory sent; waiting for grace period");
            tokio::time::sleep(session_config.shutdown_grace()).await;
        })
        .await?;

    info!("Server stopped");
    Ok(())
}
