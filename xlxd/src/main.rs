use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tracing::{Level, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use xlxd::{Daemon, DaemonConfig, EngineConfig, EventBus, EventForwardLayer};

/// How long open connections may linger once the engine has drained.
const SERVER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "xlxd")]
#[command(about = "xlxd - container daemon with background operations")]
struct Args {
    /// Listen address for the REST API
    #[arg(short, long, default_value = "127.0.0.1:8443")]
    listen: String,

    /// Maximum number of operations in flight
    #[arg(long, default_value_t = 256)]
    max_operations: usize,

    /// Seconds finished operations stay queryable
    #[arg(long, default_value_t = 60)]
    retention_secs: u64,

    /// Seconds between sweeps for expired operations
    #[arg(long, default_value_t = 10)]
    reap_interval_secs: u64,

    /// Seconds a cancelled operation gets to stop before it is detached
    #[arg(long, default_value_t = 10)]
    cancel_grace_secs: u64,

    /// Hard limit on operation runtime in seconds (unlimited when unset)
    #[arg(long)]
    operation_timeout_secs: Option<u64>,

    /// Per-listener event buffer
    #[arg(long, default_value_t = 256)]
    event_buffer: usize,

    /// Bearer token required from trusted clients (everyone is trusted when unset)
    #[arg(long)]
    trust_token: Option<String>,

    /// Minimum level of log records published as logging events
    #[arg(long, default_value = "info")]
    log_events_level: Level,

    /// Seconds to wait for running operations at shutdown
    #[arg(long, default_value_t = 30)]
    shutdown_timeout_secs: u64,

    /// Simulated latency of container actions in milliseconds
    #[arg(long, default_value_t = 200)]
    backend_latency_ms: u64,
}

impl From<Args> for DaemonConfig {
    fn from(args: Args) -> Self {
        DaemonConfig {
            listen: args.listen,
            engine: EngineConfig {
                max_operations: args.max_operations,
                retention: Duration::from_secs(args.retention_secs),
                reap_interval: Duration::from_secs(args.reap_interval_secs),
                cancel_grace: Duration::from_secs(args.cancel_grace_secs),
                operation_timeout: args.operation_timeout_secs.map(Duration::from_secs),
            },
            event_buffer: args.event_buffer,
            trust_token: args.trust_token,
            log_events_level: args.log_events_level,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            backend_latency: Duration::from_millis(args.backend_latency_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = DaemonConfig::from(Args::parse());
    let events = EventBus::new(config.event_buffer);

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("xlxd=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .with(EventForwardLayer::new(events.clone(), config.log_events_level))
        .init();

    info!(
        listen = %config.listen,
        max_operations = config.engine.max_operations,
        trusted_by_token = config.trust_token.is_some(),
        "Starting xlxd"
    );

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let daemon = Daemon::new(config, events);
    let router = daemon.router();
    info!("REST API listening on {}", listener.local_addr()?);

    // Create shutdown signal channel
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

    let rest_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // Draining closes websocket sessions; event streams only end with the server
    daemon.shutdown().await;
    match tokio::time::timeout(SERVER_DRAIN, rest_handle).await {
        Ok(Ok(result)) => result?,
        Ok(Err(e)) => warn!(error = %e, "REST server task failed"),
        Err(_) => warn!("Dropping connections still open after shutdown"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = ctrl_c.await;
            info!("Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
