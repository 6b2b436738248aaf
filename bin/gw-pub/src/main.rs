//! Publish Gateway
//!
//! Accepts messages over HTTP and forwards them to the message brokers
//! through a bounded connection pool.
//!
//! Configuration comes from `GW_*` environment variables (a `.env` file is
//! loaded when present). Set `GW_LOG_JSON=true` for JSON log lines.

use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use gw_common::GatewayConfig;
use gw_gateway::{
    create_router, serve, AuditSink, FileAuditSink, LifecycleConfig, LifecycleManager,
    MemoryAuditSink, PubServer, TcpConnector,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{signal, net::TcpListener, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{info, warn, error};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    info!("Starting publish gateway");

    // 1. Configuration
    let config = GatewayConfig::from_env();
    config.validate()?;

    // 2. Metrics
    let prometheus = if config.disable_metrics {
        info!("Metrics disabled");
        None
    } else {
        Some(PrometheusBuilder::new().install_recorder()?)
    };

    // 3. Audit trail
    let audit: Arc<dyn AuditSink> = match &config.audit.path {
        Some(path) => Arc::new(FileAuditSink::open(path)?),
        None => {
            warn!("Audit log path not set, keeping audit entries in memory only");
            Arc::new(MemoryAuditSink::new(1024))
        }
    };

    // 4. Publish server and background tasks
    let connector = Arc::new(TcpConnector::default());
    let server = Arc::new(PubServer::new(config.clone(), connector, audit));

    let lifecycle = LifecycleManager::start(
        server.clone(),
        LifecycleConfig {
            reap_interval: config.reap_interval(),
            throttle_purge_interval: config.throttle.window().max(Duration::from_secs(1)),
            ..LifecycleConfig::default()
        },
    );

    // 5. HTTP listener
    let app = create_router(server.clone(), prometheus).layer(TraceLayer::new_for_http());
    let listener = TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "Starting HTTP publish server");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let tracker = server.tracker().clone();
    let server_task = tokio::spawn(async move {
        let stop = async move {
            let _ = stop_rx.await;
        };
        if let Err(e) = serve(listener, app, tracker, stop).await {
            error!(error = %e, "HTTP server error");
        }
    });

    info!("Publish gateway started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Stop admitting, drain in-flight publishes, then stop the listener
    server.shutdown(config.shutdown_drain()).await;
    lifecycle.shutdown();
    let _ = stop_tx.send(());

    if tokio::time::timeout(Duration::from_secs(5), server_task).await.is_err() {
        warn!("HTTP server did not stop in time");
    }

    info!("Publish gateway shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("GW_LOG_JSON")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
