//! Lifecycle Manager - Background tasks for the publish gateway
//!
//! Handles:
//! - Reaping expired idle broker connections
//! - Purging idle throttle buckets
//! - Periodic stats reporting

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, debug};

use crate::server::PubServer;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Interval for idle connection reaping
    pub reap_interval: Duration,
    /// Interval for throttle bucket cleanup
    pub throttle_purge_interval: Duration,
    /// Interval for the stats report
    pub stats_report_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(5),
            throttle_purge_interval: Duration::from_secs(60),
            stats_report_interval: Duration::from_secs(60),
        }
    }
}

/// Manages background tasks for the publish server
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(server: Arc<PubServer>, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Idle connection reaper
        {
            let server = server.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.reap_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let reaped = server.brokers().reap();
                            if reaped > 0 {
                                debug!(reaped = reaped, "Reaped idle broker connections");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Connection reaper shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Throttle bucket cleanup
        if server.throttle().is_some() {
            let server = server.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.throttle_purge_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Some(throttle) = server.throttle() {
                                throttle.purge_idle();
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Throttle cleanup shutting down");
                            break;
                        }
                    }
                }
            });
        }

        // Stats reporter
        {
            let server = server.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.stats_report_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let stats = server.stats();
                            info!(
                                pool_version = stats.pool_version,
                                idle = stats.pool.idle,
                                checked_out = stats.pool.checked_out,
                                waiters = stats.pool.waiters,
                                concurrent_connections = stats.concurrent_connections,
                                in_flight = stats.in_flight,
                                throttle_keys = stats.throttle_keys,
                                "Publish gateway stats"
                            );
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Stats reporter shutting down");
                            break;
                        }
                    }
                }
            });
        }

        info!("Lifecycle manager started");

        Self { shutdown_tx }
    }

    /// Signal shutdown to all lifecycle tasks
    pub fn shutdown(&self) {
        info!("Shutting down lifecycle manager");
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gw_common::{BrokerPoolConfig, GatewayConfig};
    use crate::audit::MemoryAuditSink;
    use crate::broker::{BrokerClient, BrokerConnector, BrokerError, ProduceAck, ProduceRecord};
    use crate::server::PublishRequest;

    struct NullClient;

    #[async_trait]
    impl BrokerClient for NullClient {
        async fn send(&mut self, _record: &ProduceRecord<'_>) -> Result<ProduceAck, BrokerError> {
            Ok(ProduceAck { partition: 0, offset: 0 })
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) {}

        fn broker(&self) -> &str {
            "null:9092"
        }
    }

    struct NullConnector;

    #[async_trait]
    impl BrokerConnector for NullConnector {
        async fn connect(&self, _brokers: &[String], _timeout: Duration) -> Result<Box<dyn BrokerClient>, BrokerError> {
            Ok(Box::new(NullClient))
        }
    }

    #[tokio::test]
    async fn test_reaper_evicts_idle_connections() {
        let config = GatewayConfig {
            pool: BrokerPoolConfig {
                brokers: vec!["null:9092".to_string()],
                idle_timeout_ms: 20,
                ..BrokerPoolConfig::default()
            },
            ..GatewayConfig::default()
        };
        let server = Arc::new(PubServer::new(config, Arc::new(NullConnector), Arc::new(MemoryAuditSink::new(10))));

        server
            .publish(PublishRequest {
                topic: "orders".to_string(),
                body: b"x".to_vec(),
                ..PublishRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(server.stats().pool.idle, 1);

        let lifecycle = LifecycleManager::start(
            server.clone(),
            LifecycleConfig {
                reap_interval: Duration::from_millis(10),
                ..LifecycleConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.stats().pool.idle, 0);
        assert_eq!(server.stats().pool.destroyed, 1);

        lifecycle.shutdown();
    }
}
