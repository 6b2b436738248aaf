//! Shared test doubles for the gateway integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;

use gw_common::{BrokerPoolConfig, GatewayConfig, ThrottleConfig};
use gw_gateway::{BrokerClient, BrokerConnector, BrokerError, MemoryAuditSink, ProduceAck, ProduceRecord, PubServer};

/// A record as the broker received it
#[derive(Debug, Clone)]
pub struct Produced {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

/// Mock broker shared by every client the connector hands out
#[derive(Default)]
pub struct MockBroker {
    pub produced: Mutex<Vec<Produced>>,
    pub connects: AtomicU64,
    pub refuse_connects: AtomicBool,
    pub write_delay_ms: AtomicU64,
}

impl MockBroker {
    pub fn produced_count(&self) -> usize {
        self.produced.lock().len()
    }
}

struct MockClient {
    broker: Arc<MockBroker>,
    open: bool,
}

#[async_trait]
impl BrokerClient for MockClient {
    async fn send(&mut self, record: &ProduceRecord<'_>) -> Result<ProduceAck, BrokerError> {
        let delay = self.broker.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut produced = self.broker.produced.lock();
        produced.push(Produced {
            topic: record.topic.to_string(),
            key: record.key.map(|k| k.to_vec()),
            value: record.value.to_vec(),
        });
        Ok(ProduceAck { partition: 0, offset: produced.len() as i64 - 1 })
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn broker(&self) -> &str {
        "mock:9092"
    }
}

pub struct MockConnector(pub Arc<MockBroker>);

#[async_trait]
impl BrokerConnector for MockConnector {
    async fn connect(&self, _brokers: &[String], _timeout: Duration) -> Result<Box<dyn BrokerClient>, BrokerError> {
        if self.0.refuse_connects.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockClient { broker: self.0.clone(), open: true }))
    }
}

pub fn test_config(qps_limit: u64, pool_size: usize) -> GatewayConfig {
    GatewayConfig {
        pool: BrokerPoolConfig {
            brokers: vec!["mock:9092".to_string()],
            max_size: pool_size,
            max_idle: pool_size,
            acquire_timeout_ms: 50,
            ..BrokerPoolConfig::default()
        },
        throttle: ThrottleConfig { capacity: qps_limit, window_ms: 60_000 },
        max_pub_size: 1024,
        enable_client_stats: true,
        disable_metrics: true,
        ..GatewayConfig::default()
    }
}

pub struct TestGateway {
    pub server: Arc<PubServer>,
    pub broker: Arc<MockBroker>,
    pub audit: Arc<MemoryAuditSink>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_gateway(config: GatewayConfig) -> TestGateway {
    init_tracing();
    let broker = Arc::new(MockBroker::default());
    let audit = Arc::new(MemoryAuditSink::new(1000));
    let server = Arc::new(PubServer::new(config, Arc::new(MockConnector(broker.clone())), audit.clone()));
    TestGateway { server, broker, audit }
}
