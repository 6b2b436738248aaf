//! PubServer - Publish path orchestration
//!
//! Per request: validate -> admit -> check out a broker connection -> tag ->
//! send -> audit. The connection and the message buffer are scoped values,
//! so both are returned on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gw_common::{GatewayConfig, GatewayStats, PublishOutcome};
use crate::audit::{AuditEntry, AuditSink};
use crate::broker::{BrokerConnector, ProduceAck, ProduceRecord};
use crate::error::GatewayError;
use crate::manager::BrokerPool;
use crate::tag::{self, BufferPool, TagMap, TAG_MARKER};
use crate::throttle::LeakyBuckets;
use crate::tracker::ConnectionTracker;
use crate::Result;

const MAX_TOPIC_LEN: usize = 249;

/// An inbound publish
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub topic: String,
    pub key: Option<String>,
    pub tags: TagMap,
    pub body: Vec<u8>,
    /// Remote address of the publisher
    pub client: Option<String>,
}

/// Where a published message landed
#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub request_id: Uuid,
    pub partition: i32,
    pub offset: i64,
    /// Bytes written to the broker, including any tag block
    pub size: usize,
    pub tagged: bool,
}

struct Sent {
    ack: ProduceAck,
    size: usize,
}

/// One publish attempt, counted as in flight until dropped.
///
/// Every attempt leaves exactly one audit entry. An attempt dropped before
/// `finish` was abandoned by its caller and is audited as cancelled.
struct Attempt<'a> {
    server: &'a PubServer,
    req: &'a PublishRequest,
    request_id: Uuid,
    started: Instant,
    finished: bool,
}

impl<'a> Attempt<'a> {
    fn enter(server: &'a PubServer, req: &'a PublishRequest) -> Self {
        server.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            server,
            req,
            request_id: Uuid::new_v4(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(&mut self, result: std::result::Result<&Sent, &GatewayError>) {
        self.finished = true;
        match result {
            Ok(sent) => self.record(PublishOutcome::Ok.as_str(), PublishOutcome::Ok, Some(sent), None),
            Err(e) => self.record(e.code(), e.outcome(), None, Some(e.to_string())),
        }
    }

    fn record(&self, code: &str, outcome: PublishOutcome, sent: Option<&Sent>, error: Option<String>) {
        let elapsed = self.started.elapsed();
        metrics::counter!("gateway_pub_total", "outcome" => outcome.as_str()).increment(1);
        metrics::histogram!("gateway_pub_latency_seconds").record(elapsed.as_secs_f64());

        self.server.audit.write(&AuditEntry {
            ts: Utc::now(),
            request_id: self.request_id,
            outcome: code.to_string(),
            topic: self.req.topic.clone(),
            key: self.req.key.clone(),
            size: sent.map(|s| s.size).unwrap_or(self.req.body.len()),
            tagged: !self.req.tags.is_empty(),
            client: self.req.client.clone(),
            partition: sent.map(|s| s.ack.partition),
            offset: sent.map(|s| s.ack.offset),
            elapsed_us: elapsed.as_micros() as u64,
            error,
        });
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(topic = %self.req.topic, request_id = %self.request_id, "Publish cancelled before completion");
            let outcome = PublishOutcome::Cancelled;
            self.record(outcome.as_str(), outcome, None, Some("request cancelled".to_string()));
        }
        self.server.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Publish server
pub struct PubServer {
    config: GatewayConfig,
    brokers: Arc<BrokerPool>,
    throttle: Option<LeakyBuckets>,
    tracker: Arc<ConnectionTracker>,
    audit: Arc<dyn AuditSink>,
    buffers: Arc<BufferPool>,
    running: AtomicBool,
    shutdown_started: AtomicBool,
    in_flight: AtomicUsize,
}

impl PubServer {
    pub fn new(config: GatewayConfig, connector: Arc<dyn BrokerConnector>, audit: Arc<dyn AuditSink>) -> Self {
        let brokers = Arc::new(BrokerPool::new("pub", config.pool.clone(), connector));
        let throttle = config
            .throttle
            .is_enabled()
            .then(|| LeakyBuckets::new(config.throttle.capacity, config.throttle.window()));
        let tracker = Arc::new(
            ConnectionTracker::new(!config.disable_metrics, config.enable_client_stats).with_max_clients(config.max_clients),
        );

        info!(
            brokers = ?config.pool.brokers,
            pool_size = config.pool.max_size,
            qps_limit = config.throttle.capacity,
            max_pub_size = config.max_pub_size,
            max_clients = config.max_clients,
            "Publish server created"
        );

        Self {
            config,
            brokers,
            throttle,
            tracker,
            audit,
            buffers: BufferPool::global(),
            running: AtomicBool::new(true),
            shutdown_started: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Publish one message and audit the attempt
    pub async fn publish(&self, req: PublishRequest) -> Result<PublishReceipt> {
        let mut attempt = Attempt::enter(self, &req);
        let result = self.process(&req).await;
        attempt.finish(result.as_ref());

        match result {
            Ok(sent) => {
                metrics::counter!("gateway_pub_bytes_total").increment(sent.size as u64);
                if let (Some(clients), Some(client)) = (self.tracker.clients(), req.client.as_deref()) {
                    clients.record_publish(client, sent.size);
                }
                Ok(PublishReceipt {
                    request_id: attempt.request_id,
                    partition: sent.ack.partition,
                    offset: sent.ack.offset,
                    size: sent.size,
                    tagged: !req.tags.is_empty(),
                })
            }
            Err(e) => {
                log_failure(&req, &e);
                Err(e)
            }
        }
    }

    /// Audit a publish refused before it reached `publish`, e.g. an
    /// unreadable tag header, and hand the error back
    pub fn reject(&self, req: &PublishRequest, err: GatewayError) -> GatewayError {
        let mut attempt = Attempt::enter(self, req);
        attempt.finish(Err(&err));
        log_failure(req, &err);
        err
    }

    async fn process(&self, req: &PublishRequest) -> Result<Sent> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(GatewayError::ShuttingDown);
        }

        self.validate(req)?;

        if let Some(throttle) = &self.throttle {
            if !throttle.try_consume(&req.topic, 1) {
                return Err(GatewayError::Throttled { key: req.topic.clone() });
            }
        }

        let mut conn = self.brokers.get().await?;
        let msg = tag::tag_message(&self.buffers, &req.tags, &req.body);

        let record = ProduceRecord {
            topic: &req.topic,
            key: req.key.as_deref().map(str::as_bytes),
            value: msg.body(),
        };

        // A send dropped midway leaves the connection mid-frame; it is only
        // trusted again once the broker has answered
        conn.mark_broken();
        let result = conn.send(&record).await;
        let size = msg.len();
        msg.release();

        match result {
            Ok(ack) => {
                conn.mark_healthy();
                conn.recycle();
                Ok(Sent { ack, size })
            }
            Err(e) => {
                conn.recycle();
                Err(GatewayError::BrokerWriteError(e))
            }
        }
    }

    fn validate(&self, req: &PublishRequest) -> Result<()> {
        if req.topic.is_empty() || req.topic.len() > MAX_TOPIC_LEN {
            return Err(GatewayError::InvalidRequest(format!("invalid topic length {}", req.topic.len())));
        }
        if !req
            .topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(GatewayError::InvalidRequest(format!("invalid topic '{}'", req.topic)));
        }
        if req.body.len() > self.config.max_pub_size {
            return Err(GatewayError::MessageTooLarge {
                size: req.body.len(),
                limit: self.config.max_pub_size,
            });
        }
        // Untagged bodies must not be mistaken for envelopes downstream
        if req.tags.is_empty() && req.body.first() == Some(&TAG_MARKER) {
            return Err(GatewayError::InvalidRequest("untagged body starts with the tag marker".to_string()));
        }
        Ok(())
    }

    /// Stop admitting requests, drain in-flight ones, flush the audit trail
    /// and close the broker pool. Only the first call does any work.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Publish server shutting down...");
        self.running.store(false, Ordering::SeqCst);

        let start = Instant::now();
        while self.in_flight() > 0 && start.elapsed() < drain_timeout {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let remaining = self.in_flight();
        if remaining > 0 {
            warn!(remaining = remaining, "In-flight publishes still running after drain timeout");
        }

        self.audit.flush();

        let stats = self.stats();
        info!(
            total_connections = stats.total_connections,
            concurrent_connections = stats.concurrent_connections,
            pool_created = stats.pool.created,
            pool_destroyed = stats.pool.destroyed,
            "Final publish stats"
        );

        self.brokers.close();
        info!("Publish server shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn brokers(&self) -> &Arc<BrokerPool> {
        &self.brokers
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn throttle(&self) -> Option<&LeakyBuckets> {
        self.throttle.as_ref()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pool: self.brokers.stats(),
            pool_version: self.brokers.version(),
            brokers: self.brokers.broker_list(),
            concurrent_connections: self.tracker.concurrent(),
            total_connections: self.tracker.total(),
            rejected_connections: self.tracker.rejected(),
            in_flight: self.in_flight(),
            throttle_keys: self.throttle.as_ref().map(|t| t.len()).unwrap_or(0),
            clients: self.tracker.clients().map(|c| c.snapshot()).unwrap_or_default(),
        }
    }
}

fn log_failure(req: &PublishRequest, err: &GatewayError) {
    if err.is_backpressure() {
        debug!(topic = %req.topic, error = %err, "Publish rejected");
    } else {
        warn!(topic = %req.topic, error = %err, "Publish failed");
    }
}
