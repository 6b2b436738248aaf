//! Publish Gateway
//!
//! This crate provides the publish path of the message gateway with:
//! - ResourcePool: Generic bounded pool with idle eviction and fair waiting
//! - BrokerPool: Broker connections bound to a versioned broker list
//! - Tag codec: Optional key/value tags framed in front of message bodies
//! - LeakyBuckets: Per-topic admission control
//! - ConnectionTracker: Accept/close hooks and per-client stats
//! - PubServer: Publish orchestration, audit trail and graceful shutdown
//! - Lifecycle: Background reaping, throttle cleanup and stats reporting

pub mod error;
pub mod tag;
pub mod pool;
pub mod broker;
pub mod manager;
pub mod throttle;
pub mod tracker;
pub mod audit;
pub mod server;
pub mod api;
pub mod lifecycle;

pub use error::GatewayError;
pub use tag::{BufferPool, Message, TagError, TagMap, TAG_MARKER};
pub use pool::{PoolError, PoolOptions, PooledResource, Resource, ResourceFactory, ResourcePool};
pub use broker::{BrokerClient, BrokerConnector, BrokerError, ProduceAck, ProduceRecord, TcpConnector};
pub use manager::{BrokerHandle, BrokerPool};
pub use throttle::{LeakyBucket, LeakyBuckets};
pub use tracker::{ClientRegistry, ConnectionGuard, ConnectionTracker};
pub use audit::{AuditEntry, AuditSink, FileAuditSink, MemoryAuditSink};
pub use server::{PubServer, PublishReceipt, PublishRequest};
pub use api::{create_router, serve};
pub use lifecycle::{LifecycleConfig, LifecycleManager};

pub type Result<T> = std::result::Result<T, GatewayError>;
