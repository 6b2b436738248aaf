//! BrokerPool - Owns the pool of broker connections for one broker list
//!
//! The live pool is bound to the broker list it was built with. A changed
//! list reported through `refresh_broker_list` is only recorded; it reaches
//! new connections after an explicit `rebuild`, which swaps in a fresh pool
//! and closes the old one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn, error};

use gw_common::{BrokerPoolConfig, PoolStats};
use crate::broker::{BrokerConnFactory, BrokerConnector};
use crate::error::GatewayError;
use crate::pool::{PoolError, PoolOptions, PooledResource, ResourcePool};
use crate::Result;

pub type BrokerConnPool = ResourcePool<BrokerConnFactory>;

/// A checked-out broker connection; recycles itself when dropped
pub type BrokerHandle = PooledResource<BrokerConnFactory>;

struct PoolSlot {
    version: u64,
    brokers: Vec<String>,
    pool: BrokerConnPool,
}

/// Broker connection manager
pub struct BrokerPool {
    name: String,
    config: BrokerPoolConfig,
    connector: Arc<dyn BrokerConnector>,
    current: RwLock<Arc<PoolSlot>>,
    /// Broker list reported by the last refresh that differed from the live one
    pending: Mutex<Option<Vec<String>>>,
    closed: AtomicBool,
}

impl BrokerPool {
    pub fn new(name: impl Into<String>, config: BrokerPoolConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let name = name.into();
        let slot = Self::build_slot(&name, 1, config.brokers.clone(), &config, &connector);

        Self {
            name,
            config,
            connector,
            current: RwLock::new(Arc::new(slot)),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn build_slot(
        name: &str,
        version: u64,
        brokers: Vec<String>,
        config: &BrokerPoolConfig,
        connector: &Arc<dyn BrokerConnector>,
    ) -> PoolSlot {
        let factory = BrokerConnFactory::new(brokers.clone(), connector.clone(), config.connect_timeout());
        let pool = ResourcePool::new(
            factory,
            PoolOptions {
                name: format!("{}-v{}", name, version),
                max_size: config.max_size,
                max_idle: config.max_idle,
                min_idle: 0,
                idle_timeout: config.idle_timeout(),
                max_lifetime: config.max_lifetime(),
            },
        );

        PoolSlot { version, brokers, pool }
    }

    fn slot(&self) -> Arc<PoolSlot> {
        self.current.read().clone()
    }

    /// Check out a broker connection.
    ///
    /// Drop or `recycle()` the handle when done; dead connections are
    /// destroyed instead of going back to the idle set.
    pub async fn get(&self) -> Result<BrokerHandle> {
        let slot = self.slot();
        let started = Instant::now();

        match slot.pool.acquire(self.config.acquire_timeout()).await {
            Ok(handle) => Ok(handle),
            Err(PoolError::Factory { elapsed, source }) => {
                error!(
                    pool = %self.name,
                    brokers = ?slot.brokers,
                    error = %source,
                    elapsed_ms = elapsed.as_millis() as u64,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Failed to open broker connection"
                );
                Err(GatewayError::FactoryError { elapsed, source })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compare `brokers` with the live list as sets.
    ///
    /// Returns true on drift. The live pool is left untouched; the new list is
    /// kept until `rebuild`.
    pub fn refresh_broker_list(&self, brokers: Vec<String>) -> bool {
        let slot = self.slot();
        let old: HashSet<&String> = slot.brokers.iter().collect();
        let new: HashSet<&String> = brokers.iter().collect();

        if old == new {
            *self.pending.lock() = None;
            return false;
        }

        warn!(
            pool = %self.name,
            old = ?slot.brokers,
            new = ?brokers,
            version = slot.version,
            "Broker list changed; live pool keeps the old list until rebuilt"
        );
        *self.pending.lock() = Some(brokers);
        true
    }

    /// Swap in a fresh pool bound to the pending broker list (or the current
    /// one if nothing is pending) and close the old pool.
    ///
    /// Connections still checked out from the old pool are destroyed when
    /// they are returned. Returns the new pool version.
    pub fn rebuild(&self) -> Result<u64> {
        let old = {
            // `close` flips the flag under the same lock, so a rebuilt pool
            // can never outlive it
            let mut current = self.current.write();
            if self.closed.load(Ordering::SeqCst) {
                return Err(GatewayError::PoolClosed);
            }
            let brokers = self.pending.lock().take().unwrap_or_else(|| current.brokers.clone());
            let slot = Self::build_slot(&self.name, current.version + 1, brokers, &self.config, &self.connector);
            std::mem::replace(&mut *current, Arc::new(slot))
        };
        old.pool.close();

        let slot = self.slot();
        info!(
            pool = %self.name,
            old_version = old.version,
            new_version = slot.version,
            old_brokers = ?old.brokers,
            brokers = ?slot.brokers,
            "Rebuilt broker pool"
        );
        Ok(slot.version)
    }

    /// Evict expired idle connections
    pub fn reap(&self) -> usize {
        self.slot().pool.reap()
    }

    pub fn close(&self) {
        let current = self.current.write();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %self.name, "Closing broker pool");
        current.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Broker list the live pool connects with
    pub fn broker_list(&self) -> Vec<String> {
        self.slot().brokers.clone()
    }

    pub fn pending_broker_list(&self) -> Option<Vec<String>> {
        self.pending.lock().clone()
    }

    pub fn version(&self) -> u64 {
        self.slot().version
    }

    pub fn stats(&self) -> PoolStats {
        self.slot().pool.stats()
    }
}
