//! Connection lifecycle tracking for the publish listener
//!
//! Accept/close hooks keep the concurrent-connection gauge and, when client
//! statistics are enabled, the registry of active publishers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use gw_common::ClientStats;

const CONCURRENT_GAUGE: &str = "gateway_pub_concurrent_connections";
const REJECTED_COUNTER: &str = "gateway_pub_rejected_connections_total";

/// Active publishers keyed by remote address
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<String, ClientStats>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pub_client(&self, remote_addr: &str) {
        if self.clients.contains_key(remote_addr) {
            return;
        }
        let now = Utc::now();
        self.clients.entry(remote_addr.to_string()).or_insert_with(|| ClientStats {
            remote_addr: remote_addr.to_string(),
            messages: 0,
            bytes: 0,
            first_seen: now,
            last_seen: now,
        });
    }

    pub fn record_publish(&self, remote_addr: &str, bytes: usize) {
        self.register_pub_client(remote_addr);
        if let Some(mut stats) = self.clients.get_mut(remote_addr) {
            stats.messages += 1;
            stats.bytes += bytes as u64;
            stats.last_seen = Utc::now();
        }
    }

    pub fn unregister_pub_client(&self, remote_addr: &str) {
        self.clients.remove(remote_addr);
    }

    pub fn get(&self, remote_addr: &str) -> Option<ClientStats> {
        self.clients.get(remote_addr).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> Vec<ClientStats> {
        let mut clients: Vec<ClientStats> = self.clients.iter().map(|e| e.value().clone()).collect();
        clients.sort_by(|a, b| a.remote_addr.cmp(&b.remote_addr));
        clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Counts open publish connections
#[derive(Debug)]
pub struct ConnectionTracker {
    concurrent: AtomicI64,
    total: AtomicU64,
    rejected: AtomicU64,
    next_id: AtomicU64,
    /// 0 means unlimited
    max_clients: usize,
    metrics_enabled: bool,
    clients: Option<Arc<ClientRegistry>>,
}

impl ConnectionTracker {
    pub fn new(metrics_enabled: bool, client_stats: bool) -> Self {
        Self {
            concurrent: AtomicI64::new(0),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            max_clients: 0,
            metrics_enabled,
            clients: client_stats.then(|| Arc::new(ClientRegistry::new())),
        }
    }

    /// Cap on concurrently open connections enforced by `try_accept`
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn on_accept(&self, conn_id: u64, remote: SocketAddr) {
        self.concurrent.fetch_add(1, Ordering::SeqCst);
        self.admitted(conn_id, remote);
    }

    fn admitted(&self, conn_id: u64, remote: SocketAddr) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if self.metrics_enabled {
            metrics::gauge!(CONCURRENT_GAUGE).increment(1.0);
        }
        debug!(conn_id = conn_id, remote = %remote, "Publish connection accepted");
    }

    pub fn on_close(&self, conn_id: u64, remote: SocketAddr) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        if self.metrics_enabled {
            metrics::gauge!(CONCURRENT_GAUGE).decrement(1.0);
        }
        if let Some(clients) = &self.clients {
            clients.unregister_pub_client(&remote.to_string());
        }
        debug!(conn_id = conn_id, remote = %remote, "Publish connection closed");
    }

    /// Fire `on_accept` and return a guard that fires `on_close` exactly once
    /// when dropped
    pub fn accept(self: &Arc<Self>, remote: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.on_accept(id, remote);
        ConnectionGuard {
            id,
            remote,
            tracker: self.clone(),
        }
    }

    /// Like `accept`, but refuses the connection once `max_clients` are open
    pub fn try_accept(self: &Arc<Self>, remote: SocketAddr) -> Option<ConnectionGuard> {
        let limit = self.max_clients as i64;
        let reserved = self
            .concurrent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (limit == 0 || n < limit).then_some(n + 1));

        if let Err(open) = reserved {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            if self.metrics_enabled {
                metrics::counter!(REJECTED_COUNTER).increment(1);
            }
            warn!(remote = %remote, open = open, max_clients = self.max_clients, "Too many publish clients, connection refused");
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.admitted(id, remote);
        Some(ConnectionGuard {
            id,
            remote,
            tracker: self.clone(),
        })
    }

    pub fn concurrent(&self) -> i64 {
        self.concurrent.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Connections refused by the client cap
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Registry of active publishers, when client stats are enabled
    pub fn clients(&self) -> Option<&Arc<ClientRegistry>> {
        self.clients.as_ref()
    }
}

/// Open connection; closing is tied to drop
#[derive(Debug)]
pub struct ConnectionGuard {
    id: u64,
    remote: SocketAddr,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.on_close(self.id, self.remote);
    }
}
