//! ResourcePool - Bounded pool of health-checked, recyclable resources
//!
//! - Factory/liveness/close contract expressed as the `ResourceFactory` and
//!   `Resource` traits
//! - FIFO waiting for capacity through a tokio semaphore, bounded by a timeout
//! - Idle eviction by idle timeout and maximum lifetime, on every
//!   acquire/release and on the periodic `reap` sweep
//! - RAII checkout handle that always returns (or destroys) its resource

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use gw_common::PoolStats;

/// A pooled resource: identity, liveness and teardown
pub trait Resource: Send + 'static {
    /// Process-unique identifier
    fn id(&self) -> u64;

    /// False once the remote end has closed or the resource is unusable
    fn is_open(&self) -> bool;

    /// Tear the resource down. Called exactly once, by the pool.
    fn close(&mut self);
}

/// Creates resources for a pool
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Resource;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Resource, Self::Error>;
}

#[derive(Error, Debug)]
pub enum PoolError<E: std::error::Error + 'static> {
    #[error("no resource available within {0:?}")]
    Exhausted(Duration),

    #[error("pool is closed")]
    Closed,

    #[error("resource factory failed after {elapsed:?}: {source}")]
    Factory {
        elapsed: Duration,
        #[source]
        source: E,
    },
}

/// Pool sizing and eviction settings
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub name: String,
    pub max_size: usize,
    pub max_idle: usize,
    /// Idle resources the timeout sweep leaves alone
    pub min_idle: usize,
    /// Zero disables idle eviction
    pub idle_timeout: Duration,
    /// Zero disables lifetime eviction
    pub max_lifetime: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_size: 10,
            max_idle: 10,
            min_idle: 0,
            idle_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(60),
        }
    }
}

struct IdleEntry<R> {
    resource: R,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState<R> {
    idle: VecDeque<IdleEntry<R>>,
    /// Idle + checked out + being created
    live: usize,
    closed: bool,
}

struct Shared<F: ResourceFactory> {
    opts: PoolOptions,
    factory: F,
    state: Mutex<PoolState<F::Resource>>,
    permits: Arc<Semaphore>,
    waiters: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
}

type Doomed<R> = Vec<(R, &'static str)>;

impl<F: ResourceFactory> Shared<F> {
    fn expiry_reason(&self, created_at: Instant, idle_since: Option<Instant>, now: Instant) -> Option<&'static str> {
        let lifetime = self.opts.max_lifetime;
        if !lifetime.is_zero() && now.duration_since(created_at) >= lifetime {
            return Some("max_lifetime");
        }
        let idle_timeout = self.opts.idle_timeout;
        if let Some(since) = idle_since {
            if !idle_timeout.is_zero() && now.duration_since(since) >= idle_timeout {
                return Some("idle_timeout");
            }
        }
        None
    }

    /// Move expired or dead idle entries into `doomed`
    fn reap_locked(&self, state: &mut PoolState<F::Resource>, now: Instant, doomed: &mut Doomed<F::Resource>) {
        let mut i = 0;
        while i < state.idle.len() {
            let entry = &state.idle[i];
            let reason = if !entry.resource.is_open() {
                Some("dead")
            } else {
                match self.expiry_reason(entry.created_at, Some(entry.idle_since), now) {
                    Some("idle_timeout") if state.idle.len() <= self.opts.min_idle => None,
                    other => other,
                }
            };

            match reason {
                Some(reason) => {
                    if let Some(entry) = state.idle.remove(i) {
                        state.live -= 1;
                        doomed.push((entry.resource, reason));
                    }
                }
                None => i += 1,
            }
        }
    }

    fn destroy(&self, doomed: Doomed<F::Resource>) {
        for (mut resource, reason) in doomed {
            debug!(pool = %self.opts.name, id = resource.id(), reason = reason, "Destroying pooled resource");
            resource.close();
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "gateway_pool_destroyed_total",
                "pool" => self.opts.name.clone(),
                "reason" => reason
            )
            .increment(1);
        }
    }

    fn release(&self, resource: F::Resource, created_at: Instant, broken: bool) {
        let now = Instant::now();
        let mut doomed = Vec::new();
        {
            let mut state = self.state.lock();
            self.reap_locked(&mut state, now, &mut doomed);

            let reason = if broken {
                Some("broken")
            } else if !resource.is_open() {
                Some("dead")
            } else if state.closed {
                Some("closed")
            } else if state.idle.len() >= self.opts.max_idle {
                Some("idle_overflow")
            } else {
                self.expiry_reason(created_at, None, now)
            };

            match reason {
                Some(reason) => {
                    state.live -= 1;
                    doomed.push((resource, reason));
                }
                None => state.idle.push_back(IdleEntry {
                    resource,
                    created_at,
                    idle_since: now,
                }),
            }
        }
        self.destroy(doomed);
    }
}

/// Bounded, health-checked resource pool
pub struct ResourcePool<F: ResourceFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, opts: PoolOptions) -> Self {
        let max_size = opts.max_size.max(1);
        let opts = PoolOptions {
            max_size,
            max_idle: opts.max_idle.min(max_size),
            ..opts
        };

        info!(
            pool = %opts.name,
            max_size = opts.max_size,
            max_idle = opts.max_idle,
            idle_timeout_ms = opts.idle_timeout.as_millis() as u64,
            max_lifetime_ms = opts.max_lifetime.as_millis() as u64,
            "Creating resource pool"
        );

        Self {
            shared: Arc::new(Shared {
                permits: Arc::new(Semaphore::new(max_size)),
                opts,
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    closed: false,
                }),
                waiters: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
        }
    }

    /// Check out a resource, waiting up to `timeout` for capacity.
    ///
    /// Dead or expired idle resources are replaced transparently. A factory
    /// failure is returned as-is and frees the slot for the next caller.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledResource<F>, PoolError<F::Error>> {
        if self.shared.state.lock().closed {
            return Err(PoolError::Closed);
        }

        let permit = {
            let _waiting = Waiting::enter(&self.shared.waiters);
            tokio::time::timeout(timeout, self.shared.permits.clone().acquire_owned()).await
        };

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                debug!(pool = %self.shared.opts.name, timeout_ms = timeout.as_millis() as u64, "Pool exhausted");
                return Err(PoolError::Exhausted(timeout));
            }
        };

        let now = Instant::now();
        let mut doomed = Vec::new();
        let reused = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PoolError::Closed);
            }

            let mut found = None;
            while let Some(entry) = state.idle.pop_back() {
                let reason = if !entry.resource.is_open() {
                    Some("dead")
                } else {
                    self.shared.expiry_reason(entry.created_at, Some(entry.idle_since), now)
                };
                match reason {
                    Some(reason) => {
                        state.live -= 1;
                        doomed.push((entry.resource, reason));
                    }
                    None => {
                        found = Some(entry);
                        break;
                    }
                }
            }
            self.shared.reap_locked(&mut state, now, &mut doomed);

            if found.is_none() {
                if state.live >= self.shared.opts.max_size {
                    // Permits bound checkouts, so this means idle accounting drifted
                    warn!(pool = %self.shared.opts.name, live = state.live, "Pool full with no idle resource");
                    drop(state);
                    self.shared.destroy(doomed);
                    return Err(PoolError::Exhausted(timeout));
                }
                state.live += 1;
            }
            found
        };
        self.shared.destroy(doomed);

        if let Some(entry) = reused {
            return Ok(PooledResource {
                resource: Some(entry.resource),
                created_at: entry.created_at,
                broken: false,
                shared: self.shared.clone(),
                permit: Some(permit),
            });
        }

        // The slot reserved above is handed back if creation fails or is cancelled
        let reservation = Reservation { shared: &self.shared, armed: true };
        let started = Instant::now();
        match self.shared.factory.create().await {
            Ok(resource) => {
                reservation.disarm();
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gateway_pool_created_total", "pool" => self.shared.opts.name.clone()).increment(1);
                debug!(
                    pool = %self.shared.opts.name,
                    id = resource.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Created pooled resource"
                );
                Ok(PooledResource {
                    resource: Some(resource),
                    created_at: Instant::now(),
                    broken: false,
                    shared: self.shared.clone(),
                    permit: Some(permit),
                })
            }
            Err(source) => {
                drop(reservation);
                Err(PoolError::Factory {
                    elapsed: started.elapsed(),
                    source,
                })
            }
        }
    }

    /// Evict expired and dead idle resources; returns how many were destroyed
    pub fn reap(&self) -> usize {
        let mut doomed = Vec::new();
        {
            let mut state = self.shared.state.lock();
            self.shared.reap_locked(&mut state, Instant::now(), &mut doomed);
        }
        let count = doomed.len();
        self.shared.destroy(doomed);
        count
    }

    /// Destroy idle resources and refuse further checkouts.
    ///
    /// Checked-out resources are destroyed when they come back.
    pub fn close(&self) {
        let doomed: Doomed<F::Resource> = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.live -= idle.len();
            idle.into_iter().map(|e| (e.resource, "closed")).collect()
        };
        self.shared.permits.close();
        info!(pool = %self.shared.opts.name, idle_closed = doomed.len(), "Closing resource pool");
        self.shared.destroy(doomed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn name(&self) -> &str {
        &self.shared.opts.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.shared.opts
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            name: self.shared.opts.name.clone(),
            max_size: self.shared.opts.max_size,
            max_idle: self.shared.opts.max_idle,
            idle: state.idle.len(),
            checked_out: state.live - state.idle.len(),
            waiters: self.shared.waiters.load(Ordering::SeqCst),
            created: self.shared.created.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }
}

/// Counts a caller waiting for a permit, including callers that give up
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::SeqCst);
        Self(waiters)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Reservation<'a, F: ResourceFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<F: ResourceFactory> Reservation<'_, F> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<F: ResourceFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state.lock().live -= 1;
        }
    }
}

/// A checked-out resource. Returns to the pool when dropped or recycled.
pub struct PooledResource<F: ResourceFactory> {
    resource: Option<F::Resource>,
    created_at: Instant,
    broken: bool,
    shared: Arc<Shared<F>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<F: ResourceFactory> PooledResource<F> {
    /// Hand the resource back; dead resources are destroyed instead of reused
    pub fn recycle(self) {
        drop(self)
    }

    /// Make sure the resource is destroyed rather than reused
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Undo `mark_broken` once the resource is known to be in a clean state
    pub fn mark_healthy(&mut self) {
        self.broken = false;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl<F: ResourceFactory> Deref for PooledResource<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("pooled resource is only taken on drop")
    }
}

impl<F: ResourceFactory> DerefMut for PooledResource<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("pooled resource is only taken on drop")
    }
}

impl<F: ResourceFactory> Drop for PooledResource<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.release(resource, self.created_at, self.broken);
        }
        // Give the permit back only after the resource is idle again
        self.permit.take();
    }
}

impl<F: ResourceFactory> fmt::Debug for PooledResource<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledResource")
            .field("pool", &self.shared.opts.name)
            .field("id", &self.resource.as_ref().map(|r| r.id()))
            .field("broken", &self.broken)
            .finish()
    }
}
