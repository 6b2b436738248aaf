//! Leaky-bucket admission control
//!
//! Refill is lazy: tokens are credited from elapsed time when a caller
//! consumes, never by a timer. A refused request is rejected, not queued.

use std::time::{Duration, Instant};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug)]
struct BucketState {
    /// Tokens available, never above capacity
    level: u64,
    last_refill: Instant,
    last_used: Instant,
}

/// Single leaky bucket: `capacity` tokens per `window`
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    window: Duration,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self::new_at(capacity, window, Instant::now())
    }

    pub fn new_at(capacity: u64, window: Duration, now: Instant) -> Self {
        Self {
            capacity,
            window,
            state: Mutex::new(BucketState {
                level: capacity,
                last_refill: now,
                last_used: now,
            }),
        }
    }

    pub fn try_consume(&self, n: u64) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    /// Refill from the time elapsed up to `now`, then take `n` tokens if
    /// they are all available.
    pub fn try_consume_at(&self, n: u64, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.last_used = now;

        if state.level >= n {
            state.level -= n;
            true
        } else {
            false
        }
    }

    /// Tokens available right now
    pub fn available(&self) -> u64 {
        self.available_at(Instant::now())
    }

    pub fn available_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.level
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn idle_since(&self) -> Instant {
        self.state.lock().last_used
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        if self.capacity == 0 || self.window.is_zero() {
            return;
        }

        let elapsed = now.saturating_duration_since(state.last_refill);
        let window_ns = self.window.as_nanos();
        let added = (self.capacity as u128 * elapsed.as_nanos() / window_ns).min(self.capacity as u128) as u64;
        if added == 0 {
            return;
        }

        state.level = (state.level + added).min(self.capacity);
        if state.level == self.capacity {
            state.last_refill = now;
        } else {
            // Carry the fractional remainder into the next refill
            let credited_ns = added as u128 * window_ns / self.capacity as u128;
            state.last_refill += Duration::from_nanos(credited_ns as u64);
        }
    }
}

/// Leaky buckets keyed by publish key, sharing capacity and window
#[derive(Debug)]
pub struct LeakyBuckets {
    capacity: u64,
    window: Duration,
    buckets: DashMap<String, LeakyBucket>,
}

impl LeakyBuckets {
    pub fn new(capacity: u64, window: Duration) -> Self {
        Self {
            capacity,
            window,
            buckets: DashMap::new(),
        }
    }

    pub fn try_consume(&self, key: &str, n: u64) -> bool {
        self.try_consume_at(key, n, Instant::now())
    }

    pub fn try_consume_at(&self, key: &str, n: u64, now: Instant) -> bool {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.try_consume_at(n, now);
        }

        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| LeakyBucket::new_at(self.capacity, self.window, now))
            .try_consume_at(n, now)
    }

    /// Drop buckets untouched for a full window; they would be full again
    /// anyway, so forgetting them changes no decision.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.idle_since()) < self.window);
        let purged = before.saturating_sub(self.buckets.len());
        if purged > 0 {
            debug!(purged = purged, remaining = self.buckets.len(), "Purged idle throttle buckets");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
