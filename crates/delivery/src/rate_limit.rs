//! Per-line-item token buckets.
//!
//! Applied to DIRECT line items only; programmatic demand is rate limited
//! by its upstream. Buckets are created lazily on first use.

use adserve_core::config::RateLimitConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    /// Acquisition attempts.
    pub total: u64,
    /// Rejected attempts.
    pub hits: u64,
}

impl BucketStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.hits as f64 / self.total as f64
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

struct Bucket {
    state: Mutex<BucketState>,
    total: AtomicU64,
    hits: AtomicU64,
}

impl Bucket {
    fn new(capacity: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            total: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    fn try_acquire(&self, capacity: f64, refill_rate: f64) -> bool {
        self.total.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(state.last_refill).as_secs_f64() * refill_rate;
        state.tokens = (state.tokens + refill).min(capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            drop(state);
            self.hits.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn stats(&self) -> BucketStats {
        BucketStats {
            total: self.total.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }
}

pub struct RateLimiter {
    buckets: RwLock<HashMap<i64, Arc<Bucket>>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Take one token from the line item's bucket. Always true when
    /// rate limiting is disabled.
    pub fn try_acquire(&self, line_item_id: i64) -> bool {
        if !self.config.enabled {
            return true;
        }
        let bucket = self.bucket(line_item_id);
        let allowed = bucket.try_acquire(self.config.capacity, self.config.refill_rate);
        if !allowed {
            metrics::counter!("ratelimit.rejected").increment(1);
        }
        allowed
    }

    pub fn stats(&self, line_item_id: i64) -> Option<BucketStats> {
        self.buckets.read().get(&line_item_id).map(|b| b.stats())
    }

    /// Shared-lock lookup with a double-checked write on first use.
    fn bucket(&self, line_item_id: i64) -> Arc<Bucket> {
        if let Some(bucket) = self.buckets.read().get(&line_item_id) {
            return bucket.clone();
        }
        let mut buckets = self.buckets.write();
        buckets
            .entry(line_item_id)
            .or_insert_with(|| Arc::new(Bucket::new(self.config.capacity)))
            .clone()
    }
}
