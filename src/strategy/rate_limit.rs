//! Partitioned token-bucket rate limiting.
//!
//! Buckets are keyed by `(endpoint, partition)` and shared by every pipeline
//! of an endpoint, so distinct resources draw from the same admission budget
//! while distinct partitions never contend. Acquisition is non-blocking: an
//! empty bucket rejects immediately. Idle buckets are evicted after
//! `2 × rate_limit_period` without use.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket with capacity `limit` refilled at `limit / period` per
/// second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: u32, period: Duration) -> Self {
        let capacity = f64::from(limit);
        let refill_per_sec = if period.is_zero() {
            capacity
        } else {
            capacity / period.as_secs_f64()
        };
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Take one token without waiting; `false` when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        self.refill_locked(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    fn available(&self) -> f64 {
        let Ok(mut state) = self.state.lock() else {
            return 0.0;
        };
        self.refill_locked(&mut state);
        state.tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    endpoint: String,
    partition: String,
}

struct BucketEntry {
    bucket: TokenBucket,
    limit: u32,
    period: Duration,
    last_used: Instant,
}

/// Sliding-expiration store of token buckets, one per
/// `(endpoint, partition)`.
#[derive(Default)]
pub struct BucketStore {
    buckets: Mutex<HashMap<BucketKey, BucketEntry>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire one token for the partition's bucket, creating it lazily.
    /// A `limit` of zero disables rate limiting entirely.
    ///
    /// A bucket whose configured limit or period changed since creation is
    /// rebuilt, so a reload-then-lookup never runs against stale shaping.
    pub fn try_acquire(
        &self,
        endpoint: &str,
        partition: &str,
        limit: u32,
        period: Duration,
    ) -> bool {
        if limit == 0 {
            return true;
        }
        let Ok(mut buckets) = self.buckets.lock() else {
            return false;
        };
        let now = Instant::now();
        buckets.retain(|_, entry| now.duration_since(entry.last_used) <= entry.period * 2);

        let key = BucketKey {
            endpoint: endpoint.to_string(),
            partition: partition.to_string(),
        };
        let entry = buckets.entry(key).or_insert_with(|| BucketEntry {
            bucket: TokenBucket::new(limit, period),
            limit,
            period,
            last_used: now,
        });
        if entry.limit != limit || entry.period != period {
            *entry = BucketEntry {
                bucket: TokenBucket::new(limit, period),
                limit,
                period,
                last_used: now,
            };
        }
        entry.last_used = now;
        entry.bucket.try_acquire()
    }

    /// Drop every bucket. Called when the pipeline registry clears.
    pub fn clear(&self) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.clear();
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }
}
