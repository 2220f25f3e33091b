//! Per-tenant rate limiting: in-process token buckets keyed by tenant,
//! refilled continuously from each tenant's `rate_limit_per_second`.

use std::time::Instant;

use dashmap::DashMap;

use crate::ids::TenantId;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared across all worker tasks; each bucket's `(tokens, last_refill)`
/// pair is updated under the `DashMap` shard lock for that entry, so
/// concurrent senders for the same tenant never double-spend a token.
pub struct RateLimiter {
    buckets: DashMap<TenantId, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Attempts to take one token for `tenant`, refilling the bucket for
    /// elapsed time first. `capacity` doubles as the refill rate
    /// (tokens/second), matching `rate_limit_per_second`.
    pub fn try_acquire(&self, tenant: TenantId, capacity: i32) -> bool {
        let capacity = capacity.max(1) as f64;
        let now = Instant::now();

        let mut bucket = self.buckets.entry(tenant).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exhausts_and_refills() {
        let limiter = RateLimiter::new();
        let tenant = TenantId::new();

        // burst capacity of 2 per second
        assert!(limiter.try_acquire(tenant, 2));
        assert!(limiter.try_acquire(tenant, 2));
        assert!(!limiter.try_acquire(tenant, 2));
    }

    #[test]
    fn separate_tenants_have_separate_buckets() {
        let limiter = RateLimiter::new();
        let a = TenantId::new();
        let b = TenantId::new();

        assert!(limiter.try_acquire(a, 1));
        assert!(!limiter.try_acquire(a, 1));
        assert!(limiter.try_acquire(b, 1));
    }
}
