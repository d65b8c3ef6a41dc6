//! Per-key token buckets guarding connection setup
//!
//! Every key (client address) gets its own bucket with the same rate and
//! burst. Buckets are created lazily and evicted after sitting idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Tokens added per second
    #[serde(default = "default_per_second")]
    pub per_second: f64,
    /// Bucket capacity
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Buckets untouched this long are dropped
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
}

fn default_per_second() -> f64 {
    1.0
}

fn default_burst() -> u32 {
    5
}

fn default_idle_eviction_secs() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: default_per_second(),
            burst: default_burst(),
            idle_eviction_secs: default_idle_eviction_secs(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One key's limiter.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<Bucket>,
    per_second: f64,
    capacity: f64,
}

impl TokenBucket {
    pub fn new(per_second: f64, burst: u32) -> Self {
        Self::new_at(per_second, burst, Instant::now())
    }

    fn new_at(per_second: f64, burst: u32, now: Instant) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            state: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: now,
            }),
            per_second,
            capacity,
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Refill for the time elapsed since the last call, then take one token.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut bucket = self.state.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.last_refill = bucket.last_refill.max(now);
        bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.capacity);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_since(&self) -> Instant {
        self.state.lock().last_refill
    }
}

pub struct RateLimiter {
    buckets: DashMap<String, Arc<TokenBucket>>,
    per_second: f64,
    burst: u32,
    idle_eviction: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            per_second: config.per_second,
            burst: config.burst,
            idle_eviction: Duration::from_secs(config.idle_eviction_secs),
        }
    }

    /// The bucket for `key`, created on first use. Concurrent callers for a
    /// new key all get the same bucket.
    pub fn get_limiter(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(key) {
            return bucket.clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(self.per_second, self.burst)))
            .clone()
    }

    /// Take one token for `key`.
    pub fn check(&self, key: &str) -> Result<(), RelayError> {
        if self.get_limiter(key).allow() {
            Ok(())
        } else {
            warn!("Rate limit exceeded for {}", key);
            Err(RelayError::RateLimited)
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets idle for longer than the eviction window.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.idle_since()) < self.idle_eviction);
        before.saturating_sub(self.buckets.len())
    }

    /// Periodic [`Self::evict_idle`] until `shutdown` fires.
    pub fn start_eviction(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        let period = (self.idle_eviction / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_idle(Instant::now());
                        if evicted > 0 {
                            debug!("Evicted {} idle rate-limit bucket(s)", evicted);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_second: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            per_second,
            burst,
            idle_eviction_secs: 60,
        })
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = limiter(0.001, 3);
        for _ in 0..3 {
            assert!(limiter.check("10.0.0.1").is_ok());
        }
        assert!(matches!(
            limiter.check("10.0.0.1"),
            Err(RelayError::RateLimited)
        ));
        // Independent key
        assert!(limiter.check("10.0.0.2").is_ok());
    }

    #[test]
    fn test_refill() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(2.0, 1, start);
        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start + Duration::from_millis(100)));
        assert!(bucket.allow_at(start + Duration::from_millis(600)));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let start = Instant::now();
        let bucket = TokenBucket::new_at(10.0, 2, start);
        let later = start + Duration::from_secs(60);
        assert!(bucket.allow_at(later));
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn test_same_bucket_per_key() {
        let limiter = limiter(1.0, 5);
        let a = limiter.get_limiter("k");
        let b = limiter.get_limiter("k");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_concurrent_creation_yields_one_bucket() {
        let limiter = Arc::new(limiter(0.001, 4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.check("shared").is_ok())
            })
            .collect();
        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(allowed, 4);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_idle_eviction() {
        let limiter = limiter(1.0, 5);
        limiter.check("stale").unwrap();
        limiter.check("fresh").unwrap();

        let now = Instant::now();
        assert_eq!(limiter.evict_idle(now), 0);

        // Keep "fresh" active
        limiter.get_limiter("fresh").allow_at(now + Duration::from_secs(61));
        assert_eq!(limiter.evict_idle(now + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
