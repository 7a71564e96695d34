//! Dual token-bucket rate limiter with adaptive token estimation (spec §4.A).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::RateLimiterConfig;

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Seconds until `amount` tokens are available, 0 if already available.
    fn wait_seconds(&self, amount: f64) -> f64 {
        if self.tokens >= amount {
            0.0
        } else {
            (amount - self.tokens) / self.refill_per_sec
        }
    }

    fn consume(&mut self, amount: f64) {
        self.tokens = (self.tokens - amount).max(0.0);
    }

    fn occupancy_pct(&self) -> f64 {
        (self.tokens / self.capacity) * 100.0
    }
}

struct Inner {
    rpm_bucket: TokenBucket,
    tpm_bucket: TokenBucket,
    usage_history: VecDeque<u64>,
    history_capacity: usize,
    bootstrap_estimate: u64,
    success_count: u64,
    error_count: u64,
}

/// Per-provider dual-bucket rate limiter.
pub struct RateLimiter {
    provider: String,
    config: RateLimiterConfig,
    inner: Mutex<Inner>,
}

/// Snapshot returned by [`RateLimiter::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub provider: String,
    pub rpm_occupancy_pct: f64,
    pub tpm_occupancy_pct: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, config: RateLimiterConfig) -> Self {
        let rpm = config.requests_per_minute as f64;
        let tpm = config.tokens_per_minute as f64;
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner {
                rpm_bucket: TokenBucket::new(rpm, rpm / 60.0),
                tpm_bucket: TokenBucket::new(tpm, tpm / 60.0),
                usage_history: VecDeque::new(),
                history_capacity: 100,
                bootstrap_estimate: config.bootstrap_token_estimate,
                success_count: 0,
                error_count: 0,
            }),
        }
    }

    /// Estimate the token cost of a request from its content length,
    /// following the mean-history formula in spec §4.A.
    pub async fn estimate_tokens(&self, content_len: Option<usize>) -> u64 {
        let inner = self.inner.lock().await;
        match (content_len, inner.usage_history.len() >= 10) {
            (Some(len), true) => {
                let mean: f64 = inner.usage_history.iter().sum::<u64>() as f64
                    / inner.usage_history.len() as f64;
                let multiplier = (len as f64 / 10_000.0).clamp(0.5, 2.0);
                ((mean * multiplier).round() as u64).max(1000)
            }
            (Some(len), false) => (((len as f64) * 0.3).round() as u64).max(1000),
            (None, _) => inner.bootstrap_estimate,
        }
    }

    /// Attempt to admit a request estimated to cost `estimated_tokens`.
    /// Returns `Ok(())` if admitted, or `Err(wait_duration)` with the
    /// caller-advised sleep before retrying.
    pub async fn try_acquire(&self, estimated_tokens: u64) -> Result<(), Duration> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.rpm_bucket.refill(now);
        inner.tpm_bucket.refill(now);

        let rpm_wait = inner.rpm_bucket.wait_seconds(1.0);
        let tpm_wait = inner.tpm_bucket.wait_seconds(estimated_tokens as f64);
        let wait = rpm_wait.max(tpm_wait);

        if wait > 0.0 {
            return Err(Duration::from_secs_f64(wait));
        }

        inner.rpm_bucket.consume(1.0);
        inner.tpm_bucket.consume(estimated_tokens as f64);
        Ok(())
    }

    /// Acquire, sleeping through any advised wait. Bounded by the bucket's
    /// own refill rate so this can never starve indefinitely.
    pub async fn acquire_with_estimation(&self, content_len: Option<usize>) -> u64 {
        let estimate = self.estimate_tokens(content_len).await;
        loop {
            match self.try_acquire(estimate).await {
                Ok(()) => return estimate,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Record the actual token usage of a completed call, feeding the
    /// adaptive estimator's ring buffer.
    pub async fn record_actual_usage(&self, actual_tokens: u64) {
        let mut inner = self.inner.lock().await;
        let cap = inner.history_capacity;
        inner.usage_history.push_back(actual_tokens);
        while inner.usage_history.len() > cap {
            inner.usage_history.pop_front();
        }
        inner.success_count += 1;
    }

    pub async fn record_error(&self) {
        let mut inner = self.inner.lock().await;
        inner.error_count += 1;
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        inner.rpm_bucket.refill(now);
        inner.tpm_bucket.refill(now);
        let total = inner.success_count + inner.error_count;
        let error_rate = if total == 0 {
            0.0
        } else {
            inner.error_count as f64 / total as f64
        };
        RateLimiterStats {
            provider: self.provider.clone(),
            rpm_occupancy_pct: inner.rpm_bucket.occupancy_pct(),
            tpm_occupancy_pct: inner.tpm_bucket.occupancy_pct(),
            success_count: inner.success_count,
            error_count: inner.error_count,
            error_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> RateLimiterConfig {
        RateLimiterConfig {
            requests_per_minute: 60,
            tokens_per_minute: 6000,
            usage_history_size: 100,
            bootstrap_token_estimate: 5000,
        }
    }

    #[tokio::test]
    async fn bootstrap_estimate_used_without_history() {
        let limiter = RateLimiter::new("qwen", small_config());
        assert_eq!(limiter.estimate_tokens(None).await, 5000);
    }

    #[tokio::test]
    async fn first_request_is_admitted_immediately() {
        let limiter = RateLimiter::new("qwen", small_config());
        assert!(limiter.try_acquire(100).await.is_ok());
    }

    #[tokio::test]
    async fn depleted_tpm_bucket_refuses_admission() {
        let limiter = RateLimiter::new("qwen", small_config());
        // Tokens-per-minute capacity is 6000; ask for more than that at once.
        let result = limiter.try_acquire(100_000).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn usage_history_feeds_mean_based_estimate() {
        let limiter = RateLimiter::new("qwen", small_config());
        for _ in 0..12 {
            limiter.record_actual_usage(2000).await;
        }
        // content_len = 10000 -> multiplier clamp(1.0,...) = 1.0 -> mean*1.0 = 2000, floor 1000
        let estimate = limiter.estimate_tokens(Some(10_000)).await;
        assert_eq!(estimate, 2000);
    }

    #[tokio::test]
    async fn stats_report_error_rate() {
        let limiter = RateLimiter::new("qwen", small_config());
        limiter.record_actual_usage(100).await;
        limiter.record_error().await;
        let stats = limiter.stats().await;
        assert!((stats.error_rate - 0.5).abs() < 1e-9);
    }

    proptest::proptest! {
        /// Token conservation: a bucket's balance never goes negative no
        /// matter how large a single consume request is (spec §8 universal
        /// invariant on the rate limiter).
        #[test]
        fn token_bucket_balance_never_negative(capacity in 1.0f64..100_000.0, amount in 0.0f64..200_000.0) {
            let mut bucket = TokenBucket::new(capacity, capacity / 60.0);
            bucket.consume(amount);
            proptest::prop_assert!(bucket.tokens >= 0.0);
        }

        /// A freshly constructed bucket always admits a request within its
        /// own capacity with zero wait.
        #[test]
        fn fresh_bucket_admits_up_to_capacity(capacity in 1.0f64..100_000.0) {
            let bucket = TokenBucket::new(capacity, capacity / 60.0);
            proptest::prop_assert_eq!(bucket.wait_seconds(capacity), 0.0);
        }
    }
}
