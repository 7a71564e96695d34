//! Adaptive concurrency controller (spec §4.C).
//!
//! Resizes its semaphore without ever touching private runtime state: it
//! tracks in-flight permits itself and reconciles via the public
//! `add_permits`/`forget_permits` operations. See SPEC_FULL.md §9, open
//! question 1, for why this differs from the grounding source.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::ConcurrencyConfig;
use crate::error::{Error, Result};
use crate::llm::circuit_breaker::CircuitBreaker;

struct AdjustmentState {
    last_adjustment: Instant,
    current_concurrency: usize,
}

/// A permit from [`AdaptiveConcurrencyController::acquire`]; dropping it
/// releases the underlying semaphore slot but does not, by itself, record
/// success/failure — call [`ConcurrencyController::release`] explicitly so
/// the controller can feed its adjustment loop.
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

/// Snapshot returned by [`AdaptiveConcurrencyController::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyStats {
    pub current_concurrency: usize,
    pub in_flight: usize,
    pub total_requests: u64,
    pub error_count: u64,
}

/// Bounds the number of in-flight LLM calls, adapting the bound to the
/// observed error rate, and gates admission on a [`CircuitBreaker`].
pub struct AdaptiveConcurrencyController {
    semaphore: Arc<Semaphore>,
    breaker: CircuitBreaker,
    config: ConcurrencyConfig,
    in_flight: AtomicUsize,
    total_requests: AtomicU32,
    error_count: AtomicU32,
    adjustment: Mutex<AdjustmentState>,
}

impl AdaptiveConcurrencyController {
    pub fn new(provider: impl Into<String>, config: ConcurrencyConfig, breaker_config: crate::config::CircuitBreakerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.initial)),
            breaker: CircuitBreaker::new(provider, breaker_config),
            config,
            in_flight: AtomicUsize::new(0),
            total_requests: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            adjustment: Mutex::new(AdjustmentState {
                last_adjustment: Instant::now(),
                current_concurrency: config.initial,
            }),
        }
    }

    /// Acquire a permit, refusing immediately if the breaker is open.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit> {
        if !self.breaker.can_execute().await {
            return Err(Error::circuit_open(self.breaker.provider_name()));
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrencyPermit { _permit: permit })
    }

    /// Release a permit and record the outcome, possibly triggering a
    /// concurrency adjustment.
    pub async fn release(&self, permit: ConcurrencyPermit, success: bool) {
        drop(permit);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.total_requests.fetch_add(1, Ordering::SeqCst);

        if success {
            self.breaker.record_success().await;
        } else {
            self.breaker.record_failure().await;
            self.error_count.fetch_add(1, Ordering::SeqCst);
        }

        self.maybe_adjust().await;
    }

    async fn maybe_adjust(&self) {
        let mut state = self.adjustment.lock().await;
        if state.last_adjustment.elapsed() < Duration::from_secs(self.config.adjustment_interval_secs) {
            return;
        }
        let total = self.total_requests.load(Ordering::SeqCst);
        if total < self.config.min_sample_size {
            return;
        }
        let errors = self.error_count.load(Ordering::SeqCst);
        let error_rate = errors as f64 / total as f64;

        let current = state.current_concurrency;
        let new_target = if error_rate > self.config.high_error_rate {
            ((current as f64 * 0.7).round() as usize).max(self.config.min)
        } else if error_rate < self.config.low_error_rate {
            ((current as f64 * 1.3).round() as usize).min(self.config.max)
        } else {
            current
        };

        if new_target != current {
            self.resize(current, new_target);
            state.current_concurrency = new_target;
        }

        state.last_adjustment = Instant::now();
        self.total_requests.store(0, Ordering::SeqCst);
        self.error_count.store(0, Ordering::SeqCst);
    }

    /// Grow or shrink the semaphore's permit count without losing
    /// outstanding permits. `available_permits()` is public; combined with
    /// the in-flight counter we maintain ourselves, this never inspects
    /// runtime-private state.
    fn resize(&self, old_target: usize, new_target: usize) {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let available = self.semaphore.available_permits();
        // available + in_flight should equal old_target barring a race with
        // a concurrent acquire/release; either is safe to round against.
        let _ = old_target;
        let desired_available = new_target.saturating_sub(in_flight);
        if desired_available > available {
            self.semaphore.add_permits(desired_available - available);
        } else if desired_available < available {
            let to_remove = available - desired_available;
            // forget_permits returns the number actually removed if fewer
            // are available than requested; safe either way.
            self.semaphore.forget_permits(to_remove);
        }
    }

    pub async fn stats(&self) -> ConcurrencyStats {
        let state = self.adjustment.lock().await;
        ConcurrencyStats {
            current_concurrency: state.current_concurrency,
            in_flight: self.in_flight.load(Ordering::SeqCst),
            total_requests: self.total_requests.load(Ordering::SeqCst) as u64,
            error_count: self.error_count.load(Ordering::SeqCst) as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;

    fn fast_config() -> ConcurrencyConfig {
        ConcurrencyConfig {
            initial: 10,
            min: 2,
            max: 20,
            adjustment_interval_secs: 0,
            min_sample_size: 4,
            high_error_rate: 0.15,
            low_error_rate: 0.03,
        }
    }

    #[tokio::test]
    async fn acquire_release_round_trips() {
        let controller =
            AdaptiveConcurrencyController::new("qwen", fast_config(), CircuitBreakerConfig::default());
        let permit = controller.acquire().await.unwrap();
        controller.release(permit, true).await;
        let stats = controller.stats().await;
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn high_error_rate_shrinks_concurrency() {
        let controller =
            AdaptiveConcurrencyController::new("qwen", fast_config(), CircuitBreakerConfig::default());
        for _ in 0..4 {
            let permit = controller.acquire().await.unwrap();
            controller.release(permit, false).await;
        }
        let stats = controller.stats().await;
        assert_eq!(stats.current_concurrency, 7); // round(10 * 0.7)
    }

    #[tokio::test]
    async fn low_error_rate_grows_concurrency() {
        let controller =
            AdaptiveConcurrencyController::new("qwen", fast_config(), CircuitBreakerConfig::default());
        for _ in 0..4 {
            let permit = controller.acquire().await.unwrap();
            controller.release(permit, true).await;
        }
        let stats = controller.stats().await;
        assert_eq!(stats.current_concurrency, 13); // round(10 * 1.3)
    }

    #[tokio::test]
    async fn under_sample_size_does_not_adjust() {
        let controller =
            AdaptiveConcurrencyController::new("qwen", fast_config(), CircuitBreakerConfig::default());
        for _ in 0..2 {
            let permit = controller.acquire().await.unwrap();
            controller.release(permit, false).await;
        }
        let stats = controller.stats().await;
        assert_eq!(stats.current_concurrency, 10);
    }

    #[tokio::test]
    async fn resize_preserves_in_flight_permits() {
        let controller =
            AdaptiveConcurrencyController::new("qwen", fast_config(), CircuitBreakerConfig::default());
        // Hold one permit across the adjustment.
        let held = controller.acquire().await.unwrap();
        for _ in 0..4 {
            let permit = controller.acquire().await.unwrap();
            controller.release(permit, false).await;
        }
        // The held permit must still be valid; releasing it should not panic
        // or under/overflow the semaphore's internal accounting.
        controller.release(held, true).await;
    }
}
