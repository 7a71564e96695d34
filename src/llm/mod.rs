//! LLM orchestration layer: provider abstraction, rate limiting, circuit
//! breaking, adaptive concurrency, result caching, and the manager that
//! ties them together behind `analyze_code` (spec §4 A-F).

pub mod cache;
pub mod circuit_breaker;
pub mod concurrency;
pub mod manager;
pub mod provider;
pub mod rate_limiter;
pub mod types;

pub use cache::{CacheEntry, CacheStats, ResultCache};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use concurrency::{AdaptiveConcurrencyController, ConcurrencyPermit, ConcurrencyStats};
pub use manager::{CrossFileHook, LlmManager, LoadBalancingStrategy, ManagerStats};
pub use provider::{HttpProvider, Provider};
pub use rate_limiter::{RateLimiter, RateLimiterStats};
pub use types::{ChatMessage, ChatRequest, ChatResponse, ChatRole, TokenUsage};
