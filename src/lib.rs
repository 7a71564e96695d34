//! # ai-code-audit
//!
//! Orchestration core for LLM-driven static security audits: file discovery
//! and filtering, code-unit coverage tracking, a priority task matrix, a
//! rate-limited/circuit-broken/adaptively-concurrent LLM manager, a
//! cross-file follow-up analyzer with recursion guards, a content-addressed
//! result cache, and a finding aggregator.
//!
//! The CLI front end, configuration file parsing, report rendering, and the
//! prompt templates themselves are collaborators outside this crate's scope
//! (see `SPEC_FULL.md` §1).

pub mod aggregator;
pub mod confidence;
pub mod config;
pub mod coverage;
pub mod cross_file;
pub mod discovery;
pub mod error;
pub mod file_filter;
pub mod frontend_optimizer;
pub mod llm;
pub mod model;
pub mod orchestrator;
pub mod recursion;
pub mod task_matrix;

pub use aggregator::{risk_score, AggregateStatistics, Aggregator};
pub use confidence::{ConfidenceCalculator, ConfidenceContext};
pub use config::{
    AuditConfig, AuditRuntimeConfig, CacheConfig, CircuitBreakerConfig, ConcurrencyConfig,
    ConditionalIgnore, CrossFileConfig, CrossFileSearchConfig, FileFilteringConfig,
    ProviderConfig, RateLimiterConfig, RecursionConfig,
};
pub use coverage::{CoverageReport, CoverageTracker, FileCoverage};
pub use cross_file::{CrossFileAnalyzer, CrossFileEvidence};
pub use discovery::{assign_priority, detect_language, Discovery, RegexSymbolExtractor, Symbol, SymbolExtractor};
pub use error::{Error, Result};
pub use file_filter::{FileFilter, FilterOutcome, FilterStats};
pub use frontend_optimizer::{classify as classify_frontend, OptimizerDecision, Strategy as FrontendStrategy};
pub use llm::{
    CacheEntry, CacheStats, ChatMessage, ChatRequest, ChatResponse, ChatRole,
    CircuitBreaker, CircuitState, AdaptiveConcurrencyController, ConcurrencyPermit,
    ConcurrencyStats, CrossFileHook, HttpProvider, LlmManager, LoadBalancingStrategy,
    ManagerStats, Provider, RateLimiter, RateLimiterStats, ResultCache, TokenUsage,
};
pub use model::{
    AnalysisTask, Category, CodeUnit, ConfidenceFactors, Finding, Priority, RiskLevel, Session,
    SessionProgress, SessionStatus, Severity, TaskMetrics, TaskType, UnitStatus, UnitType,
};
pub use orchestrator::{default_priority_order, Orchestrator, ProgressCallback, SessionHandle};
pub use recursion::{RecursionStack, StackEntry};
pub use task_matrix::{ResourceConstraints, TaskMatrix};

/// Install a `tracing` subscriber driven by `RUST_LOG`, for tests that want
/// to see diagnostics on failure. Safe to call from multiple test modules:
/// subsequent calls after the first are no-ops.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}
