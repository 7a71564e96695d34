//! Frozen configuration record (spec §6 recognized options).
//!
//! Parsing these values out of a YAML file or environment overlay is a
//! collaborator's job (out of scope, §1); this module only owns the typed,
//! `Default`-backed shape every component binds to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One LLM provider's dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    pub enabled: bool,
    pub priority: u32,
    pub max_requests_per_minute: u32,
    pub max_tokens_per_minute: u64,
    pub cost_weight: f64,
    pub performance_weight: f64,
    pub supported_models: Vec<String>,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            enabled: true,
            priority: 1,
            max_requests_per_minute: 10_000,
            max_tokens_per_minute: 400_000,
            cost_weight: 1.0,
            performance_weight: 1.0,
            supported_models: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.supported_models = models;
        self
    }
}

/// Circuit breaker thresholds (§4.B).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            success_threshold: 3,
        }
    }
}

/// Adaptive concurrency controller bounds (§4.C).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    pub adjustment_interval_secs: u64,
    pub min_sample_size: u32,
    pub high_error_rate: f64,
    pub low_error_rate: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial: 15,
            min: 5,
            max: 25,
            adjustment_interval_secs: 30,
            min_sample_size: 10,
            high_error_rate: 0.15,
            low_error_rate: 0.03,
        }
    }
}

/// Rate limiter bucket sizing, per provider (§4.A).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub usage_history_size: usize,
    pub bootstrap_token_estimate: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 10_000,
            tokens_per_minute: 400_000,
            usage_history_size: 100,
            bootstrap_token_estimate: 5_000,
        }
    }
}

/// Conditional ignore block (css/test/doc/log) for the File Filter (§4.G).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConditionalIgnore {
    pub enabled: bool,
    pub patterns: Vec<String>,
}

/// File filtering configuration (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFilteringConfig {
    pub enabled: bool,
    pub ignore_patterns: Vec<String>,
    pub use_gitignore: bool,
    pub max_file_size_bytes: u64,
    pub detect_libraries: bool,
    pub library_keywords: Vec<String>,
    pub force_include: Vec<String>,
    pub css_files: ConditionalIgnore,
    pub test_files: ConditionalIgnore,
    pub doc_files: ConditionalIgnore,
    pub log_files: ConditionalIgnore,
}

impl Default for FileFilteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore_patterns: vec![
                "*.min.js".into(),
                "node_modules/".into(),
                ".git/".into(),
                "dist/".into(),
                "build/".into(),
                "vendor/".into(),
            ],
            use_gitignore: true,
            max_file_size_bytes: 1_000_000,
            detect_libraries: true,
            library_keywords: vec![
                "Copyright".into(),
                "MIT License".into(),
                "generated automatically".into(),
                "DO NOT EDIT".into(),
            ],
            force_include: Vec::new(),
            css_files: ConditionalIgnore {
                enabled: true,
                patterns: vec!["*.css".into(), "*.scss".into(), "*.less".into()],
            },
            test_files: ConditionalIgnore {
                enabled: false,
                patterns: vec!["test_*.py".into(), "*_test.go".into(), "*.test.js".into()],
            },
            doc_files: ConditionalIgnore {
                enabled: true,
                patterns: vec!["*.md".into(), "*.rst".into(), "*.txt".into()],
            },
            log_files: ConditionalIgnore {
                enabled: true,
                patterns: vec!["*.log".into()],
            },
        }
    }
}

/// Cross-file analyzer bounds (§4.L).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossFileSearchConfig {
    pub max_files_per_pattern: usize,
    pub max_file_bytes: u64,
    pub preview_bytes: usize,
    pub max_matches: usize,
    pub extensions: Vec<String>,
}

impl Default for CrossFileSearchConfig {
    fn default() -> Self {
        Self {
            max_files_per_pattern: 100,
            max_file_bytes: 500_000,
            preview_bytes: 10_240,
            max_matches: 5,
            extensions: vec![
                "php".into(),
                "java".into(),
                "py".into(),
                "js".into(),
                "html".into(),
                "jsp".into(),
                "xml".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossFileConfig {
    pub max_depth: u32,
    /// Lower bound of the trigger band a finding's adjusted confidence must
    /// fall in for `analyze_code` to invoke the analyzer (§4.E).
    pub confidence_floor: f64,
    /// Upper bound of that same trigger band (spec's literal `0.98`, §4.E).
    pub confidence_ceiling: f64,
    /// Lower bound the analyzer's final, evidence-folded confidence is
    /// clamped to (§4.L step 5's literal `0.1`).
    pub min_confidence: f64,
    /// Upper bound of that same final clamp (§4.L step 5's literal `1.0`).
    pub max_confidence: f64,
    pub max_related_files: usize,
    pub search: CrossFileSearchConfig,
}

impl Default for CrossFileConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            confidence_floor: 0.4,
            confidence_ceiling: 0.98,
            min_confidence: 0.1,
            max_confidence: 1.0,
            max_related_files: 5,
            search: CrossFileSearchConfig::default(),
        }
    }
}

/// Result cache configuration (§4.F/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_dir: String,
    pub max_size_bytes: u64,
    pub ttl_hours: u64,
    pub eviction_target_fraction: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: ".ai_audit_cache".into(),
            max_size_bytes: 500 * 1024 * 1024,
            ttl_hours: 24,
            eviction_target_fraction: 0.8,
        }
    }
}

/// Recursion monitor bound (§4.K).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecursionConfig {
    pub max_depth: u32,
}

impl Default for RecursionConfig {
    fn default() -> Self {
        Self { max_depth: 50 }
    }
}

/// Orchestrator-level audit knobs (§6 `audit.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRuntimeConfig {
    pub max_concurrent_sessions: usize,
    pub max_file_size_bytes: u64,
    pub max_files_per_audit: usize,
    pub supported_languages: Vec<String>,
    pub worker_count: usize,
    pub task_timeout_secs: u64,
    pub session_timeout_secs: u64,
}

impl Default for AuditRuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            max_file_size_bytes: 1_000_000,
            max_files_per_audit: 5_000,
            supported_languages: vec![
                "python".into(),
                "javascript".into(),
                "java".into(),
                "go".into(),
            ],
            worker_count: 3,
            task_timeout_secs: 600,
            session_timeout_secs: 3_600,
        }
    }
}

/// Top-level frozen configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub default_model: String,
    pub audit: AuditRuntimeConfig,
    pub rate_limiter: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub concurrency: ConcurrencyConfig,
    pub file_filtering: FileFilteringConfig,
    pub cross_file: CrossFileConfig,
    pub cache: CacheConfig,
    pub recursion: RecursionConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_model: "Qwen/Qwen3-Coder-30B-A3B-Instruct".into(),
            audit: AuditRuntimeConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            file_filtering: FileFilteringConfig::default(),
            cross_file: CrossFileConfig::default(),
            cache: CacheConfig::default(),
            recursion: RecursionConfig::default(),
        }
    }
}

impl AuditConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        self.providers.insert(config.name.clone(), config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_bounds() {
        let config = AuditConfig::default();
        assert_eq!(config.concurrency.initial, 15);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn with_provider_inserts_by_name() {
        let config = AuditConfig::new()
            .with_provider(ProviderConfig::new("qwen", "key", "https://api.example.com"));
        assert!(config.providers.contains_key("qwen"));
    }
}
