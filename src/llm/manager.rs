//! LLM manager: provider selection, fallback dispatch, and `analyze_code`
//! (spec §4.E).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AuditConfig, CrossFileConfig, ProviderConfig};
use crate::confidence::{ConfidenceCalculator, ConfidenceContext};
use crate::error::{Error, Result};
use crate::llm::cache::{cache_key, ResultCache};
use crate::llm::concurrency::AdaptiveConcurrencyController;
use crate::llm::provider::Provider;
use crate::llm::types::{ChatMessage, ChatRequest, ChatResponse};
use crate::model::Finding;

/// Provider ordering strategy used when no `preferred_provider` is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Random,
    CostOptimized,
    PerformanceOptimized,
}

/// Re-entry hook the Cross-File Analyzer implements so the Manager can
/// recurse into it from `analyze_code` without a hard module dependency.
#[async_trait]
pub trait CrossFileHook: Send + Sync {
    async fn analyze_uncertain_finding(
        &self,
        finding: Finding,
        file_path: &str,
    ) -> Finding;
}

struct ManagedProvider {
    provider: Arc<dyn Provider>,
    config: ProviderConfig,
    concurrency: AdaptiveConcurrencyController,
}

/// Dispatches chat completions across providers with fallback, and drives
/// the `analyze_code` pipeline (prompt -> response -> findings -> confidence
/// -> optional cross-file follow-up).
pub struct LlmManager {
    providers: Vec<ManagedProvider>,
    strategy: LoadBalancingStrategy,
    round_robin_index: AtomicUsize,
    confidence: ConfidenceCalculator,
    cross_file: Option<Arc<dyn CrossFileHook>>,
    cross_file_config: CrossFileConfig,
    cache: Option<Arc<ResultCache>>,
}

/// Per-request stats snapshot (§4.E `get_comprehensive_stats`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub providers: Vec<ProviderStatsEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatsEntry {
    pub name: String,
    pub concurrency: crate::llm::concurrency::ConcurrencyStats,
}

impl LlmManager {
    pub fn new(config: &AuditConfig, providers: Vec<(Arc<dyn Provider>, ProviderConfig)>) -> Self {
        let managed = providers
            .into_iter()
            .filter(|(_, pc)| pc.enabled)
            .map(|(provider, pc)| {
                let concurrency = AdaptiveConcurrencyController::new(
                    pc.name.clone(),
                    config.concurrency,
                    config.circuit_breaker,
                );
                ManagedProvider {
                    provider,
                    config: pc,
                    concurrency,
                }
            })
            .collect();

        Self {
            providers: managed,
            strategy: LoadBalancingStrategy::RoundRobin,
            round_robin_index: AtomicUsize::new(0),
            confidence: ConfidenceCalculator::new(),
            cross_file: None,
            cross_file_config: config.cross_file.clone(),
            cache: None,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalancingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Wire in the Cross-File Analyzer after construction (it needs a
    /// reference back to this manager, so it cannot be built first).
    pub fn set_cross_file_hook(&mut self, hook: Arc<dyn CrossFileHook>) {
        self.cross_file = Some(hook);
    }

    fn provider_order(&self, preferred: Option<&str>, model: &str) -> Vec<usize> {
        let eligible: Vec<usize> = self
            .providers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.provider.is_model_supported(model))
            .map(|(i, _)| i)
            .collect();

        if let Some(name) = preferred {
            if let Some(pos) = eligible.iter().position(|&i| self.providers[i].provider.name() == name) {
                let mut ordered = eligible.clone();
                let preferred_idx = ordered.remove(pos);
                ordered.insert(0, preferred_idx);
                return ordered;
            }
        }

        let mut ordered = eligible;
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                if !ordered.is_empty() {
                    let start = self.round_robin_index.fetch_add(1, Ordering::SeqCst) % ordered.len();
                    ordered.rotate_left(start);
                }
            }
            LoadBalancingStrategy::Random => {
                ordered.shuffle(&mut thread_rng());
            }
            LoadBalancingStrategy::CostOptimized => {
                ordered.sort_by(|&a, &b| {
                    self.providers[a]
                        .config
                        .cost_weight
                        .partial_cmp(&self.providers[b].config.cost_weight)
                        .unwrap()
                });
            }
            LoadBalancingStrategy::PerformanceOptimized => {
                ordered.sort_by(|&a, &b| {
                    self.providers[a]
                        .config
                        .performance_weight
                        .partial_cmp(&self.providers[b].config.performance_weight)
                        .unwrap()
                });
            }
        }
        ordered
    }

    /// Dispatch a chat completion, trying `preferred_provider` first (if
    /// given and eligible) then falling back across the remaining providers
    /// in strategy order.
    pub async fn chat_completion(
        &self,
        request: ChatRequest,
        preferred_provider: Option<&str>,
        fallback: bool,
    ) -> Result<ChatResponse> {
        let order = self.provider_order(preferred_provider, &request.model);
        if order.is_empty() {
            return Err(Error::no_provider_available(format!(
                "no enabled provider supports model '{}'",
                request.model
            )));
        }

        let mut last_error: Option<Error> = None;
        for idx in order {
            let managed = &self.providers[idx];
            let permit = match managed.concurrency.acquire().await {
                Ok(p) => p,
                Err(e) => {
                    last_error = Some(e);
                    if fallback {
                        continue;
                    } else {
                        return Err(last_error.unwrap());
                    }
                }
            };

            match managed.provider.chat_completion(request.clone()).await {
                Ok(response) => {
                    managed.concurrency.release(permit, true).await;
                    return Ok(response);
                }
                Err(err) => {
                    managed.concurrency.release(permit, false).await;
                    warn!(provider = managed.provider.name(), "chat completion failed: {err}");
                    last_error = Some(err);
                    if !fallback {
                        return Err(last_error.unwrap());
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::no_provider_available("all providers exhausted")))
    }

    /// Detect the architecture layer of a file from its path, used both by
    /// the false-positive filter and the confidence calculator's context.
    pub fn detect_architecture_layer(file_path: &str) -> &'static str {
        let lower = file_path.to_lowercase();
        if lower.contains("controller") {
            "controller"
        } else if lower.contains("service") {
            "service"
        } else if lower.contains("dao") || lower.contains("repository") {
            "dao"
        } else if lower.contains("entity") || lower.contains("model") {
            "entity"
        } else if lower.contains("config") {
            "config"
        } else {
            "unknown"
        }
    }

    fn is_false_positive(&self, finding: &Finding, architecture_layer: &str) -> bool {
        if finding.confidence < 0.3 {
            return true;
        }
        let lower = finding.description.to_lowercase();
        let safe_sql_markers = ["prepared statement", "parameterized", "parameterised"];
        if matches!(finding.category, crate::model::Category::Injection)
            && safe_sql_markers.iter().any(|m| lower.contains(m))
        {
            return true;
        }
        if architecture_layer == "dao" && lower.contains("authorization") {
            // Authorization concerns are typically enforced above the DAO
            // layer; a bare DAO-layer authorization finding is usually noise.
            return true;
        }
        false
    }

    /// Analyze one unit of code: build a prompt from `template` and `code`,
    /// dispatch it, parse the response into findings, filter obvious false
    /// positives, rescore confidence, and recurse into the Cross-File
    /// Analyzer for uncertain findings (unless this call is itself a
    /// related-file follow-up).
    pub async fn analyze_code(
        &self,
        code: &str,
        file_path: &str,
        language: &str,
        template: &str,
        model: &str,
        analysis_context: Option<&str>,
    ) -> Result<Vec<Finding>> {
        let key = cache_key(code, template, language);
        let mut deps = HashMap::new();
        deps.insert(file_path.to_string(), code.to_string());

        let cached = match &self.cache {
            Some(cache) => cache.get(&key, &deps).await,
            None => None,
        };

        let response_content = match cached {
            Some(payload) => payload,
            None => {
                let user_message = format!(
                    "Language: {language}\nFile: {file_path}\n\n```{language}\n{code}\n```"
                );
                let request = ChatRequest::new(
                    model,
                    vec![ChatMessage::system(template), ChatMessage::user(user_message)],
                );

                let response = self.chat_completion(request, None, true).await?;

                if let Some(cache) = &self.cache {
                    let _ = cache.put(&key, &response.content, &deps, None, HashMap::new()).await;
                }
                response.content
            }
        };

        let mut findings = crate::aggregator::parse_single_response(&response_content, file_path);

        let architecture_layer = Self::detect_architecture_layer(file_path);
        findings.retain(|f| !self.is_false_positive(f, architecture_layer));

        let context = ConfidenceContext {
            frameworks: Vec::new(),
            architecture_layer: architecture_layer.to_string(),
            tech_stack: vec![language.to_string()],
            has_security_config: false,
            call_chain_known: false,
        };

        for finding in findings.iter_mut() {
            let (score, factors) = self.confidence.calculate(finding, &context);
            finding.confidence = score;
            finding.confidence_factors = Some(factors);
        }

        let is_related_file_call = analysis_context == Some("related_file");
        if !is_related_file_call {
            if let Some(hook) = &self.cross_file {
                for finding in findings.iter_mut() {
                    if self.should_trigger_cross_file(finding) {
                        let before = finding.confidence;
                        let updated = hook.analyze_uncertain_finding(finding.clone(), file_path).await;
                        if (updated.confidence - before).abs() > f64::EPSILON {
                            info!(
                                file = file_path,
                                before, after = updated.confidence,
                                "cross-file analysis adjusted confidence"
                            );
                        }
                        *finding = updated;
                    }
                }
            }
        }

        Ok(findings)
    }

    /// Whether a finding should be routed through the Cross-File Analyzer:
    /// confidence strictly between the configured floor and ceiling, or its
    /// category matches one of the always-escalate concerns (spec §4.E/§4.L).
    fn should_trigger_cross_file(&self, finding: &Finding) -> bool {
        let in_band = finding.confidence > self.cross_file_config.confidence_floor
            && finding.confidence < self.cross_file_config.confidence_ceiling;
        let lower_title = finding.title.to_lowercase();
        let always_escalate = ["upload", "xss", "path traversal", "permission"]
            .iter()
            .any(|kw| lower_title.contains(kw));
        in_band || always_escalate
    }

    pub async fn stats(&self) -> ManagerStats {
        let mut providers = Vec::with_capacity(self.providers.len());
        for p in &self.providers {
            providers.push(ProviderStatsEntry {
                name: p.provider.name().to_string(),
                concurrency: p.concurrency.stats().await,
            });
        }
        ManagerStats { providers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_layer_detection() {
        assert_eq!(LlmManager::detect_architecture_layer("src/UserController.java"), "controller");
        assert_eq!(LlmManager::detect_architecture_layer("src/UserDao.java"), "dao");
        assert_eq!(LlmManager::detect_architecture_layer("src/random.java"), "unknown");
    }

    #[test]
    fn cross_file_trigger_band() {
        let config = AuditConfig::default();
        let manager = LlmManager::new(&config, Vec::new());
        let mut finding = sample_finding(0.5);
        assert!(manager.should_trigger_cross_file(&finding));
        finding.confidence = 0.99;
        finding.title = "Plain bug".into();
        assert!(!manager.should_trigger_cross_file(&finding));
        finding.title = "Unrestricted file upload".into();
        assert!(manager.should_trigger_cross_file(&finding));
    }

    struct CountingProvider {
        calls: std::sync::atomic::AtomicUsize,
        models: Vec<String>,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn supported_models(&self) -> &[String] {
            &self.models
        }

        async fn chat_completion(&self, _request: ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: "{\"findings\": []}".into(),
                model: "mock-model".into(),
                usage: Default::default(),
                finish_reason: Some("stop".into()),
                response_time_ms: 1,
                timestamp: chrono::Utc::now(),
                provider: "mock".into(),
            })
        }
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_the_provider_call() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(crate::llm::cache::ResultCache::new(crate::config::CacheConfig {
            cache_dir: dir.path().to_string_lossy().to_string(),
            ..Default::default()
        }));

        let provider = Arc::new(CountingProvider {
            calls: std::sync::atomic::AtomicUsize::new(0),
            models: vec!["mock-model".into()],
        });
        let provider_config = crate::config::ProviderConfig::new("mock", "key", "https://example.com");

        let config = AuditConfig::default();
        let manager = LlmManager::new(&config, vec![(provider.clone() as Arc<dyn Provider>, provider_config)])
            .with_cache(cache);

        let first = manager
            .analyze_code("print('hi')\n", "a.py", "python", "owasp_top_10_2021", "mock-model", None)
            .await
            .unwrap();
        let second = manager
            .analyze_code("print('hi')\n", "a.py", "python", "owasp_top_10_2021", "mock-model", None)
            .await
            .unwrap();

        assert!(first.is_empty());
        assert!(second.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    /// A provider that fails its first `fail_until` calls with a retryable
    /// server error before succeeding, used to exercise the Manager's
    /// cross-provider fallback path without a real HTTP mock.
    struct FlakyProvider {
        name: &'static str,
        fail_until: usize,
        calls: std::sync::atomic::AtomicUsize,
        models: Vec<String>,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn supported_models(&self) -> &[String] {
            &self.models
        }

        async fn chat_completion(&self, _request: ChatRequest) -> Result<ChatResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_until {
                return Err(Error::server_error(self.name, 500));
            }
            Ok(ChatResponse {
                content: "{\"findings\": []}".into(),
                model: "mock-model".into(),
                usage: Default::default(),
                finish_reason: Some("stop".into()),
                response_time_ms: 1,
                timestamp: chrono::Utc::now(),
                provider: self.name.into(),
            })
        }
    }

    #[tokio::test]
    async fn fallback_dispatches_to_second_provider_on_failure() {
        crate::init_test_logging();
        let p1 = Arc::new(FlakyProvider {
            name: "p1",
            fail_until: usize::MAX,
            calls: std::sync::atomic::AtomicUsize::new(0),
            models: vec!["mock-model".into()],
        });
        let p2 = Arc::new(FlakyProvider {
            name: "p2",
            fail_until: 0,
            calls: std::sync::atomic::AtomicUsize::new(0),
            models: vec!["mock-model".into()],
        });

        let config = AuditConfig::default();
        let manager = LlmManager::new(
            &config,
            vec![
                (p1.clone() as Arc<dyn Provider>, crate::config::ProviderConfig::new("p1", "k", "https://example.com").with_priority(1)),
                (p2.clone() as Arc<dyn Provider>, crate::config::ProviderConfig::new("p2", "k", "https://example.com").with_priority(2)),
            ],
        );

        let findings = manager
            .analyze_code("print('hi')\n", "a.py", "python", "owasp_top_10_2021", "mock-model", None)
            .await
            .unwrap();

        assert!(findings.is_empty());
        assert!(p1.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(p2.calls.load(Ordering::SeqCst), 1);
    }

    fn sample_finding(confidence: f64) -> Finding {
        Finding {
            id: "abc".into(),
            title: "SQL Injection".into(),
            description: "desc".into(),
            severity: crate::model::Severity::High,
            category: crate::model::Category::Injection,
            file_path: "a.py".into(),
            line_number: None,
            code_snippet: None,
            cwe_id: None,
            confidence,
            confidence_factors: None,
            cross_file_evidence: Vec::new(),
            cross_file_recommendation: None,
        }
    }
}
