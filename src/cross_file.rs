//! Cross-file relationship discovery and confidence re-scoring (spec §4.L).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::CrossFileConfig;
use crate::llm::manager::{CrossFileHook, LlmManager};
use crate::model::Finding;
use crate::recursion::RecursionStack;

const ALWAYS_ESCALATE_KEYWORDS: &[&str] = &["upload", "xss", "path traversal", "permission"];

/// One related file's contribution to a finding's re-scored confidence.
#[derive(Debug, Clone)]
pub struct CrossFileEvidence {
    pub related_path: String,
    pub adjustment: f64,
    pub reason: String,
}

struct CandidateFile {
    path: PathBuf,
    category: &'static str,
}

fn word_boundary_regex(stem: &str) -> Option<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(stem))).ok()
}

/// Small LRU-flavored cache of file contents read during one analyzer's
/// lifetime, bounded to avoid unbounded memory growth over a long session.
struct FileContentCache {
    entries: HashMap<PathBuf, String>,
    order: Vec<PathBuf>,
    capacity: usize,
}

impl FileContentCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            capacity,
        }
    }

    fn insert(&mut self, path: PathBuf, content: String) {
        if !self.entries.contains_key(&path) {
            if self.order.len() >= self.capacity {
                if let Some(oldest) = self.order.first().cloned() {
                    self.entries.remove(&oldest);
                    self.order.remove(0);
                }
            }
            self.order.push(path.clone());
        }
        self.entries.insert(path, content);
    }

    fn get(&self, path: &Path) -> Option<&String> {
        self.entries.get(path)
    }
}

/// Discovers related files for a low-confidence finding, re-analyzes them
/// through the LLM Manager, and folds the evidence back into the finding's
/// confidence score. Held by the [`LlmManager`] as a [`CrossFileHook`]; it
/// holds a [`Weak`] reference back so the two do not form an `Arc` cycle.
/// Construction order is the caller's responsibility: build the `LlmManager`
/// with `Arc::new_cyclic`, constructing a `CrossFileAnalyzer` from the weak
/// handle the closure receives, then call `set_cross_file_hook` before
/// handing the manager to the [`crate::orchestrator::Orchestrator`].
pub struct CrossFileAnalyzer {
    manager: Weak<LlmManager>,
    project_root: PathBuf,
    config: CrossFileConfig,
    stack: Mutex<RecursionStack>,
    file_cache: Mutex<FileContentCache>,
    pattern_memo: Mutex<HashMap<String, Vec<PathBuf>>>,
    finding_memo: Mutex<HashMap<String, Finding>>,
}

impl CrossFileAnalyzer {
    pub fn new(manager: Weak<LlmManager>, project_root: impl Into<PathBuf>, config: CrossFileConfig) -> Self {
        let max_depth = config.max_depth;
        Self {
            manager,
            project_root: project_root.into(),
            config,
            stack: Mutex::new(RecursionStack::new(max_depth)),
            file_cache: Mutex::new(FileContentCache::new(64)),
            pattern_memo: Mutex::new(HashMap::new()),
            finding_memo: Mutex::new(HashMap::new()),
        }
    }

    fn memo_key(path: &str, finding: &Finding) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(format!("{:?}", finding.category).as_bytes());
        hasher.update(finding.line_number.unwrap_or(0).to_string().as_bytes());
        let digest = hasher.finalize();
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    async fn read_cached(&self, path: &Path) -> Option<String> {
        {
            let cache = self.file_cache.lock().await;
            if let Some(content) = cache.get(path) {
                return Some(content.clone());
            }
        }
        let content = tokio::fs::read_to_string(path).await.ok()?;
        let mut cache = self.file_cache.lock().await;
        cache.insert(path.to_path_buf(), content.clone());
        Some(content)
    }

    async fn find_callers(&self, stem: &str) -> Vec<CandidateFile> {
        let memo_key = format!("callers:{stem}");
        {
            let memo = self.pattern_memo.lock().await;
            if let Some(hit) = memo.get(&memo_key) {
                return hit.iter().map(|p| CandidateFile { path: p.clone(), category: "caller" }).collect();
            }
        }

        let Some(pattern) = word_boundary_regex(stem) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut files_scanned = 0usize;
        for entry in walkdir::WalkDir::new(&self.project_root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if files_scanned >= self.config.search.max_files_per_pattern {
                break;
            }
            let ext = entry.path().extension().and_then(|e| e.to_str()).unwrap_or("");
            if !self.config.search.extensions.iter().any(|e| e == ext) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if metadata.len() > self.config.search.max_file_bytes {
                continue;
            }
            files_scanned += 1;

            let Ok(content) = tokio::fs::read_to_string(entry.path()).await else {
                continue;
            };
            let preview: String = content.chars().take(self.config.search.preview_bytes).collect();
            if pattern.is_match(&preview) {
                found.push(entry.path().to_path_buf());
                if found.len() >= self.config.search.max_matches {
                    break;
                }
            }
        }

        let mut memo = self.pattern_memo.lock().await;
        memo.insert(memo_key, found.clone());

        found.into_iter().map(|path| CandidateFile { path, category: "caller" }).collect()
    }

    fn find_callees(&self, current_path: &Path, content: &str) -> Vec<CandidateFile> {
        static IMPORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
            vec![
                Regex::new(r#"(?m)^\s*from\s+([\w.]+)\s+import"#).unwrap(),
                Regex::new(r#"(?m)^\s*import\s+([\w.]+)"#).unwrap(),
                Regex::new(r#"require\(['"]([^'"]+)['"]\)"#).unwrap(),
                Regex::new(r#"(?m)^\s*import .* from\s+['"]([^'"]+)['"]"#).unwrap(),
                Regex::new(r#"(?:include|require)(?:_once)?\s*\(?\s*['"]([^'"]+)['"]"#).unwrap(),
            ]
        });

        let parent = current_path.parent().unwrap_or(Path::new(""));
        let mut candidates = Vec::new();

        for pattern in IMPORT_PATTERNS.iter() {
            for caps in pattern.captures_iter(content) {
                let raw = caps[1].replace('.', "/");
                for base in [parent.join(&raw), self.project_root.join(&raw)] {
                    for ext in ["", ".py", ".js", ".ts", ".java", ".php", ".go"] {
                        let candidate = PathBuf::from(format!("{}{}", base.display(), ext));
                        if candidate.exists() {
                            candidates.push(CandidateFile { path: candidate, category: "callee" });
                        }
                    }
                }
            }
        }

        candidates
    }

    fn find_configs(&self) -> Vec<CandidateFile> {
        let patterns = [
            "**/config.*",
            "**/settings.*",
            "**/application.properties",
            "**/web.xml",
            "**/.htaccess",
        ];
        self.glob_candidates(&patterns, "config")
    }

    fn find_templates(&self, content: &str) -> Vec<CandidateFile> {
        static TEMPLATE_REF: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"(?:include|extends|import)\s*\(?\s*['"]([^'"]+\.html?)['"]"#).unwrap()
        });
        let mut candidates = Vec::new();
        for caps in TEMPLATE_REF.captures_iter(content) {
            let candidate = self.project_root.join(&caps[1]);
            if candidate.exists() {
                candidates.push(CandidateFile { path: candidate, category: "template" });
            }
        }
        candidates
    }

    fn find_parent_controllers(&self, current_path: &Path) -> Vec<CandidateFile> {
        let ancestors: Vec<&Path> = current_path.ancestors().collect();
        self.glob_candidates(&["**/*Controller*"], "parent_controller")
            .into_iter()
            .filter(|c| ancestors.iter().any(|a| c.path.starts_with(a)))
            .collect()
    }

    fn glob_candidates(&self, patterns: &[&str], category: &'static str) -> Vec<CandidateFile> {
        let mut candidates = Vec::new();
        for pattern in patterns {
            let full_pattern = self.project_root.join(pattern);
            let Some(pattern_str) = full_pattern.to_str() else { continue };
            let Ok(paths) = glob::glob(pattern_str) else { continue };
            for entry in paths.filter_map(|p| p.ok()) {
                candidates.push(CandidateFile { path: entry, category });
            }
        }
        candidates
    }

    fn category_for_finding(&self, finding: &Finding) -> &'static str {
        let lower_title = finding.title.to_lowercase();
        if lower_title.contains("upload") || lower_title.contains("path traversal") {
            "upload_or_traversal"
        } else if lower_title.contains("xss") {
            "xss"
        } else {
            "generic"
        }
    }

    async fn candidates_for(&self, finding: &Finding, file_path: &Path, content: &str) -> Vec<CandidateFile> {
        let mut candidates = Vec::new();
        let stem = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if !stem.is_empty() {
            candidates.extend(self.find_callers(&stem).await);
        }
        candidates.extend(self.find_callees(file_path, content));

        match self.category_for_finding(finding) {
            "upload_or_traversal" => {
                candidates.extend(self.find_configs());
                candidates.extend(self.find_parent_controllers(file_path));
            }
            "xss" => candidates.extend(self.find_templates(content)),
            _ => {}
        }

        candidates.truncate(self.config.max_related_files);
        candidates
    }

    fn fold_evidence(&self, original: f64, related_findings: &[(String, Finding)], matching_category: crate::model::Category) -> (f64, Vec<CrossFileEvidence>) {
        let mut evidence = Vec::new();
        let mut total_adjustment = 0.0;

        for (related_path, finding) in related_findings {
            let lower = finding.description.to_lowercase();
            let signals_control = ["safe", "validated", "validation", "sanitized", "sanitised"]
                .iter()
                .any(|marker| lower.contains(marker));

            let adjustment = if finding.category == matching_category {
                0.2
            } else if signals_control {
                -0.1
            } else {
                0.0
            };

            if adjustment != 0.0 {
                evidence.push(CrossFileEvidence {
                    related_path: related_path.clone(),
                    adjustment,
                    reason: if adjustment > 0.0 {
                        "corroborating finding in related file".to_string()
                    } else {
                        "related file signals a security control".to_string()
                    },
                });
                total_adjustment += adjustment;
            }
        }

        (
            (original + total_adjustment).clamp(self.config.min_confidence, self.config.max_confidence),
            evidence,
        )
    }

    /// Recommendation string reflecting whether the cross-file pass raised,
    /// lowered, or left confidence within a ±0.1 band (spec §4.L step 5).
    fn generate_recommendation(original: f64, adjusted: f64) -> String {
        if adjusted > original + 0.1 {
            format!(
                "cross-file analysis increased confidence ({original:.2} -> {adjusted:.2}); prioritize remediation"
            )
        } else if adjusted < original - 0.1 {
            format!(
                "cross-file analysis decreased confidence ({original:.2} -> {adjusted:.2}); likely mitigated by a security control"
            )
        } else {
            "cross-file analysis did not significantly change confidence; recommend manual review".to_string()
        }
    }

    /// Core cross-file analysis: discover related files, re-analyze each
    /// through the Manager, fold the evidence into `finding`'s confidence.
    pub async fn analyze(&self, mut finding: Finding, file_path: &str) -> Finding {
        let memo_key = Self::memo_key(file_path, &finding);
        {
            let memo = self.finding_memo.lock().await;
            if let Some(cached) = memo.get(&memo_key) {
                return cached.clone();
            }
        }

        {
            let mut stack = self.stack.lock().await;
            if stack.contains("related_file", file_path) || stack.depth() as u32 >= self.config.max_depth {
                finding.cross_file_recommendation = Some(
                    "cross-file analysis stopped: maximum recursion depth reached".to_string(),
                );
                return finding;
            }
            if stack.enter("related_file", file_path).is_err() {
                finding.cross_file_recommendation = Some(
                    "cross-file analysis stopped: maximum recursion depth reached".to_string(),
                );
                return finding;
            }
        }

        let result = self.analyze_inner(&mut finding, file_path).await;
        finding = result;

        {
            let mut stack = self.stack.lock().await;
            stack.exit("related_file", file_path);
        }

        let mut memo = self.finding_memo.lock().await;
        memo.insert(memo_key, finding.clone());
        finding
    }

    async fn analyze_inner(&self, finding: &mut Finding, file_path: &str) -> Finding {
        let Some(manager) = self.manager.upgrade() else {
            return finding.clone();
        };

        let current_path = self.project_root.join(file_path);
        let content = match self.read_cached(&current_path).await {
            Some(c) => c,
            None => return finding.clone(),
        };

        let candidates = self.candidates_for(finding, &current_path, &content).await;
        let matching_category = finding.category;

        let mut related_findings = Vec::new();
        for candidate in candidates {
            let rel = candidate
                .path
                .strip_prefix(&self.project_root)
                .unwrap_or(&candidate.path)
                .to_string_lossy()
                .to_string();
            if rel == file_path {
                continue;
            }
            let Some(related_content) = self.read_cached(&candidate.path).await else {
                continue;
            };
            let language = crate::discovery::detect_language(&candidate.path).unwrap_or("unknown");
            let template = format!(
                "Focused re-analysis: does this file corroborate or mitigate a {:?} finding titled '{}'? Related via: {}.",
                finding.category, finding.title, candidate.category,
            );

            let analyzed = manager
                .analyze_code(&related_content, &rel, language, &template, "kimi-k2", Some("related_file"))
                .await
                .unwrap_or_default();

            for related in analyzed {
                related_findings.push((rel.clone(), related));
            }
        }

        let original_confidence = finding.confidence;
        let (confidence, evidence) = self.fold_evidence(original_confidence, &related_findings, matching_category);
        finding.confidence = confidence;
        finding.cross_file_evidence = evidence
            .into_iter()
            .map(|e| format!("{}: {:+.2} ({})", e.related_path, e.adjustment, e.reason))
            .collect();
        finding.cross_file_recommendation = Some(Self::generate_recommendation(original_confidence, confidence));
        finding.clone()
    }
}

#[async_trait]
impl CrossFileHook for CrossFileAnalyzer {
    async fn analyze_uncertain_finding(&self, finding: Finding, file_path: &str) -> Finding {
        self.analyze(finding, file_path).await
    }
}

/// Whether a finding's title matches one of the cross-file always-escalate
/// categories, mirroring `should_trigger_cross_file`'s title check in
/// `llm::manager` (kept here too since the analyzer's own candidate
/// selection branches on the same categories).
pub fn matches_escalation_keyword(title: &str) -> bool {
    let lower = title.to_lowercase();
    ALWAYS_ESCALATE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Severity};

    fn finding(category: Category, description: &str) -> Finding {
        Finding {
            id: "abc".into(),
            title: "Test".into(),
            description: description.into(),
            severity: Severity::Medium,
            category,
            file_path: "a.py".into(),
            line_number: Some(10),
            code_snippet: None,
            cwe_id: None,
            confidence: 0.5,
            confidence_factors: None,
            cross_file_evidence: Vec::new(),
            cross_file_recommendation: None,
        }
    }

    fn analyzer() -> CrossFileAnalyzer {
        CrossFileAnalyzer::new(Weak::new(), ".", CrossFileConfig::default())
    }

    #[test]
    fn memo_key_is_stable_for_same_inputs() {
        let f = finding(Category::Injection, "desc");
        let a = CrossFileAnalyzer::memo_key("a.py", &f);
        let b = CrossFileAnalyzer::memo_key("a.py", &f);
        assert_eq!(a, b);
    }

    #[test]
    fn memo_key_differs_by_path() {
        let f = finding(Category::Injection, "desc");
        let a = CrossFileAnalyzer::memo_key("a.py", &f);
        let b = CrossFileAnalyzer::memo_key("b.py", &f);
        assert_ne!(a, b);
    }

    #[test]
    fn corroborating_finding_raises_confidence() {
        let related = finding(Category::Injection, "plain description");
        let (score, evidence) = analyzer().fold_evidence(0.5, &[("b.py".into(), related)], Category::Injection);
        assert!(score > 0.5);
        assert_eq!(evidence.len(), 1);
    }

    #[test]
    fn security_control_signal_lowers_confidence() {
        let related = finding(Category::Other, "input is validated and safe here");
        let (score, _) = analyzer().fold_evidence(0.5, &[("b.py".into(), related)], Category::Injection);
        assert!(score < 0.5);
    }

    #[test]
    fn confidence_clamped_to_floor_and_ceiling() {
        let low = analyzer().fold_evidence(0.05, &[], Category::Injection).0;
        assert_eq!(low, 0.1);
    }

    #[test]
    fn recommendation_reflects_confidence_direction() {
        assert!(CrossFileAnalyzer::generate_recommendation(0.5, 0.7).contains("increased"));
        assert!(CrossFileAnalyzer::generate_recommendation(0.7, 0.5).contains("decreased"));
        assert!(CrossFileAnalyzer::generate_recommendation(0.5, 0.55).contains("did not significantly"));
    }

    #[test]
    fn escalation_keywords_detected() {
        assert!(matches_escalation_keyword("Unrestricted File Upload"));
        assert!(matches_escalation_keyword("Reflected XSS in search box"));
        assert!(!matches_escalation_keyword("Unused variable"));
    }

    #[test]
    fn word_boundary_avoids_substring_overmatch() {
        let pattern = word_boundary_regex("auth").unwrap();
        assert!(pattern.is_match("import auth"));
        assert!(!pattern.is_match("import authority"));
    }
}
