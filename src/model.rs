//! Shared data model: findings, code units, analysis tasks, and sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Severity of a reported vulnerability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Weight used by the risk-score formula (spec §7).
    pub fn weight(self) -> f64 {
        match self {
            Severity::Critical => 10.0,
            Severity::High => 7.0,
            Severity::Medium => 4.0,
            Severity::Low => 2.0,
            Severity::Info => 0.5,
        }
    }
}

/// Vulnerability category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Injection,
    Authentication,
    Authorization,
    SensitiveData,
    Cryptography,
    InputValidation,
    OutputEncoding,
    SessionManagement,
    Configuration,
    CodeQuality,
    Dependency,
    Other,
}

/// One reported issue, produced by the Aggregator from raw LLM output and
/// possibly rescored by the Confidence Calculator / Cross-File Analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub category: Category,
    pub file_path: String,
    pub line_number: Option<u32>,
    pub code_snippet: Option<String>,
    pub cwe_id: Option<String>,
    pub confidence: f64,
    pub confidence_factors: Option<ConfidenceFactors>,
    pub cross_file_evidence: Vec<String>,
    /// Set by the Cross-File Analyzer (§4.L step 5): whether its pass raised,
    /// lowered, or left the confidence within a ±0.1 band, or hit a recursion
    /// limit. `None` until a cross-file pass runs.
    pub cross_file_recommendation: Option<String>,
}

impl Finding {
    /// Stable id derived from title+path+line, matching the grounding
    /// source's `md5(title_path_line)[:12]` shape but with SHA-256.
    pub fn derive_id(title: &str, file_path: &str, line_number: Option<u32>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(b"_");
        hasher.update(file_path.as_bytes());
        hasher.update(b"_");
        hasher.update(line_number.unwrap_or(0).to_string().as_bytes());
        format!("{:x}", hasher.finalize())[..12].to_string()
    }
}

/// Per-factor breakdown from the Confidence Calculator (§4.M).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceFactors {
    pub framework_protection: f64,
    pub architecture_appropriateness: f64,
    pub code_complexity: f64,
    pub pattern_reliability: f64,
    pub context_completeness: f64,
    pub historical_accuracy: f64,
}

/// Risk level derived from a confidence score (§4.M thresholds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.85 {
            RiskLevel::Critical
        } else if confidence >= 0.65 {
            RiskLevel::High
        } else if confidence >= 0.4 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Scope of a [`CodeUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitType {
    File,
    Function,
    Class,
    Module,
}

/// Scheduling priority, also used by the Task Matrix's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Business-criticality score feeding the Task Matrix priority formula.
    pub fn business_criticality(self) -> f64 {
        match self {
            Priority::Critical => 0.9,
            Priority::High => 0.7,
            Priority::Medium => 0.5,
            Priority::Low => 0.3,
        }
    }
}

/// Analysis status of a [`CodeUnit`]. Transitions only forward:
/// `Pending -> InProgress -> {Completed|Failed|Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

/// One analyzable scope of source code (file, function, or class).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeUnit {
    pub id: String,
    pub name: String,
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub unit_type: UnitType,
    pub status: UnitStatus,
    pub priority: Priority,
    pub dependencies: HashSet<String>,
    pub analyzed_at: Option<DateTime<Utc>>,
    pub analysis_duration_ms: Option<u64>,
}

impl CodeUnit {
    pub fn new(
        file_path: impl Into<String>,
        name: impl Into<String>,
        unit_type: UnitType,
        start_line: u32,
        end_line: u32,
        priority: Priority,
    ) -> Self {
        let file_path = file_path.into();
        let name = name.into();
        let id = format!(
            "{:?}:{}:{}:{}",
            unit_type, file_path, name, start_line
        );
        Self {
            id,
            name,
            file_path,
            start_line,
            end_line,
            unit_type,
            status: UnitStatus::Pending,
            priority,
            dependencies: HashSet::new(),
            analyzed_at: None,
            analysis_duration_ms: None,
        }
    }

    pub fn line_count(&self) -> u32 {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    pub fn is_analyzed(&self) -> bool {
        matches!(self.status, UnitStatus::Completed | UnitStatus::Skipped)
    }

    pub fn is_pending(&self) -> bool {
        self.status == UnitStatus::Pending
    }
}

/// The kind of work an [`AnalysisTask`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FileAnalysis,
    FunctionAnalysis,
    ClassAnalysis,
    SecurityScan,
    DependencyCheck,
    ContextBuild,
}

/// Inputs to the priority-score formula (§4.J).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub security_impact: f64,
    pub business_criticality: f64,
    pub complexity: f64,
    pub estimated_duration_secs: f64,
    pub dependency_count: usize,
    pub failure_risk: f64,
}

impl TaskMetrics {
    pub fn priority_score(&self) -> f64 {
        let duration_term = (self.estimated_duration_secs / 300.0).min(1.0);
        let dependency_term = (self.dependency_count as f64 / 10.0).min(1.0);
        0.35 * self.security_impact + 0.25 * self.business_criticality
            - 0.15 * self.complexity
            - 0.10 * duration_term
            - 0.05 * dependency_term
            - 0.10 * self.failure_risk
    }

    /// Rough memory footprint estimate used by resource-constrained
    /// scheduling (§4.J `get_next_task`): complexity scaled to MB.
    pub fn estimated_memory_mb(&self) -> f64 {
        self.complexity * 100.0
    }
}

/// A scheduled unit of work bound to a [`CodeUnit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: String,
    pub code_unit_id: String,
    pub task_type: TaskType,
    pub model: String,
    pub metrics: TaskMetrics,
    pub dependencies: HashSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub metadata: std::collections::HashMap<String, String>,
}

impl AnalysisTask {
    pub fn priority_score(&self) -> f64 {
        self.metrics.priority_score()
    }

    pub fn is_ready(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now > d).unwrap_or(false)
    }
}

/// Lifecycle of an audit [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Progress snapshot for an in-flight [`Session`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionProgress {
    pub total_files: usize,
    pub analyzed_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
    pub current_file: Option<String>,
}

impl SessionProgress {
    pub fn coverage_percentage(&self) -> f64 {
        if self.total_files == 0 {
            return 0.0;
        }
        (self.analyzed_files as f64 / self.total_files as f64) * 100.0
    }
}

/// One audit run over one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub status: SessionStatus,
    pub progress: SessionProgress,
    pub findings: Vec<Finding>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(project_path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_path: project_path.into(),
            status: SessionStatus::Created,
            progress: SessionProgress::default(),
            findings: Vec::new(),
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
