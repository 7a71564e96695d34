//! Orchestrator / Session: drives discovery, scheduling, and the worker
//! pool that dispatches analysis through the LLM Manager (spec §4.O).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use crate::aggregator::Aggregator;
use crate::config::AuditConfig;
use crate::coverage::CoverageTracker;
use crate::discovery::Discovery;
use crate::error::{Error, Result};
use crate::file_filter::FileFilter;
use crate::llm::manager::LlmManager;
use crate::model::{
    AnalysisTask, CodeUnit, Priority, Session, SessionProgress, SessionStatus, TaskMetrics, TaskType,
};
use crate::task_matrix::{ResourceConstraints, TaskMatrix};

const MAX_UNIT_CONTENT_BYTES: usize = 50_000;
const DEFAULT_SYSTEM_TEMPLATE: &str = "You are a static application security testing assistant. \
Identify vulnerabilities in the supplied code. Respond with a JSON array of findings, each with \
title, description, severity, category, line, and confidence fields.";

const CANCEL_POLL_MILLIS: u64 = 50;

/// Invoked whenever `analyzed_files`, `failed_files`, or `current_file`
/// changes, per spec §4.O.
pub type ProgressCallback = Arc<dyn Fn(SessionProgress) + Send + Sync>;

/// A handle to a running or completed audit session: lets the caller poll
/// progress, read the final result, and request cancellation.
pub struct SessionHandle {
    session: Arc<Mutex<Session>>,
    cancel: Arc<AtomicBool>,
}

impl SessionHandle {
    pub async fn snapshot(&self) -> Session {
        self.session.lock().await.clone()
    }

    /// Request cancellation. Workers observe this at their next scheduling
    /// point and abandon in-flight results (spec §4.O).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Splits oversized file content on function/class boundaries (falling
/// back to a fixed byte split) so no single LLM call exceeds the bound.
fn chunk_content(content: &str) -> Vec<String> {
    if content.len() <= MAX_UNIT_CONTENT_BYTES {
        return vec![content.to_string()];
    }

    let boundary = regex::Regex::new(r"(?m)^\s*(def |function |class |public |private |func )").unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in &lines {
        if boundary.is_match(line) && current.len() >= MAX_UNIT_CONTENT_BYTES / 2 {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
        if current.len() >= MAX_UNIT_CONTENT_BYTES {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(content.to_string());
    }
    chunks
}

async fn load_unit_content(project_root: &Path, unit: &CodeUnit) -> Result<String> {
    let path = project_root.join(&unit.file_path);
    let full = tokio::fs::read_to_string(&path).await?;
    let lines: Vec<&str> = full.lines().collect();
    let start = (unit.start_line.saturating_sub(1)) as usize;
    let end = (unit.end_line as usize).min(lines.len());
    if start >= end {
        return Ok(full);
    }
    Ok(lines[start..end].join("\n"))
}

fn task_for_unit(unit: &CodeUnit, model: &str) -> AnalysisTask {
    let task_type = match unit.unit_type {
        crate::model::UnitType::File => TaskType::FileAnalysis,
        crate::model::UnitType::Function => TaskType::FunctionAnalysis,
        crate::model::UnitType::Class => TaskType::ClassAnalysis,
        crate::model::UnitType::Module => TaskType::ContextBuild,
    };

    let complexity = (unit.line_count() as f64 / 500.0).min(1.0);
    AnalysisTask {
        id: format!("task:{}", unit.id),
        code_unit_id: unit.id.clone(),
        task_type,
        model: model.to_string(),
        metrics: TaskMetrics {
            security_impact: unit.priority.business_criticality(),
            business_criticality: unit.priority.business_criticality(),
            complexity,
            estimated_duration_secs: (unit.line_count() as f64 / 10.0).max(5.0),
            dependency_count: 0,
            failure_risk: 0.1,
        },
        dependencies: Default::default(),
        retry_count: 0,
        max_retries: 3,
        created_at: chrono::Utc::now(),
        deadline: None,
        metadata: HashMap::new(),
    }
}

fn language_for(path: &str) -> &'static str {
    crate::discovery::detect_language(Path::new(path)).unwrap_or("unknown")
}

/// Shared, lock-guarded state every worker in the pool mutates.
struct SharedState {
    coverage: Mutex<CoverageTracker>,
    task_matrix: Mutex<TaskMatrix>,
    aggregator: Mutex<Aggregator>,
    session: Arc<Mutex<Session>>,
}

/// Drives one audit end to end: discovery, scheduling through the Task
/// Matrix and Coverage Tracker, and a bounded worker pool dispatching
/// through the LLM Manager.
pub struct Orchestrator {
    config: AuditConfig,
    manager: Arc<LlmManager>,
    discovery: Discovery,
}

impl Orchestrator {
    pub fn new(config: AuditConfig, manager: Arc<LlmManager>) -> Self {
        Self {
            config,
            manager,
            discovery: Discovery::default(),
        }
    }

    /// Start an audit over `project_path`. `file_contents` is the set of
    /// candidate files already read from disk (relative-path, content
    /// pairs) — loading the tree is the caller's concern (spec §1 leaves
    /// filesystem traversal policy, e.g. symlink handling, to the embedder).
    pub async fn start_audit(
        &self,
        project_path: impl Into<String>,
        file_contents: Vec<(PathBuf, String)>,
        progress: Option<ProgressCallback>,
    ) -> Result<SessionHandle> {
        let project_path = project_path.into();
        let mut session = Session::new(project_path.clone());
        session.status = SessionStatus::Initializing;

        let filter = FileFilter::new(self.config.file_filtering.clone());
        let units = self
            .discovery
            .discover(Path::new(&project_path), &filter, &file_contents);

        let total_files = units
            .iter()
            .filter(|u| u.unit_type == crate::model::UnitType::File)
            .count();

        let mut coverage = CoverageTracker::new();
        coverage.register(units.clone());

        let mut task_matrix = TaskMatrix::new(chrono::Utc::now());
        for unit in &units {
            task_matrix.add_task(task_for_unit(unit, &self.config.default_model));
        }

        session.progress.total_files = total_files;
        session.status = SessionStatus::Running;
        session.started_at = Some(chrono::Utc::now());

        let session = Arc::new(Mutex::new(session));
        let cancel = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(SharedState {
            coverage: Mutex::new(coverage),
            task_matrix: Mutex::new(task_matrix),
            aggregator: Mutex::new(Aggregator::new()),
            session: session.clone(),
        });

        let worker_count = self.config.audit.worker_count.max(1);
        let mut join_set = JoinSet::new();
        for worker_id in 0..worker_count {
            let shared = shared.clone();
            let manager = self.manager.clone();
            let project_path = project_path.clone();
            let cancel = cancel.clone();
            let progress = progress.clone();
            let task_timeout_secs = self.config.audit.task_timeout_secs;
            join_set.spawn(async move {
                worker_loop(
                    worker_id,
                    shared,
                    manager,
                    project_path,
                    cancel,
                    progress,
                    task_timeout_secs,
                )
                .await;
            });
        }

        let session_timeout = std::time::Duration::from_secs(self.config.audit.session_timeout_secs);
        let cancel_for_timeout = cancel.clone();
        let join_handle = tokio::spawn(async move {
            let _ = tokio::time::timeout(session_timeout, async {
                while let Some(res) = join_set.join_next().await {
                    if let Err(e) = res {
                        error!("worker task panicked: {e}");
                    }
                }
            })
            .await
            .map_err(|_| {
                warn!("session timeout elapsed, cancelling remaining workers");
                cancel_for_timeout.store(true, Ordering::SeqCst);
            });
        });

        let shared_for_finalize = shared.clone();
        let session_for_finalize = session.clone();
        tokio::spawn(async move {
            let _ = join_handle.await;
            let mut session = session_for_finalize.lock().await;
            let aggregator = shared_for_finalize.aggregator.lock().await;
            session.findings = aggregator.sorted_findings();
            if session.status == SessionStatus::Running {
                session.status = SessionStatus::Completed;
            }
            session.completed_at = Some(chrono::Utc::now());
        });

        Ok(SessionHandle { session, cancel })
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<SharedState>,
    manager: Arc<LlmManager>,
    project_root: String,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
    task_timeout_secs: u64,
) {
    let project_root = PathBuf::from(project_root);
    let mut idle_polls = 0u32;

    loop {
        if cancel.load(Ordering::SeqCst) {
            debug!(worker_id, "worker observed cancellation, exiting");
            return;
        }

        let task = {
            let mut matrix = shared.task_matrix.lock().await;
            matrix.get_next_task(&ResourceConstraints::default())
        };

        let Some(task) = task else {
            let done = {
                let matrix = shared.task_matrix.lock().await;
                matrix.ready_count() == 0 && matrix.blocked_count() == 0
            };
            if done {
                return;
            }
            idle_polls += 1;
            if idle_polls > 200 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(CANCEL_POLL_MILLIS)).await;
            continue;
        };
        idle_polls = 0;

        if cancel.load(Ordering::SeqCst) {
            return;
        }

        let unit = {
            let mut coverage = shared.coverage.lock().await;
            let unit = coverage.get(&task.code_unit_id).cloned();
            if let Some(unit) = &unit {
                coverage.mark_unit_in_progress(&unit.id);
            }
            unit
        };

        let Some(unit) = unit else {
            warn!(worker_id, task_id = %task.id, "task referenced unknown code unit");
            continue;
        };

        {
            let mut session = shared.session.lock().await;
            session.progress.current_file = Some(unit.file_path.clone());
            if let Some(cb) = &progress {
                cb(session.progress.clone());
            }
        }

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(task_timeout_secs),
            dispatch_unit(&manager, &project_root, &unit, &task.model),
        )
        .await;

        if cancel.load(Ordering::SeqCst) {
            debug!(worker_id, unit_id = %unit.id, "worker observed cancellation after dispatch, discarding result");
            let mut coverage = shared.coverage.lock().await;
            coverage.mark_unit_failed(&unit.id, "cancelled");
            return;
        }

        match outcome {
            Ok(Ok(findings)) => {
                {
                    let mut aggregator = shared.aggregator.lock().await;
                    for finding in findings {
                        aggregator.add(finding);
                    }
                }
                {
                    let mut coverage = shared.coverage.lock().await;
                    coverage.mark_unit_analyzed(&unit.id, 0);
                }
                {
                    let mut matrix = shared.task_matrix.lock().await;
                    matrix.complete_task(&task.id);
                }
                let mut session = shared.session.lock().await;
                if unit.unit_type == crate::model::UnitType::File {
                    session.progress.analyzed_files += 1;
                }
                if let Some(cb) = &progress {
                    cb(session.progress.clone());
                }
            }
            Ok(Err(err)) => {
                warn!(worker_id, unit_id = %unit.id, "analysis failed: {err}");
                handle_failure(&shared, task, &unit, &err.to_string()).await;
            }
            Err(_) => {
                warn!(worker_id, unit_id = %unit.id, "analysis timed out");
                handle_failure(&shared, task, &unit, "task timeout").await;
            }
        }
    }
}

async fn handle_failure(shared: &Arc<SharedState>, task: AnalysisTask, unit: &CodeUnit, reason: &str) {
    let will_retry = task.retry_count < task.max_retries;
    {
        let mut matrix = shared.task_matrix.lock().await;
        matrix.fail_task(task);
    }
    if !will_retry {
        let mut coverage = shared.coverage.lock().await;
        coverage.mark_unit_failed(&unit.id, reason);
        let mut session = shared.session.lock().await;
        session.progress.failed_files += 1;
        session.errors.push(format!("{}: {}", unit.file_path, reason));
    }
}

#[instrument(skip(manager, project_root, unit), fields(file = %unit.file_path, unit = %unit.name))]
async fn dispatch_unit(
    manager: &Arc<LlmManager>,
    project_root: &Path,
    unit: &CodeUnit,
    model: &str,
) -> Result<Vec<crate::model::Finding>> {
    let content = load_unit_content(project_root, unit).await?;
    let chunks = chunk_content(&content);
    let language = language_for(&unit.file_path);

    let mut findings = Vec::new();
    for chunk in chunks {
        let result = manager
            .analyze_code(&chunk, &unit.file_path, language, DEFAULT_SYSTEM_TEMPLATE, model, None)
            .await;
        match result {
            Ok(mut chunk_findings) => findings.append(&mut chunk_findings),
            Err(e) if findings.is_empty() => return Err(e),
            Err(e) => {
                warn!("partial chunk analysis failure for {}: {e}", unit.file_path);
            }
        }
    }
    Ok(findings)
}

/// Priority hint an embedder may use to cap concurrent sessions (spec
/// §6 `audit.max_concurrent_sessions`), exposed for callers managing a
/// session pool themselves; the orchestrator itself is single-session.
pub fn default_priority_order() -> [Priority; 4] {
    [Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_preserves_small_content() {
        let content = "short file\nwith two lines\n";
        let chunks = chunk_content(content);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].trim(), content.trim());
    }

    #[test]
    fn chunking_splits_oversized_content() {
        let mut content = String::new();
        for i in 0..2000 {
            content.push_str(&format!("def f{i}():\n    pass\n"));
        }
        let chunks = chunk_content(&content);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_UNIT_CONTENT_BYTES * 2);
        }
    }

    #[test]
    fn task_for_unit_inherits_priority_as_security_impact() {
        let unit = CodeUnit::new("a.py", "a.py", crate::model::UnitType::File, 1, 10, Priority::Critical);
        let task = task_for_unit(&unit, "kimi-k2");
        assert_eq!(task.metrics.security_impact, Priority::Critical.business_criticality());
        assert_eq!(task.task_type, TaskType::FileAnalysis);
    }

    #[tokio::test]
    async fn session_handle_cancel_flag_is_observable() {
        let handle = SessionHandle {
            session: Arc::new(Mutex::new(Session::new("proj"))),
            cancel: Arc::new(AtomicBool::new(false)),
        };
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
