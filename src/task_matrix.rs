//! Priority-score scheduling heap for [`AnalysisTask`]s (spec §4.J).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::AnalysisTask;

const REBALANCE_INTERVAL_MINUTES: i64 = 15;
const PRIORITY_BOOST_THRESHOLD: u32 = 3;
const OVERDUE_BOOST_FACTOR: f64 = 1.3;
const RETRY_BOOST_FACTOR: f64 = 1.2;

/// Wraps an [`AnalysisTask`] for max-heap ordering by `priority_score()`.
/// Ties break on `created_at` (older first) for determinism.
#[derive(Debug, Clone)]
struct ScoredTask {
    task: AnalysisTask,
}

impl PartialEq for ScoredTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id
    }
}
impl Eq for ScoredTask {}

impl PartialOrd for ScoredTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority_score()
            .partial_cmp(&other.task.priority_score())
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.task.created_at.cmp(&self.task.created_at))
    }
}

/// Resource limits `get_next_task` applies before dispatching a task: a
/// task whose estimated needs don't fit is skipped and requeued (spec §4.J).
#[derive(Debug, Clone)]
pub struct ResourceConstraints {
    pub max_memory_mb: f64,
    pub max_duration_seconds: f64,
    pub max_complexity: f64,
}

impl Default for ResourceConstraints {
    fn default() -> Self {
        Self {
            max_memory_mb: f64::INFINITY,
            max_duration_seconds: f64::INFINITY,
            max_complexity: 1.0,
        }
    }
}

impl ResourceConstraints {
    fn allows(&self, task: &AnalysisTask) -> bool {
        task.metrics.estimated_duration_secs <= self.max_duration_seconds
            && task.metrics.complexity <= self.max_complexity
            && task.metrics.estimated_memory_mb() <= self.max_memory_mb
    }
}

/// Max-priority scheduling heap with dependency tracking, retry-with-boost,
/// and periodic rebalancing of stale or overdue tasks (spec §4.J).
pub struct TaskMatrix {
    ready: BinaryHeap<ScoredTask>,
    blocked: HashMap<String, AnalysisTask>,
    failed: Vec<AnalysisTask>,
    completed_ids: HashSet<String>,
    last_rebalance: DateTime<Utc>,
}

impl TaskMatrix {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            ready: BinaryHeap::new(),
            blocked: HashMap::new(),
            failed: Vec::new(),
            completed_ids: HashSet::new(),
            last_rebalance: now,
        }
    }

    /// Insert a task, routing it to the ready heap or the blocked map
    /// depending on whether its dependencies have already completed.
    pub fn add_task(&mut self, mut task: AnalysisTask) {
        task.dependencies.retain(|dep| !self.completed_ids.contains(dep));
        if task.is_ready() {
            self.ready.push(ScoredTask { task });
        } else {
            self.blocked.insert(task.id.clone(), task);
        }
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    /// Pop the highest priority-score ready task satisfying `constraints`,
    /// if any. Tasks skipped due to constraint mismatch are requeued.
    pub fn get_next_task(&mut self, constraints: &ResourceConstraints) -> Option<AnalysisTask> {
        let mut deferred = Vec::new();
        let mut chosen = None;

        while let Some(scored) = self.ready.pop() {
            if constraints.allows(&scored.task) {
                chosen = Some(scored.task);
                break;
            }
            deferred.push(scored);
        }

        for scored in deferred {
            self.ready.push(scored);
        }

        chosen
    }

    /// Mark a task completed, unblocking any dependents whose dependency
    /// set is now fully satisfied.
    pub fn complete_task(&mut self, task_id: &str) {
        self.completed_ids.insert(task_id.to_string());

        let unblocked: Vec<String> = self
            .blocked
            .iter_mut()
            .filter_map(|(id, task)| {
                task.dependencies.remove(task_id);
                task.is_ready().then(|| id.clone())
            })
            .collect();

        for id in unblocked {
            if let Some(task) = self.blocked.remove(&id) {
                self.ready.push(ScoredTask { task });
            }
        }
    }

    /// Handle a failed task: if retries remain, boost its security impact
    /// and requeue; otherwise move it to the permanently-failed set.
    pub fn fail_task(&mut self, mut task: AnalysisTask) {
        if task.retry_count < task.max_retries {
            task.retry_count += 1;
            if task.retry_count >= PRIORITY_BOOST_THRESHOLD {
                task.metrics.security_impact = (task.metrics.security_impact * RETRY_BOOST_FACTOR).min(1.0);
            }
            self.ready.push(ScoredTask { task });
        } else {
            self.failed.push(task);
        }
    }

    pub fn failed_tasks(&self) -> &[AnalysisTask] {
        &self.failed
    }

    /// Every `rebalance_interval_minutes`, boost overdue ready tasks'
    /// security impact so they rise in the heap (spec §4.J).
    pub fn maybe_rebalance(&mut self, now: DateTime<Utc>) -> bool {
        if (now - self.last_rebalance).num_minutes() < REBALANCE_INTERVAL_MINUTES {
            return false;
        }
        self.last_rebalance = now;

        let mut tasks: Vec<ScoredTask> = std::mem::take(&mut self.ready).into_vec();
        for scored in &mut tasks {
            if scored.task.is_overdue(now) {
                scored.task.metrics.security_impact =
                    (scored.task.metrics.security_impact * OVERDUE_BOOST_FACTOR).min(1.0);
            }
        }
        self.ready = tasks.into_iter().collect();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskMetrics, TaskType};
    use std::collections::HashMap as Map;

    fn task(id: &str, security_impact: f64) -> AnalysisTask {
        AnalysisTask {
            id: id.to_string(),
            code_unit_id: format!("unit-{id}"),
            task_type: TaskType::FileAnalysis,
            model: "kimi-k2".into(),
            metrics: TaskMetrics {
                security_impact,
                business_criticality: 0.5,
                complexity: 0.2,
                estimated_duration_secs: 30.0,
                dependency_count: 0,
                failure_risk: 0.1,
            },
            dependencies: HashSet::new(),
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            deadline: None,
            metadata: Map::new(),
        }
    }

    #[test]
    fn higher_priority_score_dispatched_first() {
        let mut matrix = TaskMatrix::new(Utc::now());
        matrix.add_task(task("low", 0.1));
        matrix.add_task(task("high", 0.9));
        let next = matrix.get_next_task(&ResourceConstraints::default()).unwrap();
        assert_eq!(next.id, "high");
    }

    #[test]
    fn dependent_task_blocked_until_dependency_completes() {
        let mut matrix = TaskMatrix::new(Utc::now());
        let mut dependent = task("dependent", 0.5);
        dependent.dependencies.insert("dependency".to_string());
        matrix.add_task(dependent);
        assert_eq!(matrix.ready_count(), 0);
        assert_eq!(matrix.blocked_count(), 1);

        matrix.complete_task("dependency");
        assert_eq!(matrix.ready_count(), 1);
        assert_eq!(matrix.blocked_count(), 0);
    }

    #[test]
    fn failed_task_with_retries_left_is_requeued_with_boost() {
        let mut matrix = TaskMatrix::new(Utc::now());
        let mut t = task("retryable", 0.4);
        t.retry_count = PRIORITY_BOOST_THRESHOLD - 1;
        matrix.fail_task(t);
        assert_eq!(matrix.ready_count(), 1);
        let requeued = matrix.get_next_task(&ResourceConstraints::default()).unwrap();
        assert!(requeued.metrics.security_impact > 0.4);
    }

    #[test]
    fn failed_task_out_of_retries_moves_to_failed_set() {
        let mut matrix = TaskMatrix::new(Utc::now());
        let mut t = task("exhausted", 0.4);
        t.retry_count = t.max_retries;
        matrix.fail_task(t);
        assert_eq!(matrix.ready_count(), 0);
        assert_eq!(matrix.failed_tasks().len(), 1);
    }

    #[test]
    fn resource_constraints_skip_tasks_exceeding_duration() {
        let mut matrix = TaskMatrix::new(Utc::now());
        matrix.add_task(task("t1", 0.5));
        let constraints = ResourceConstraints {
            max_duration_seconds: 5.0,
            ..ResourceConstraints::default()
        };
        assert!(matrix.get_next_task(&constraints).is_none());
        assert_eq!(matrix.ready_count(), 1);
    }

    #[test]
    fn resource_constraints_skip_tasks_exceeding_complexity() {
        let mut matrix = TaskMatrix::new(Utc::now());
        let mut t = task("t1", 0.5);
        t.metrics.complexity = 0.9;
        matrix.add_task(t);
        let constraints = ResourceConstraints {
            max_complexity: 0.5,
            ..ResourceConstraints::default()
        };
        assert!(matrix.get_next_task(&constraints).is_none());
        assert_eq!(matrix.ready_count(), 1);
    }

    #[test]
    fn resource_constraints_skip_tasks_exceeding_memory() {
        let mut matrix = TaskMatrix::new(Utc::now());
        let mut t = task("t1", 0.5);
        t.metrics.complexity = 0.9;
        matrix.add_task(t);
        let constraints = ResourceConstraints {
            max_memory_mb: 50.0,
            ..ResourceConstraints::default()
        };
        assert!(matrix.get_next_task(&constraints).is_none());
        assert_eq!(matrix.ready_count(), 1);
    }
}
