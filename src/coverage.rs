//! Priority-bucketed coverage tracking over discovered [`CodeUnit`]s (spec §4.I).

use std::collections::{HashMap, VecDeque};

use crate::model::{CodeUnit, Priority, UnitStatus};

/// Per-file rollup used by [`CoverageTracker::generate_coverage_report`].
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct FileCoverage {
    pub total_units: usize,
    pub analyzed_units: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
}

/// Aggregate coverage numbers across a whole project.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CoverageReport {
    pub total_units: usize,
    pub analyzed_units: usize,
    pub failed_units: usize,
    pub skipped_units: usize,
    pub coverage_percentage: f64,
    pub success_rate: f64,
    pub per_file: HashMap<String, FileCoverage>,
}

/// Tracks every [`CodeUnit`] discovered for a project and hands them out in
/// priority order: CRITICAL, then HIGH, then MEDIUM, then LOW (spec §4.I).
#[derive(Debug, Default)]
pub struct CoverageTracker {
    units: HashMap<String, CodeUnit>,
    queues: HashMap<Priority, VecDeque<String>>,
}

fn priority_order() -> [Priority; 4] {
    [Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
}

impl CoverageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register discovered units, enqueuing pending ones into their
    /// priority bucket in the order given.
    pub fn register(&mut self, units: Vec<CodeUnit>) {
        for unit in units {
            if unit.status == UnitStatus::Pending {
                self.queues.entry(unit.priority).or_default().push_back(unit.id.clone());
            }
            self.units.insert(unit.id.clone(), unit);
        }
    }

    pub fn get(&self, id: &str) -> Option<&CodeUnit> {
        self.units.get(id)
    }

    pub fn total(&self) -> usize {
        self.units.len()
    }

    /// Pop up to `count` pending units, optionally restricted to a single
    /// priority bucket, draining CRITICAL before HIGH before MEDIUM before LOW.
    pub fn get_next_units(&mut self, count: usize, priority_filter: Option<Priority>) -> Vec<CodeUnit> {
        let mut result = Vec::with_capacity(count);
        let order: Vec<Priority> = match priority_filter {
            Some(p) => vec![p],
            None => priority_order().to_vec(),
        };

        'outer: for priority in order {
            let queue = match self.queues.get_mut(&priority) {
                Some(q) => q,
                None => continue,
            };
            while result.len() < count {
                let Some(id) = queue.pop_front() else { break };
                if let Some(unit) = self.units.get_mut(&id) {
                    if unit.status == UnitStatus::Pending {
                        unit.status = UnitStatus::InProgress;
                        result.push(unit.clone());
                    }
                }
                if result.len() >= count {
                    break 'outer;
                }
            }
        }

        result
    }

    pub fn mark_unit_in_progress(&mut self, id: &str) {
        if let Some(unit) = self.units.get_mut(id) {
            unit.status = UnitStatus::InProgress;
        }
    }

    pub fn mark_unit_analyzed(&mut self, id: &str, duration_ms: u64) {
        if let Some(unit) = self.units.get_mut(id) {
            unit.status = UnitStatus::Completed;
            unit.analyzed_at = Some(chrono::Utc::now());
            unit.analysis_duration_ms = Some(duration_ms);
        }
    }

    pub fn mark_unit_failed(&mut self, id: &str, reason: &str) {
        if let Some(unit) = self.units.get_mut(id) {
            unit.status = UnitStatus::Failed;
            tracing::warn!(unit_id = id, reason, "code unit analysis failed");
        }
    }

    pub fn mark_unit_skipped(&mut self, id: &str, reason: &str) {
        if let Some(unit) = self.units.get_mut(id) {
            unit.status = UnitStatus::Skipped;
            tracing::debug!(unit_id = id, reason, "code unit skipped");
        }
    }

    pub fn generate_coverage_report(&self) -> CoverageReport {
        let mut per_file: HashMap<String, FileCoverage> = HashMap::new();
        let (mut analyzed, mut failed, mut skipped) = (0usize, 0usize, 0usize);

        for unit in self.units.values() {
            let entry = per_file.entry(unit.file_path.clone()).or_default();
            entry.total_units += 1;
            match unit.status {
                UnitStatus::Completed => {
                    entry.analyzed_units += 1;
                    analyzed += 1;
                }
                UnitStatus::Failed => {
                    entry.failed_units += 1;
                    failed += 1;
                }
                UnitStatus::Skipped => {
                    entry.skipped_units += 1;
                    skipped += 1;
                }
                _ => {}
            }
        }

        let total = self.units.len();
        let coverage_percentage = if total == 0 {
            0.0
        } else {
            (analyzed + skipped) as f64 / total as f64 * 100.0
        };
        let attempted = analyzed + failed;
        let success_rate = if attempted == 0 {
            0.0
        } else {
            analyzed as f64 / attempted as f64 * 100.0
        };

        CoverageReport {
            total_units: total,
            analyzed_units: analyzed,
            failed_units: failed,
            skipped_units: skipped,
            coverage_percentage,
            success_rate,
            per_file,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UnitType;
    use pretty_assertions::assert_eq;

    fn unit(name: &str, priority: Priority) -> CodeUnit {
        CodeUnit::new("a.py", name, UnitType::Function, 1, 2, priority)
    }

    #[test]
    fn drains_critical_before_low() {
        let mut tracker = CoverageTracker::new();
        tracker.register(vec![unit("low", Priority::Low), unit("critical", Priority::Critical)]);
        let next = tracker.get_next_units(1, None);
        assert_eq!(next[0].name, "critical");
    }

    #[test]
    fn priority_filter_restricts_bucket() {
        let mut tracker = CoverageTracker::new();
        tracker.register(vec![unit("low", Priority::Low), unit("critical", Priority::Critical)]);
        let next = tracker.get_next_units(5, Some(Priority::Low));
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name, "low");
    }

    #[test]
    fn mark_analyzed_updates_status_and_report() {
        let mut tracker = CoverageTracker::new();
        tracker.register(vec![unit("u1", Priority::Medium)]);
        let units = tracker.get_next_units(1, None);
        tracker.mark_unit_analyzed(&units[0].id, 120);
        let report = tracker.generate_coverage_report();
        assert_eq!(report.analyzed_units, 1);
        assert_eq!(report.coverage_percentage, 100.0);
    }

    #[test]
    fn failed_units_lower_success_rate() {
        let mut tracker = CoverageTracker::new();
        tracker.register(vec![unit("u1", Priority::Medium), unit("u2", Priority::Medium)]);
        let units = tracker.get_next_units(2, None);
        tracker.mark_unit_analyzed(&units[0].id, 10);
        tracker.mark_unit_failed(&units[1].id, "timeout");
        let report = tracker.generate_coverage_report();
        assert_eq!(report.success_rate, 50.0);
    }

    #[test]
    fn in_progress_units_are_not_redealt() {
        let mut tracker = CoverageTracker::new();
        tracker.register(vec![unit("u1", Priority::Medium)]);
        let first = tracker.get_next_units(5, None);
        let second = tracker.get_next_units(5, None);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[test]
    fn single_file_rollup_matches_whole_report_shape() {
        let mut tracker = CoverageTracker::new();
        tracker.register(vec![unit("u1", Priority::Medium)]);
        let units = tracker.get_next_units(1, None);
        tracker.mark_unit_analyzed(&units[0].id, 5);

        let report = tracker.generate_coverage_report();
        let expected_file = FileCoverage {
            total_units: 1,
            analyzed_units: 1,
            failed_units: 0,
            skipped_units: 0,
        };
        assert_eq!(report.per_file.get("a.py"), Some(&expected_file));
    }
}
