//! Per-tick metrics collection and end-of-run aggregation.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::types::{FileStatus, StatusEntry, StopReason};
use crate::io::audit::AuditLog;

/// Files unchanged for this many consecutive ticks count as starving.
const STARVATION_THRESHOLD: u32 = 12;

/// Which roles acted in one tick, in activation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleActions {
    pub discover: bool,
    pub transform: bool,
    pub test: bool,
    pub validate: bool,
}

impl RoleActions {
    pub fn any(&self) -> bool {
        self.discover || self.transform || self.test || self.validate
    }
}

/// One row of the per-tick timeseries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRow {
    pub tick: u64,
    pub any_role_acted: bool,
    pub acted_discover: bool,
    pub acted_transform: bool,
    pub acted_test: bool,
    pub acted_validate: bool,
    pub files_total: u32,
    pub files_pending: u32,
    pub files_in_progress: u32,
    pub files_transformed: u32,
    pub files_tested: u32,
    pub files_validated: u32,
    pub files_needs_review: u32,
    pub files_failed: u32,
    pub files_retry: u32,
    pub files_skipped: u32,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub success_rate: f64,
    pub rollback_rate: f64,
    pub human_escalation_rate: f64,
    pub retry_resolution_rate: f64,
    pub starvation_count: u32,
    pub audit_completeness: f64,
}

/// Final aggregates for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub stop_reason: StopReason,
    pub total_ticks: u64,
    pub files_total: u32,
    pub files_validated: u32,
    pub files_failed: u32,
    pub files_needs_review: u32,
    pub files_skipped: u32,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub success_rate: f64,
    pub rollback_rate: f64,
    pub human_escalation_rate: f64,
    pub retry_resolution_rate: f64,
    pub starvation_count: u32,
    pub audit_completeness: f64,
}

/// Collect and aggregate per-tick metrics for one run.
pub struct MetricsCollector {
    audit: AuditLog,
    tick_rows: Vec<TickRow>,
    previous_statuses: BTreeMap<String, FileStatus>,
    idle_ticks_by_file: BTreeMap<String, u32>,
    files_with_retry: BTreeSet<String>,
    resolved_retry_files: BTreeSet<String>,
}

impl MetricsCollector {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            audit,
            tick_rows: Vec::new(),
            previous_statuses: BTreeMap::new(),
            idle_ticks_by_file: BTreeMap::new(),
            files_with_retry: BTreeSet::new(),
            resolved_retry_files: BTreeSet::new(),
        }
    }

    pub fn tick_rows(&self) -> &[TickRow] {
        &self.tick_rows
    }

    /// Record one loop tick worth of metrics.
    pub fn record_tick(
        &mut self,
        tick: u64,
        actions: RoleActions,
        statuses: &BTreeMap<String, StatusEntry>,
        total_tokens: u64,
        total_cost_usd: f64,
    ) -> Result<()> {
        self.update_status_tracking(statuses);

        let count = |status: FileStatus| -> u32 {
            statuses.values().filter(|entry| entry.status == status).count() as u32
        };
        let files_total = statuses.len() as u32;
        let files_validated = count(FileStatus::Validated);
        let files_failed = count(FileStatus::Failed);
        let files_needs_review = count(FileStatus::NeedsReview);

        let success_rate = ratio(files_validated, files_total);
        let rollback_rate = ratio(files_failed, files_validated + files_failed);
        let human_escalation_rate = ratio(files_needs_review, files_total);
        let retry_resolution_rate = ratio(
            self.resolved_retry_files.len() as u32,
            self.files_with_retry.len() as u32,
        );
        let starvation_count = self
            .idle_ticks_by_file
            .iter()
            .filter(|(file_id, idle_ticks)| {
                **idle_ticks > STARVATION_THRESHOLD
                    && statuses
                        .get(*file_id)
                        .is_some_and(|entry| !entry.status.is_loop_terminal())
            })
            .count() as u32;

        self.tick_rows.push(TickRow {
            tick,
            any_role_acted: actions.any(),
            acted_discover: actions.discover,
            acted_transform: actions.transform,
            acted_test: actions.test,
            acted_validate: actions.validate,
            files_total,
            files_pending: count(FileStatus::Pending),
            files_in_progress: count(FileStatus::InProgress),
            files_transformed: count(FileStatus::Transformed),
            files_tested: count(FileStatus::Tested),
            files_validated,
            files_needs_review,
            files_failed,
            files_retry: count(FileStatus::Retry),
            files_skipped: count(FileStatus::Skipped),
            total_tokens,
            total_cost_usd: round6(total_cost_usd),
            success_rate: round6(success_rate),
            rollback_rate: round6(rollback_rate),
            human_escalation_rate: round6(human_escalation_rate),
            retry_resolution_rate: round6(retry_resolution_rate),
            starvation_count,
            audit_completeness: round6(self.audit.completeness()?),
        });
        Ok(())
    }

    /// Build the final summary.
    ///
    /// Status counts come from the final state of the medium (the last tick
    /// row is sampled before tick-end failure promotion, so it can miss a
    /// terminal skip); cumulative usage comes from the last recorded row.
    pub fn build_summary(
        &self,
        run_id: &str,
        stop_reason: StopReason,
        statuses: &BTreeMap<String, StatusEntry>,
    ) -> RunSummary {
        let count = |status: FileStatus| -> u32 {
            statuses.values().filter(|entry| entry.status == status).count() as u32
        };
        let files_total = statuses.len() as u32;
        let files_validated = count(FileStatus::Validated);
        let files_failed = count(FileStatus::Failed);
        let files_needs_review = count(FileStatus::NeedsReview);
        let resolved_retries = statuses
            .iter()
            .filter(|(file_id, entry)| {
                entry.status == FileStatus::Validated && self.files_with_retry.contains(*file_id)
            })
            .count() as u32;
        let last = self.tick_rows.last();
        RunSummary {
            run_id: run_id.to_string(),
            stop_reason,
            total_ticks: last.map_or(0, |row| row.tick + 1),
            files_total,
            files_validated,
            files_failed,
            files_needs_review,
            files_skipped: count(FileStatus::Skipped),
            total_tokens: last.map_or(0, |row| row.total_tokens),
            total_cost_usd: last.map_or(0.0, |row| row.total_cost_usd),
            success_rate: round6(ratio(files_validated, files_total)),
            rollback_rate: round6(ratio(files_failed, files_validated + files_failed)),
            human_escalation_rate: round6(ratio(files_needs_review, files_total)),
            retry_resolution_rate: round6(ratio(
                resolved_retries,
                self.files_with_retry.len() as u32,
            )),
            starvation_count: last.map_or(0, |row| row.starvation_count),
            audit_completeness: last.map_or(1.0, |row| row.audit_completeness),
        }
    }

    fn update_status_tracking(&mut self, statuses: &BTreeMap<String, StatusEntry>) {
        for (file_id, entry) in statuses {
            let previous = self.previous_statuses.get(file_id).copied();
            if previous == Some(entry.status) {
                *self.idle_ticks_by_file.entry(file_id.clone()).or_insert(0) += 1;
            } else {
                self.idle_ticks_by_file.insert(file_id.clone(), 0);
            }
            // Promotion into retry happens at tick end and the requeue at the
            // next tick start, so a retry is usually observed here as pending
            // with previous_status = retry.
            if entry.status == FileStatus::Retry
                || entry.previous_status == Some(FileStatus::Retry)
            {
                self.files_with_retry.insert(file_id.clone());
            }
            if entry.status == FileStatus::Validated && self.files_with_retry.contains(file_id) {
                self.resolved_retry_files.insert(file_id.clone());
            }
            self.previous_statuses.insert(file_id.clone(), entry.status);
        }
        self.previous_statuses.retain(|file_id, _| statuses.contains_key(file_id));
        self.idle_ticks_by_file.retain(|file_id, _| statuses.contains_key(file_id));
    }
}

fn ratio(numerator: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RoleTag;

    fn entry(status: FileStatus) -> StatusEntry {
        let mut entry = StatusEntry::pending(RoleTag::Discover, 0);
        entry.status = status;
        entry
    }

    fn collector(dir: &std::path::Path) -> MetricsCollector {
        MetricsCollector::new(AuditLog::new(dir.join("audit_log.jsonl")))
    }

    #[test]
    fn rates_follow_status_counts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collector = collector(temp.path());

        let mut statuses = BTreeMap::new();
        statuses.insert("a.py".to_string(), entry(FileStatus::Validated));
        statuses.insert("b.py".to_string(), entry(FileStatus::Failed));
        statuses.insert("c.py".to_string(), entry(FileStatus::NeedsReview));
        statuses.insert("d.py".to_string(), entry(FileStatus::Pending));

        collector
            .record_tick(0, RoleActions::default(), &statuses, 120, 0.5)
            .expect("record");

        let row = &collector.tick_rows()[0];
        assert_eq!(row.files_total, 4);
        assert_eq!(row.success_rate, 0.25);
        assert_eq!(row.rollback_rate, 0.5);
        assert_eq!(row.human_escalation_rate, 0.25);
        assert_eq!(row.total_tokens, 120);
        assert_eq!(row.audit_completeness, 1.0);
    }

    #[test]
    fn retry_resolution_tracks_recovered_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collector = collector(temp.path());

        let mut statuses = BTreeMap::new();
        statuses.insert("a.py".to_string(), entry(FileStatus::Retry));
        collector
            .record_tick(0, RoleActions::default(), &statuses, 0, 0.0)
            .expect("record");
        let row = &collector.tick_rows()[0];
        assert_eq!(row.retry_resolution_rate, 0.0);

        statuses.insert("a.py".to_string(), entry(FileStatus::Validated));
        collector
            .record_tick(1, RoleActions::default(), &statuses, 0, 0.0)
            .expect("record");
        let row = &collector.tick_rows()[1];
        assert_eq!(row.retry_resolution_rate, 1.0);
    }

    #[test]
    fn starvation_counts_long_unchanged_open_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collector = collector(temp.path());
        let mut statuses = BTreeMap::new();
        statuses.insert("slow.py".to_string(), entry(FileStatus::Pending));
        statuses.insert("done.py".to_string(), entry(FileStatus::Validated));

        for tick in 0..=(STARVATION_THRESHOLD as u64 + 1) {
            collector
                .record_tick(tick, RoleActions::default(), &statuses, 0, 0.0)
                .expect("record");
        }
        let row = collector.tick_rows().last().expect("row");
        assert_eq!(row.starvation_count, 1);
    }

    #[test]
    fn empty_run_summary_is_well_formed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let collector = collector(temp.path());
        let summary = collector.build_summary("run-1", StopReason::IdleCycles, &BTreeMap::new());
        assert_eq!(summary.total_ticks, 0);
        assert_eq!(summary.files_total, 0);
        assert_eq!(summary.audit_completeness, 1.0);
    }

    #[test]
    fn summary_counts_reflect_final_statuses() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut collector = collector(temp.path());
        let mut statuses = BTreeMap::new();
        statuses.insert("a.py".to_string(), entry(FileStatus::Failed));
        collector
            .record_tick(0, RoleActions::default(), &statuses, 10, 0.0)
            .expect("record");

        // The failure was promoted to a terminal skip after the row was
        // recorded; the summary must see the promoted state.
        let mut final_statuses = BTreeMap::new();
        final_statuses.insert("a.py".to_string(), entry(FileStatus::Skipped));
        let summary =
            collector.build_summary("run-1", StopReason::AllTerminal, &final_statuses);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(summary.files_failed, 0);
        assert_eq!(summary.total_tokens, 10);
        assert_eq!(summary.total_ticks, 1);
    }
}
