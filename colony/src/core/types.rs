//! Shared deterministic types for the pheromone medium.
//!
//! These types define the stable contracts between the store, the roles, and
//! the orchestrator. They should not depend on external state and must remain
//! deterministic across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Return a UTC timestamp in ISO-8601 format with `Z` suffix, second precision.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Role tag attached to every store mutation.
///
/// The four worker roles plus the system actors that mutate the medium during
/// tick maintenance, and the human actor driving review mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleTag {
    Discover,
    Transform,
    Test,
    Validate,
    SystemDecay,
    SystemTtl,
    SystemRetry,
    HumanReview,
}

impl RoleTag {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleTag::Discover => "discover",
            RoleTag::Transform => "transform",
            RoleTag::Test => "test",
            RoleTag::Validate => "validate",
            RoleTag::SystemDecay => "system_decay",
            RoleTag::SystemTtl => "system_ttl",
            RoleTag::SystemRetry => "system_retry",
            RoleTag::HumanReview => "human_review",
        }
    }
}

/// Per-file lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Transformed,
    Tested,
    Validated,
    NeedsReview,
    Failed,
    Retry,
    Skipped,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::InProgress => "in_progress",
            FileStatus::Transformed => "transformed",
            FileStatus::Tested => "tested",
            FileStatus::Validated => "validated",
            FileStatus::NeedsReview => "needs_review",
            FileStatus::Failed => "failed",
            FileStatus::Retry => "retry",
            FileStatus::Skipped => "skipped",
        }
    }

    /// True for states from which no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Validated | FileStatus::Skipped)
    }

    /// True for states the stop condition `all_terminal` accepts.
    ///
    /// `needs_review` is a pause state awaiting an external decision; the loop
    /// treats it as terminal so a run can finish with files parked for review.
    pub fn is_loop_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Validated | FileStatus::Skipped | FileStatus::NeedsReview
        )
    }

    /// True while a file is actively moving through the pipeline.
    ///
    /// Working states are exempt from intensity decay.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            FileStatus::InProgress | FileStatus::Transformed | FileStatus::Tested
        )
    }

    pub fn all() -> [FileStatus; 9] {
        [
            FileStatus::Pending,
            FileStatus::InProgress,
            FileStatus::Transformed,
            FileStatus::Tested,
            FileStatus::Validated,
            FileStatus::NeedsReview,
            FileStatus::Failed,
            FileStatus::Retry,
            FileStatus::Skipped,
        ]
    }
}

/// How the detector arrived at a file's pattern set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Structural,
    Textual,
    Semantic,
}

/// Task pheromone: the Discover role's view of one file's migration work.
///
/// Entries are never deleted during a run; a fully decayed intensity leaves
/// the entry in place for traceability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    /// Priority in [0.0, 1.0] after batch normalization; decays per tick.
    pub intensity: f64,
    pub pattern_count: u32,
    pub dep_count: u32,
    pub patterns_found: Vec<String>,
    /// Intra-repo references, by file id.
    pub dependencies: Vec<String>,
    pub detection_source: DetectionSource,
    pub created_at: String,
    pub created_by: RoleTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<RoleTag>,
}

/// Status pheromone: one file's lifecycle state plus scope-lock bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusEntry {
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<FileStatus>,
    /// Last mutator.
    pub agent: RoleTag,
    pub timestamp: String,
    /// Monotone; never reset within a run.
    pub retry_count: u32,
    /// Anti-oscillation field γ; incremented only on transition into `retry`.
    pub inhibition: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_owner: Option<RoleTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_acquired_tick: Option<u64>,
    /// Tick of the last transition into `pending`; drives the aging boost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_since_tick: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StatusEntry {
    /// Fresh entry as deposited by Discover.
    pub fn pending(role: RoleTag, tick: u64) -> Self {
        Self {
            status: FileStatus::Pending,
            previous_status: None,
            agent: role,
            timestamp: utc_timestamp(),
            retry_count: 0,
            inhibition: 0.0,
            lock_owner: None,
            lock_acquired_tick: None,
            pending_since_tick: Some(tick),
            metadata: BTreeMap::new(),
        }
    }
}

/// Test outcome classification, ordered by confidence contract:
/// `compile_fail < fail_related < fail_inconclusive <= pass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Pass,
    FailRelated,
    FailInconclusive,
    CompileFail,
    NoTests,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Pass => "pass",
            Classification::FailRelated => "fail_related",
            Classification::FailInconclusive => "fail_inconclusive",
            Classification::CompileFail => "compile_fail",
            Classification::NoTests => "no_tests",
        }
    }
}

/// Quality pheromone: the Test role's confidence signal for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityEntry {
    /// Clamped to [0.0, 1.0]; reinforced +0.1 on commit, evaporated -0.2 on
    /// rollback.
    pub confidence: f64,
    pub tests_total: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    pub issues: Vec<String>,
    pub classification: Classification,
    pub timestamp: String,
    pub agent: RoleTag,
}

/// The three persisted maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapName {
    Tasks,
    Status,
    Quality,
}

impl MapName {
    pub fn as_str(self) -> &'static str {
        match self {
            MapName::Tasks => "tasks",
            MapName::Status => "status",
            MapName::Quality => "quality",
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            MapName::Tasks => "tasks.json",
            MapName::Status => "status.json",
            MapName::Quality => "quality.json",
        }
    }
}

/// Store mutation kind recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
}

/// One append-only audit record mirroring a successful store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub role: RoleTag,
    pub map_name: MapName,
    pub file_id: String,
    pub operation: Operation,
    /// Changed keys mapped to their new values.
    pub fields_changed: BTreeMap<String, serde_json::Value>,
    /// Changed keys mapped to their prior values (absent keys omitted).
    pub previous_values: BTreeMap<String, serde_json::Value>,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllTerminal,
    BudgetExhausted,
    MaxTicks,
    IdleCycles,
    FatalError,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::AllTerminal => "all_terminal",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::MaxTicks => "max_ticks",
            StopReason::IdleCycles => "idle_cycles",
            StopReason::FatalError => "fatal_error",
        }
    }
}
