//! Run artifact writers: manifest, per-tick timeseries, final summary.
//!
//! Artifacts are written deterministically and never mutated after run end.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::io::config::Config;
use crate::metrics::{RunSummary, TickRow};

/// Immutable record of what a run was, written before the first tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub timestamp_utc: String,
    /// HEAD of the target repo at run start; empty when unavailable.
    pub target_repo_commit: String,
    pub config_hash: String,
    pub seed: Option<u64>,
    pub model_id: String,
    pub max_tokens_total: u64,
    pub max_budget_usd: f64,
    pub dry_run: bool,
    pub runner_version: String,
}

/// `sha256:` digest over the canonical JSON projection of the config.
pub fn config_hash(config: &Config) -> Result<String> {
    let canonical = serde_json::to_string(config).context("serialize config for hashing")?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("sha256:{digest:x}"))
}

/// Run ids are UTC timestamps, stable and sortable.
pub fn build_run_id() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
}

pub fn manifest_path(metrics_dir: &Path, run_id: &str) -> PathBuf {
    metrics_dir.join(format!("run_{run_id}_manifest.json"))
}

pub fn ticks_path(metrics_dir: &Path, run_id: &str) -> PathBuf {
    metrics_dir.join(format!("run_{run_id}_ticks.csv"))
}

pub fn summary_path(metrics_dir: &Path, run_id: &str) -> PathBuf {
    metrics_dir.join(format!("run_{run_id}_summary.json"))
}

pub fn write_manifest(path: &Path, manifest: &RunManifest) -> Result<()> {
    write_json(path, manifest)
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    write_json(path, summary)
}

/// Write the per-tick timeseries as CSV with a fixed column order.
pub fn write_ticks_csv(path: &Path, rows: &[TickRow]) -> Result<()> {
    let mut buf = String::from(
        "tick,any_role_acted,acted_discover,acted_transform,acted_test,acted_validate,\
         files_total,files_pending,files_in_progress,files_transformed,files_tested,\
         files_validated,files_needs_review,files_failed,files_retry,files_skipped,\
         total_tokens,total_cost_usd,success_rate,rollback_rate,human_escalation_rate,\
         retry_resolution_rate,starvation_count,audit_completeness\n",
    );
    for row in rows {
        buf.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
            row.tick,
            row.any_role_acted,
            row.acted_discover,
            row.acted_transform,
            row.acted_test,
            row.acted_validate,
            row.files_total,
            row.files_pending,
            row.files_in_progress,
            row.files_transformed,
            row.files_tested,
            row.files_validated,
            row.files_needs_review,
            row.files_failed,
            row.files_retry,
            row.files_skipped,
            row.total_tokens,
            row.total_cost_usd,
            row.success_rate,
            row.rollback_rate,
            row.human_escalation_rate,
            row.retry_resolution_rate,
            row.starvation_count,
            row.audit_completeness,
        ));
    }
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}
