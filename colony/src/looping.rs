//! The run loop: tick after tick until a stop condition fires.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::core::types::{FileStatus, StatusEntry, StopReason};
use crate::io::config::Config;
use crate::io::detector::PatternDetector;
use crate::io::git::Vcs;
use crate::io::llm::LlmClient;
use crate::io::report::{summary_path, ticks_path, write_summary, write_ticks_csv};
use crate::io::store::PheromoneStore;
use crate::io::testing::TestRunner;
use crate::metrics::{MetricsCollector, RunSummary};
use crate::roles::RoleContext;
use crate::tick::{Roles, run_tick};

/// Everything a run needs, wired once by the caller.
pub struct LoopEnv<'a> {
    pub store: &'a PheromoneStore,
    pub config: &'a Config,
    pub target: &'a Path,
    pub llm: &'a LlmClient,
    pub detector: &'a dyn PatternDetector,
    pub tests: &'a dyn TestRunner,
    pub vcs: &'a dyn Vcs,
    pub dry_run: bool,
    pub seed: Option<u64>,
}

/// Outcome of a completed (non-fatal) run.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub run_id: String,
    pub stop_reason: StopReason,
    pub ticks_executed: u64,
    pub summary: RunSummary,
}

/// Drive the Discover -> Transform -> Test -> Validate loop to a stop.
///
/// Per tick: maintenance and decay, the four role activations, one metrics
/// row, tick-end failure promotion, then the stop-condition evaluation.
/// On a run-scoped error the collected metrics are flushed with
/// `stop_reason = fatal_error` before the error propagates.
pub fn run_loop(env: &LoopEnv<'_>, run_id: &str, metrics_dir: &Path) -> Result<LoopOutcome> {
    let roles = Roles::new()?;
    let mut collector = MetricsCollector::new(env.store.audit().clone());
    let rng = RefCell::new(StdRng::seed_from_u64(env.seed.unwrap_or(0)));

    let mut idle_cycles = 0u32;
    let mut stop_reason = StopReason::MaxTicks;
    let mut ticks_executed = 0u64;

    for tick in 0..env.config.r#loop.max_ticks {
        let result = (|| -> Result<Option<StopReason>> {
            let ctx = RoleContext {
                store: env.store,
                config: env.config,
                target: env.target,
                tick,
                dry_run: env.dry_run,
                llm: env.llm,
                detector: env.detector,
                tests: env.tests,
                vcs: env.vcs,
                rng: &rng,
            };
            let report = run_tick(&ctx, &roles)?;

            // Metrics sample before failure promotion so rollback ticks are
            // observable in the timeseries.
            let statuses = env.store.read_status()?;
            collector.record_tick(
                tick,
                report.actions,
                &statuses,
                env.llm.total_tokens(),
                env.llm.total_cost_usd(),
            )?;

            env.store.promote_failed()?;
            let statuses = env.store.read_status()?;

            if !statuses.is_empty()
                && statuses.values().all(|entry| entry.status.is_loop_terminal())
            {
                return Ok(Some(StopReason::AllTerminal));
            }

            let budgets = &env.config.budgets;
            let over_tokens = env.llm.total_tokens() > budgets.max_tokens_total;
            let over_cost =
                budgets.max_budget_usd > 0.0 && env.llm.total_cost_usd() > budgets.max_budget_usd;
            if over_tokens || over_cost {
                return Ok(Some(StopReason::BudgetExhausted));
            }
            if env.llm.budget_blocked() && !report.actions.any() {
                return Ok(Some(StopReason::BudgetExhausted));
            }

            if report.actions.any() {
                idle_cycles = 0;
            } else if awaiting_inhibition_release(&statuses, env.config) {
                // The medium is still evolving: an inhibited pending file will
                // become eligible as gamma decays, so this is not idleness.
                idle_cycles = 0;
            } else {
                idle_cycles += 1;
                if idle_cycles >= env.config.r#loop.idle_cycles_to_stop {
                    return Ok(Some(StopReason::IdleCycles));
                }
            }
            Ok(None)
        })();

        ticks_executed = tick + 1;
        match result {
            Ok(Some(reason)) => {
                stop_reason = reason;
                break;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(tick, error = %format!("{err:#}"), "run-scoped failure, flushing artifacts");
                let statuses = env.store.read_status().unwrap_or_default();
                let summary = collector.build_summary(run_id, StopReason::FatalError, &statuses);
                flush_artifacts(&collector, &summary, run_id, metrics_dir);
                return Err(err).context("run loop failed");
            }
        }
    }

    let statuses = env.store.read_status()?;
    let summary = collector.build_summary(run_id, stop_reason, &statuses);
    flush_artifacts(&collector, &summary, run_id, metrics_dir);
    info!(
        run_id,
        stop_reason = stop_reason.as_str(),
        ticks = ticks_executed,
        success_rate = summary.success_rate,
        "run complete"
    );
    Ok(LoopOutcome { run_id: run_id.to_string(), stop_reason, ticks_executed, summary })
}

fn awaiting_inhibition_release(
    statuses: &BTreeMap<String, StatusEntry>,
    config: &Config,
) -> bool {
    let threshold = config.pheromones.inhibition_threshold;
    statuses.values().any(|entry| {
        matches!(entry.status, FileStatus::Pending | FileStatus::Retry)
            && entry.inhibition >= threshold
    })
}

fn flush_artifacts(
    collector: &MetricsCollector,
    summary: &RunSummary,
    run_id: &str,
    metrics_dir: &Path,
) {
    if let Err(err) = write_ticks_csv(&ticks_path(metrics_dir, run_id), collector.tick_rows()) {
        warn!(error = %format!("{err:#}"), "failed to write tick timeseries");
    }
    if let Err(err) = write_summary(&summary_path(metrics_dir, run_id), summary) {
        warn!(error = %format!("{err:#}"), "failed to write run summary");
    }
}
