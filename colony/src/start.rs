//! Run bootstrap: state scaffolding, git work branch, immutable manifest.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::types::utc_timestamp;
use crate::io::config::Config;
use crate::io::git::Git;
use crate::io::init::{ColonyPaths, init_state};
use crate::io::report::{RunManifest, build_run_id, config_hash, manifest_path, write_manifest};

/// Bootstrap options from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub resume: bool,
    pub dry_run: bool,
    pub seed: Option<u64>,
}

/// Outcome of run bootstrap.
#[derive(Debug, Clone)]
pub struct RunSetup {
    pub run_id: String,
    pub paths: ColonyPaths,
    pub manifest: RunManifest,
}

/// Prepare the target tree for a run.
///
/// Scaffolds `.colony/`, resets the pheromone state unless resuming, ensures
/// the target is a git repository on a `<prefix>/<run-id>` work branch, and
/// writes the immutable manifest before the first tick.
pub fn prepare_run(target: &Path, config: &Config, options: StartOptions) -> Result<RunSetup> {
    let paths = ColonyPaths::new(target);
    init_state(&paths, options.resume).context("initialize colony state")?;

    let run_id = build_run_id();
    let git = Git::new(target);
    let commit = ensure_repo(&git)?;
    ensure_work_branch(&git, config, &run_id)?;

    let manifest = RunManifest {
        run_id: run_id.clone(),
        timestamp_utc: utc_timestamp(),
        target_repo_commit: commit,
        config_hash: config_hash(config)?,
        seed: options.seed,
        model_id: config.llm.model.clone(),
        max_tokens_total: config.budgets.max_tokens_total,
        max_budget_usd: config.budgets.max_budget_usd,
        dry_run: options.dry_run,
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    write_manifest(&manifest_path(&paths.metrics, &run_id), &manifest)
        .context("write run manifest")?;

    info!(%run_id, target = %target.display(), "run prepared");
    Ok(RunSetup { run_id, paths, manifest })
}

/// Make sure the target is a git repository with at least one commit, so the
/// Validate role has a baseline to revert to.
fn ensure_repo(git: &Git) -> Result<String> {
    if let Ok(sha) = git.head_sha() {
        return Ok(sha);
    }
    debug!("target is not a git repository, initializing one");
    let run = |args: &[&str]| -> Result<()> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(git.workdir())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    };
    run(&["init"])?;
    run(&["add", "-A"])?;
    run(&["commit", "-m", "colony: baseline before migration"])?;
    git.head_sha()
}

/// Create or reuse the work branch for this run.
///
/// A resumed run may already be on a prefixed branch; leave it in place.
fn ensure_work_branch(git: &Git, config: &Config, run_id: &str) -> Result<()> {
    let prefix = &config.git.branch_prefix;
    let current = git.current_branch()?;
    if current.starts_with(&format!("{prefix}/")) {
        debug!(branch = %current, "already on a work branch");
        return Ok(());
    }
    let mut branch = format!("{prefix}/{run_id}");
    // Repeated local runs inside the same second collide on the branch name.
    if git.branch_exists(&branch)? {
        branch.push_str("-retry");
    }
    git.checkout_new_branch(&branch)?;
    Ok(())
}
