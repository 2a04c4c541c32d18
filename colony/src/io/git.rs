//! Git adapter and the VCS effector consumed by the Validate role.
//!
//! Validation commits and rollbacks must be deterministic and auditable, so we
//! keep a small, explicit wrapper around `git` subprocess calls rather than a
//! library binding. `--dry-run` swaps the effector for a no-op recorder.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// VCS effector interface: exactly what Validate needs.
pub trait Vcs {
    /// Stage and commit a single file. No-op when nothing changed.
    fn commit(&self, file_id: &str, message: &str) -> Result<()>;
    /// Restore a single file to its committed state.
    fn revert(&self, file_id: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { workdir: workdir.into() }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        Ok(name)
    }

    /// Current HEAD commit hash, stable given repo state.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Stage one path.
    pub fn add_path(&self, path: &str) -> Result<()> {
        self.run_checked(&["add", "--", path])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes; returns Ok(false) when nothing was staged.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Restore one path to its state at HEAD, discarding the working copy.
    #[instrument(skip_all, fields(path))]
    pub fn checkout_head_path(&self, path: &str) -> Result<()> {
        debug!(path, "reverting path to HEAD");
        self.run_checked(&["checkout", "HEAD", "--", path])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Real VCS effector committing into the target repository.
pub struct GitVcs {
    git: Git,
}

impl GitVcs {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self { git: Git::new(workdir) }
    }
}

impl Vcs for GitVcs {
    fn commit(&self, file_id: &str, message: &str) -> Result<()> {
        self.git.add_path(file_id)?;
        self.git.commit_staged(message)?;
        Ok(())
    }

    fn revert(&self, file_id: &str) -> Result<()> {
        self.git.checkout_head_path(file_id)
    }
}

/// Dry-run effector: state transitions still happen, the repository does not.
#[derive(Debug, Default)]
pub struct NoopVcs;

impl Vcs for NoopVcs {
    fn commit(&self, file_id: &str, _message: &str) -> Result<()> {
        debug!(file_id, "dry-run: skipping commit");
        Ok(())
    }

    fn revert(&self, file_id: &str) -> Result<()> {
        debug!(file_id, "dry-run: skipping revert");
        Ok(())
    }
}
