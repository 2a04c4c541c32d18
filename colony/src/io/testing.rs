//! Test-runner effector: per-file suites, the whole-repo regression probe,
//! and the structural compile check.
//!
//! Commands are configured rather than hard-coded so the core stays agnostic
//! of the legacy language's toolchain; `{file}` and `{test_file}` placeholders
//! are substituted at call time.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, instrument};

use crate::io::config::TesterConfig;
use crate::io::process::run_command_with_timeout;

const OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Parsed outcome of one test-command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub coverage: Option<f64>,
    /// Combined stdout/stderr, bounded.
    pub output: String,
    pub exit_ok: bool,
}

impl TestReport {
    pub fn ratio(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.passed as f64 / self.total as f64)
        }
    }
}

/// Structural check verdict for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileCheck {
    Ok,
    Fail(String),
}

/// Test-runner effector interface consumed by the Test role.
pub trait TestRunner {
    /// Locate an associated test in the canonical locations.
    fn discover_test(&self, target: &Path, file_id: &str) -> Option<PathBuf>;
    /// Run the per-file suite.
    fn run_tests(&self, target: &Path, test_file: &Path) -> Result<TestReport>;
    /// Run the whole-repo regression probe.
    fn run_probe(&self, target: &Path) -> Result<TestReport>;
    /// Structural compile/parse check on one file in the working tree.
    fn compile_check(&self, target: &Path, file_id: &str) -> Result<CompileCheck>;
}

/// Command-driven implementation configured under `[tester]`.
pub struct CommandTestRunner {
    config: TesterConfig,
}

impl CommandTestRunner {
    pub fn new(config: TesterConfig) -> Self {
        Self { config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_seconds)
    }

    fn run_parsed(&self, target: &Path, argv: Vec<String>) -> Result<TestReport> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty tester command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(target);
        let output = run_command_with_timeout(cmd, self.timeout(), OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {program}"))?;
        let combined = output.combined();
        let mut report = parse_test_summary(&combined);
        report.exit_ok = output.success();
        report.output = combined;
        // A run that produced no parseable counts still carries a verdict.
        if report.total == 0 {
            report.total = 1;
            if report.exit_ok {
                report.passed = 1;
            } else {
                report.failed = 1;
            }
        }
        debug!(
            total = report.total,
            passed = report.passed,
            failed = report.failed,
            exit_ok = report.exit_ok,
            "test command finished"
        );
        Ok(report)
    }
}

impl TestRunner for CommandTestRunner {
    fn discover_test(&self, target: &Path, file_id: &str) -> Option<PathBuf> {
        let name = file_id.rsplit('/').next().unwrap_or(file_id);
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) => (stem, format!(".{ext}")),
            None => (name, String::new()),
        };
        let dir = file_id.rsplit_once('/').map_or("", |(dir, _)| dir);
        for pattern in &self.config.test_locations {
            let relative = pattern
                .replace("{stem}", stem)
                .replace("{ext}", &ext)
                .replace("{dir}", dir);
            let relative = relative.trim_start_matches('/');
            let candidate = target.join(relative);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    #[instrument(skip_all, fields(test_file = %test_file.display()))]
    fn run_tests(&self, target: &Path, test_file: &Path) -> Result<TestReport> {
        let test_file = test_file.display().to_string();
        let argv: Vec<String> = self
            .config
            .test_command
            .iter()
            .map(|part| part.replace("{test_file}", &test_file))
            .collect();
        self.run_parsed(target, argv)
    }

    #[instrument(skip_all)]
    fn run_probe(&self, target: &Path) -> Result<TestReport> {
        self.run_parsed(target, self.config.probe_command.clone())
    }

    #[instrument(skip_all, fields(file_id))]
    fn compile_check(&self, target: &Path, file_id: &str) -> Result<CompileCheck> {
        let file = target.join(file_id).display().to_string();
        let argv: Vec<String> = self
            .config
            .compile_command
            .iter()
            .map(|part| part.replace("{file}", &file))
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty compile command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(target);
        let output = run_command_with_timeout(cmd, self.timeout(), OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("run {program}"))?;
        if output.success() {
            Ok(CompileCheck::Ok)
        } else {
            Ok(CompileCheck::Fail(compact_issue(&output.combined())))
        }
    }
}

/// Parse `N passed` / `N failed` / `N error(s)` counters from runner output.
pub fn parse_test_summary(output: &str) -> TestReport {
    let passed = extract_count(output, "passed");
    let failed = extract_count(output, "failed");
    let errors = extract_count(output, "error");
    TestReport {
        total: passed + failed + errors,
        passed,
        failed: failed + errors,
        coverage: parse_coverage(output),
        output: String::new(),
        exit_ok: false,
    }
}

fn extract_count(output: &str, keyword: &str) -> u32 {
    let pattern = Regex::new(&format!(r"(\d+)\s+{keyword}s?\b")).expect("count regex");
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn parse_coverage(output: &str) -> Option<f64> {
    let pattern = Regex::new(r"TOTAL\s+\d+\s+\d+\s+(\d+)%").expect("coverage regex");
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .map(|percent| percent as f64 / 100.0)
}

/// Flatten noisy subprocess output into a single bounded diagnostic line.
pub fn compact_issue(output: &str) -> String {
    let clean = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if clean.len() > 300 {
        let mut cut = 297;
        while !clean.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &clean[..cut])
    } else {
        clean
    }
}
