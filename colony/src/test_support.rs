//! Test-only scripted effectors.
//!
//! Scenario tests drive the loop against tempdir targets with these doubles
//! so no run ever touches the network, a model, or a real test toolchain.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::io::llm::{LlmTransport, RawCompletion, TransportError};
use crate::io::testing::{CompileCheck, TestReport, TestRunner};

/// LLM transport that replays a fixed script of completions.
pub struct ScriptedLlm {
    responses: RefCell<VecDeque<std::result::Result<RawCompletion, TransportError>>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(
        responses: Vec<std::result::Result<RawCompletion, TransportError>>,
    ) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Prompts the roles actually sent, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

/// A successful completion costing `tokens` in total.
pub fn completion(content: &str, tokens: u64) -> std::result::Result<RawCompletion, TransportError> {
    Ok(RawCompletion {
        content: content.to_string(),
        prompt_tokens: tokens / 2,
        completion_tokens: tokens - tokens / 2,
        cost_usd: None,
    })
}

/// A terminal effector failure (non-retryable).
pub fn effector_failure(message: &str) -> std::result::Result<RawCompletion, TransportError> {
    Err(TransportError { message: message.to_string(), retryable: false })
}

impl LlmTransport for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted-model"
    }

    fn send(
        &self,
        prompt: &str,
        _system: Option<&str>,
        _timeout: Duration,
    ) -> std::result::Result<RawCompletion, TransportError> {
        self.calls.borrow_mut().push(prompt.to_string());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(TransportError {
                    message: "scripted llm exhausted".to_string(),
                    retryable: false,
                })
            })
    }
}

/// Scripted test-runner effector.
///
/// `discover_test` answers from a fixed mapping; suite and probe runs pop
/// their scripted reports in order; compile checks default to passing when
/// the script runs dry.
#[derive(Default)]
pub struct ScriptedTestRunner {
    pub test_files: Vec<(String, PathBuf)>,
    pub suite_reports: RefCell<VecDeque<TestReport>>,
    pub probe_reports: RefCell<VecDeque<TestReport>>,
    pub compile_checks: RefCell<VecDeque<CompileCheck>>,
}

impl ScriptedTestRunner {
    pub fn with_suite(file_id: &str, reports: Vec<TestReport>) -> Self {
        Self {
            test_files: vec![(file_id.to_string(), PathBuf::from(format!("test_{file_id}")))],
            suite_reports: RefCell::new(reports.into()),
            ..Self::default()
        }
    }

    pub fn with_probe(reports: Vec<TestReport>) -> Self {
        Self {
            probe_reports: RefCell::new(reports.into()),
            ..Self::default()
        }
    }
}

/// Build a report the way the command runner would parse one.
pub fn report(total: u32, passed: u32, failed: u32, exit_ok: bool, output: &str) -> TestReport {
    TestReport {
        total,
        passed,
        failed,
        coverage: None,
        output: output.to_string(),
        exit_ok,
    }
}

impl TestRunner for ScriptedTestRunner {
    fn discover_test(&self, _target: &Path, file_id: &str) -> Option<PathBuf> {
        self.test_files
            .iter()
            .find(|(id, _)| id == file_id)
            .map(|(_, path)| path.clone())
    }

    fn run_tests(&self, _target: &Path, _test_file: &Path) -> Result<TestReport> {
        self.suite_reports
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted suite reports exhausted"))
    }

    fn run_probe(&self, _target: &Path) -> Result<TestReport> {
        self.probe_reports
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted probe reports exhausted"))
    }

    fn compile_check(&self, _target: &Path, _file_id: &str) -> Result<CompileCheck> {
        Ok(self
            .compile_checks
            .borrow_mut()
            .pop_front()
            .unwrap_or(CompileCheck::Ok))
    }
}

/// VCS effector that records commits and reverts without touching a repo.
#[derive(Default)]
pub struct RecordingVcs {
    pub commits: RefCell<Vec<String>>,
    pub reverts: RefCell<Vec<String>>,
}

impl crate::io::git::Vcs for RecordingVcs {
    fn commit(&self, file_id: &str, _message: &str) -> Result<()> {
        self.commits.borrow_mut().push(file_id.to_string());
        Ok(())
    }

    fn revert(&self, file_id: &str) -> Result<()> {
        self.reverts.borrow_mut().push(file_id.to_string());
        Ok(())
    }
}
