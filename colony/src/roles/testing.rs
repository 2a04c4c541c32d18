//! Test role: run deterministic checks for transformed files and deposit
//! quality pheromones.

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::classify::{ProbeFailure, classify_probe_failure, confidence_for};
use crate::core::types::{Classification, FileStatus, QualityEntry, RoleTag, utc_timestamp};
use crate::io::store::{Filter, StatusPatch};
use crate::io::testing::{CompileCheck, compact_issue};
use crate::roles::{Role, RoleContext};

pub struct Test;

#[derive(Debug)]
pub struct TestView {
    /// Transformed file ids, stable order.
    pub candidates: Vec<String>,
}

#[derive(Debug)]
pub struct TestAction {
    pub file_id: String,
}

#[derive(Debug)]
pub struct TestOutcome {
    pub file_id: String,
    pub classification: Classification,
    pub confidence: f64,
    pub tests_total: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub coverage: Option<f64>,
    pub issues: Vec<String>,
}

impl Role for Test {
    type View = TestView;
    type Action = TestAction;
    type Outcome = TestOutcome;

    fn tag(&self) -> RoleTag {
        RoleTag::Test
    }

    fn perceive(&self, ctx: &RoleContext<'_>) -> Result<Self::View> {
        let transformed = ctx
            .store
            .query_status(&[Filter::eq("status", FileStatus::Transformed.as_str())])?;
        Ok(TestView { candidates: transformed.into_keys().collect() })
    }

    fn should_act(&self, view: &Self::View) -> bool {
        !view.candidates.is_empty()
    }

    fn decide(&self, _ctx: &RoleContext<'_>, view: Self::View) -> Result<Self::Action> {
        let file_id = view
            .candidates
            .into_iter()
            .next()
            .context("decide called with no candidates")?;
        Ok(TestAction { file_id })
    }

    fn execute(&self, ctx: &RoleContext<'_>, action: Self::Action) -> Result<Option<Self::Outcome>> {
        Ok(Some(self.check_file(ctx, &action.file_id)))
    }

    fn deposit(&self, ctx: &RoleContext<'_>, outcome: Self::Outcome) -> Result<()> {
        let quality = QualityEntry {
            confidence: outcome.confidence,
            tests_total: outcome.tests_total,
            tests_passed: outcome.tests_passed,
            tests_failed: outcome.tests_failed,
            coverage: outcome.coverage,
            issues: outcome.issues.clone(),
            classification: outcome.classification,
            timestamp: utc_timestamp(),
            agent: self.tag(),
        };
        ctx.store.write_quality(&outcome.file_id, quality, self.tag())?;

        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert(
            "classification".to_string(),
            serde_json::json!(outcome.classification.as_str()),
        );
        metadata.insert("tests_total".to_string(), serde_json::json!(outcome.tests_total));
        metadata.insert("tests_failed".to_string(), serde_json::json!(outcome.tests_failed));
        ctx.store.update_status(
            &outcome.file_id,
            StatusPatch {
                status: Some(FileStatus::Tested),
                metadata: Some(metadata),
                ..StatusPatch::default()
            },
            self.tag(),
        )
    }
}

impl Test {
    /// Per-file suite when one exists; otherwise the two-phase fallback:
    /// structural check on the transformed file, then a whole-repo regression
    /// probe classified as related or inconclusive.
    fn check_file(&self, ctx: &RoleContext<'_>, file_id: &str) -> TestOutcome {
        let fallback = ctx.config.tester.fallback_quality.to_fallback();

        if let Some(test_file) = ctx.tests.discover_test(ctx.target, file_id) {
            debug!(file_id, test_file = %test_file.display(), "running per-file suite");
            return match ctx.tests.run_tests(ctx.target, &test_file) {
                Ok(report) => {
                    let classification = if report.failed == 0 && report.exit_ok {
                        Classification::Pass
                    } else {
                        Classification::FailRelated
                    };
                    let mut issues = Vec::new();
                    if classification != Classification::Pass {
                        issues.push(compact_issue(&report.output));
                    }
                    TestOutcome {
                        file_id: file_id.to_string(),
                        classification,
                        confidence: confidence_for(classification, report.ratio(), &fallback),
                        tests_total: report.total,
                        tests_passed: report.passed,
                        tests_failed: report.failed,
                        coverage: report.coverage,
                        issues,
                    }
                }
                Err(err) => crashed_outcome(file_id, &err, &fallback),
            };
        }

        // Phase 1: structural check on the transformed file.
        match ctx.tests.compile_check(ctx.target, file_id) {
            Ok(CompileCheck::Ok) => {}
            Ok(CompileCheck::Fail(reason)) => {
                return TestOutcome {
                    file_id: file_id.to_string(),
                    classification: Classification::CompileFail,
                    confidence: confidence_for(Classification::CompileFail, None, &fallback),
                    tests_total: 1,
                    tests_passed: 0,
                    tests_failed: 1,
                    coverage: None,
                    issues: vec![reason],
                };
            }
            Err(err) => return crashed_outcome(file_id, &err, &fallback),
        }

        // Phase 2: whole-repo regression probe.
        match ctx.tests.run_probe(ctx.target) {
            Ok(report) if report.exit_ok && report.failed == 0 => TestOutcome {
                file_id: file_id.to_string(),
                classification: Classification::NoTests,
                confidence: confidence_for(Classification::NoTests, None, &fallback),
                tests_total: 0,
                tests_passed: 0,
                tests_failed: 0,
                coverage: None,
                issues: Vec::new(),
            },
            Ok(report) => {
                let classification = classify_probe_failure(&ProbeFailure {
                    output: &report.output,
                    file_id,
                    inconclusive_markers: &ctx.config.tester.inconclusive_markers,
                    optional_dependency_hints: &ctx.config.tester.optional_dependency_hints,
                });
                TestOutcome {
                    file_id: file_id.to_string(),
                    classification,
                    confidence: confidence_for(classification, None, &fallback),
                    tests_total: report.total,
                    tests_passed: report.passed,
                    tests_failed: report.failed,
                    coverage: None,
                    issues: vec![compact_issue(&report.output)],
                }
            }
            Err(err) => crashed_outcome(file_id, &err, &fallback),
        }
    }
}

/// A crashing test subprocess classifies as `compile_fail` with the crash
/// signature preserved in the issues.
fn crashed_outcome(
    file_id: &str,
    err: &anyhow::Error,
    fallback: &crate::core::classify::FallbackQuality,
) -> TestOutcome {
    warn!(file_id, error = %format!("{err:#}"), "test subprocess crashed");
    TestOutcome {
        file_id: file_id.to_string(),
        classification: Classification::CompileFail,
        confidence: confidence_for(Classification::CompileFail, None, fallback),
        tests_total: 1,
        tests_passed: 0,
        tests_failed: 1,
        coverage: None,
        issues: vec![compact_issue(&format!("{err:#}"))],
    }
}
