//! Test-outcome classification and the confidence map.
//!
//! The classification contract orders the fallback confidences
//! `compile_fail < fail_related < fail_inconclusive <= pass`; the related/
//! inconclusive split for whole-repo probe failures is heuristic and driven
//! by configured marker lists plus a mention-of-target check.

use crate::core::types::Classification;

/// Confidence values for fallback classifications (no per-file test suite).
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackQuality {
    pub compile_import_fail: f64,
    pub related_regression: f64,
    pub pass_or_inconclusive: f64,
}

/// Inputs for classifying a failed whole-repo regression probe.
pub struct ProbeFailure<'a> {
    /// Combined stdout/stderr of the probe.
    pub output: &'a str,
    /// Repo-relative id of the migrated file.
    pub file_id: &'a str,
    /// Output fragments that mark environmental noise (case-insensitive).
    pub inconclusive_markers: &'a [String],
    /// Output fragments that mark missing optional dependencies.
    pub optional_dependency_hints: &'a [String],
}

/// Classify a failed probe as migration-caused or environmental.
///
/// Environmental markers win over target mentions: a probe that died on a
/// missing optional dependency is inconclusive even when the traceback names
/// the migrated file. Anything that mentions the target's path, file name, or
/// stem is otherwise treated as a related regression; unattributable noise is
/// inconclusive.
pub fn classify_probe_failure(failure: &ProbeFailure<'_>) -> Classification {
    let lowered = failure.output.to_lowercase();

    let environmental = failure
        .inconclusive_markers
        .iter()
        .chain(failure.optional_dependency_hints.iter())
        .any(|marker| {
            let marker = marker.trim().to_lowercase();
            !marker.is_empty() && lowered.contains(&marker)
        });
    if environmental {
        return Classification::FailInconclusive;
    }

    let file_name = failure.file_id.rsplit('/').next().unwrap_or(failure.file_id);
    let stem = file_name.rsplit_once('.').map_or(file_name, |(s, _)| s);
    let mentions_target = failure.output.contains(failure.file_id)
        || failure.output.contains(file_name)
        || (!stem.is_empty() && failure.output.contains(stem));
    if mentions_target {
        return Classification::FailRelated;
    }
    Classification::FailInconclusive
}

/// Map a classification to its confidence.
///
/// `ratio` is `tests_passed / tests_total` and only applies when a per-file
/// suite actually ran (`pass` and test-backed `fail_related`).
pub fn confidence_for(
    classification: Classification,
    ratio: Option<f64>,
    fallback: &FallbackQuality,
) -> f64 {
    let confidence = match (classification, ratio) {
        (Classification::Pass, Some(ratio)) => ratio,
        (Classification::FailRelated, Some(ratio)) => ratio,
        (Classification::Pass, None) => 1.0,
        (Classification::FailRelated, None) => fallback.related_regression,
        (Classification::FailInconclusive, _) => fallback.pass_or_inconclusive,
        (Classification::NoTests, _) => fallback.pass_or_inconclusive,
        (Classification::CompileFail, _) => fallback.compile_import_fail,
    };
    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fallback() -> FallbackQuality {
        FallbackQuality {
            compile_import_fail: 0.4,
            related_regression: 0.6,
            pass_or_inconclusive: 0.8,
        }
    }

    fn markers() -> Vec<String> {
        vec!["usage:".into(), "no tests ran".into()]
    }

    fn hints() -> Vec<String> {
        vec!["pip install".into(), "optional dependency".into()]
    }

    #[test]
    fn environmental_markers_win() {
        let markers = markers();
        let hints = hints();
        let classification = classify_probe_failure(&ProbeFailure {
            output: "usage: prog [-h] ... error in lib/widgets.py",
            file_id: "lib/widgets.py",
            inconclusive_markers: &markers,
            optional_dependency_hints: &hints,
        });
        assert_eq!(classification, Classification::FailInconclusive);
    }

    #[test]
    fn target_mention_is_related() {
        let markers = markers();
        let hints = hints();
        let classification = classify_probe_failure(&ProbeFailure {
            output: "E  ImportError in lib/widgets.py line 3",
            file_id: "lib/widgets.py",
            inconclusive_markers: &markers,
            optional_dependency_hints: &hints,
        });
        assert_eq!(classification, Classification::FailRelated);
    }

    #[test]
    fn unattributable_noise_is_inconclusive() {
        let markers = markers();
        let hints = hints();
        let classification = classify_probe_failure(&ProbeFailure {
            output: "1 failed in tests/test_other.py",
            file_id: "lib/widgets.py",
            inconclusive_markers: &markers,
            optional_dependency_hints: &hints,
        });
        assert_eq!(classification, Classification::FailInconclusive);
    }

    #[test]
    fn confidence_ordering_contract_holds() {
        let fallback = fallback();
        let compile = confidence_for(Classification::CompileFail, None, &fallback);
        let related = confidence_for(Classification::FailRelated, None, &fallback);
        let inconclusive = confidence_for(Classification::FailInconclusive, None, &fallback);
        let pass = confidence_for(Classification::Pass, Some(1.0), &fallback);
        assert!(compile < related && related < inconclusive && inconclusive <= pass);
    }

    #[test]
    fn pass_confidence_is_test_ratio() {
        let fallback = fallback();
        assert_eq!(
            confidence_for(Classification::FailRelated, Some(0.0), &fallback),
            0.0
        );
        assert_eq!(
            confidence_for(Classification::Pass, Some(0.75), &fallback),
            0.75
        );
    }
}
