//! Interactive review pass over files parked in `needs_review`.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use crate::core::types::{FileStatus, RoleTag};
use crate::io::config::Config;
use crate::io::store::{Filter, PheromoneStore, QualityPatch, StatusPatch};

/// Human decision for one escalated file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Validate,
    Retry,
    Skip,
}

impl ReviewDecision {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "validate" => Some(Self::Validate),
            "retry" => Some(Self::Retry),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// Present each `needs_review` file and apply the decision to the medium.
///
/// Decisions mirror the Validate role's bands: `validate` raises confidence to
/// at least the high threshold and finishes the file; `retry` requeues it with
/// the usual inhibition bump; `skip` parks it terminally.
pub fn run_review<R: BufRead, W: Write>(
    store: &PheromoneStore,
    config: &Config,
    input: &mut R,
    output: &mut W,
) -> Result<usize> {
    let entries = store.query_status(&[Filter::eq("status", FileStatus::NeedsReview.as_str())])?;
    if entries.is_empty() {
        writeln!(output, "No needs_review files found.").context("write output")?;
        return Ok(0);
    }

    let high = config.thresholds.validator_confidence_high;
    let mut reviewed = 0;

    for (file_id, status_entry) in entries {
        let quality = store.quality_of(&file_id)?;
        let confidence = quality.as_ref().map_or(0.0, |entry| entry.confidence);
        let issues = quality.map(|entry| entry.issues).unwrap_or_default();

        writeln!(output, "\nFile: {file_id}").context("write output")?;
        writeln!(output, "Confidence: {confidence:.3}").context("write output")?;
        writeln!(output, "Issues: {issues:?}").context("write output")?;

        let decision = prompt_decision(&file_id, input, output)?;
        match decision {
            ReviewDecision::Validate => {
                store.update_quality(
                    &file_id,
                    QualityPatch { confidence: Some(confidence.max(high)), issues: None },
                    RoleTag::HumanReview,
                )?;
                store.update_status(
                    &file_id,
                    StatusPatch {
                        status: Some(FileStatus::Validated),
                        metadata: Some(decision_metadata("manual_validate")),
                        ..StatusPatch::default()
                    },
                    RoleTag::HumanReview,
                )?;
            }
            ReviewDecision::Retry => {
                store.update_status(
                    &file_id,
                    StatusPatch {
                        status: Some(FileStatus::Retry),
                        retry_count: Some(status_entry.retry_count + 1),
                        inhibition: Some(status_entry.inhibition + 0.5),
                        metadata: Some(decision_metadata("manual_retry")),
                        ..StatusPatch::default()
                    },
                    RoleTag::HumanReview,
                )?;
            }
            ReviewDecision::Skip => {
                store.update_status(
                    &file_id,
                    StatusPatch {
                        status: Some(FileStatus::Skipped),
                        metadata: Some(decision_metadata("manual_skip")),
                        ..StatusPatch::default()
                    },
                    RoleTag::HumanReview,
                )?;
            }
        }
        reviewed += 1;
    }

    writeln!(output, "\nReview updates applied: {reviewed}").context("write output")?;
    Ok(reviewed)
}

fn decision_metadata(decision: &str) -> std::collections::BTreeMap<String, serde_json::Value> {
    let mut metadata = std::collections::BTreeMap::new();
    metadata.insert("decision".to_string(), serde_json::json!(decision));
    metadata
}

fn prompt_decision<R: BufRead, W: Write>(
    file_id: &str,
    input: &mut R,
    output: &mut W,
) -> Result<ReviewDecision> {
    loop {
        write!(output, "Choose action for {file_id} [validate/retry/skip]: ")
            .context("write prompt")?;
        output.flush().context("flush prompt")?;
        let mut line = String::new();
        let read = input.read_line(&mut line).context("read decision")?;
        if read == 0 {
            // EOF defaults to skip so piped input cannot loop forever.
            return Ok(ReviewDecision::Skip);
        }
        if let Some(decision) = ReviewDecision::parse(&line) {
            return Ok(decision);
        }
        writeln!(output, "Invalid action. Choose one of: validate, retry, skip.")
            .context("write output")?;
    }
}
