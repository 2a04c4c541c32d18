//! Validate role: final decisioning by confidence band, with VCS commit on
//! acceptance and rollback on rejection.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::types::{FileStatus, QualityEntry, RoleTag, StatusEntry};
use crate::io::store::{Filter, QualityPatch, StatusPatch};
use crate::roles::{Role, RoleContext};

pub struct Validate;

#[derive(Debug)]
pub struct ValidateView {
    /// Tested file ids, stable order, joined with quality.
    pub candidates: Vec<(String, StatusEntry, QualityEntry)>,
}

#[derive(Debug)]
pub struct ValidateAction {
    pub file_id: String,
    pub status_entry: StatusEntry,
    pub quality_entry: QualityEntry,
}

/// The three threshold bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoValidate,
    HumanEscalation,
    Rollback,
}

impl Decision {
    fn as_str(self) -> &'static str {
        match self {
            Decision::AutoValidate => "auto_validate",
            Decision::HumanEscalation => "human_escalation",
            Decision::Rollback => "rollback",
        }
    }
}

#[derive(Debug)]
pub enum ValidateOutcome {
    Decided {
        file_id: String,
        decision: Decision,
        updated_confidence: f64,
    },
    Failed {
        file_id: String,
        error: String,
    },
}

impl Role for Validate {
    type View = ValidateView;
    type Action = ValidateAction;
    type Outcome = ValidateOutcome;

    fn tag(&self) -> RoleTag {
        RoleTag::Validate
    }

    fn perceive(&self, ctx: &RoleContext<'_>) -> Result<Self::View> {
        let tested = ctx
            .store
            .query_status(&[Filter::eq("status", FileStatus::Tested.as_str())])?;
        let quality = ctx.store.read_quality()?;
        let candidates = tested
            .into_iter()
            .filter_map(|(file_id, status_entry)| {
                quality
                    .get(&file_id)
                    .cloned()
                    .map(|quality_entry| (file_id, status_entry, quality_entry))
            })
            .collect();
        Ok(ValidateView { candidates })
    }

    fn should_act(&self, view: &Self::View) -> bool {
        !view.candidates.is_empty()
    }

    fn decide(&self, _ctx: &RoleContext<'_>, view: Self::View) -> Result<Self::Action> {
        let (file_id, status_entry, quality_entry) = view
            .candidates
            .into_iter()
            .next()
            .context("decide called with no candidates")?;
        Ok(ValidateAction { file_id, status_entry, quality_entry })
    }

    fn execute(
        &self,
        ctx: &RoleContext<'_>,
        action: Self::Action,
    ) -> Result<Option<Self::Outcome>> {
        let thresholds = &ctx.config.thresholds;
        let confidence = action.quality_entry.confidence;
        let file_id = action.file_id;

        let outcome = if confidence >= thresholds.validator_confidence_high {
            // Reinforcement: the trace that led here becomes a stronger
            // few-shot source for later files.
            let updated = (confidence + 0.1).min(1.0);
            let message = format!("colony: migrate {file_id} (confidence={updated:.2})");
            match ctx.vcs.commit(&file_id, &message) {
                Ok(()) => {
                    info!(%file_id, confidence = updated, "validated and committed");
                    ValidateOutcome::Decided {
                        file_id,
                        decision: Decision::AutoValidate,
                        updated_confidence: updated,
                    }
                }
                Err(err) => ValidateOutcome::Failed { file_id, error: format!("{err:#}") },
            }
        } else if confidence >= thresholds.validator_confidence_low {
            info!(%file_id, confidence, "escalating for human review");
            ValidateOutcome::Decided {
                file_id,
                decision: Decision::HumanEscalation,
                updated_confidence: confidence,
            }
        } else {
            // Evaporation plus rollback; the tick-end promotion turns the
            // failure into a retry or a terminal skip.
            let updated = (confidence - 0.2).max(0.0);
            match ctx.vcs.revert(&file_id) {
                Ok(()) => {
                    warn!(%file_id, confidence, "rolled back low-confidence transform");
                    ValidateOutcome::Decided {
                        file_id,
                        decision: Decision::Rollback,
                        updated_confidence: updated,
                    }
                }
                Err(err) => ValidateOutcome::Failed { file_id, error: format!("{err:#}") },
            }
        };
        Ok(Some(outcome))
    }

    fn deposit(&self, ctx: &RoleContext<'_>, outcome: Self::Outcome) -> Result<()> {
        match outcome {
            ValidateOutcome::Decided { file_id, decision, updated_confidence } => {
                ctx.store.update_quality(
                    &file_id,
                    QualityPatch { confidence: Some(updated_confidence), issues: None },
                    self.tag(),
                )?;
                let status = match decision {
                    Decision::AutoValidate => FileStatus::Validated,
                    Decision::HumanEscalation => FileStatus::NeedsReview,
                    Decision::Rollback => FileStatus::Failed,
                };
                let mut metadata = std::collections::BTreeMap::new();
                metadata.insert("decision".to_string(), serde_json::json!(decision.as_str()));
                metadata.insert("dry_run".to_string(), serde_json::json!(ctx.dry_run));
                ctx.store.update_status(
                    &file_id,
                    StatusPatch {
                        status: Some(status),
                        metadata: Some(metadata),
                        ..StatusPatch::default()
                    },
                    self.tag(),
                )
            }
            ValidateOutcome::Failed { file_id, error } => {
                // VCS conflicts are file-scoped: record and fail the file.
                let mut metadata = std::collections::BTreeMap::new();
                metadata.insert("error".to_string(), serde_json::json!(error));
                ctx.store.update_status(
                    &file_id,
                    StatusPatch {
                        status: Some(FileStatus::Failed),
                        metadata: Some(metadata),
                        ..StatusPatch::default()
                    },
                    self.tag(),
                )
            }
        }
    }
}
