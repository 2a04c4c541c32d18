//! Transform role: consume task pheromones, call the language-model effector,
//! and write migrated file content back into the working tree.

use std::collections::BTreeSet;
use std::fs;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::priority::{aging_boost, effective_priority};
use crate::core::types::{FileStatus, RoleTag, StatusEntry, TaskEntry};
use crate::io::llm::extract_code_block;
use crate::io::prompt::{FewShotExample, PromptEngine, TRANSFORM_SYSTEM_PROMPT, TransformPromptInputs};
use crate::io::store::{Filter, StatusPatch};
use crate::io::testing::CompileCheck;
use crate::roles::{Role, RoleContext};

pub struct Transform {
    prompts: PromptEngine,
}

impl Transform {
    pub fn new() -> Result<Self> {
        Ok(Self { prompts: PromptEngine::new()? })
    }
}

#[derive(Debug)]
pub struct TransformCandidate {
    pub file_id: String,
    pub priority: f64,
    pub status_entry: StatusEntry,
    pub task_entry: TaskEntry,
}

#[derive(Debug)]
pub struct TransformView {
    /// Eligible candidates, best effective priority first.
    pub candidates: Vec<TransformCandidate>,
}

#[derive(Debug)]
pub struct TransformAction {
    pub file_id: String,
    pub status_entry: StatusEntry,
    pub patterns: Vec<String>,
    pub source: String,
    pub prompt: String,
}

#[derive(Debug)]
pub enum TransformOutcome {
    Completed {
        file_id: String,
        tokens_used: u64,
        latency_ms: u64,
        diff_lines: u64,
        patterns: Vec<String>,
        repair_attempts_used: u32,
    },
    Failed {
        file_id: String,
        error: String,
    },
}

impl Role for Transform {
    type View = TransformView;
    type Action = TransformAction;
    type Outcome = TransformOutcome;

    fn tag(&self) -> RoleTag {
        RoleTag::Transform
    }

    /// Pending files whose inhibition has decayed below the resume threshold,
    /// ranked by `intensity + aging_boost - inhibition + noise` and floored at
    /// the activation minimum. The aging boost rescues mid-priority files
    /// whose raw intensity has evaporated while they waited.
    fn perceive(&self, ctx: &RoleContext<'_>) -> Result<Self::View> {
        let thresholds = &ctx.config.thresholds;
        let inhibition_threshold = ctx.config.pheromones.inhibition_threshold;

        let pending = ctx
            .store
            .query_status(&[Filter::eq("status", FileStatus::Pending.as_str())])?;
        let tasks = ctx.store.read_tasks()?;

        let mut candidates = Vec::new();
        for (file_id, status_entry) in pending {
            if status_entry.inhibition >= inhibition_threshold {
                continue;
            }
            let Some(task_entry) = tasks.get(&file_id).cloned() else {
                continue;
            };
            let ticks_pending = ctx
                .tick
                .saturating_sub(status_entry.pending_since_tick.unwrap_or(ctx.tick));
            let boost = aging_boost(
                ticks_pending,
                thresholds.aging_boost_per_tick,
                thresholds.aging_boost_cap,
            );
            // The activation floor is checked against boosted intensity, so a
            // mid-priority file whose raw intensity evaporated while waiting
            // can still re-enter once its aging boost accumulates.
            if task_entry.intensity + boost < thresholds.transformer_intensity_min {
                continue;
            }
            let priority = effective_priority(
                task_entry.intensity,
                boost,
                status_entry.inhibition,
                &mut *ctx.rng.borrow_mut(),
            );
            candidates.push(TransformCandidate { file_id, priority, status_entry, task_entry });
        }
        candidates.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(TransformView { candidates })
    }

    fn should_act(&self, view: &Self::View) -> bool {
        !view.candidates.is_empty()
    }

    fn decide(&self, ctx: &RoleContext<'_>, view: Self::View) -> Result<Self::Action> {
        let candidate = view
            .candidates
            .into_iter()
            .next()
            .context("decide called with no candidates")?;
        let path = ctx.target.join(&candidate.file_id);
        let source = fs::read_to_string(&path)
            .with_context(|| format!("read source {}", path.display()))?;

        let patterns = candidate.task_entry.patterns_found.clone();
        let examples = collect_few_shot_examples(ctx, &candidate.file_id, &patterns)?;
        let retry_context = build_retry_context(ctx, &candidate.file_id, &candidate.status_entry)?;

        let prompt = self.prompts.render_transform(&TransformPromptInputs {
            file_id: &candidate.file_id,
            patterns: &patterns,
            source: &source,
            examples: &examples,
            retry_context,
        })?;

        Ok(TransformAction {
            file_id: candidate.file_id,
            status_entry: candidate.status_entry,
            patterns,
            source,
            prompt,
        })
    }

    fn execute(
        &self,
        ctx: &RoleContext<'_>,
        action: TransformAction,
    ) -> Result<Option<Self::Outcome>> {
        // Budget gate first: a refused call must leave the file pending so the
        // orchestrator can attribute the stop to the budget, not the file.
        if !ctx.llm.reserve(&action.prompt, Some(TRANSFORM_SYSTEM_PROMPT)) {
            info!(file_id = %action.file_id, "budget refusal, leaving file pending");
            return Ok(None);
        }

        // Acquire the scope lock before the effector call so a hung effector
        // is visible to the TTL guardrail.
        ctx.store.update_status(
            &action.file_id,
            StatusPatch {
                status: Some(FileStatus::InProgress),
                current_tick: Some(ctx.tick),
                ..StatusPatch::default()
            },
            self.tag(),
        )?;

        match self.transform_file(ctx, &action) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) => {
                warn!(file_id = %action.file_id, error = %format!("{err:#}"), "transform failed");
                Ok(Some(TransformOutcome::Failed {
                    file_id: action.file_id,
                    error: format!("{err:#}"),
                }))
            }
        }
    }

    fn deposit(&self, ctx: &RoleContext<'_>, outcome: Self::Outcome) -> Result<()> {
        match outcome {
            TransformOutcome::Completed {
                file_id,
                tokens_used,
                latency_ms,
                diff_lines,
                patterns,
                repair_attempts_used,
            } => {
                let mut metadata = std::collections::BTreeMap::new();
                metadata.insert("tokens_used".to_string(), serde_json::json!(tokens_used));
                metadata.insert("latency_ms".to_string(), serde_json::json!(latency_ms));
                metadata.insert("diff_lines".to_string(), serde_json::json!(diff_lines));
                metadata.insert("patterns_migrated".to_string(), serde_json::json!(patterns));
                metadata.insert(
                    "repair_attempts_used".to_string(),
                    serde_json::json!(repair_attempts_used),
                );
                ctx.store.update_status(
                    &file_id,
                    StatusPatch {
                        status: Some(FileStatus::Transformed),
                        metadata: Some(metadata),
                        ..StatusPatch::default()
                    },
                    self.tag(),
                )
            }
            TransformOutcome::Failed { file_id, error } => {
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

impl Transform {
    /// The effector call plus the syntax gate with bounded repair.
    fn transform_file(
        &self,
        ctx: &RoleContext<'_>,
        action: &TransformAction,
    ) -> Result<TransformOutcome> {
        let transformer = &ctx.config.transformer;

        let response = ctx.llm.generate(&action.prompt, Some(TRANSFORM_SYSTEM_PROMPT))?;
        let mut tokens_used = response.tokens_used;
        let mut latency_ms = response.latency_ms;
        let mut content = extract_code_block(&response.content);
        if content.trim().is_empty() {
            anyhow::bail!("effector returned empty transformed content");
        }

        let mut repair_attempts_used = 0;
        if transformer.syntax_gate {
            loop {
                let reason = match self.syntax_gate(ctx, &action.file_id, &content)? {
                    CompileCheck::Ok => break,
                    CompileCheck::Fail(reason) => reason,
                };
                if repair_attempts_used >= transformer.repair_attempts_max {
                    anyhow::bail!("syntax gate failed after repairs: {reason}");
                }
                repair_attempts_used += 1;
                debug!(
                    file_id = %action.file_id,
                    attempt = repair_attempts_used,
                    "issuing syntax repair call"
                );
                let repair_prompt =
                    self.prompts.render_repair(&action.file_id, &content, &reason)?;
                let repair = ctx.llm.generate(&repair_prompt, Some(TRANSFORM_SYSTEM_PROMPT))?;
                tokens_used += repair.tokens_used;
                latency_ms += repair.latency_ms;
                content = extract_code_block(&repair.content);
                if content.trim().is_empty() {
                    anyhow::bail!("effector returned empty repaired content");
                }
            }
        }

        let path = ctx.target.join(&action.file_id);
        fs::write(&path, format!("{content}\n"))
            .with_context(|| format!("write transformed {}", path.display()))?;

        Ok(TransformOutcome::Completed {
            file_id: action.file_id.clone(),
            tokens_used,
            latency_ms,
            diff_lines: count_diff_lines(&action.source, &content),
            patterns: action.patterns.clone(),
            repair_attempts_used,
        })
    }

    /// Structural check on candidate text via a scratch file under `.colony/`.
    fn syntax_gate(
        &self,
        ctx: &RoleContext<'_>,
        file_id: &str,
        content: &str,
    ) -> Result<CompileCheck> {
        let name = file_id.rsplit('/').next().unwrap_or(file_id);
        let scratch_id = format!(".colony/tmp/{name}");
        let scratch_path = ctx.target.join(&scratch_id);
        if let Some(parent) = scratch_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&scratch_path, format!("{content}\n"))
            .with_context(|| format!("write gate scratch {}", scratch_path.display()))?;
        let verdict = ctx.tests.compile_check(ctx.target, &scratch_id);
        let _ = fs::remove_file(&scratch_path);
        verdict
    }
}

/// Up to `max_few_shot_examples` validated, high-confidence files sharing at
/// least one pattern tag with the target, rendered as worked examples.
fn collect_few_shot_examples(
    ctx: &RoleContext<'_>,
    target_file_id: &str,
    target_patterns: &[String],
) -> Result<Vec<FewShotExample>> {
    let max_examples = ctx.config.transformer.max_few_shot_examples;
    if max_examples == 0 {
        return Ok(Vec::new());
    }
    let high = ctx.config.thresholds.validator_confidence_high;
    let validated = ctx
        .store
        .query_status(&[Filter::eq("status", FileStatus::Validated.as_str())])?;
    let quality = ctx.store.read_quality()?;
    let tasks = ctx.store.read_tasks()?;
    let target_patterns: BTreeSet<&String> = target_patterns.iter().collect();

    let mut examples = Vec::new();
    for file_id in validated.keys() {
        if file_id == target_file_id {
            continue;
        }
        if quality.get(file_id).map_or(0.0, |entry| entry.confidence) < high {
            continue;
        }
        let patterns: Vec<String> = tasks
            .get(file_id)
            .map(|task| task.patterns_found.clone())
            .unwrap_or_default();
        if !target_patterns.is_empty()
            && !patterns.iter().any(|pattern| target_patterns.contains(pattern))
        {
            continue;
        }
        let path = ctx.target.join(file_id);
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        examples.push(FewShotExample { file_id: file_id.clone(), patterns, content });
        if examples.len() >= max_examples {
            break;
        }
    }
    Ok(examples)
}

/// Diagnostics from the file's last quality entry, quoted on retries.
fn build_retry_context(
    ctx: &RoleContext<'_>,
    file_id: &str,
    status_entry: &StatusEntry,
) -> Result<Option<String>> {
    if status_entry.retry_count == 0 {
        return Ok(None);
    }
    let issues = ctx
        .store
        .quality_of(file_id)?
        .map(|entry| entry.issues)
        .unwrap_or_default();
    if issues.is_empty() {
        return Ok(Some("This file was previously retried.".to_string()));
    }
    let lines: Vec<String> = issues.iter().map(|issue| format!("- {issue}")).collect();
    Ok(Some(lines.join("\n")))
}

/// Count changed lines between source and transformed content.
///
/// Positional comparison, not a minimal diff; good enough for the
/// observational `diff_lines` metadata field.
fn count_diff_lines(before: &str, after: &str) -> u64 {
    let before: Vec<&str> = before.lines().collect();
    let after: Vec<&str> = after.lines().collect();
    let common = before.len().min(after.len());
    let mut changed = (before.len() + after.len() - 2 * common) as u64;
    for index in 0..common {
        if before[index] != after[index] {
            changed += 2;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_lines_counts_replacements_twice() {
        assert_eq!(count_diff_lines("a\nb\n", "a\nc\n"), 2);
        assert_eq!(count_diff_lines("a\n", "a\nb\nc\n"), 2);
        assert_eq!(count_diff_lines("same\n", "same\n"), 0);
    }
}
