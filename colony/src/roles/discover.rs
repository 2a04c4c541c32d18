//! Discover role: walk the working tree, score new files, deposit task and
//! status pheromones.

use std::collections::BTreeSet;
use std::fs;

use anyhow::Result;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::core::priority::normalize_batch;
use crate::core::types::{RoleTag, StatusEntry, TaskEntry, utc_timestamp};
use crate::io::detector::DetectionReport;
use crate::roles::{Role, RoleContext};

pub struct Discover;

#[derive(Debug)]
pub struct DiscoverView {
    /// New files with no task entry and no terminal status, sorted.
    pub candidates: Vec<String>,
    /// Every candidate file id in the tree, for dependency resolution.
    pub known_files: BTreeSet<String>,
}

#[derive(Debug)]
pub struct DiscoverAction {
    pub candidates: Vec<String>,
    pub known_files: BTreeSet<String>,
}

#[derive(Debug)]
pub struct ScoredFile {
    pub file_id: String,
    pub report: DetectionReport,
    pub intensity: f64,
}

impl Discover {
    /// Enumerate migratable files under the target tree, repo-relative with
    /// forward slashes, excluding configured directories.
    fn walk_tree(&self, ctx: &RoleContext<'_>) -> BTreeSet<String> {
        let discover = &ctx.config.discover;
        let mut files = BTreeSet::new();
        let walker = WalkDir::new(ctx.target).into_iter().filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && discover.exclude_dirs.iter().any(|d| *d == name))
        });
        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !path
                .to_string_lossy()
                .ends_with(discover.file_extension.as_str())
            {
                continue;
            }
            if let Ok(relative) = path.strip_prefix(ctx.target) {
                files.insert(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        files
    }
}

impl Role for Discover {
    type View = DiscoverView;
    type Action = DiscoverAction;
    type Outcome = Vec<ScoredFile>;

    fn tag(&self) -> RoleTag {
        RoleTag::Discover
    }

    fn perceive(&self, ctx: &RoleContext<'_>) -> Result<Self::View> {
        let known_files = self.walk_tree(ctx);
        let tasks = ctx.store.read_tasks()?;
        let statuses = ctx.store.read_status()?;

        let candidates: Vec<String> = known_files
            .iter()
            .filter(|file_id| !tasks.contains_key(*file_id))
            .filter(|file_id| {
                statuses
                    .get(*file_id)
                    .is_none_or(|entry| !entry.status.is_loop_terminal())
            })
            .take(ctx.config.r#loop.sequential_stage_action_cap)
            .cloned()
            .collect();
        Ok(DiscoverView { candidates, known_files })
    }

    fn should_act(&self, view: &Self::View) -> bool {
        !view.candidates.is_empty()
    }

    fn decide(&self, _ctx: &RoleContext<'_>, view: Self::View) -> Result<Self::Action> {
        Ok(DiscoverAction {
            candidates: view.candidates,
            known_files: view.known_files,
        })
    }

    fn execute(
        &self,
        ctx: &RoleContext<'_>,
        action: Self::Action,
    ) -> Result<Option<Self::Outcome>> {
        let discover = &ctx.config.discover;
        let mut analyzed: Vec<(String, DetectionReport)> = Vec::new();

        for file_id in action.candidates {
            let path = ctx.target.join(&file_id);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(%file_id, error = %err, "unreadable candidate, skipping");
                    continue;
                }
            };
            match ctx.detector.analyze(&file_id, &content, &action.known_files) {
                Ok(report) => analyzed.push((file_id, report)),
                Err(err) => {
                    warn!(%file_id, error = %err, "detector failed, skipping");
                }
            }
        }
        if analyzed.is_empty() {
            return Ok(None);
        }

        let raw_scores: Vec<f64> = analyzed
            .iter()
            .map(|(_, report)| {
                discover.pattern_weight * f64::from(report.pattern_count())
                    + discover.dependency_weight * f64::from(report.dep_count())
            })
            .collect();
        let [floor, ceiling] = ctx.config.pheromones.task_intensity_clamp;
        let intensities = normalize_batch(&raw_scores, floor, ceiling);

        let scored = analyzed
            .into_iter()
            .zip(intensities)
            .map(|((file_id, report), intensity)| ScoredFile { file_id, report, intensity })
            .collect();
        Ok(Some(scored))
    }

    fn deposit(&self, ctx: &RoleContext<'_>, outcome: Self::Outcome) -> Result<()> {
        for scored in outcome {
            debug!(
                file_id = %scored.file_id,
                intensity = scored.intensity,
                patterns = scored.report.pattern_count(),
                "depositing task pheromone"
            );
            let task = TaskEntry {
                intensity: scored.intensity,
                pattern_count: scored.report.pattern_count(),
                dep_count: scored.report.dep_count(),
                patterns_found: scored.report.patterns_found.clone(),
                dependencies: scored.report.dependencies.clone(),
                detection_source: scored.report.detection_source,
                created_at: utc_timestamp(),
                created_by: self.tag(),
                updated_at: None,
                updated_by: None,
            };
            ctx.store.write_task(&scored.file_id, task, self.tag())?;

            // A resumed run can hold a status entry whose task map was lost;
            // leave the existing lifecycle untouched in that case.
            if ctx.store.status_of(&scored.file_id)?.is_none() {
                let mut status = StatusEntry::pending(self.tag(), ctx.tick);
                status.metadata.insert(
                    "patterns_found".to_string(),
                    serde_json::json!(scored.report.patterns_found),
                );
                ctx.store.write_status(&scored.file_id, status, self.tag())?;
            }
        }
        Ok(())
    }
}
