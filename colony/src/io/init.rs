//! `.colony/` state scaffolding inside the target working tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const GITIGNORE_BODY: &str = "pheromones/\nmetrics/\ntmp/\n";
const MAP_FILES: [&str; 3] = ["tasks.json", "status.json", "quality.json"];

/// Canonical layout of the state directory.
#[derive(Debug, Clone)]
pub struct ColonyPaths {
    pub root: PathBuf,
    pub pheromones: PathBuf,
    pub metrics: PathBuf,
    pub gitignore: PathBuf,
}

impl ColonyPaths {
    pub fn new(target: &Path) -> Self {
        let root = target.join(".colony");
        Self {
            pheromones: root.join("pheromones"),
            metrics: root.join("metrics"),
            gitignore: root.join(".gitignore"),
            root,
        }
    }

    pub fn audit_log(&self) -> PathBuf {
        self.pheromones.join("audit_log.jsonl")
    }
}

/// Create the state layout. Unless `resume` is set, the three maps and the
/// audit log are reset to their empty forms.
pub fn init_state(paths: &ColonyPaths, resume: bool) -> Result<()> {
    for dir in [&paths.root, &paths.pheromones, &paths.metrics] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if !paths.gitignore.exists() {
        fs::write(&paths.gitignore, GITIGNORE_BODY)
            .with_context(|| format!("write {}", paths.gitignore.display()))?;
    }
    if resume {
        return Ok(());
    }
    for map in MAP_FILES {
        let path = paths.pheromones.join(map);
        fs::write(&path, "{}\n").with_context(|| format!("reset {}", path.display()))?;
    }
    fs::write(paths.audit_log(), "")
        .with_context(|| format!("reset {}", paths.audit_log().display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_layout_and_empty_maps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ColonyPaths::new(temp.path());
        init_state(&paths, false).expect("init");

        assert!(paths.pheromones.is_dir());
        assert!(paths.metrics.is_dir());
        for map in MAP_FILES {
            let contents = fs::read_to_string(paths.pheromones.join(map)).expect("read");
            assert_eq!(contents, "{}\n");
        }
        let gitignore = fs::read_to_string(&paths.gitignore).expect("read");
        assert!(gitignore.contains("pheromones/"));
        assert!(gitignore.contains("metrics/"));
    }

    #[test]
    fn resume_preserves_existing_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ColonyPaths::new(temp.path());
        init_state(&paths, false).expect("init");
        fs::write(paths.pheromones.join("status.json"), "{\"a.py\": {}}\n").expect("seed");

        init_state(&paths, true).expect("resume");
        let contents = fs::read_to_string(paths.pheromones.join("status.json")).expect("read");
        assert_eq!(contents, "{\"a.py\": {}}\n");

        init_state(&paths, false).expect("fresh");
        let contents = fs::read_to_string(paths.pheromones.join("status.json")).expect("read");
        assert_eq!(contents, "{}\n");
    }
}
