//! Append-only audit journal mirroring every store mutation.
//!
//! One JSON event per line. The file is never rewritten or truncated during a
//! run; appends happen under an exclusive OS lock so the journal stays a
//! linear history even if a future variant introduces parallel writers.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use crate::core::types::AuditEvent;

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append events as JSONL under an exclusive lock.
    ///
    /// The store calls this before persisting the map mutation the events
    /// describe; a failed append aborts the mutation.
    pub fn append(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock audit log {}", self.path.display()))?;
        let mut writer = &file;
        for event in events {
            let line = serde_json::to_string(event).context("serialize audit event")?;
            writeln!(writer, "{line}")
                .with_context(|| format!("append audit log {}", self.path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flush audit log {}", self.path.display()))?;
        Ok(())
    }

    /// Read the full journal back as typed events, skipping blank lines.
    pub fn read_events(&self) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("read audit log {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line)
                .with_context(|| format!("parse audit event: {line}"))?;
            events.push(event);
        }
        Ok(events)
    }

    /// Ratio of events carrying a full trace to total journal lines. 1.0 in a
    /// correct implementation; anything lower indicates a bug in the store
    /// write path.
    ///
    /// A full trace means the identity fields are present and the before/after
    /// values pair up: an `update` must carry a prior value for every changed
    /// field (including fields that were added or removed, marked `null` on
    /// the absent side), while a `create` has changed fields and no priors.
    pub fn completeness(&self) -> Result<f64> {
        if !self.path.exists() {
            return Ok(1.0);
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read audit log {}", self.path.display()))?;
        let lines: Vec<&str> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return Ok(1.0);
        }
        let full = lines
            .iter()
            .filter(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .map(|value| is_full_trace(&value))
                    .unwrap_or(false)
            })
            .count();
        Ok(full as f64 / lines.len() as f64)
    }
}

fn is_full_trace(value: &serde_json::Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };
    let required = ["timestamp", "role", "map_name", "file_id", "operation"];
    if !required.iter().all(|field| {
        object
            .get(*field)
            .is_some_and(|v| !v.is_null() && v.as_str() != Some(""))
    }) {
        return false;
    }
    let Some(fields_changed) = object.get("fields_changed").and_then(|v| v.as_object()) else {
        return false;
    };
    let Some(previous_values) = object.get("previous_values").and_then(|v| v.as_object()) else {
        return false;
    };
    match object.get("operation").and_then(|v| v.as_str()) {
        Some("create") => !fields_changed.is_empty() && previous_values.is_empty(),
        Some("update") => {
            fields_changed.keys().all(|key| previous_values.contains_key(key))
                && previous_values.keys().all(|key| fields_changed.contains_key(key))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::types::{MapName, Operation, RoleTag, utc_timestamp};

    fn event(file_id: &str) -> AuditEvent {
        let mut fields_changed = BTreeMap::new();
        fields_changed.insert("status".to_string(), serde_json::json!("pending"));
        let mut previous_values = BTreeMap::new();
        previous_values.insert("status".to_string(), serde_json::json!("retry"));
        AuditEvent {
            timestamp: utc_timestamp(),
            role: RoleTag::SystemRetry,
            map_name: MapName::Status,
            file_id: file_id.to_string(),
            operation: Operation::Update,
            fields_changed,
            previous_values,
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path().join("audit_log.jsonl"));

        log.append(&[event("a.py"), event("b.py")]).expect("append");
        log.append(&[event("c.py")]).expect("append");

        let events = log.read_events().expect("read");
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].file_id, "c.py");
    }

    #[test]
    fn completeness_is_one_for_store_written_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path().join("audit_log.jsonl"));
        log.append(&[event("a.py")]).expect("append");
        assert_eq!(log.completeness().expect("ratio"), 1.0);
    }

    #[test]
    fn completeness_flags_truncated_events() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit_log.jsonl");
        std::fs::write(&path, "{\"timestamp\":\"t\"}\n").expect("write");
        let log = AuditLog::new(&path);
        assert_eq!(log.completeness().expect("ratio"), 0.0);
    }

    #[test]
    fn completeness_requires_paired_before_after_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("audit_log.jsonl");
        // An update whose changed field lost its prior value is not a full
        // trace, even though both maps are present.
        let unpaired = concat!(
            "{\"timestamp\":\"t\",\"role\":\"transform\",\"map_name\":\"status\",",
            "\"file_id\":\"a.py\",\"operation\":\"update\",",
            "\"fields_changed\":{\"lock_owner\":null},\"previous_values\":{}}\n",
        );
        std::fs::write(&path, unpaired).expect("write");
        let log = AuditLog::new(&path);
        assert_eq!(log.completeness().expect("ratio"), 0.0);

        log.append(&[event("b.py")]).expect("append");
        assert_eq!(log.completeness().expect("ratio"), 0.5);
    }

    #[test]
    fn missing_journal_is_vacuously_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path().join("absent.jsonl"));
        assert_eq!(log.completeness().expect("ratio"), 1.0);
        assert!(log.read_events().expect("read").is_empty());
    }
}
