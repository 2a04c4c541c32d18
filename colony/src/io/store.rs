//! The pheromone store: three JSON-backed maps with locking, decay hooks,
//! maintenance transitions, and an audit mirror.
//!
//! The persisted artifacts are the source of truth. In-memory payloads exist
//! only inside a single lock acquisition, so readers always observe the latest
//! committed state and the cooperative model stays cache-coherence-free.
//!
//! Every mutation follows the same write path: validate the requested status
//! transition, stamp the trace, enforce the scope lock, append the audit
//! record, then persist the map. The audit append happens before the map
//! write, so a failed append leaves the map untouched.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::core::decay::{DecayKind, decay_inhibition, decay_intensity};
use crate::core::transitions;
use crate::core::types::{
    AuditEvent, FileStatus, MapName, Operation, QualityEntry, RoleTag, StatusEntry, TaskEntry,
    utc_timestamp,
};
use crate::io::audit::AuditLog;
use crate::io::config::Config;

/// Scope lock held by another role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockViolation {
    pub file_id: String,
    pub holder: RoleTag,
    pub requested_by: RoleTag,
}

impl fmt::Display for LockViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scope lock violation for {}: held by {}, not {}",
            self.file_id,
            self.holder.as_str(),
            self.requested_by.as_str()
        )
    }
}

impl Error for LockViolation {}

/// Persistent map artifact unreadable; the run cannot continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCorrupted {
    pub path: PathBuf,
    pub detail: String,
}

impl fmt::Display for StoreCorrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "corrupt store artifact {}: {}", self.path.display(), self.detail)
    }
}

impl Error for StoreCorrupted {}

/// Field-level patch for `update` on the status map.
///
/// Unset fields are left untouched; unknown fields cannot be expressed.
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub status: Option<FileStatus>,
    pub retry_count: Option<u32>,
    pub inhibition: Option<f64>,
    /// Replaces the observational metadata wholesale when set.
    pub metadata: Option<BTreeMap<String, Value>>,
    /// Required when transitioning into `in_progress` or `pending` so lock
    /// and aging bookkeeping stay tick-based.
    pub current_tick: Option<u64>,
}

/// Field-level patch for `update` on the quality map.
#[derive(Debug, Clone, Default)]
pub struct QualityPatch {
    pub confidence: Option<f64>,
    pub issues: Option<Vec<String>>,
}

/// Query operator over one entry field. `file_id` addresses the map key.
#[derive(Debug, Clone)]
pub enum FilterOp {
    Eq(Value),
    In(Vec<Value>),
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: FilterOp::Eq(value.into()) }
    }

    pub fn one_of(field: &str, values: Vec<Value>) -> Self {
        Self { field: field.to_string(), op: FilterOp::In(values) }
    }

    pub fn gt(field: &str, value: f64) -> Self {
        Self { field: field.to_string(), op: FilterOp::Gt(value) }
    }

    pub fn gte(field: &str, value: f64) -> Self {
        Self { field: field.to_string(), op: FilterOp::Gte(value) }
    }

    pub fn lt(field: &str, value: f64) -> Self {
        Self { field: field.to_string(), op: FilterOp::Lt(value) }
    }

    pub fn lte(field: &str, value: f64) -> Self {
        Self { field: field.to_string(), op: FilterOp::Lte(value) }
    }

    fn matches(&self, file_id: &str, entry: &Value) -> bool {
        let current = if self.field == "file_id" {
            Some(Value::String(file_id.to_string()))
        } else {
            entry.get(&self.field).cloned()
        };
        match &self.op {
            FilterOp::Eq(expected) => current.as_ref() == Some(expected),
            FilterOp::In(expected) => current.is_some_and(|v| expected.contains(&v)),
            FilterOp::Gt(bound) => number(&current).is_some_and(|v| v > *bound),
            FilterOp::Gte(bound) => number(&current).is_some_and(|v| v >= *bound),
            FilterOp::Lt(bound) => number(&current).is_some_and(|v| v < *bound),
            FilterOp::Lte(bound) => number(&current).is_some_and(|v| v <= *bound),
        }
    }
}

fn number(value: &Option<Value>) -> Option<f64> {
    value.as_ref().and_then(Value::as_f64)
}

/// Tick-start maintenance results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Zombie `in_progress` files forcibly returned to pending.
    pub ttl_released: Vec<String>,
    /// Files requeued `retry -> pending`.
    pub retry_requeued: Vec<String>,
}

/// Tick-end failure promotion results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    /// Files promoted `failed -> retry` (inhibition bumped).
    pub retried: Vec<String>,
    /// Files past the retry ceiling, moved to terminal `skipped`.
    pub skipped: Vec<String>,
}

pub struct PheromoneStore {
    dir: PathBuf,
    audit: AuditLog,
    decay_kind: DecayKind,
    decay_rate: f64,
    inhibition_decay_rate: f64,
    max_retry_count: u32,
    scope_lock_ttl: u64,
}

impl PheromoneStore {
    /// Open (and scaffold, if needed) the store under `dir`.
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create pheromone dir {}", dir.display()))?;
        let store = Self {
            dir: dir.to_path_buf(),
            audit: AuditLog::new(dir.join("audit_log.jsonl")),
            decay_kind: config.pheromones.decay_type,
            decay_rate: config.pheromones.decay_rate,
            inhibition_decay_rate: config.pheromones.inhibition_decay_rate,
            max_retry_count: config.thresholds.max_retry_count,
            scope_lock_ttl: config.thresholds.scope_lock_ttl,
        };
        for map in [MapName::Tasks, MapName::Status, MapName::Quality] {
            let path = store.map_path(map);
            if !path.exists() || std::fs::metadata(&path)?.len() == 0 {
                std::fs::write(&path, "{}\n")
                    .with_context(|| format!("initialize {}", path.display()))?;
            }
        }
        if !store.audit.path().exists() {
            std::fs::write(store.audit.path(), "")
                .with_context(|| format!("initialize {}", store.audit.path().display()))?;
        }
        Ok(store)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn map_path(&self, map: MapName) -> PathBuf {
        self.dir.join(map.file_name())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn read_tasks(&self) -> Result<BTreeMap<String, TaskEntry>> {
        self.read_map(MapName::Tasks)
    }

    pub fn read_status(&self) -> Result<BTreeMap<String, StatusEntry>> {
        self.read_map(MapName::Status)
    }

    pub fn read_quality(&self) -> Result<BTreeMap<String, QualityEntry>> {
        self.read_map(MapName::Quality)
    }

    pub fn task(&self, file_id: &str) -> Result<Option<TaskEntry>> {
        Ok(self.read_tasks()?.remove(file_id))
    }

    pub fn status_of(&self, file_id: &str) -> Result<Option<StatusEntry>> {
        Ok(self.read_status()?.remove(file_id))
    }

    pub fn quality_of(&self, file_id: &str) -> Result<Option<QualityEntry>> {
        Ok(self.read_quality()?.remove(file_id))
    }

    pub fn query_tasks(&self, filters: &[Filter]) -> Result<BTreeMap<String, TaskEntry>> {
        self.query_map(MapName::Tasks, filters)
    }

    pub fn query_status(&self, filters: &[Filter]) -> Result<BTreeMap<String, StatusEntry>> {
        self.query_map(MapName::Status, filters)
    }

    pub fn query_quality(&self, filters: &[Filter]) -> Result<BTreeMap<String, QualityEntry>> {
        self.query_map(MapName::Quality, filters)
    }

    fn query_map<T>(&self, map: MapName, filters: &[Filter]) -> Result<BTreeMap<String, T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let entries: BTreeMap<String, T> = self.read_map(map)?;
        let mut matched = BTreeMap::new();
        for (file_id, entry) in entries {
            let view = serde_json::to_value(&entry).context("project entry for query")?;
            if filters.iter().all(|filter| filter.matches(&file_id, &view)) {
                matched.insert(file_id, entry);
            }
        }
        Ok(matched)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create or overwrite a task entry.
    pub fn write_task(&self, file_id: &str, mut entry: TaskEntry, role: RoleTag) -> Result<()> {
        self.enforce_scope_lock(file_id, role)?;
        self.mutate_map(MapName::Tasks, |payload: &mut BTreeMap<String, TaskEntry>| {
            let previous = payload.get(file_id).cloned();
            match &previous {
                None => {
                    entry.created_at = utc_timestamp();
                    entry.created_by = role;
                }
                Some(prior) => {
                    entry.created_at = prior.created_at.clone();
                    entry.created_by = prior.created_by;
                    entry.updated_at = Some(utc_timestamp());
                    entry.updated_by = Some(role);
                }
            }
            let event = audit_event(MapName::Tasks, file_id, role, previous.as_ref(), &entry)?;
            payload.insert(file_id.to_string(), entry.clone());
            Ok(((), vec![event]))
        })
    }

    /// Create a status entry (Discover) or overwrite one wholesale.
    pub fn write_status(&self, file_id: &str, mut entry: StatusEntry, role: RoleTag) -> Result<()> {
        self.mutate_map(MapName::Status, |payload: &mut BTreeMap<String, StatusEntry>| {
            let previous = payload.get(file_id).cloned();
            check_scope_lock(file_id, role, previous.as_ref())?;
            transitions::validate(file_id, previous.as_ref().map(|e| e.status), entry.status)
                .map_err(anyhow::Error::new)?;
            entry.agent = role;
            entry.timestamp = utc_timestamp();
            if let Some(prior) = &previous {
                entry.retry_count = entry.retry_count.max(prior.retry_count);
            }
            let event = audit_event(MapName::Status, file_id, role, previous.as_ref(), &entry)?;
            payload.insert(file_id.to_string(), entry.clone());
            Ok(((), vec![event]))
        })
    }

    /// Merge changed fields into an existing status entry.
    ///
    /// Validates the state transition, stamps the trace, and maintains the
    /// scope lock implicitly: transitions into `in_progress` acquire it,
    /// transitions out release it, transitions into `pending` restamp the
    /// aging origin.
    pub fn update_status(&self, file_id: &str, patch: StatusPatch, role: RoleTag) -> Result<()> {
        self.mutate_map(MapName::Status, |payload: &mut BTreeMap<String, StatusEntry>| {
            let previous = payload
                .get(file_id)
                .cloned()
                .ok_or_else(|| anyhow!("update of unknown status entry {file_id}"))?;
            check_scope_lock(file_id, role, Some(&previous))?;

            let next_status = patch.status.unwrap_or(previous.status);
            transitions::validate(file_id, Some(previous.status), next_status)
                .map_err(anyhow::Error::new)?;

            let mut candidate = previous.clone();
            candidate.status = next_status;
            if next_status != previous.status {
                candidate.previous_status = Some(previous.status);
            }
            candidate.agent = role;
            candidate.timestamp = utc_timestamp();
            // retry_count never decreases.
            if let Some(retry_count) = patch.retry_count {
                candidate.retry_count = retry_count.max(previous.retry_count);
            }
            if let Some(inhibition) = patch.inhibition {
                candidate.inhibition = inhibition.max(0.0);
            }
            if let Some(metadata) = patch.metadata {
                candidate.metadata = metadata;
            }

            if next_status == FileStatus::InProgress {
                candidate.lock_owner = Some(role);
                candidate.lock_acquired_tick = patch.current_tick;
            } else if previous.lock_owner.is_none() || previous.lock_owner == Some(role) {
                candidate.lock_owner = None;
                candidate.lock_acquired_tick = None;
            }
            if next_status == FileStatus::Pending && previous.status != FileStatus::Pending {
                candidate.pending_since_tick = patch.current_tick;
            }

            let event = audit_event(MapName::Status, file_id, role, Some(&previous), &candidate)?;
            payload.insert(file_id.to_string(), candidate);
            Ok(((), vec![event]))
        })
    }

    /// Create or overwrite a quality entry (Test's deposit).
    pub fn write_quality(&self, file_id: &str, mut entry: QualityEntry, role: RoleTag) -> Result<()> {
        self.enforce_scope_lock(file_id, role)?;
        self.mutate_map(MapName::Quality, |payload: &mut BTreeMap<String, QualityEntry>| {
            let previous = payload.get(file_id).cloned();
            entry.agent = role;
            entry.timestamp = utc_timestamp();
            entry.confidence = entry.confidence.clamp(0.0, 1.0);
            let event = audit_event(MapName::Quality, file_id, role, previous.as_ref(), &entry)?;
            payload.insert(file_id.to_string(), entry.clone());
            Ok(((), vec![event]))
        })
    }

    /// Merge changed fields into an existing quality entry (reinforcement and
    /// evaporation). Confidence is clamped to [0.0, 1.0].
    pub fn update_quality(&self, file_id: &str, patch: QualityPatch, role: RoleTag) -> Result<()> {
        self.enforce_scope_lock(file_id, role)?;
        self.mutate_map(MapName::Quality, |payload: &mut BTreeMap<String, QualityEntry>| {
            let previous = payload
                .get(file_id)
                .cloned()
                .ok_or_else(|| anyhow!("update of unknown quality entry {file_id}"))?;
            let mut candidate = previous.clone();
            if let Some(confidence) = patch.confidence {
                candidate.confidence = confidence.clamp(0.0, 1.0);
            }
            if let Some(issues) = patch.issues {
                candidate.issues = issues;
            }
            candidate.agent = role;
            candidate.timestamp = utc_timestamp();
            let event = audit_event(MapName::Quality, file_id, role, Some(&previous), &candidate)?;
            payload.insert(file_id.to_string(), candidate);
            Ok(((), vec![event]))
        })
    }

    // ------------------------------------------------------------------
    // Decay
    // ------------------------------------------------------------------

    /// Evaporate task intensity for files in a non-working state.
    pub fn apply_intensity_decay(&self) -> Result<()> {
        let statuses = self.read_status()?;
        let kind = self.decay_kind;
        let rate = self.decay_rate;
        self.mutate_map(MapName::Tasks, |payload: &mut BTreeMap<String, TaskEntry>| {
            let mut events = Vec::new();
            for (file_id, entry) in payload.iter_mut() {
                let status = statuses
                    .get(file_id)
                    .map_or(FileStatus::Pending, |s| s.status);
                if !matches!(status, FileStatus::Pending | FileStatus::Retry) {
                    continue;
                }
                let updated = decay_intensity(entry.intensity, kind, rate);
                if updated == entry.intensity {
                    continue;
                }
                let previous = entry.clone();
                entry.intensity = updated;
                entry.updated_at = Some(utc_timestamp());
                entry.updated_by = Some(RoleTag::SystemDecay);
                events.push(audit_event(
                    MapName::Tasks,
                    file_id,
                    RoleTag::SystemDecay,
                    Some(&previous),
                    entry,
                )?);
            }
            Ok(((), events))
        })
    }

    /// Evaporate the inhibition field γ wherever it is positive.
    pub fn apply_inhibition_decay(&self) -> Result<()> {
        let rate = self.inhibition_decay_rate;
        self.mutate_map(MapName::Status, |payload: &mut BTreeMap<String, StatusEntry>| {
            let mut events = Vec::new();
            for (file_id, entry) in payload.iter_mut() {
                if entry.inhibition <= 0.0 {
                    continue;
                }
                let updated = decay_inhibition(entry.inhibition, rate);
                if updated == entry.inhibition {
                    continue;
                }
                let previous = entry.clone();
                entry.inhibition = updated;
                entry.agent = RoleTag::SystemDecay;
                entry.timestamp = utc_timestamp();
                events.push(audit_event(
                    MapName::Status,
                    file_id,
                    RoleTag::SystemDecay,
                    Some(&previous),
                    entry,
                )?);
            }
            Ok(((), events))
        })
    }

    // ------------------------------------------------------------------
    // Tick maintenance
    // ------------------------------------------------------------------

    /// Tick-start maintenance: zombie lock release, then retry requeue.
    pub fn maintain_status(&self, current_tick: u64) -> Result<MaintenanceReport> {
        let ttl = self.scope_lock_ttl;
        self.mutate_map(MapName::Status, |payload: &mut BTreeMap<String, StatusEntry>| {
            let mut report = MaintenanceReport::default();
            let mut events = Vec::new();

            for (file_id, entry) in payload.iter_mut() {
                if entry.status != FileStatus::InProgress {
                    continue;
                }
                let (Some(_owner), Some(lock_tick)) = (entry.lock_owner, entry.lock_acquired_tick)
                else {
                    continue;
                };
                if current_tick.saturating_sub(lock_tick) <= ttl {
                    continue;
                }
                let previous = entry.clone();
                entry.previous_status = Some(FileStatus::InProgress);
                entry.status = FileStatus::Pending;
                entry.retry_count += 1;
                entry.lock_owner = None;
                entry.lock_acquired_tick = None;
                entry.pending_since_tick = Some(current_tick);
                entry.agent = RoleTag::SystemTtl;
                entry.timestamp = utc_timestamp();
                events.push(audit_event(
                    MapName::Status,
                    file_id,
                    RoleTag::SystemTtl,
                    Some(&previous),
                    entry,
                )?);
                report.ttl_released.push(file_id.clone());
            }

            for (file_id, entry) in payload.iter_mut() {
                if entry.status != FileStatus::Retry {
                    continue;
                }
                let previous = entry.clone();
                entry.previous_status = Some(FileStatus::Retry);
                entry.status = FileStatus::Pending;
                entry.pending_since_tick = Some(current_tick);
                entry.agent = RoleTag::SystemRetry;
                entry.timestamp = utc_timestamp();
                events.push(audit_event(
                    MapName::Status,
                    file_id,
                    RoleTag::SystemRetry,
                    Some(&previous),
                    entry,
                )?);
                report.retry_requeued.push(file_id.clone());
            }

            report.ttl_released.sort();
            report.retry_requeued.sort();
            Ok((report, events))
        })
    }

    /// Tick-end maintenance: promote `failed` files into `retry` (advancing
    /// the retry counter and bumping γ by 0.5) or into terminal `skipped`
    /// once the counter passes the ceiling.
    pub fn promote_failed(&self) -> Result<PromotionReport> {
        let ceiling = self.max_retry_count;
        self.mutate_map(MapName::Status, |payload: &mut BTreeMap<String, StatusEntry>| {
            let mut report = PromotionReport::default();
            let mut events = Vec::new();

            for (file_id, entry) in payload.iter_mut() {
                if entry.status != FileStatus::Failed {
                    continue;
                }
                let previous = entry.clone();
                entry.previous_status = Some(FileStatus::Failed);
                entry.retry_count += 1;
                if entry.retry_count > ceiling {
                    entry.status = FileStatus::Skipped;
                    report.skipped.push(file_id.clone());
                } else {
                    entry.status = FileStatus::Retry;
                    entry.inhibition += 0.5;
                    report.retried.push(file_id.clone());
                }
                entry.agent = RoleTag::SystemRetry;
                entry.timestamp = utc_timestamp();
                events.push(audit_event(
                    MapName::Status,
                    file_id,
                    RoleTag::SystemRetry,
                    Some(&previous),
                    entry,
                )?);
            }

            report.retried.sort();
            report.skipped.sort();
            Ok((report, events))
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read_map<T: DeserializeOwned>(&self, map: MapName) -> Result<BTreeMap<String, T>> {
        let path = self.map_path(map);
        let file = lock_file(&path)?;
        let payload = parse_map(&file, &path)?;
        Ok(payload)
    }

    /// Read-modify-write one map under its exclusive lock.
    ///
    /// The closure returns its result plus the audit events describing the
    /// mutation; events are appended before the map is persisted so a failed
    /// append aborts the mutation.
    fn mutate_map<T, R>(
        &self,
        map: MapName,
        mutate: impl FnOnce(&mut BTreeMap<String, T>) -> Result<(R, Vec<AuditEvent>)>,
    ) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
    {
        let path = self.map_path(map);
        let file = lock_file(&path)?;
        let mut payload: BTreeMap<String, T> = parse_map(&file, &path)?;
        let (result, events) = mutate(&mut payload)?;
        if !events.is_empty() {
            self.audit.append(&events)?;
            persist_map(&path, &payload)?;
            debug!(map = map.as_str(), events = events.len(), "map mutated");
        }
        drop(file);
        Ok(result)
    }

    /// Scope-lock check for mutations of the task and quality maps: the
    /// status entry for the file decides who may touch any of its pheromones.
    fn enforce_scope_lock(&self, file_id: &str, role: RoleTag) -> Result<()> {
        let status_entry = self.status_of(file_id)?;
        check_scope_lock(file_id, role, status_entry.as_ref())
    }
}

fn check_scope_lock(file_id: &str, role: RoleTag, entry: Option<&StatusEntry>) -> Result<()> {
    let Some(entry) = entry else {
        return Ok(());
    };
    if entry.status != FileStatus::InProgress {
        return Ok(());
    }
    match entry.lock_owner {
        Some(holder) if holder != role && role != RoleTag::SystemTtl => {
            Err(anyhow::Error::new(LockViolation {
                file_id: file_id.to_string(),
                holder,
                requested_by: role,
            }))
        }
        _ => Ok(()),
    }
}

fn lock_file(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("lock {}", path.display()))?;
    Ok(file)
}

fn parse_map<T: DeserializeOwned>(mut file: &File, path: &Path) -> Result<BTreeMap<String, T>> {
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .with_context(|| format!("read {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&contents).map_err(|err| {
        anyhow::Error::new(StoreCorrupted {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })
    })
}

/// Persist a map as pretty JSON with trailing newline (temp file + rename).
fn persist_map<T: Serialize>(path: &Path, payload: &BTreeMap<String, T>) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(payload).context("serialize map")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp map {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("replace map {}", path.display()))?;
    Ok(())
}

/// Build the audit record for one entry mutation.
///
/// Every changed key appears in `fields_changed` paired with its prior value
/// in `previous_values` (`null` marks a side that did not exist). Keys that
/// vanish from the serialized entry, such as a released scope lock whose
/// `lock_owner` is omitted when empty, are recorded as changed-to-null so the
/// before/after trace stays complete.
fn audit_event<T: Serialize>(
    map: MapName,
    file_id: &str,
    role: RoleTag,
    previous: Option<&T>,
    next: &T,
) -> Result<AuditEvent> {
    let previous_view = match previous {
        Some(entry) => serde_json::to_value(entry).context("serialize prior entry")?,
        None => Value::Object(serde_json::Map::new()),
    };
    let next_view = serde_json::to_value(next).context("serialize entry")?;
    let empty = serde_json::Map::new();
    let previous_object = previous_view.as_object().unwrap_or(&empty);
    let next_object = next_view.as_object().unwrap_or(&empty);

    let mut fields_changed = BTreeMap::new();
    let mut previous_values = BTreeMap::new();
    for (key, next_value) in next_object {
        match previous_object.get(key) {
            Some(previous_value) if previous_value == next_value => {}
            Some(previous_value) => {
                fields_changed.insert(key.clone(), next_value.clone());
                previous_values.insert(key.clone(), previous_value.clone());
            }
            None => {
                fields_changed.insert(key.clone(), next_value.clone());
                if previous.is_some() {
                    previous_values.insert(key.clone(), Value::Null);
                }
            }
        }
    }
    for (key, previous_value) in previous_object {
        if !next_object.contains_key(key) {
            fields_changed.insert(key.clone(), Value::Null);
            previous_values.insert(key.clone(), previous_value.clone());
        }
    }

    Ok(AuditEvent {
        timestamp: utc_timestamp(),
        role,
        map_name: map,
        file_id: file_id.to_string(),
        operation: if previous.is_some() { Operation::Update } else { Operation::Create },
        fields_changed,
        previous_values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Classification, DetectionSource};

    fn store(dir: &Path) -> PheromoneStore {
        PheromoneStore::open(dir, &Config::default()).expect("open store")
    }

    fn task(intensity: f64) -> TaskEntry {
        TaskEntry {
            intensity,
            pattern_count: 2,
            dep_count: 0,
            patterns_found: vec!["print_statement".to_string()],
            dependencies: Vec::new(),
            detection_source: DetectionSource::Textual,
            created_at: String::new(),
            created_by: RoleTag::Discover,
            updated_at: None,
            updated_by: None,
        }
    }

    fn seed_pending(store: &PheromoneStore, file_id: &str, intensity: f64) {
        store
            .write_task(file_id, task(intensity), RoleTag::Discover)
            .expect("write task");
        store
            .write_status(file_id, StatusEntry::pending(RoleTag::Discover, 0), RoleTag::Discover)
            .expect("write status");
    }

    fn quality(confidence: f64) -> QualityEntry {
        QualityEntry {
            confidence,
            tests_total: 1,
            tests_passed: 1,
            tests_failed: 0,
            coverage: None,
            issues: Vec::new(),
            classification: Classification::Pass,
            timestamp: String::new(),
            agent: RoleTag::Test,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);

        let tasks = store.read_tasks().expect("read tasks");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks["a.py"].intensity, 0.9);
        assert_eq!(tasks["a.py"].created_by, RoleTag::Discover);
        assert!(!tasks["a.py"].created_at.is_empty());

        let status = store.status_of("a.py").expect("status").expect("entry");
        assert_eq!(status.status, FileStatus::Pending);
        assert_eq!(status.retry_count, 0);
    }

    #[test]
    fn every_mutation_appends_a_complete_audit_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        store
            .update_status(
                "a.py",
                StatusPatch {
                    status: Some(FileStatus::InProgress),
                    current_tick: Some(1),
                    ..StatusPatch::default()
                },
                RoleTag::Transform,
            )
            .expect("update");

        let events = store.audit().read_events().expect("events");
        assert_eq!(events.len(), 3);
        assert_eq!(store.audit().completeness().expect("ratio"), 1.0);

        let last = events.last().expect("last event");
        assert_eq!(last.operation, Operation::Update);
        assert_eq!(last.fields_changed["status"], serde_json::json!("in_progress"));
        assert_eq!(last.previous_values["status"], serde_json::json!("pending"));
    }

    #[test]
    fn invalid_transition_is_rejected_and_unrecorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        let before = store.audit().read_events().expect("events").len();

        let err = store
            .update_status(
                "a.py",
                StatusPatch { status: Some(FileStatus::Tested), ..StatusPatch::default() },
                RoleTag::Test,
            )
            .expect_err("must reject");
        assert!(err.downcast_ref::<transitions::TransitionInvalid>().is_some());

        let status = store.status_of("a.py").expect("status").expect("entry");
        assert_eq!(status.status, FileStatus::Pending);
        assert_eq!(store.audit().read_events().expect("events").len(), before);
    }

    #[test]
    fn scope_lock_blocks_other_roles() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        store
            .update_status(
                "a.py",
                StatusPatch {
                    status: Some(FileStatus::InProgress),
                    current_tick: Some(1),
                    ..StatusPatch::default()
                },
                RoleTag::Transform,
            )
            .expect("acquire");

        let err = store
            .update_status(
                "a.py",
                StatusPatch { status: Some(FileStatus::Failed), ..StatusPatch::default() },
                RoleTag::Validate,
            )
            .expect_err("lock must hold");
        let violation = err.downcast_ref::<LockViolation>().expect("lock violation");
        assert_eq!(violation.holder, RoleTag::Transform);

        // Writes to the other maps are equally blocked while the lock is held.
        let err = store
            .write_quality("a.py", quality(0.5), RoleTag::Validate)
            .expect_err("quality write must be blocked");
        assert!(err.downcast_ref::<LockViolation>().is_some());

        // The owner may complete the transition, which releases the lock.
        store
            .update_status(
                "a.py",
                StatusPatch { status: Some(FileStatus::Transformed), ..StatusPatch::default() },
                RoleTag::Transform,
            )
            .expect("owner transition");
        let status = store.status_of("a.py").expect("status").expect("entry");
        assert_eq!(status.lock_owner, None);
        assert_eq!(status.lock_acquired_tick, None);
    }

    #[test]
    fn lock_release_event_records_cleared_lock_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        store
            .update_status(
                "a.py",
                StatusPatch {
                    status: Some(FileStatus::InProgress),
                    current_tick: Some(1),
                    ..StatusPatch::default()
                },
                RoleTag::Transform,
            )
            .expect("acquire");
        store
            .update_status(
                "a.py",
                StatusPatch { status: Some(FileStatus::Transformed), ..StatusPatch::default() },
                RoleTag::Transform,
            )
            .expect("release");

        let events = store.audit().read_events().expect("events");
        let release = events.last().expect("release event");
        assert_eq!(release.fields_changed["lock_owner"], serde_json::Value::Null);
        assert_eq!(release.previous_values["lock_owner"], serde_json::json!("transform"));
        assert_eq!(release.fields_changed["lock_acquired_tick"], serde_json::Value::Null);
        assert_eq!(release.previous_values["lock_acquired_tick"], serde_json::json!(1));
        assert_eq!(store.audit().completeness().expect("ratio"), 1.0);
    }

    #[test]
    fn retry_count_never_decreases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        store
            .update_status(
                "a.py",
                StatusPatch { retry_count: Some(2), ..StatusPatch::default() },
                RoleTag::Validate,
            )
            .expect("raise");
        store
            .update_status(
                "a.py",
                StatusPatch { retry_count: Some(0), ..StatusPatch::default() },
                RoleTag::Validate,
            )
            .expect("attempt lower");
        let status = store.status_of("a.py").expect("status").expect("entry");
        assert_eq!(status.retry_count, 2);
    }

    #[test]
    fn intensity_decay_skips_working_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "idle.py", 0.8);
        seed_pending(&store, "busy.py", 0.8);
        store
            .update_status(
                "busy.py",
                StatusPatch {
                    status: Some(FileStatus::InProgress),
                    current_tick: Some(0),
                    ..StatusPatch::default()
                },
                RoleTag::Transform,
            )
            .expect("busy");

        store.apply_intensity_decay().expect("decay");

        let tasks = store.read_tasks().expect("tasks");
        assert!(tasks["idle.py"].intensity < 0.8);
        assert_eq!(tasks["busy.py"].intensity, 0.8);
        assert_eq!(tasks["idle.py"].updated_by, Some(RoleTag::SystemDecay));
    }

    #[test]
    fn inhibition_decays_exponentially() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        store
            .update_status(
                "a.py",
                StatusPatch { inhibition: Some(0.5), ..StatusPatch::default() },
                RoleTag::Validate,
            )
            .expect("set gamma");

        store.apply_inhibition_decay().expect("decay");
        let status = store.status_of("a.py").expect("status").expect("entry");
        let expected = 0.5 * (-0.08_f64).exp();
        assert!((status.inhibition - expected).abs() < 1e-12);
    }

    #[test]
    fn ttl_release_fires_after_ttl_plus_one_ticks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "e.py", 0.9);
        store
            .update_status(
                "e.py",
                StatusPatch {
                    status: Some(FileStatus::InProgress),
                    current_tick: Some(0),
                    ..StatusPatch::default()
                },
                RoleTag::Transform,
            )
            .expect("acquire");

        // Ticks 1..=3 are within TTL.
        for tick in 1..=3 {
            let report = store.maintain_status(tick).expect("maintain");
            assert!(report.ttl_released.is_empty(), "tick {tick}");
        }
        let report = store.maintain_status(4).expect("maintain");
        assert_eq!(report.ttl_released, vec!["e.py".to_string()]);

        let status = store.status_of("e.py").expect("status").expect("entry");
        assert_eq!(status.status, FileStatus::Pending);
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.lock_owner, None);
        assert_eq!(status.pending_since_tick, Some(4));

        let events = store.audit().read_events().expect("events");
        let release = events.last().expect("release event");
        assert_eq!(release.role, RoleTag::SystemTtl);
        assert_eq!(release.fields_changed["status"], serde_json::json!("pending"));
        assert_eq!(release.previous_values["status"], serde_json::json!("in_progress"));
    }

    #[test]
    fn retry_requeues_to_pending_at_tick_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "b.py", 0.9);
        force_status(&store, "b.py", FileStatus::Retry);

        let report = store.maintain_status(5).expect("maintain");
        assert_eq!(report.retry_requeued, vec!["b.py".to_string()]);
        let status = store.status_of("b.py").expect("status").expect("entry");
        assert_eq!(status.status, FileStatus::Pending);
        assert_eq!(status.previous_status, Some(FileStatus::Retry));
        assert_eq!(status.pending_since_tick, Some(5));
    }

    #[test]
    fn failed_promotion_bumps_gamma_until_ceiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "b.py", 0.9);

        force_status(&store, "b.py", FileStatus::Failed);
        let report = store.promote_failed().expect("promote");
        assert_eq!(report.retried, vec!["b.py".to_string()]);
        let status = store.status_of("b.py").expect("status").expect("entry");
        assert_eq!(status.status, FileStatus::Retry);
        assert_eq!(status.retry_count, 1);
        assert_eq!(status.inhibition, 0.5);

        // Drive the counter past the ceiling: the next failure skips.
        store
            .update_status(
                "b.py",
                StatusPatch { retry_count: Some(3), ..StatusPatch::default() },
                RoleTag::Validate,
            )
            .expect("raise retries");
        force_status(&store, "b.py", FileStatus::Failed);
        let report = store.promote_failed().expect("promote");
        assert_eq!(report.skipped, vec!["b.py".to_string()]);
        let status = store.status_of("b.py").expect("status").expect("entry");
        assert_eq!(status.status, FileStatus::Skipped);
        assert_eq!(status.retry_count, 4);
    }

    #[test]
    fn query_filters_compose() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        seed_pending(&store, "a.py", 0.9);
        seed_pending(&store, "b.py", 0.15);
        force_status(&store, "b.py", FileStatus::Failed);

        let pending = store
            .query_status(&[Filter::eq("status", "pending")])
            .expect("query");
        assert_eq!(pending.keys().collect::<Vec<_>>(), vec!["a.py"]);

        let hot = store
            .query_tasks(&[Filter::gte("intensity", 0.2)])
            .expect("query");
        assert_eq!(hot.keys().collect::<Vec<_>>(), vec!["a.py"]);

        let either = store
            .query_status(&[Filter::one_of(
                "status",
                vec![serde_json::json!("pending"), serde_json::json!("failed")],
            )])
            .expect("query");
        assert_eq!(either.len(), 2);
    }

    #[test]
    fn corrupt_map_surfaces_store_corrupted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        std::fs::write(store.map_path(MapName::Status), "not json").expect("corrupt");
        let err = store.read_status().expect_err("must fail");
        assert!(err.downcast_ref::<StoreCorrupted>().is_some());
    }

    /// Walk a file through legal transitions into the requested status.
    fn force_status(store: &PheromoneStore, file_id: &str, target: FileStatus) {
        let current = store
            .status_of(file_id)
            .expect("status")
            .expect("entry")
            .status;
        let steps: &[FileStatus] = match (current, target) {
            (FileStatus::Pending, FileStatus::Failed) => {
                &[FileStatus::InProgress, FileStatus::Failed]
            }
            (FileStatus::Pending, FileStatus::Retry) => {
                &[FileStatus::InProgress, FileStatus::Failed, FileStatus::Retry]
            }
            (FileStatus::Retry, FileStatus::Failed) => {
                &[FileStatus::InProgress, FileStatus::Failed]
            }
            _ => panic!("unsupported forcing {current:?} -> {target:?}"),
        };
        for step in steps {
            // The in_progress lock is held by Transform, so the transition out
            // of it must come from the same role.
            let role = match step {
                FileStatus::Retry => RoleTag::SystemRetry,
                _ => RoleTag::Transform,
            };
            store
                .update_status(
                    file_id,
                    StatusPatch {
                        status: Some(*step),
                        current_tick: Some(0),
                        ..StatusPatch::default()
                    },
                    role,
                )
                .expect("force step");
        }
    }
}
