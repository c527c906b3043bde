//! Persisted flow state
//!
//! One versioned JSON document per instance maps step ids to their status,
//! result and last error. The executor is the only writer; it saves after
//! every terminal transition. `running` only exists in memory.

use crate::error::StateError;
use crate::step::{ATTR_ADOPTED, ResourceRef, Step, StepOutput, StepTask};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use infraflow_cloud::ResourceKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;

pub const STATE_VERSION: u32 = 1;

const STATE_EXTENSION: &str = "json";
const BACKUP_SUFFIX: &str = "backup";
const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted progress of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub kind: ResourceKind,
    pub target: ResourceRef,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<StepOutput>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(step: &Step) -> Self {
        Self {
            kind: step.kind(),
            target: step.target.clone(),
            depends_on: step.depends_on.clone(),
            fingerprint: step.fingerprint.clone(),
            status: StepStatus::Pending,
            result: None,
            last_error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether any provider call was ever made for this record
    pub fn was_attempted(&self) -> bool {
        self.attempts > 0 || self.result.is_some()
    }

    /// Taken over from an unmarked resource; counts as owned for deletion
    pub fn adopted(&self) -> bool {
        self.result
            .as_ref()
            .is_some_and(|o| o.attribute_bool(ATTR_ADOPTED))
    }
}

/// Progress of every step of one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    #[serde(default = "default_version")]
    pub version: u32,
    pub instance_id: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Unreadable records are dropped on load and run again as new steps
    #[serde(default, deserialize_with = "readable_records")]
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(skip)]
    running: BTreeSet<String>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

fn readable_records<'de, D>(deserializer: D) -> Result<BTreeMap<String, StepRecord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(id, value)| match serde_json::from_value(value) {
            Ok(record) => Some((id, record)),
            Err(e) => {
                tracing::warn!(step = %id, error = %e, "Dropping unreadable step record");
                None
            }
        })
        .collect())
}

impl FlowState {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            instance_id: instance_id.into(),
            updated_at: Utc::now(),
            steps: BTreeMap::new(),
            running: BTreeSet::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Effective status, including the in-memory `running` flag
    pub fn status(&self, id: &str) -> Option<StepStatus> {
        if self.running.contains(id) {
            return Some(StepStatus::Running);
        }
        self.steps.get(id).map(|r| r.status)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains(id)
    }

    pub fn output(&self, id: &str) -> Option<&StepOutput> {
        self.steps
            .get(id)
            .filter(|r| r.status == StepStatus::Succeeded)
            .and_then(|r| r.result.as_ref())
    }

    pub fn mark_running(&mut self, id: &str) {
        self.running.insert(id.to_string());
    }

    pub fn clear_running(&mut self, id: &str) {
        self.running.remove(id);
    }

    pub fn record_success(&mut self, id: &str, output: StepOutput, attempts: u32) {
        if let Some(record) = self.steps.get_mut(id) {
            record.status = StepStatus::Succeeded;
            record.result = Some(output);
            record.last_error = None;
            record.attempts += attempts;
            record.updated_at = Utc::now();
        }
        self.touch();
    }

    pub fn record_failure(&mut self, id: &str, error: String, attempts: u32) {
        if let Some(record) = self.steps.get_mut(id) {
            record.status = StepStatus::Failed;
            record.last_error = Some(error);
            record.attempts += attempts;
            record.updated_at = Utc::now();
        }
        self.touch();
    }

    /// Send a succeeded step back to pending, keeping its result
    pub fn requeue(&mut self, id: &str) {
        if let Some(record) = self.steps.get_mut(id)
            && record.status == StepStatus::Succeeded
        {
            record.status = StepStatus::Pending;
            record.updated_at = Utc::now();
            self.touch();
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<StepRecord> {
        let removed = self.steps.remove(id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Align records with the ensure steps of a graph
    ///
    /// New steps get a pending record. A step whose fingerprint changed is a
    /// new definition: its record returns to pending with a fresh attempt
    /// count while the previous result is kept for dependents. Records
    /// without a step are left alone; pruning decides their fate.
    pub fn sync<'a>(&mut self, steps: impl IntoIterator<Item = &'a Step>) {
        for step in steps {
            if !matches!(step.task, StepTask::Ensure(_)) {
                continue;
            }
            match self.steps.get_mut(&step.id) {
                Some(record) if record.fingerprint == step.fingerprint => {
                    record.depends_on = step.depends_on.clone();
                }
                Some(record) => {
                    tracing::debug!(step = %step.id, "Step definition changed");
                    record.kind = step.kind();
                    record.target = step.target.clone();
                    record.depends_on = step.depends_on.clone();
                    record.fingerprint = step.fingerprint.clone();
                    record.status = StepStatus::Pending;
                    record.attempts = 0;
                    record.updated_at = Utc::now();
                }
                None => {
                    self.steps.insert(step.id.clone(), StepRecord::new(step));
                }
            }
        }
        self.touch();
    }

    /// Records whose step ended in `failed`
    pub fn failed(&self) -> impl Iterator<Item = (&String, &StepRecord)> {
        self.steps
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Failed)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn normalize(&mut self) {
        // A crash mid-step leaves nothing persisted as running, but older
        // documents might
        for record in self.steps.values_mut() {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Pending;
            }
        }
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(content: &str) -> Result<Self, StateError> {
        let mut state: FlowState = serde_json::from_str(content)?;
        if state.version > STATE_VERSION {
            return Err(StateError::UnsupportedVersion {
                found: state.version,
                supported: STATE_VERSION,
            });
        }
        state.normalize();
        Ok(state)
    }
}

/// Durable storage for flow state documents
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, instance_id: &str) -> Result<Option<FlowState>, StateError>;

    /// Atomically replace the whole document
    async fn save(&self, state: &FlowState) -> Result<(), StateError>;

    /// Remove the document; absent documents are not an error
    async fn delete(&self, instance_id: &str) -> Result<(), StateError>;
}

/// Stores `<dir>/<instance>.json`, keeping the previous version as a backup
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Get the state file path
    pub fn state_path(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", instance_id, STATE_EXTENSION))
    }

    fn backup_path(&self, instance_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", instance_id, STATE_EXTENSION, BACKUP_SUFFIX))
    }

    fn temp_path(&self, instance_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", instance_id, STATE_EXTENSION, TEMP_SUFFIX))
    }

    /// Ensure the state directory exists
    async fn ensure_dir(&self) -> Result<(), StateError> {
        if !fs::try_exists(&self.dir).await? {
            fs::create_dir_all(&self.dir).await?;
            tracing::debug!("Created state directory: {}", self.dir.display());
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, instance_id: &str) -> Result<Option<FlowState>, StateError> {
        let path = self.state_path(instance_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No flow state for {}", instance_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state = FlowState::from_json(&content)?;
        tracing::debug!("Loaded flow state with {} steps", state.steps.len());
        Ok(Some(state))
    }

    async fn save(&self, state: &FlowState) -> Result<(), StateError> {
        self.ensure_dir().await?;

        let path = self.state_path(&state.instance_id);
        let temp = self.temp_path(&state.instance_id);
        let content = state.to_json()?;

        fs::write(&temp, content).await?;
        if fs::try_exists(&path).await? {
            fs::copy(&path, self.backup_path(&state.instance_id)).await?;
        }
        // rename within one directory replaces the document atomically
        fs::rename(&temp, &path).await?;

        tracing::debug!("Saved flow state with {} steps", state.steps.len());
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<(), StateError> {
        for path in [
            self.state_path(instance_id),
            self.backup_path(instance_id),
            self.temp_path(instance_id),
        ] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!("Deleted flow state for {}", instance_id);
        Ok(())
    }
}

/// Process-local store; documents are kept serialized like on disk
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    documents: Mutex<HashMap<String, String>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (or succeed again)
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.lock().contains_key(instance_id)
    }

    /// Store a raw document, bypassing validation
    pub fn insert_raw(&self, instance_id: &str, document: impl Into<String>) {
        self.lock().insert(instance_id.to_string(), document.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.documents.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, instance_id: &str) -> Result<Option<FlowState>, StateError> {
        let document = self.lock().get(instance_id).cloned();
        document.map(|d| FlowState::from_json(&d)).transpose()
    }

    async fn save(&self, state: &FlowState) -> Result<(), StateError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("saves are disabled".to_string()));
        }
        let document = state.to_json()?;
        self.lock().insert(state.instance_id.clone(), document);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<(), StateError> {
        self.lock().remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Intent;
    use assert_matches::assert_matches;
    use infraflow_cloud::{Network, RoutingMode};
    use tempfile::tempdir;

    fn step(mtu: Option<u32>) -> Step {
        Step::ensure(
            "network/net-1".into(),
            ResourceRef::global(ResourceKind::Network, "proj", "shoot-net-1"),
            BTreeSet::new(),
            Intent::Network(Network {
                name: "shoot-net-1".into(),
                routing_mode: RoutingMode::Regional,
                mtu,
                owner: Some("shoot".into()),
                self_link: None,
            }),
        )
    }

    #[test]
    fn test_sync_resets_changed_definitions() {
        let mut state = FlowState::new("shoot");
        state.sync([&step(None)]);
        state.record_success("network/net-1", StepOutput::link(Some("link".into())), 2);

        // Same definition: untouched
        state.sync([&step(None)]);
        assert_eq!(state.status("network/net-1"), Some(StepStatus::Succeeded));
        assert_eq!(state.get("network/net-1").unwrap().attempts, 2);

        // Changed definition: pending again, previous result kept
        state.sync([&step(Some(1460))]);
        let record = state.get("network/net-1").unwrap();
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.result.is_some());
    }

    #[test]
    fn test_running_is_never_persisted() {
        let mut state = FlowState::new("shoot");
        state.sync([&step(None)]);
        state.mark_running("network/net-1");
        assert_eq!(state.status("network/net-1"), Some(StepStatus::Running));

        let loaded = FlowState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(loaded.status("network/net-1"), Some(StepStatus::Pending));
    }

    #[test]
    fn test_unknown_fields_and_defaults() {
        let json = r#"{
            "version": 1,
            "instanceId": "shoot",
            "futureField": {"x": 1},
            "steps": {
                "subnet/nodes": {
                    "kind": "subnet",
                    "target": {
                        "kind": "subnet", "name": "shoot-nodes", "project": "p", "region": "r"
                    },
                    "status": "running",
                    "somethingNew": true
                }
            }
        }"#;
        let state = FlowState::from_json(json).unwrap();
        let record = state.get("subnet/nodes").unwrap();
        assert_eq!(record.status, StepStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(!record.was_attempted());
    }

    #[test]
    fn test_unreadable_record_is_dropped() {
        let json = r#"{
            "version": 1,
            "instanceId": "shoot",
            "steps": {
                "network/net-1": {"kind": "network", "status": "succeeded", "attempts": 1},
                "subnet/nodes": {
                    "kind": "subnet",
                    "target": {
                        "kind": "subnet", "name": "shoot-nodes", "project": "p", "region": "r"
                    },
                    "status": "succeeded"
                }
            }
        }"#;
        let mut state = FlowState::from_json(json).unwrap();
        assert_eq!(state.status("subnet/nodes"), Some(StepStatus::Succeeded));
        assert!(!state.contains("network/net-1"));

        // Syncing brings the dropped step back as not yet run
        state.sync([&step(None)]);
        assert_eq!(state.status("network/net-1"), Some(StepStatus::Pending));
        assert!(!state.get("network/net-1").unwrap().was_attempted());
    }

    #[test]
    fn test_requeue_keeps_result() {
        let mut state = FlowState::new("shoot");
        state.sync([&step(None)]);
        state.requeue("network/net-1");
        assert_eq!(state.status("network/net-1"), Some(StepStatus::Pending));

        state.record_success("network/net-1", StepOutput::link(Some("link".into())), 1);
        state.requeue("network/net-1");
        let record = state.get("network/net-1").unwrap();
        assert_eq!(record.status, StepStatus::Pending);
        assert!(record.result.is_some());
        assert_eq!(record.attempts, 1);
    }

    #[test]
    fn test_newer_version_rejected() {
        let json = r#"{"version": 2, "instanceId": "shoot", "steps": {}}"#;
        assert_matches!(
            FlowState::from_json(json),
            Err(StateError::UnsupportedVersion {
                found: 2,
                supported: 1
            })
        );
    }

    #[tokio::test]
    async fn test_file_store_save_load() {
        let temp_dir = tempdir().unwrap();
        let store = FileStateStore::new(temp_dir.path().join("state"));

        assert!(store.load("shoot").await.unwrap().is_none());

        let mut state = FlowState::new("shoot");
        state.sync([&step(None)]);
        store.save(&state).await.unwrap();
        state.record_success("network/net-1", StepOutput::link(Some("link".into())), 1);
        store.save(&state).await.unwrap();

        let loaded = store.load("shoot").await.unwrap().unwrap();
        assert_eq!(loaded.status("network/net-1"), Some(StepStatus::Succeeded));
        assert!(temp_dir.path().join("state/shoot.json.backup").exists());
        assert!(!temp_dir.path().join("state/shoot.json.tmp").exists());

        store.delete("shoot").await.unwrap();
        assert!(store.load("shoot").await.unwrap().is_none());
        assert!(!temp_dir.path().join("state/shoot.json.backup").exists());
        // Deleting twice is fine
        store.delete("shoot").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_failures() {
        let store = MemoryStateStore::new();
        let state = FlowState::new("shoot");
        store.save(&state).await.unwrap();
        assert_eq!(store.saves(), 1);

        store.fail_saves(true);
        assert_matches!(store.save(&state).await, Err(StateError::Unavailable(_)));
        assert_eq!(store.saves(), 1);
    }
}
