//! Persistence of finished sessions.
//!
//! Sessions live in a hierarchical store, one group per run keyed
//! `<date>/<time>` of the session start:
//!
//! ```text
//! 2025-02-18
//! └── 17:00:59
//!     ├── time_ms      (dataset, u64)
//!     ├── value        (dataset, f64)
//!     └── @started_at, @sample_interval_ms, @tare_applied, @<caller attributes>
//! ```
//!
//! Metadata goes into group attributes by default. [`MetadataForm::Datasets`]
//! writes it as one-element datasets instead, for readers that expect that layout.
//! Groups are never overwritten.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::{HorizonPolicy, SampleBuffer};
use crate::errors::{DriverError, Result};
use crate::frame::Sample;
use crate::session::{FinishedSession, SessionMetadata};

pub const TIME_DATASET: &str = "time_ms";
pub const VALUE_DATASET: &str = "value";

/// Names the recorder writes itself. Caller attributes may not use them.
pub const RESERVED_NAMES: [&str; 5] = [
    TIME_DATASET,
    VALUE_DATASET,
    "started_at",
    "sample_interval_ms",
    "tare_applied",
];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

// ============================================================================
// Store Model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Dataset {
    U64(Vec<u64>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Text(Vec<String>),
}

impl Dataset {
    pub fn len(&self) -> usize {
        match self {
            Dataset::U64(v) => v.len(),
            Dataset::F64(v) => v.len(),
            Dataset::Bool(v) => v.len(),
            Dataset::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Text(v) => f.write_str(v),
        }
    }
}

/// A node of the store: nested groups plus its own datasets and attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, Group>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub datasets: BTreeMap<String, Dataset>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl Group {
    fn get(&self, key: &str) -> Option<&Group> {
        segments(key).try_fold(self, |node, seg| node.groups.get(seg))
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Group> {
        segments(key).try_fold(self, |node, seg| node.groups.get_mut(seg))
    }

    /// Create `key`, including missing parents. Fails if the leaf exists.
    fn create(&mut self, key: &str) -> Result<()> {
        let segs: Vec<&str> = segments(key).collect();
        let Some((leaf, parents)) = segs.split_last() else {
            return Err(DriverError::Store(format!("invalid group key {key:?}")));
        };
        let parent = parents
            .iter()
            .fold(self, |node, seg| node.groups.entry(seg.to_string()).or_default());
        if parent.groups.contains_key(*leaf) {
            return Err(DriverError::DuplicateSession(key.to_string()));
        }
        parent.groups.insert(leaf.to_string(), Group::default());
        Ok(())
    }

    /// Remove `key`, then any ancestors it leaves empty. `false` if absent.
    fn remove(&mut self, key: &str) -> bool {
        let segs: Vec<&str> = segments(key).collect();
        self.remove_path(&segs)
    }

    fn remove_path(&mut self, segs: &[&str]) -> bool {
        match segs {
            [] => false,
            [leaf] => self.groups.remove(*leaf).is_some(),
            [head, rest @ ..] => {
                let Some(child) = self.groups.get_mut(*head) else {
                    return false;
                };
                let removed = child.remove_path(rest);
                if removed && child.is_empty() {
                    self.groups.remove(*head);
                }
                removed
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.datasets.is_empty() && self.attributes.is_empty()
    }

    /// Paths of all groups holding at least one dataset, in key order.
    fn leaf_keys(&self, prefix: &str, out: &mut Vec<String>) {
        for (name, child) in &self.groups {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            if !child.datasets.is_empty() {
                out.push(path.clone());
            }
            child.leaf_keys(&path, out);
        }
    }
}

fn segments(key: &str) -> impl Iterator<Item = &str> {
    key.split('/').filter(|s| !s.is_empty())
}

/// Handle to a group created in a [`SessionStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHandle(String);

impl GroupHandle {
    pub fn key(&self) -> &str {
        &self.0
    }
}

/// Hierarchical keyed storage.
pub trait SessionStore {
    /// Create a new group. Fails with [`DriverError::DuplicateSession`] when
    /// `key` already exists.
    fn create_group(&mut self, key: &str) -> Result<GroupHandle>;

    fn write_dataset(&mut self, group: &GroupHandle, name: &str, data: Dataset) -> Result<()>;

    fn write_attribute(&mut self, group: &GroupHandle, name: &str, value: AttrValue)
        -> Result<()>;

    fn group(&self, key: &str) -> Option<&Group>;

    /// Delete a group and everything under it.
    fn remove_group(&mut self, key: &str) -> Result<()>;

    /// Keys of all groups that hold datasets.
    fn session_keys(&self) -> Vec<String>;

    /// Make written data durable.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`SessionStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    root: Group,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    fn node_mut(&mut self, group: &GroupHandle) -> Result<&mut Group> {
        self.root
            .get_mut(group.key())
            .ok_or_else(|| DriverError::Store(format!("no group {:?}", group.key())))
    }
}

impl SessionStore for MemoryStore {
    fn create_group(&mut self, key: &str) -> Result<GroupHandle> {
        self.root.create(key)?;
        Ok(GroupHandle(segments(key).collect::<Vec<_>>().join("/")))
    }

    fn write_dataset(&mut self, group: &GroupHandle, name: &str, data: Dataset) -> Result<()> {
        let node = self.node_mut(group)?;
        if node.datasets.contains_key(name) {
            return Err(DriverError::Store(format!(
                "dataset {name:?} already exists in {}",
                group.key()
            )));
        }
        node.datasets.insert(name.to_string(), data);
        Ok(())
    }

    fn write_attribute(
        &mut self,
        group: &GroupHandle,
        name: &str,
        value: AttrValue,
    ) -> Result<()> {
        self.node_mut(group)?
            .attributes
            .insert(name.to_string(), value);
        Ok(())
    }

    fn group(&self, key: &str) -> Option<&Group> {
        self.root.get(key)
    }

    fn remove_group(&mut self, key: &str) -> Result<()> {
        if self.root.remove(key) {
            Ok(())
        } else {
            Err(DriverError::Store(format!("no group {key:?}")))
        }
    }

    fn session_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.root.leaf_keys("", &mut keys);
        keys
    }
}

/// [`SessionStore`] kept in a JSON document on disk. Changes are held in memory
/// until [`flush`](SessionStore::flush), which replaces the file atomically.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let root = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DriverError::Store(format!("{} is not a session store: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Group::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("opened session store {}", path.display());
        Ok(Self {
            path,
            inner: MemoryStore { root },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for JsonFileStore {
    fn create_group(&mut self, key: &str) -> Result<GroupHandle> {
        self.inner.create_group(key)
    }

    fn write_dataset(&mut self, group: &GroupHandle, name: &str, data: Dataset) -> Result<()> {
        self.inner.write_dataset(group, name, data)
    }

    fn write_attribute(
        &mut self,
        group: &GroupHandle,
        name: &str,
        value: AttrValue,
    ) -> Result<()> {
        self.inner.write_attribute(group, name, value)
    }

    fn group(&self, key: &str) -> Option<&Group> {
        self.inner.group(key)
    }

    fn remove_group(&mut self, key: &str) -> Result<()> {
        self.inner.remove_group(key)
    }

    fn session_keys(&self) -> Vec<String> {
        self.inner.session_keys()
    }

    fn flush(&mut self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self.inner.root())
            .map_err(|e| DriverError::Store(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// `<date>/<time>` of a session start, second resolution.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionKey {
    pub date: String,
    pub time: String,
}

impl SessionKey {
    pub fn from_datetime(at: &DateTime<Local>) -> Self {
        Self {
            date: at.format("%Y-%m-%d").to_string(),
            time: at.format("%H:%M:%S").to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataForm {
    #[default]
    Attributes,
    Datasets,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionRecorder {
    form: MetadataForm,
}

impl SessionRecorder {
    pub fn new(form: MetadataForm) -> Self {
        Self { form }
    }

    pub fn persist_finished(
        &self,
        session: &FinishedSession,
        store: &mut dyn SessionStore,
    ) -> Result<SessionKey> {
        self.persist(&session.buffer, &session.metadata, store)
    }

    /// Write one session. Either the whole group lands in the store or nothing
    /// does: reserved attribute names and existing keys are refused up front, and
    /// a failed write or flush removes the half-written group again.
    pub fn persist(
        &self,
        buffer: &SampleBuffer,
        metadata: &SessionMetadata,
        store: &mut dyn SessionStore,
    ) -> Result<SessionKey> {
        let fields = metadata_fields(metadata)?;
        let key = SessionKey::from_datetime(&metadata.started_at);
        let group = store.create_group(&key.to_string())?;

        if let Err(e) = self.write_session(buffer, fields, &group, store) {
            if let Err(cleanup) = store.remove_group(group.key()) {
                warn!("could not roll back {}: {cleanup}", group.key());
            }
            return Err(e);
        }
        info!("recorded {} samples as {key}", buffer.len());
        Ok(key)
    }

    fn write_session(
        &self,
        buffer: &SampleBuffer,
        fields: Vec<(String, AttrValue)>,
        group: &GroupHandle,
        store: &mut dyn SessionStore,
    ) -> Result<()> {
        store.write_dataset(group, TIME_DATASET, Dataset::U64(buffer.times_ms()))?;
        store.write_dataset(group, VALUE_DATASET, Dataset::F64(buffer.values()))?;
        for (name, value) in fields {
            match self.form {
                MetadataForm::Attributes => store.write_attribute(group, &name, value)?,
                MetadataForm::Datasets => {
                    store.write_dataset(group, &name, scalar_dataset(value))?
                }
            }
        }
        store.flush()
    }
}

fn metadata_fields(metadata: &SessionMetadata) -> Result<Vec<(String, AttrValue)>> {
    if let Some(name) = metadata.attributes.keys().find(|k| is_reserved_name(k)) {
        return Err(DriverError::Store(format!(
            "attribute name {name:?} is reserved"
        )));
    }
    let mut fields = vec![
        (
            "started_at".to_string(),
            AttrValue::Text(metadata.started_at.to_rfc3339()),
        ),
        (
            "sample_interval_ms".to_string(),
            AttrValue::Int(i64::from(metadata.sample_interval_ms)),
        ),
        (
            "tare_applied".to_string(),
            AttrValue::Bool(metadata.tare_applied),
        ),
    ];
    fields.extend(
        metadata
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), AttrValue::Text(v.clone()))),
    );
    Ok(fields)
}

fn scalar_dataset(value: AttrValue) -> Dataset {
    match value {
        AttrValue::Bool(v) => Dataset::Bool(vec![v]),
        AttrValue::Int(v) => Dataset::U64(vec![u64::try_from(v).unwrap_or(0)]),
        AttrValue::Float(v) => Dataset::F64(vec![v]),
        AttrValue::Text(v) => Dataset::Text(vec![v]),
    }
}

/// Read a recorded session back into a buffer for offline analysis.
pub fn load_buffer(
    store: &dyn SessionStore,
    key: &str,
    policy: HorizonPolicy,
) -> Result<SampleBuffer> {
    let group = store
        .group(key)
        .ok_or_else(|| DriverError::Store(format!("no session {key:?}")))?;
    let (Some(Dataset::U64(times)), Some(Dataset::F64(values))) = (
        group.datasets.get(TIME_DATASET),
        group.datasets.get(VALUE_DATASET),
    ) else {
        return Err(DriverError::Store(format!(
            "session {key:?} lacks {TIME_DATASET}/{VALUE_DATASET} datasets"
        )));
    };
    if times.len() != values.len() {
        return Err(DriverError::Store(format!(
            "session {key:?}: {} timestamps but {} values",
            times.len(),
            values.len()
        )));
    }
    SampleBuffer::from_samples(
        policy,
        times
            .iter()
            .zip(values)
            .map(|(&t, &v)| Sample::new(t, v)),
    )
}
