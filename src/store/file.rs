//! JSON-file-backed store implementations.
//!
//! Each store is a single pretty-printed JSON file rewritten after every
//! mutation. The record store re-reads its file on every call. I/O failures surface as
//! `StoreError::Unavailable` so a load cycle backs off instead of blaming a
//! plugin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    normalize_key, PluginRecord, RecordStore, ScheduleEntry, ScheduleStore, StoreError,
};

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StoreError> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        StoreError::Unavailable(format!("Failed to read {}: {}", path.display(), e))
    })?;

    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_json::from_str(&content)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StoreError::Unavailable(format!(
                "Failed to create directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Corrupt(format!("Failed to serialize store: {}", e)))?;

    std::fs::write(path, json).map_err(|e| {
        StoreError::Unavailable(format!("Failed to write {}: {}", path.display(), e))
    })
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("store lock poisoned".into())
}

/// Record store persisted to a JSON file keyed by slug.
///
/// The file is the source of truth: every call re-reads it under the lock,
/// so changes made by another process (`plughost enable`) are seen and
/// never overwritten with a stale copy. Nothing is kept in memory, so a
/// failed write leaves no trace.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRecordStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let _: BTreeMap<String, PluginRecord> = read_json(&path)?;
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, PluginRecord>, StoreError> {
        read_json(&self.path)
    }
}

impl RecordStore for FileRecordStore {
    fn get_or_create(
        &self,
        key: &str,
        name: &str,
        default_active: bool,
    ) -> Result<PluginRecord, StoreError> {
        let key = normalize_key(key);
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut records = self.read()?;

        if let Some(record) = records.get(&key) {
            return Ok(record.clone());
        }

        let id = records.values().map(|r| r.id).max().unwrap_or(0) + 1;
        let record = PluginRecord {
            id,
            key: key.clone(),
            name: name.to_string(),
            active: default_active,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        records.insert(key, record.clone());
        write_json(&self.path, &records)?;
        Ok(record)
    }

    fn set_active(&self, key: &str, active: bool) -> Result<(), StoreError> {
        let key = normalize_key(key);
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut records = self.read()?;
        match records.get_mut(&key) {
            Some(record) => record.active = active,
            None => return Err(StoreError::NotFound(key)),
        }
        write_json(&self.path, &records)
    }

    fn list(&self) -> Result<Vec<PluginRecord>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let records = self.read()?;
        let mut out: Vec<PluginRecord> = records.into_values().collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }
}

/// Schedule store persisted to a JSON file keyed by entry name.
#[derive(Debug)]
pub struct FileScheduleStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ScheduleEntry>>,
}

impl FileScheduleStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = read_json(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }
}

impl ScheduleStore for FileScheduleStore {
    fn upsert(&self, entry: ScheduleEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        if entries.get(&entry.name) == Some(&entry) {
            return Ok(());
        }
        entries.insert(entry.name.clone(), entry);
        write_json(&self.path, &*entries)
    }

    fn names_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, names: &[String]) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        let removed = names
            .iter()
            .filter(|name| entries.remove(name.as_str()).is_some())
            .count();
        if removed > 0 {
            write_json(&self.path, &*entries)?;
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.values().cloned().collect())
    }
}
