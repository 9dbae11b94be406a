//! In-memory store implementations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;

use super::{
    normalize_key, PluginRecord, RecordStore, ScheduleEntry, ScheduleStore, StoreError,
};

fn poisoned(what: &str) -> StoreError {
    StoreError::Unavailable(format!("{} lock poisoned", what))
}

#[derive(Debug, Default)]
struct RecordTable {
    records: BTreeMap<String, PluginRecord>,
    next_id: u64,
}

/// Record store held in process memory.
///
/// `set_available(false)` simulates an unreachable backing store (for
/// example a database that has not been migrated yet).
#[derive(Debug)]
pub struct MemoryRecordStore {
    table: Mutex<RecordTable>,
    available: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RecordTable::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle whether every operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Read a record without creating it.
    pub fn get(&self, key: &str) -> Option<PluginRecord> {
        let table = self.table.lock().ok()?;
        table.records.get(&normalize_key(key)).cloned()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("record store offline".into()))
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_or_create(
        &self,
        key: &str,
        name: &str,
        default_active: bool,
    ) -> Result<PluginRecord, StoreError> {
        self.check()?;
        let key = normalize_key(key);
        let mut table = self.table.lock().map_err(|_| poisoned("record"))?;

        if let Some(record) = table.records.get(&key) {
            return Ok(record.clone());
        }

        table.next_id += 1;
        let record = PluginRecord {
            id: table.next_id,
            key: key.clone(),
            name: name.to_string(),
            active: default_active,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        };
        table.records.insert(key, record.clone());
        Ok(record)
    }

    fn set_active(&self, key: &str, active: bool) -> Result<(), StoreError> {
        self.check()?;
        let key = normalize_key(key);
        let mut table = self.table.lock().map_err(|_| poisoned("record"))?;
        let record = table
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        record.active = active;
        Ok(())
    }

    fn list(&self) -> Result<Vec<PluginRecord>, StoreError> {
        self.check()?;
        let table = self.table.lock().map_err(|_| poisoned("record"))?;
        let mut records: Vec<PluginRecord> = table.records.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }
}

/// Schedule store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    entries: Mutex<BTreeMap<String, ScheduleEntry>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn upsert(&self, entry: ScheduleEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("schedule"))?;
        entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    fn names_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| poisoned("schedule"))?;
        Ok(entries
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn delete(&self, names: &[String]) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned("schedule"))?;
        Ok(names
            .iter()
            .filter(|name| entries.remove(name.as_str()).is_some())
            .count())
    }

    fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| poisoned("schedule"))?;
        Ok(entries.values().cloned().collect())
    }
}
