//! Persisted stores used by the plugin registry.
//!
//! Two stores live outside the registry and are reached through traits:
//!
//! - [`RecordStore`]: one [`PluginRecord`] per plugin slug, the source of
//!   truth for activation state. The registry only ever creates records and
//!   flips their `active` flag.
//! - [`ScheduleStore`]: recurring task entries. Plugin-owned entries are
//!   named `plugin.<slug>.<task>`.
//!
//! Memory-backed and JSON-file-backed implementations are provided.

mod file;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::{FileRecordStore, FileScheduleStore};
pub use memory::{MemoryRecordStore, MemoryScheduleStore};

/// Name prefix of every schedule entry owned by a plugin.
pub const PLUGIN_TASK_PREFIX: &str = "plugin.";

/// Errors raised by the persisted stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached (missing table, unreadable file).
    /// Aborts a load cycle without blaming any plugin.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The addressed record or entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored data could not be decoded.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

/// Persisted activation record for one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Numeric record id, stable for the lifetime of the store.
    pub id: u64,
    /// Plugin slug, always lowercase.
    pub key: String,
    /// Display name at creation time.
    pub name: String,
    /// Whether the plugin may be instantiated.
    pub active: bool,
    /// Opaque metadata owned by the host.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Normalize a record key for case-insensitive lookup.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

/// Store of plugin activation records.
#[cfg_attr(test, mockall::automock)]
pub trait RecordStore: Send + Sync {
    /// Fetch the record for `key`, creating it with `default_active` if absent.
    fn get_or_create(
        &self,
        key: &str,
        name: &str,
        default_active: bool,
    ) -> Result<PluginRecord, StoreError>;

    /// Persist a new `active` flag for `key`.
    fn set_active(&self, key: &str, active: bool) -> Result<(), StoreError>;

    /// All records ordered by id.
    fn list(&self) -> Result<Vec<PluginRecord>, StoreError>;
}

/// Recurrence of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Every `minutes` minutes; requires `minutes`.
    Minutes,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
    /// Run a single time.
    Once,
}

/// What a schedule entry runs when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskTarget {
    /// A method of a loaded plugin, invoked through
    /// `Registry::call_plugin_function`.
    PluginMethod { slug: String, method: String },
    /// A host function addressed by dotted path.
    Function { path: String },
}

/// One entry of the schedule store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub target: TaskTarget,
    pub kind: ScheduleKind,
    #[serde(default)]
    pub minutes: Option<u32>,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

/// Store of recurring task entries.
pub trait ScheduleStore: Send + Sync {
    /// Insert or replace the entry with the same name.
    fn upsert(&self, entry: ScheduleEntry) -> Result<(), StoreError>;

    /// Names of all entries starting with `prefix`.
    fn names_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Delete the named entries, returning how many existed.
    fn delete(&self, names: &[String]) -> Result<usize, StoreError>;

    /// All entries ordered by name.
    fn list(&self) -> Result<Vec<ScheduleEntry>, StoreError>;
}
