//! Append-only log of plugin failures, grouped by bucket.
//!
//! Buckets name the stage that failed (`discovery`, `init`, `schedule`,
//! `app`). Entries are never removed; the log lives as long as the registry
//! that owns it, across any number of reloads.

use std::collections::BTreeMap;

use serde::Serialize;

pub const DISCOVERY: &str = "discovery";
pub const INIT: &str = "init";
pub const SCHEDULE: &str = "schedule";
pub const APP: &str = "app";

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    /// Module identity (or path) the failure is attributed to.
    pub module: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorLog {
    buckets: BTreeMap<String, Vec<ErrorEntry>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bucket: &str, module: impl Into<String>, message: impl Into<String>) {
        self.buckets
            .entry(bucket.to_string())
            .or_default()
            .push(ErrorEntry {
                module: module.into(),
                message: message.into(),
            });
    }

    /// Entries of one bucket, oldest first.
    pub fn bucket(&self, bucket: &str) -> &[ErrorEntry] {
        self.buckets.get(bucket).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Entries attributed to `module` in `bucket`.
    pub fn for_module<'a>(&'a self, bucket: &str, module: &'a str) -> Vec<&'a ErrorEntry> {
        self.bucket(bucket)
            .iter()
            .filter(|e| e.module == module)
            .collect()
    }

    pub fn buckets(&self) -> impl Iterator<Item = (&str, &[ErrorEntry])> {
        self.buckets.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every entry of `other`, preserving bucket order.
    pub fn extend(&mut self, other: ErrorLog) {
        for (bucket, entries) in other.buckets {
            self.buckets.entry(bucket).or_default().extend(entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read() {
        let mut log = ErrorLog::new();
        log.record(INIT, "dir:/p/broken", "constructor failed");
        log.record(INIT, "dir:/p/other", "boom");
        log.record(DISCOVERY, "dir:/p/bad", "bad json");

        assert_eq!(log.len(), 3);
        assert_eq!(log.bucket(INIT).len(), 2);
        assert_eq!(log.bucket(INIT)[0].module, "dir:/p/broken");
        assert_eq!(log.for_module(INIT, "dir:/p/other").len(), 1);
        assert!(log.bucket(APP).is_empty());
    }

    #[test]
    fn test_extend_keeps_order() {
        let mut log = ErrorLog::new();
        log.record(INIT, "a", "first");

        let mut more = ErrorLog::new();
        more.record(INIT, "b", "second");
        more.record(SCHEDULE, "c", "third");
        log.extend(more);

        let modules: Vec<&str> = log.bucket(INIT).iter().map(|e| e.module.as_str()).collect();
        assert_eq!(modules, vec!["a", "b"]);
        assert_eq!(log.buckets().count(), 2);
    }

    #[test]
    fn test_empty_log() {
        let log = ErrorLog::default();
        assert!(log.is_empty());
    }
}
