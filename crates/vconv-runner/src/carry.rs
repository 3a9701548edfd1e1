//! Carry store: artifact facts threaded between stages of one task.
//!
//! The control plane has no schema for local file paths, so the task
//! entity never carries them. This store is the single source of truth
//! for intermediate artifacts inside the runner; the service creates an
//! entry when a task is accepted and removes it on terminal transitions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Facts accumulated for one task as stages complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarryEntry {
    pub downloaded_file_path: Option<PathBuf>,
    pub converted_file_path: Option<PathBuf>,
    /// Media duration of the converted output, seconds
    pub converted_duration: Option<f64>,
    /// Solved video bitrate of the converted output, bits/second
    pub converted_bitrate: Option<u64>,
}

/// Mutex-guarded map from task id to its carry entry.
#[derive(Debug, Default)]
pub struct CarryStore {
    entries: Mutex<HashMap<String, CarryEntry>>,
}

impl CarryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry if absent. Idempotent.
    pub fn insert(&self, task_id: &str) {
        self.entries
            .lock()
            .expect("carry store poisoned")
            .entry(task_id.to_string())
            .or_default();
    }

    /// Record the downloaded source path, merging into any existing entry.
    pub fn set_downloaded(&self, task_id: &str, path: PathBuf) {
        let mut entries = self.entries.lock().expect("carry store poisoned");
        entries
            .entry(task_id.to_string())
            .or_default()
            .downloaded_file_path = Some(path);
    }

    /// Record the converted output and its media facts.
    pub fn set_converted(&self, task_id: &str, path: PathBuf, duration: f64, bitrate: u64) {
        let mut entries = self.entries.lock().expect("carry store poisoned");
        let entry = entries.entry(task_id.to_string()).or_default();
        entry.converted_file_path = Some(path);
        entry.converted_duration = Some(duration);
        entry.converted_bitrate = Some(bitrate);
    }

    /// Snapshot the entry for a task.
    pub fn get(&self, task_id: &str) -> Option<CarryEntry> {
        self.entries
            .lock()
            .expect("carry store poisoned")
            .get(task_id)
            .cloned()
    }

    /// Remove and return the entry on a terminal transition.
    pub fn remove(&self, task_id: &str) -> Option<CarryEntry> {
        self.entries
            .lock()
            .expect("carry store poisoned")
            .remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("carry store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let store = CarryStore::new();
        store.insert("t1");
        store.set_downloaded("t1", PathBuf::from("/tmp/t1/source.mp4"));
        store.insert("t1");

        let entry = store.get("t1").unwrap();
        assert_eq!(
            entry.downloaded_file_path.as_deref(),
            Some(std::path::Path::new("/tmp/t1/source.mp4"))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_set_merges_keys() {
        let store = CarryStore::new();
        store.insert("t1");
        store.set_downloaded("t1", PathBuf::from("/tmp/t1/source.mp4"));
        store.set_converted("t1", PathBuf::from("/tmp/t1_converted.mp4"), 12.5, 900_000);

        let entry = store.get("t1").unwrap();
        assert!(entry.downloaded_file_path.is_some());
        assert!(entry.converted_file_path.is_some());
        assert_eq!(entry.converted_duration, Some(12.5));
        assert_eq!(entry.converted_bitrate, Some(900_000));
    }

    #[test]
    fn test_remove_clears_entry() {
        let store = CarryStore::new();
        store.insert("t1");
        assert!(store.remove("t1").is_some());
        assert!(store.get("t1").is_none());
        assert!(store.remove("t1").is_none());
        assert!(store.is_empty());
    }
}
