//! State Store (C8): on-disk per-container state directory.
//!
//! Layout: `<state_root>/<id>/record.json`, `<state_root>/<id>/lock`, optional
//! `<state_root>/<id>/pid`. Writes use write-then-rename for atomicity; reads tolerate
//! absent-or-partial files by retrying once after a short sleep.

mod lock;

pub use lock::ContainerLock;

use crate::error::StateError;
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
/// The backend substrate a container was created against. Recorded at create time and sticky
/// for the container's lifetime regardless of later `--runtime` flags.
pub enum BackendTag {
    OciLib,
    Lxc,
    Vm,
}

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
/// Possible container record statuses.
pub enum Status {
    Creating,
    Created,
    Running,
    Paused,
    Stopping,
    Stopped,
    Deleted,
}

#[derive(Clone, Debug, Serialize, Deserialize, CopyGetters, Getters, Setters)]
/// A persisted container record, one per id.
pub struct Record {
    #[getset(get = "pub")]
    id: String,

    #[getset(get = "pub")]
    bundle_path: PathBuf,

    #[getset(get_copy = "pub", set = "pub")]
    backend_tag: BackendTag,

    #[getset(get_copy = "pub", set = "pub")]
    status: Status,

    #[getset(get_copy = "pub", set = "pub")]
    pid: i64,

    #[getset(get_copy = "pub")]
    created_at: i64,

    #[getset(get_copy = "pub", set = "pub")]
    exit_code: i32,

    #[getset(get = "pub", set = "pub")]
    annotations: std::collections::HashMap<String, String>,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        bundle_path: impl Into<PathBuf>,
        backend_tag: BackendTag,
        created_at: i64,
        annotations: std::collections::HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            bundle_path: bundle_path.into(),
            backend_tag,
            status: Status::Creating,
            pid: 0,
            created_at,
            exit_code: -1,
            annotations,
        }
    }
}

/// The on-disk state root. One `Store` per invocation.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("record.json")
    }

    fn pid_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("pid")
    }

    /// Acquires the exclusive per-id lock for the duration of a state-mutating operation.
    pub fn lock(&self, id: &str) -> Result<ContainerLock, StateError> {
        fs::create_dir_all(self.container_dir(id))
            .map_err(|e| StateError::LockContention(format!("{id}: {e}")))?;
        ContainerLock::acquire(self.container_dir(id).join("lock"))
            .map_err(|_| StateError::LockContention(id.to_string()))
    }

    /// Persists a record atomically via write-then-rename.
    pub fn put(&self, record: &Record) -> io::Result<()> {
        let dir = self.container_dir(&record.id);
        fs::create_dir_all(&dir)?;
        let final_path = self.record_path(&record.id);
        let tmp_path = dir.join(".record.json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Reads a record, retrying once after a short sleep if the file is absent or partial (a
    /// concurrent writer's rename may not yet be visible).
    pub fn get(&self, id: &str) -> Result<Record, StateError> {
        self.try_read(id)
            .or_else(|| {
                thread::sleep(Duration::from_millis(20));
                self.try_read(id)
            })
            .ok_or_else(|| StateError::RecordMissing(id.to_string()))
    }

    fn try_read(&self, id: &str) -> Option<Record> {
        let bytes = fs::read(self.record_path(id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Lists all persisted records beneath the state root.
    pub fn list(&self) -> io::Result<Vec<Record>> {
        let mut records = Vec::new();
        if !self.root.exists() {
            return Ok(records);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            if let Ok(record) = self.get(&id) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Removes the entire per-container directory. Called on delete.
    pub fn remove(&self, id: &str) -> io::Result<()> {
        let dir = self.container_dir(id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn write_pid(&self, id: &str, pid: i64) -> io::Result<()> {
        fs::write(self.pid_path(id), pid.to_string())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn sample_record(id: &str) -> Record {
        Record::new(id, "/bundles/a", BackendTag::OciLib, 0, HashMap::new())
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let record = sample_record("c1");
        store.put(&record).unwrap();

        let fetched = store.get("c1").unwrap();
        assert_eq!(fetched.id(), "c1");
        assert_eq!(fetched.status(), Status::Creating);
    }

    #[test]
    fn get_missing_record_errors() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        assert!(matches!(store.get("missing"), Err(StateError::RecordMissing(_))));
    }

    #[test]
    fn list_returns_all_records_until_delete() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        store.put(&sample_record("a")).unwrap();
        store.put(&sample_record("b")).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids.len(), 2);

        store.remove("a").unwrap();
        let ids: Vec<_> = store.list().unwrap().into_iter().map(|r| r.id().clone()).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn delete_leaves_no_files_for_id() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        store.put(&sample_record("c")).unwrap();
        store.write_pid("c", 1234).unwrap();

        store.remove("c").unwrap();
        assert!(!dir.path().join("c").exists());
    }

    #[test]
    fn lock_is_exclusive_per_id() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(dir.path());
        let _lock = store.lock("c").unwrap();
        assert!(store.lock("c").is_err());
    }
}
