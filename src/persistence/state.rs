//! Current-run pointers, one JSON record per running instance

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::core::{InstanceState, ManagerError, Result};

type StateMap = BTreeMap<String, InstanceState>;

/// Durable record of which instances are running and which run owns them.
///
/// The file is re-read on every call so that separate manager processes
/// sharing a data directory observe each other's writes.
pub struct InstanceStateStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl InstanceStateStore {
    /// Open the store, resetting a damaged file to empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            path,
            guard: Mutex::new(()),
        };
        {
            let _lock = store.lock()?;
            let records = store.load()?;
            debug!(
                "State store at {:?} holds {} record(s)",
                store.path,
                records.len()
            );
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.guard
            .lock()
            .map_err(|_| ManagerError::LockPoisoned("state store"))
    }

    /// Read all records, replacing a corrupted file with an empty one
    fn load(&self) -> Result<StateMap> {
        match self.read_records() {
            Ok(records) => Ok(records),
            Err(ManagerError::StoreCorrupted { path, reason }) => {
                warn!("{:?} is corrupted ({}), resetting state", path, reason);
                let empty = StateMap::new();
                self.save(&empty)?;
                Ok(empty)
            }
            Err(e) => Err(e),
        }
    }

    fn read_records(&self) -> Result<StateMap> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateMap::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(StateMap::new());
        }

        serde_json::from_str(&text).map_err(|e| ManagerError::StoreCorrupted {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn save(&self, records: &StateMap) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, records)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Insert or overwrite the state of an instance
    pub fn update(&self, state: InstanceState) -> Result<()> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        debug!(
            "Saving state for '{}' (pid {}, run #{})",
            state.instance_name, state.pid, state.start_id
        );
        records.insert(state.instance_name.clone(), state);
        self.save(&records)
    }

    pub fn get(&self, name: &str) -> Result<Option<InstanceState>> {
        let _lock = self.lock()?;
        Ok(self.load()?.remove(name))
    }

    /// Remove the state of an instance. Returns the removed record, if any.
    pub fn remove(&self, name: &str) -> Result<Option<InstanceState>> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let removed = records.remove(name);
        if removed.is_some() {
            self.save(&records)?;
            debug!("Removed state for '{}'", name);
        }
        Ok(removed)
    }

    /// Remove the state only if it still belongs to `start_id`
    pub fn remove_if_run(&self, name: &str, start_id: i64) -> Result<bool> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        match records.get(name) {
            Some(state) if state.start_id == start_id => {
                records.remove(name);
                self.save(&records)?;
                debug!("Removed state for '{}' (run #{})", name, start_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// All recorded states, ordered by instance name
    pub fn all(&self) -> Result<Vec<InstanceState>> {
        let _lock = self.lock()?;
        Ok(self.load()?.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn state(name: &str, pid: u32, start_id: i64) -> InstanceState {
        InstanceState {
            instance_name: name.to_string(),
            pid,
            start_id,
            start_time: Utc::now(),
            process_started_at: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_update_get_remove() {
        let temp = tempdir().unwrap();
        let store = InstanceStateStore::open(temp.path().join("state.json")).unwrap();

        assert!(store.get("lobby").unwrap().is_none());
        store.update(state("lobby", 100, 1)).unwrap();
        assert_eq!(store.get("lobby").unwrap().unwrap().pid, 100);

        // Last write wins
        store.update(state("lobby", 200, 2)).unwrap();
        let current = store.get("lobby").unwrap().unwrap();
        assert_eq!((current.pid, current.start_id), (200, 2));

        assert!(store.remove("lobby").unwrap().is_some());
        assert!(store.get("lobby").unwrap().is_none());
        assert!(store.remove("lobby").unwrap().is_none());
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        {
            let store = InstanceStateStore::open(&path).unwrap();
            store.update(state("survival", 321, 7)).unwrap();
            store.update(state("creative", 654, 1)).unwrap();
        }

        let reopened = InstanceStateStore::open(&path).unwrap();
        let all = reopened.all().unwrap();
        let names: Vec<&str> = all.iter().map(|s| s.instance_name.as_str()).collect();
        assert_eq!(names, vec!["creative", "survival"]);
        assert_eq!(reopened.get("survival").unwrap().unwrap().start_id, 7);
    }

    #[test]
    fn test_corrupted_file_is_reset() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = InstanceStateStore::open(&path).unwrap();
        assert!(store.all().unwrap().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");

        store.update(state("lobby", 1, 1)).unwrap();
        assert!(store.get("lobby").unwrap().is_some());
    }

    #[test]
    fn test_remove_if_run_ignores_newer_runs() {
        let temp = tempdir().unwrap();
        let store = InstanceStateStore::open(temp.path().join("state.json")).unwrap();
        store.update(state("lobby", 10, 3)).unwrap();

        assert!(!store.remove_if_run("lobby", 2).unwrap());
        assert!(store.get("lobby").unwrap().is_some());
        assert!(store.remove_if_run("lobby", 3).unwrap());
        assert!(store.get("lobby").unwrap().is_none());
    }

    #[test]
    fn test_writes_are_visible_to_other_handles() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        let first = InstanceStateStore::open(&path).unwrap();
        let second = InstanceStateStore::open(&path).unwrap();

        first.update(state("lobby", 55, 1)).unwrap();
        assert_eq!(second.get("lobby").unwrap().unwrap().pid, 55);
        second.remove("lobby").unwrap();
        assert!(first.get("lobby").unwrap().is_none());
    }
}
