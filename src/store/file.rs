//! File-backed key/value store.
//!
//! One JSON object per file. Reads always go to disk because another process
//! may have written since the last read. Writes go to a sibling temp file that
//! is synced and renamed over the target, so readers never see a torn object.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{KeyValueStore, StoreError};

pub struct FileKeyValueStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Map<String, Value>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::Corrupt(format!(
                "{:?} does not contain a JSON object",
                self.path
            ))),
            Err(e) => Err(StoreError::Corrupt(format!("{:?}: {}", self.path, e))),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
    }

    fn replace(&self, map: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_vec_pretty(map)
            .map_err(|e| StoreError::Corrupt(format!("serialize: {}", e)))?;

        let tmp = self.tmp_path();
        let written = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&content)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                log::warn!("Failed to remove temp file {:?}: {}", tmp, cleanup);
            }
            return Err(e.into());
        }

        log::debug!("Store {:?} written ({} keys)", self.path, map.len());
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, StoreError> {
        let map = self.load()?;
        Ok(keys.iter().map(|k| map.get(*k).cloned()).collect())
    }

    fn set_many(&self, entries: &[(&str, Value)]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut map = self.load()?;
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        self.replace(&map)
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut map = self.load()?;
        let before = map.len();
        for key in keys {
            map.remove(*key);
        }
        if map.len() == before && !self.path.exists() {
            return Ok(());
        }
        self.replace(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path().join("nested").join("kv.json"));

        assert_eq!(store.get("anything").unwrap(), None);
        // Removing from a store that was never written creates nothing
        store.remove_many(&["anything"]).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn writes_are_visible_to_a_second_handle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.json");
        let writer = FileKeyValueStore::new(&path);
        let reader = FileKeyValueStore::new(&path);

        writer
            .set_many(&[("lat", json!(48.8566)), ("lon", json!(2.3522))])
            .unwrap();

        assert_eq!(
            reader.get_many(&["lat", "lon"]).unwrap(),
            vec![Some(json!(48.8566)), Some(json!(2.3522))]
        );

        writer.remove_many(&["lat"]).unwrap();
        assert_eq!(reader.get("lat").unwrap(), None);
        assert_eq!(reader.get("lon").unwrap(), Some(json!(2.3522)));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path().join("kv.json"));
        store.set_many(&[("k", json!("v"))]).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["kv.json".to_string()]);
    }

    #[test]
    fn non_object_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kv.json");
        fs::write(&path, "[1, 2, 3]").unwrap();

        let store = FileKeyValueStore::new(&path);
        assert!(matches!(store.get("k"), Err(StoreError::Corrupt(_))));
        assert!(matches!(
            store.set_many(&[("k", json!(1))]),
            Err(StoreError::Corrupt(_))
        ));
        // The corrupt file is left for inspection, not overwritten
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1, 2, 3]");
    }

    #[test]
    fn floats_round_trip_exactly() {
        let dir = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(dir.path().join("kv.json"));
        let values = [0.1 + 0.2, -33.868_819_999_999_99, 179.999_999_999_999_97, f64::MIN_POSITIVE];

        for v in values {
            store.set_many(&[("v", json!(v))]).unwrap();
            let back = store.get("v").unwrap().and_then(|v| v.as_f64()).unwrap();
            assert_eq!(back.to_bits(), v.to_bits());
        }
    }
}
