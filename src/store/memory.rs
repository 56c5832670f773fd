//! In-memory key/value store.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use super::{KeyValueStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, StoreError> {
        let entries = self.entries.read();
        Ok(keys.iter().map(|k| entries.get(*k).cloned()).collect())
    }

    fn set_many(&self, values: &[(&str, Value)]) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        for (key, value) in values {
            entries.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
