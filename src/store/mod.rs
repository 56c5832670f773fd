//! Scoped key/value storage shared between the configuration surface and the
//! tunnel process.
//!
//! - file.rs: JSON file per scope, replaced atomically on every write
//! - memory.rs: in-process map with the same semantics
//!
//! A write of several keys is one unit: a reader observes either all of it or
//! none of it.

pub mod file;
pub mod memory;

pub use file::FileKeyValueStore;
pub use memory::MemoryKeyValueStore;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// Key/value repository with snapshot reads and atomic multi-key writes.
pub trait KeyValueStore: Send + Sync {
    /// Read several keys from one consistent snapshot, in the order given.
    fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Value>>, StoreError>;

    /// Write all entries as a single unit.
    fn set_many(&self, entries: &[(&str, Value)]) -> Result<(), StoreError>;

    /// Remove all keys as a single unit. Missing keys are ignored.
    fn remove_many(&self, keys: &[&str]) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_many(&[key])?.pop().flatten())
    }
}
