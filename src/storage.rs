//! The `Storage` collaborator: a synchronous key/value interface the core uses to
//! persist `current_term`, `voted_for`, and `log`.
//!
//! The teacher never implemented this (its `ServerState` carried a
//! `// TODO: state and term must be persisted to disk`); this module is new,
//! built directly from the spec's three-operation KV contract.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::StorageError;

/// Keys the core persists under. No other keys are ever read or written.
pub const KEY_CURRENT_TERM: &str = "current_term";
pub const KEY_VOTED_FOR: &str = "voted_for";
pub const KEY_LOG: &str = "log";

/// A synchronous key/value store used to persist durable replica state.
///
/// Deliberately not `async`: a local KV put is expected to be fast, and keeping
/// this trait synchronous means `persist_to_storage` can be called while holding
/// the state mutex without an extra `spawn_blocking` hop.
pub trait Storage: Send + Sync {
    /// Whether this store already holds a previously persisted replica state.
    fn has_data(&self) -> bool;

    /// Fetch the raw bytes for `key`, if present.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Persist `value` under `key`.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
}

/// An in-memory `Storage` implementation, useful for tests and for embedders that
/// don't need durability across process restarts.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn has_data(&self) -> bool {
        !self.entries.lock().unwrap().is_empty()
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_has_no_data() {
        let store = MemoryStorage::new();
        assert!(!store.has_data());
        assert!(store.get(KEY_CURRENT_TERM).is_none());
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = MemoryStorage::new();
        store.set(KEY_CURRENT_TERM, vec![1, 2, 3]).unwrap();
        assert!(store.has_data());
        assert_eq!(store.get(KEY_CURRENT_TERM), Some(vec![1, 2, 3]));
        assert_eq!(store.get(KEY_VOTED_FOR), None);
    }
}
