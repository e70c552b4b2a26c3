//! Keyed state storage between batches.

use crate::error::{EngineError, Result};
use crate::types::KeyState;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Holds the authoritative state of every key between batches.
///
/// Implementations must never change a key's shard count once set.
pub trait KeyedStateStore: Send + Sync {
    /// Current state of a key.
    fn get(&self, key: &str) -> Option<KeyState>;

    /// Register a new key.
    fn insert(&self, key: &str, state: KeyState) -> Result<()>;

    /// Replace the state of an existing key.
    fn put(&self, key: &str, state: KeyState) -> Result<()>;

    /// Remove a key, returning its last state.
    fn remove(&self, key: &str) -> Option<KeyState>;

    /// All keys, sorted.
    fn keys(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the whole table, sorted by key.
    fn snapshot(&self) -> Vec<(String, KeyState)>;

    /// Replace the whole table.
    fn restore(&self, entries: Vec<(String, KeyState)>);
}

/// In-memory store backed by a sorted map.
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<BTreeMap<String, KeyState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyedStateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Option<KeyState> {
        self.states.read().get(key).cloned()
    }

    fn insert(&self, key: &str, state: KeyState) -> Result<()> {
        let mut states = self.states.write();
        if states.contains_key(key) {
            return Err(EngineError::KeyExists(key.to_string()));
        }
        states.insert(key.to_string(), state);
        Ok(())
    }

    fn put(&self, key: &str, state: KeyState) -> Result<()> {
        let mut states = self.states.write();
        let current = states
            .get_mut(key)
            .ok_or_else(|| EngineError::KeyNotFound(key.to_string()))?;

        if current.is_sharded() != state.is_sharded()
            || current.shard_count() != state.shard_count()
        {
            return Err(EngineError::AlreadySplit {
                key: key.to_string(),
                existing: current.shard_count(),
                requested: state.shard_count(),
            });
        }

        *current = state;
        Ok(())
    }

    fn remove(&self, key: &str) -> Option<KeyState> {
        self.states.write().remove(key)
    }

    fn keys(&self) -> Vec<String> {
        self.states.read().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.states.read().len()
    }

    fn snapshot(&self) -> Vec<(String, KeyState)> {
        self.states
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn restore(&self, entries: Vec<(String, KeyState)>) {
        *self.states.write() = entries.into_iter().collect();
    }
}
