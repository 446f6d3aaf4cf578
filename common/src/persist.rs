use std::collections::HashMap;

use thiserror::Error;

pub const LOCK_NAMESPACE: &str = "door_lock";
pub const LOCKED_KEY: &str = "locked";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Durable key-value storage for named booleans.
pub trait LockStore: Send {
    /// Returns `default` when the key is missing or unreadable.
    fn get_bool(&self, key: &str, default: bool) -> bool;

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    values: HashMap<String, bool>,
    writes: usize,
}

impl MemoryLockStore {
    pub fn with_value(key: &str, value: bool) -> Self {
        let mut store = Self::default();
        store.values.insert(key.to_string(), value);
        store
    }

    /// Number of successful `put_bool` calls.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl LockStore for MemoryLockStore {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).copied().unwrap_or(default)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        self.writes += 1;
        Ok(())
    }
}

impl<S: LockStore + ?Sized> LockStore for Box<S> {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        (**self).get_bool(key, default)
    }

    fn put_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        (**self).put_bool(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_yields_default() {
        let store = MemoryLockStore::default();
        assert!(store.get_bool(LOCKED_KEY, true));
        assert!(!store.get_bool(LOCKED_KEY, false));
    }

    #[test]
    fn put_then_get_round_trips_and_counts_writes() {
        let mut store = MemoryLockStore::with_value(LOCKED_KEY, true);
        assert!(store.get_bool(LOCKED_KEY, false));

        store.put_bool(LOCKED_KEY, false).unwrap();
        assert!(!store.get_bool(LOCKED_KEY, true));
        assert_eq!(store.writes(), 1);
    }
}
