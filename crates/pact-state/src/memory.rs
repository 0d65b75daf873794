//! In-memory fake for the storage traits (testing and `--no-persist` runs)
//!
//! Provides `MemoryStore` and `MemoryStateBase` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::kv::{KvStore, StateBase, StateDb, StoreResult};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory logical database backed by a `HashMap<key, value>`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries. Test helper.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when no entries are stored. Test helper.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(key);
        Ok(())
    }

    async fn has(&self, key: &[u8]) -> StoreResult<bool> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.contains_key(key))
    }

    async fn scan(&self) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    async fn retain(
        &self,
        keep: &(dyn for<'a, 'b> Fn(&'a [u8], &'b [u8]) -> bool + Send + Sync),
    ) -> StoreResult<usize> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|k, v| keep(k, v));
        Ok(before - entries.len())
    }
}

// ---------------------------------------------------------------------------
// MemoryStateBase
// ---------------------------------------------------------------------------

/// In-memory backend mapping each [`StateDb`] to its own [`MemoryStore`].
#[derive(Debug, Default)]
pub struct MemoryStateBase {
    stores: Mutex<HashMap<StateDb, Arc<MemoryStore>>>,
}

impl MemoryStateBase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBase for MemoryStateBase {
    async fn open(&self, db: StateDb) -> StoreResult<Arc<dyn KvStore>> {
        let mut stores = self.stores.lock().unwrap();
        let store = stores
            .entry(db)
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = MemoryStore::new();
        store.put(b"alpha", b"one").await.unwrap();
        assert_eq!(store.get(b"alpha").await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get(b"beta").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_replaces_previous_value() {
        let store = MemoryStore::new();
        store.put(b"alpha", b"one").await.unwrap();
        store.put(b"alpha", b"two").await.unwrap();
        assert_eq!(store.get(b"alpha").await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.put(b"alpha", b"one").await.unwrap();
        store.delete(b"alpha").await.unwrap();
        store.delete(b"alpha").await.unwrap();
        assert!(!store.has(b"alpha").await.unwrap());
    }

    #[tokio::test]
    async fn test_retain_deletes_rejected_entries() {
        let store = MemoryStore::new();
        store.put(b"keep.1", b"x").await.unwrap();
        store.put(b"drop.1", b"x").await.unwrap();
        store.put(b"drop.2", b"x").await.unwrap();

        let deleted = store
            .retain(&|k: &[u8], _v: &[u8]| k.starts_with(b"keep."))
            .await
            .unwrap();

        assert_eq!(deleted, 2);
        assert!(store.has(b"keep.1").await.unwrap());
        assert!(!store.has(b"drop.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_base_returns_same_keyspace_per_id() {
        let base = MemoryStateBase::new();
        let a = base.open(StateDb::Locks).await.unwrap();
        let b = base.open(StateDb::Locks).await.unwrap();
        a.put(b"shared", b"yes").await.unwrap();
        assert_eq!(b.get(b"shared").await.unwrap(), Some(b"yes".to_vec()));

        let other = base.open(StateDb::State).await.unwrap();
        assert_eq!(other.get(b"shared").await.unwrap(), None);
    }
}
