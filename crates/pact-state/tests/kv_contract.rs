//! Contract tests for the KvStore/StateBase traits.
//!
//! Any conforming backend must pass these; they run against both the
//! in-memory fake and the SurrealDB backend.

use std::sync::Arc;

use pact_state::{
    KvStore, LockRecord, MemoryStateBase, PersistPolicy, PersistRecord, StateBase, StateDb,
    SurrealStateBase,
};

async fn backends() -> Vec<(&'static str, Arc<dyn StateBase>)> {
    vec![
        ("memory", Arc::new(MemoryStateBase::new()) as Arc<dyn StateBase>),
        (
            "surreal",
            Arc::new(SurrealStateBase::memory().await.unwrap()) as Arc<dyn StateBase>,
        ),
    ]
}

#[tokio::test]
async fn get_after_put_returns_stored_bytes() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::State).await.unwrap();
        store.put(b"key", b"value").await.unwrap();
        assert_eq!(
            store.get(b"key").await.unwrap(),
            Some(b"value".to_vec()),
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn get_missing_key_is_none() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::State).await.unwrap();
        assert_eq!(store.get(b"absent").await.unwrap(), None, "backend {name}");
        assert!(!store.has(b"absent").await.unwrap(), "backend {name}");
    }
}

#[tokio::test]
async fn put_overwrites_previous_value() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::State).await.unwrap();
        store.put(b"key", b"one").await.unwrap();
        store.put(b"key", b"two").await.unwrap();
        assert_eq!(
            store.get(b"key").await.unwrap(),
            Some(b"two".to_vec()),
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn delete_then_get_is_none() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::State).await.unwrap();
        store.put(b"key", b"value").await.unwrap();
        store.delete(b"key").await.unwrap();
        assert_eq!(store.get(b"key").await.unwrap(), None, "backend {name}");
        // Deleting again is a no-op.
        store.delete(b"key").await.unwrap();
    }
}

#[tokio::test]
async fn binary_keys_and_values_survive() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::Locks).await.unwrap();
        let key = [0u8, 1, 2, 0xff, 0xfe];
        let record = LockRecord::new(777, -12345);
        store.put(&key, &record.to_bytes()).await.unwrap();

        let loaded = store.get(&key).await.unwrap().unwrap();
        assert_eq!(
            LockRecord::from_bytes(&loaded).unwrap(),
            record,
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn scan_returns_all_entries() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::State).await.unwrap();
        for i in 0u8..5 {
            store.put(&[i], &[i, i]).await.unwrap();
        }

        let mut entries = store.scan().await.unwrap();
        entries.sort();
        assert_eq!(entries.len(), 5, "backend {name}");
        assert_eq!(entries[0], (vec![0u8], vec![0u8, 0]), "backend {name}");
    }
}

#[tokio::test]
async fn retain_deletes_under_store_lock() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::Locks).await.unwrap();
        store.put(b"lock.a", b"x").await.unwrap();
        store.put(b"last.a", b"x").await.unwrap();
        store.put(b"lock.b", b"x").await.unwrap();

        let deleted = store
            .retain(&|k: &[u8], _v: &[u8]| k.starts_with(b"last."))
            .await
            .unwrap();
        assert_eq!(deleted, 2, "backend {name}");
        assert!(store.has(b"last.a").await.unwrap(), "backend {name}");
        assert!(!store.has(b"lock.a").await.unwrap(), "backend {name}");
    }
}

#[tokio::test]
async fn logical_databases_are_isolated() {
    for (name, base) in backends().await {
        let state = base.open(StateDb::State).await.unwrap();
        let locks = base.open(StateDb::Locks).await.unwrap();

        state.put(b"shared-name", b"state").await.unwrap();
        locks.put(b"shared-name", b"locks").await.unwrap();

        assert_eq!(
            state.get(b"shared-name").await.unwrap(),
            Some(b"state".to_vec()),
            "backend {name}"
        );
        assert_eq!(
            locks.get(b"shared-name").await.unwrap(),
            Some(b"locks".to_vec()),
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn reopening_a_database_sees_existing_entries() {
    for (name, base) in backends().await {
        let first = base.open(StateDb::Classes).await.unwrap();
        first.put(b"persists", b"yes").await.unwrap();

        let second = base.open(StateDb::Classes).await.unwrap();
        assert_eq!(
            second.get(b"persists").await.unwrap(),
            Some(b"yes".to_vec()),
            "backend {name}"
        );
    }
}

#[tokio::test]
async fn persist_record_roundtrips_through_store() {
    for (name, base) in backends().await {
        let store = base.open(StateDb::State).await.unwrap();
        let record = PersistRecord::new(1_900_000_000, PersistPolicy::Preserve);
        store.put(b"upgraded", &record.to_bytes()).await.unwrap();

        let loaded =
            PersistRecord::from_bytes(&store.get(b"upgraded").await.unwrap().unwrap()).unwrap();
        assert_eq!(loaded, record, "backend {name}");
    }
}

#[tokio::test]
async fn surrealkv_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pact.db");

    {
        let base = SurrealStateBase::at_path(&path).await.unwrap();
        let store = base.open(StateDb::State).await.unwrap();
        store.put(b"durable", b"1").await.unwrap();
    }

    let base = SurrealStateBase::at_path(&path).await.unwrap();
    let store = base.open(StateDb::State).await.unwrap();
    assert_eq!(store.get(b"durable").await.unwrap(), Some(b"1".to_vec()));
}
