//! SurrealDB backend for the storage traits
//!
//! Each logical [`StateDb`] maps to one table; keys and values are
//! hex-armoured so arbitrary bytes survive the round trip. The record id is
//! derived from the key, which makes `put` a delete-then-create pair and
//! `get` a direct record fetch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::engine::local::Db;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::kv::{KvStore, StateBase, StateDb, StoreResult};

/// SurrealDB-backed state base.
///
/// Open with [`SurrealStateBase::memory`] for an ephemeral run or
/// [`SurrealStateBase::at_path`] for on-disk persistence under the agent
/// workspace.
pub struct SurrealStateBase {
    db: Surreal<Db>,
    /// Serialises retain() passes per process; see `KvStore::retain`.
    scan_guard: Arc<Mutex<()>>,
}

impl SurrealStateBase {
    /// Connect to an in-memory SurrealDB instance and set up the schema.
    pub async fn memory() -> StoreResult<Self> {
        info!("Connecting to state backend (in-memory)");

        let db = Surreal::new::<surrealdb::engine::local::Mem>(())
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Self::finish_setup(db).await
    }

    /// Open (creating if necessary) an on-disk SurrealKV database at `path`.
    pub async fn at_path(path: &std::path::Path) -> StoreResult<Self> {
        info!(path = %path.display(), "Connecting to state backend (surrealkv)");

        let endpoint = path.to_string_lossy().to_string();
        let db = Surreal::new::<surrealdb::engine::local::SurrealKv>(endpoint)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Self::finish_setup(db).await
    }

    async fn finish_setup(db: Surreal<Db>) -> StoreResult<Self> {
        db.use_ns("pact")
            .use_db("state")
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let base = SurrealStateBase {
            db,
            scan_guard: Arc::new(Mutex::new(())),
        };
        base.init_schema().await?;

        info!("State backend connected and schema initialized");
        Ok(base)
    }

    /// Initialize one schemafull table per logical database.
    async fn init_schema(&self) -> StoreResult<()> {
        debug!("Initializing state schema");

        let mut schema = String::new();
        for db in StateDb::ALL {
            let table = table_name(db);
            schema.push_str(&format!(
                "DEFINE TABLE IF NOT EXISTS {table} SCHEMAFULL;\n\
                 DEFINE FIELD IF NOT EXISTS k ON {table} TYPE string;\n\
                 DEFINE FIELD IF NOT EXISTS v ON {table} TYPE string;\n\
                 DEFINE INDEX IF NOT EXISTS idx_{table}_k ON {table} FIELDS k UNIQUE;\n"
            ));
        }

        self.db
            .query(schema.as_str())
            .await
            .and_then(|response| response.check())
            .map_err(|e| StoreError::SchemaSetup(e.to_string()))?;

        debug!("State schema initialized");
        Ok(())
    }
}

#[async_trait]
impl StateBase for SurrealStateBase {
    async fn open(&self, db: StateDb) -> StoreResult<Arc<dyn KvStore>> {
        Ok(Arc::new(SurrealStore {
            db: self.db.clone(),
            table: table_name(db),
            scan_guard: self.scan_guard.clone(),
        }))
    }
}

fn table_name(db: StateDb) -> String {
    format!("kv_{}", db.as_str())
}

/// One opened logical database on the SurrealDB backend.
pub struct SurrealStore {
    db: Surreal<Db>,
    table: String,
    scan_guard: Arc<Mutex<()>>,
}

#[derive(Deserialize)]
struct ValueRow {
    v: String,
}

#[derive(Deserialize)]
struct EntryRow {
    k: String,
    v: String,
}

impl SurrealStore {
    async fn get_hex(&self, key_hex: &str) -> StoreResult<Option<String>> {
        let mut result = self
            .db
            .query("SELECT v FROM type::thing($tb, $k)")
            .bind(("tb", self.table.clone()))
            .bind(("k", key_hex.to_string()))
            .await?;

        let rows: Vec<ValueRow> = result.take(0)?;
        Ok(rows.into_iter().next().map(|r| r.v))
    }

    async fn delete_hex(&self, key_hex: &str) -> StoreResult<()> {
        self.db
            .query("DELETE type::thing($tb, $k)")
            .bind(("tb", self.table.clone()))
            .bind(("k", key_hex.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SurrealStore {
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let key_hex = hex::encode(key);
        match self.get_hex(&key_hex).await? {
            Some(v) => {
                let bytes = hex::decode(&v).map_err(|e| StoreError::Corrupt {
                    key: key_hex,
                    reason: e.to_string(),
                })?;
                Ok(Some(bytes))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let key_hex = hex::encode(key);
        let value_hex = hex::encode(value);

        self.db
            .query("DELETE type::thing($tb, $k); CREATE type::thing($tb, $k) SET k = $k, v = $v")
            .bind(("tb", self.table.clone()))
            .bind(("k", key_hex))
            .bind(("v", value_hex))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.delete_hex(&hex::encode(key)).await
    }

    async fn has(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get_hex(&hex::encode(key)).await?.is_some())
    }

    async fn scan(&self) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut result = self
            .db
            .query("SELECT k, v FROM type::table($tb)")
            .bind(("tb", self.table.clone()))
            .await?;

        let rows: Vec<EntryRow> = result.take(0)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let key = hex::decode(&row.k).map_err(|e| StoreError::Corrupt {
                key: row.k.clone(),
                reason: e.to_string(),
            })?;
            let value = hex::decode(&row.v).map_err(|e| StoreError::Corrupt {
                key: row.k.clone(),
                reason: e.to_string(),
            })?;
            entries.push((key, value));
        }
        Ok(entries)
    }

    async fn retain(
        &self,
        keep: &(dyn for<'a, 'b> Fn(&'a [u8], &'b [u8]) -> bool + Send + Sync),
    ) -> StoreResult<usize> {
        let _guard = self.scan_guard.lock().await;

        let entries = self.scan().await?;
        let mut deleted = 0;
        for (key, value) in entries {
            if !keep(&key, &value) {
                self.delete_hex(&hex::encode(&key)).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_surreal_connection_and_schema_creation() {
        let base = SurrealStateBase::memory().await;
        assert!(base.is_ok(), "Failed to connect: {:?}", base.err());
    }

    #[tokio::test]
    async fn test_put_get_binary_roundtrip() {
        let base = SurrealStateBase::memory().await.unwrap();
        let store = base.open(StateDb::Locks).await.unwrap();

        let key = [0x00u8, 0xff, 0x10, 0x7f];
        let value = [0xdeu8, 0xad, 0xbe, 0xef, 0x00];
        store.put(&key, &value).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap(), Some(value.to_vec()));
        assert!(store.has(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_databases_are_isolated() {
        let base = SurrealStateBase::memory().await.unwrap();
        let locks = base.open(StateDb::Locks).await.unwrap();
        let state = base.open(StateDb::State).await.unwrap();

        locks.put(b"only-in-locks", b"1").await.unwrap();
        assert!(state.get(b"only-in-locks").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scan_and_retain() {
        let base = SurrealStateBase::memory().await.unwrap();
        let store = base.open(StateDb::State).await.unwrap();

        store.put(b"a", b"1").await.unwrap();
        store.put(b"b", b"2").await.unwrap();
        store.put(b"c", b"3").await.unwrap();

        let mut entries = store.scan().await.unwrap();
        entries.sort();
        assert_eq!(entries.len(), 3);

        let deleted = store
            .retain(&|k: &[u8], _v: &[u8]| k != b"b")
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(!store.has(b"b").await.unwrap());
        assert!(store.has(b"a").await.unwrap());
    }
}
