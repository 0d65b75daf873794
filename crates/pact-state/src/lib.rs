//! pact-state: persistence layer for the pact policy engine
//!
//! The engine's run-to-run memory (promise locks, persistent classes,
//! performance moments, inventories) lives behind a narrow key/value
//! contract keyed by a logical database id. This crate provides:
//!
//! - `StateDb` / `KvStore` / `StateBase`: the storage contract
//! - `MemoryStateBase`: dependency-free in-memory backend for tests and
//!   ephemeral runs
//! - `SurrealStateBase`: SurrealDB backend (in-memory or on-disk surrealkv)
//! - `LockRecord` / `PersistRecord`: fixed-width codecs for the records the
//!   engine persists

mod error;
mod kv;
mod memory;
mod records;
mod surreal;

pub use error::StoreError;
pub use kv::{KvStore, StateBase, StateDb, StoreResult};
pub use memory::{MemoryStateBase, MemoryStore};
pub use records::{
    LockRecord, PersistPolicy, PersistRecord, LOCK_RECORD_LEN, PERSIST_RECORD_LEN,
};
pub use surreal::{SurrealStateBase, SurrealStore};
