//! Storage contract for the pact engine
//!
//! The engine persists run-to-run state (locks, persistent classes,
//! performance moments, ...) through a narrow key/value contract:
//! `get`/`put`/`delete`/`has`/`scan`/`retain` on byte keys and byte values,
//! one logical database per concern.
//!
//! All traits are async and backend-agnostic. An in-memory fake is provided
//! for testing via the `memory` module.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StateDb — logical database identifiers
// ---------------------------------------------------------------------------

/// Identifier for one logical key/value database.
///
/// Each id maps to an isolated keyspace; a handle opened for one id never
/// sees another id's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateDb {
    /// Persistent classes and miscellaneous agent state
    State,
    /// Per-promise lock and last-completion records
    Locks,
    /// Peer last-seen records (maintained by network collaborators)
    LastSeen,
    /// Rolling performance moments per event name
    Performance,
    /// Cached class environment
    Classes,
    /// File content checksums
    Checksums,
    /// Change tracking
    Changes,
    /// Audit trail
    Audit,
    /// Monitor measurements
    Measure,
    /// Promise valuation ledger
    Value,
    /// Installed-package inventory cache
    PackagesInstalled,
    /// Available-update inventory cache
    PackagesUpdates,
}

impl StateDb {
    /// Every logical database, in declaration order.
    pub const ALL: [StateDb; 12] = [
        StateDb::State,
        StateDb::Locks,
        StateDb::LastSeen,
        StateDb::Performance,
        StateDb::Classes,
        StateDb::Checksums,
        StateDb::Changes,
        StateDb::Audit,
        StateDb::Measure,
        StateDb::Value,
        StateDb::PackagesInstalled,
        StateDb::PackagesUpdates,
    ];

    /// Stable short name, used as the backend table/file name.
    pub fn as_str(self) -> &'static str {
        match self {
            StateDb::State => "state",
            StateDb::Locks => "locks",
            StateDb::LastSeen => "lastseen",
            StateDb::Performance => "performance",
            StateDb::Classes => "classes",
            StateDb::Checksums => "checksums",
            StateDb::Changes => "changes",
            StateDb::Audit => "audit",
            StateDb::Measure => "measure",
            StateDb::Value => "value",
            StateDb::PackagesInstalled => "packages_installed",
            StateDb::PackagesUpdates => "packages_updates",
        }
    }
}

impl std::fmt::Display for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// KvStore — one opened logical database
// ---------------------------------------------------------------------------

/// A handle to one opened logical database.
///
/// Guarantees:
/// - `put` followed by `get` on the same key returns the stored bytes.
/// - `scan` returns a point-in-time snapshot; callers must not interleave
///   `put`/`delete` on the same handle with a scan they are still consuming.
/// - `retain` is the cursor-deletion path: it deletes every entry the
///   predicate rejects in a single pass under the store's internal lock.
///
/// Multi-step read-modify-write sequences (e.g. the lock acquire protocol)
/// are serialised by the engine's critical section, not by the store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Retrieve the value stored under `key`, or `None` if absent.
    async fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Delete the entry under `key`. No-op if absent.
    async fn delete(&self, key: &[u8]) -> StoreResult<()>;

    /// Check whether `key` is present.
    async fn has(&self, key: &[u8]) -> StoreResult<bool>;

    /// Snapshot all entries as `(key, value)` pairs.
    ///
    /// Ordering is unspecified; callers needing determinism sort the result.
    async fn scan(&self) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Delete every entry for which `keep` returns `false`, atomically with
    /// respect to other operations on this handle. Returns the number of
    /// deleted entries.
    async fn retain(
        &self,
        keep: &(dyn for<'a, 'b> Fn(&'a [u8], &'b [u8]) -> bool + Send + Sync),
    ) -> StoreResult<usize>;
}

// ---------------------------------------------------------------------------
// StateBase — a collection of logical databases
// ---------------------------------------------------------------------------

/// A storage backend capable of opening any logical database.
///
/// Opening the same id twice returns handles onto the same keyspace.
#[async_trait]
pub trait StateBase: Send + Sync {
    /// Open (creating if necessary) the logical database `db`.
    async fn open(&self, db: StateDb) -> StoreResult<Arc<dyn KvStore>>;
}
