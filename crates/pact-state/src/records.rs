//! Fixed-width record codecs for persisted engine state
//!
//! The lock manager and the persistent-class subsystem store small
//! fixed-layout records so that any agent build can read any other's state:
//!
//! - [`LockRecord`]: 16 bytes — `pid: u32` (LE), 4 pad bytes, `time: i64` (LE)
//! - [`PersistRecord`]: 9 bytes — `expires: i64` (LE), `policy: u8`

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Encoded size of a [`LockRecord`].
pub const LOCK_RECORD_LEN: usize = 16;

/// Encoded size of a [`PersistRecord`].
pub const PERSIST_RECORD_LEN: usize = 9;

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

/// A lock or last-completion record in the `locks` database.
///
/// `lock.<fp>` entries mark an in-progress attempt; `last.<fp>` entries mark
/// the time the previous attempt completed. The `lock_horizon` sentinel
/// reuses the same layout with `pid = 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Process id of the holder (0 for sentinels).
    pub pid: u32,
    /// Unix timestamp of acquisition or completion.
    pub time: i64,
}

impl LockRecord {
    pub fn new(pid: u32, time: i64) -> Self {
        Self { pid, time }
    }

    /// Encode to the 16-byte wire layout.
    pub fn to_bytes(self) -> [u8; LOCK_RECORD_LEN] {
        let mut buf = [0u8; LOCK_RECORD_LEN];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        // bytes 4..8 stay zero (alignment padding in the on-disk layout)
        buf[8..16].copy_from_slice(&self.time.to_le_bytes());
        buf
    }

    /// Decode from the 16-byte wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != LOCK_RECORD_LEN {
            return Err(StoreError::RecordSize {
                expected: LOCK_RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let pid = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let time = i64::from_le_bytes(bytes[8..16].try_into().unwrap());
        Ok(Self { pid, time })
    }
}

// ---------------------------------------------------------------------------
// PersistRecord
// ---------------------------------------------------------------------------

/// Retention policy for a persistent class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    /// Every save restarts the expiry counter.
    Reset,
    /// A save within the unexpired window keeps the existing entry.
    Preserve,
}

impl PersistPolicy {
    pub fn as_u8(self) -> u8 {
        match self {
            PersistPolicy::Reset => 0,
            PersistPolicy::Preserve => 1,
        }
    }

    pub fn from_u8(b: u8) -> Result<Self, StoreError> {
        match b {
            0 => Ok(PersistPolicy::Reset),
            1 => Ok(PersistPolicy::Preserve),
            other => Err(StoreError::Corrupt {
                key: String::new(),
                reason: format!("unknown persist policy byte {other}"),
            }),
        }
    }
}

/// A persistent-class entry in the `state` database, keyed by the
/// (possibly namespace-qualified) class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistRecord {
    /// Unix timestamp after which the class is evicted on load.
    pub expires: i64,
    /// Retention policy applied on re-save.
    pub policy: PersistPolicy,
}

impl PersistRecord {
    pub fn new(expires: i64, policy: PersistPolicy) -> Self {
        Self { expires, policy }
    }

    /// Encode to the 9-byte wire layout.
    pub fn to_bytes(self) -> [u8; PERSIST_RECORD_LEN] {
        let mut buf = [0u8; PERSIST_RECORD_LEN];
        buf[0..8].copy_from_slice(&self.expires.to_le_bytes());
        buf[8] = self.policy.as_u8();
        buf
    }

    /// Decode from the 9-byte wire layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() != PERSIST_RECORD_LEN {
            return Err(StoreError::RecordSize {
                expected: PERSIST_RECORD_LEN,
                actual: bytes.len(),
            });
        }
        let expires = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let policy = PersistPolicy::from_u8(bytes[8])?;
        Ok(Self { expires, policy })
    }
}
