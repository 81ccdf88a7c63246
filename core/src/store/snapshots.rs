//! Versioned contract snapshots.
//!
//! Every state-changing transaction that accepts produces a new snapshot
//! version for its contract. Old versions are never deleted — a historical
//! transaction resolves against the version that existed when it ran, so
//! replays and explorers stay deterministic.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;

use crate::primitives::ids::{Address, TxHash};
use crate::store::tx_store::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// An immutable version of a contract's code and storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSnapshot {
    pub address: Address,
    /// 1-based monotonic counter per address.
    pub version: u64,
    /// Contract code. Empty for pure-storage updates.
    pub code: Vec<u8>,
    /// Opaque storage blob. The core never parses it.
    pub storage: Vec<u8>,
    /// The transaction whose acceptance produced this version.
    pub produced_by: Option<TxHash>,
}

/// A lightweight reference handed to the executor: enough to name a
/// snapshot without hauling the blob around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub address: Address,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Append-only store of contract snapshots, keyed `address ‖ version (BE)`
/// so a prefix scan yields versions in ascending order.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    db: Db,
    snapshots: Tree,
}

impl SnapshotStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    /// Builds the store over a shared sled handle.
    pub fn from_db(db: Db) -> StoreResult<Self> {
        let snapshots = db.open_tree("contract_snapshots")?;
        Ok(Self { db, snapshots })
    }

    /// Appends the next version for a contract and returns it.
    ///
    /// `code = None` carries the previous version's code forward — the
    /// common case for calls that only touch storage.
    pub fn put_new_version(
        &self,
        address: Address,
        code: Option<Vec<u8>>,
        storage: Vec<u8>,
        produced_by: Option<TxHash>,
    ) -> StoreResult<ContractSnapshot> {
        let previous = self.latest(&address)?;
        let version = previous.as_ref().map(|s| s.version + 1).unwrap_or(1);
        let code = match code {
            Some(code) => code,
            None => previous.map(|s| s.code).unwrap_or_default(),
        };

        let snapshot = ContractSnapshot {
            address,
            version,
            code,
            storage,
            produced_by,
        };
        let bytes = bincode::serialize(&snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.snapshots
            .insert(snapshot_key(&address, version), bytes)?;
        self.db.flush()?;
        Ok(snapshot)
    }

    /// Fetches a specific version.
    pub fn get(&self, address: &Address, version: u64) -> StoreResult<Option<ContractSnapshot>> {
        match self.snapshots.get(snapshot_key(address, version))? {
            Some(bytes) => Ok(Some(
                bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// The newest version for a contract, if any exists.
    pub fn latest(&self, address: &Address) -> StoreResult<Option<ContractSnapshot>> {
        match self.snapshots.scan_prefix(address.as_bytes()).last() {
            Some(item) => {
                let (_key, bytes) = item?;
                Ok(Some(
                    bincode::deserialize(&bytes)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?,
                ))
            }
            None => Ok(None),
        }
    }

    /// A reference to the newest version, for executor requests.
    pub fn latest_ref(&self, address: &Address) -> StoreResult<Option<SnapshotRef>> {
        Ok(self.latest(address)?.map(|s| SnapshotRef {
            address: s.address,
            version: s.version,
        }))
    }

    /// Number of stored versions for a contract.
    pub fn version_count(&self, address: &Address) -> usize {
        self.snapshots.scan_prefix(address.as_bytes()).count()
    }
}

fn snapshot_key(address: &Address, version: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(address.as_bytes());
    key.extend_from_slice(&version.to_be_bytes());
    key
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
