//! The transaction store: durable records, secondary indices, and the CAS
//! surface every phase transition goes through.

use sled::{Db, IVec, Tree};
use std::path::Path;

use crate::primitives::clock::Millis;
use crate::primitives::ids::{Address, TxHash, WorkerId};
use crate::transaction::types::{
    ConsensusRoundEntry, RoundTag, Transaction, TransactionStatus, ValidatorResult,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction not found: {0}")]
    NotFound(TxHash),

    #[error("transaction hash already exists: {0}")]
    DuplicateHash(TxHash),

    #[error("nonce {nonce} already used by {from}")]
    DuplicateNonce { from: Address, nonce: u64 },

    #[error("stale status for {hash}: expected {expected}, found {actual}")]
    StaleStatus {
        hash: TxHash,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    #[error("illegal transition for {hash}: {from} -> {to}")]
    IllegalTransition {
        hash: TxHash,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("no round {round_index} on {hash}")]
    NoSuchRound { hash: TxHash, round_index: u32 },

    #[error("store corruption: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient errors are worth a backoff-and-retry; everything else
    /// propagates. Worker crash-on-permanent is the policy upstairs.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Sled(sled::Error::Io(_)))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// TxPatch
// ---------------------------------------------------------------------------

/// Field updates applied atomically together with a status CAS.
///
/// Outer `Option` = "should this field change", inner value = the new
/// content. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct TxPatch {
    pub current_worker: Option<Option<WorkerId>>,
    pub timestamp_awaiting_finalization: Option<Option<Millis>>,
    pub rotation_count: Option<u32>,
    pub appeal_count: Option<u32>,
    pub committee_size: Option<usize>,
    pub blocked_at: Option<Option<Millis>>,
    pub last_vote_timestamp: Option<Option<Millis>>,
}

impl TxPatch {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.current_worker = Some(Some(worker));
        self
    }

    pub fn clear_worker(mut self) -> Self {
        self.current_worker = Some(None);
        self
    }

    pub fn awaiting_finalization(mut self, at: Millis) -> Self {
        self.timestamp_awaiting_finalization = Some(Some(at));
        self
    }

    pub fn clear_awaiting_finalization(mut self) -> Self {
        self.timestamp_awaiting_finalization = Some(None);
        self
    }

    pub fn rotation_count(mut self, count: u32) -> Self {
        self.rotation_count = Some(count);
        self
    }

    pub fn appeal_count(mut self, count: u32) -> Self {
        self.appeal_count = Some(count);
        self
    }

    pub fn committee_size(mut self, size: usize) -> Self {
        self.committee_size = Some(size);
        self
    }

    fn apply(&self, tx: &mut Transaction) {
        if let Some(worker) = self.current_worker {
            tx.current_worker = worker;
        }
        if let Some(at) = self.timestamp_awaiting_finalization {
            tx.timestamp_awaiting_finalization = at;
        }
        if let Some(count) = self.rotation_count {
            tx.rotation_count = count;
        }
        if let Some(count) = self.appeal_count {
            tx.appeal_count = count;
        }
        if let Some(size) = self.committee_size {
            tx.committee_size = size;
        }
        if let Some(at) = self.blocked_at {
            tx.blocked_at = at;
        }
        if let Some(at) = self.last_vote_timestamp {
            tx.last_vote_timestamp = at;
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata keys
// ---------------------------------------------------------------------------

/// Admin-mutable finality window, persisted across restarts.
const META_FINALITY_WINDOW_MS: &[u8] = b"finality_window_ms";

// ---------------------------------------------------------------------------
// TransactionStore
// ---------------------------------------------------------------------------

/// Durable storage for transactions and their consensus journal.
///
/// # Thread Safety
///
/// sled trees support lock-free concurrent reads and serialized writes;
/// `TransactionStore` is shared across tasks via `Arc` without external
/// locking. Cross-record races resolve through the CAS loops.
#[derive(Debug, Clone)]
pub struct TransactionStore {
    db: Db,
    transactions: Tree,
    sender_nonce: Tree,
    contract_index: Tree,
    status_index: Tree,
    meta: Tree,
}

impl TransactionStore {
    /// Opens or creates a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory store that vanishes on drop. For tests.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    /// Builds the store over an existing sled handle, sharing the file
    /// with other stores (snapshots) in the same deployment.
    pub fn from_db(db: Db) -> StoreResult<Self> {
        let transactions = db.open_tree("transactions")?;
        let sender_nonce = db.open_tree("sender_nonce")?;
        let contract_index = db.open_tree("contract_index")?;
        let status_index = db.open_tree("status_index")?;
        let meta = db.open_tree("meta")?;

        Ok(Self {
            db,
            transactions,
            sender_nonce,
            contract_index,
            status_index,
            meta,
        })
    }

    /// The underlying sled handle, for siblings that share the file.
    pub fn db(&self) -> &Db {
        &self.db
    }

    // -- Ingest --------------------------------------------------------------

    /// Inserts a new PENDING transaction.
    ///
    /// Uniqueness is enforced in two steps, both CAS-on-absent: the
    /// `(from, nonce)` claim first, then the hash itself. Losing either
    /// race yields the corresponding duplicate error; a lost hash race
    /// releases the nonce claim before returning.
    pub fn insert(&self, tx: &Transaction) -> StoreResult<()> {
        if tx.status != TransactionStatus::Pending {
            return Err(StoreError::Corrupt(format!(
                "insert requires PENDING, got {}",
                tx.status
            )));
        }

        let nonce_key = sender_nonce_key(&tx.from, tx.nonce);
        let hash_bytes = tx.hash.as_bytes().to_vec();

        if self
            .sender_nonce
            .compare_and_swap(&nonce_key, None::<IVec>, Some(hash_bytes))?
            .is_err()
        {
            return Err(StoreError::DuplicateNonce {
                from: tx.from,
                nonce: tx.nonce,
            });
        }

        let encoded = encode(tx)?;
        if self
            .transactions
            .compare_and_swap(tx.hash.as_bytes(), None::<IVec>, Some(encoded))?
            .is_err()
        {
            // Someone holds this hash already; release the nonce claim we
            // just took.
            self.sender_nonce.remove(&nonce_key)?;
            return Err(StoreError::DuplicateHash(tx.hash));
        }

        if let Some(to) = tx.to {
            let seq = self.db.generate_id()?;
            self.contract_index
                .insert(contract_key(&to, tx.nonce, seq, &tx.hash), hash_vec(&tx.hash))?;
        }
        self.status_index
            .insert(status_key(tx.status, &tx.hash), &[])?;

        self.db.flush()?;
        Ok(())
    }

    // -- Reads ---------------------------------------------------------------

    /// Fetches a transaction, erroring when absent.
    pub fn get(&self, hash: &TxHash) -> StoreResult<Transaction> {
        self.get_opt(hash)?.ok_or(StoreError::NotFound(*hash))
    }

    /// Fetches a transaction, `None` when absent.
    pub fn get_opt(&self, hash: &TxHash) -> StoreResult<Option<Transaction>> {
        match self.transactions.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// PENDING transactions for one contract, lowest nonce first,
    /// insertion order breaking ties.
    pub fn list_pending_by_contract(
        &self,
        contract: &Address,
        limit: usize,
    ) -> StoreResult<Vec<Transaction>> {
        let mut out = Vec::new();
        for item in self.contract_index.scan_prefix(contract.as_bytes()) {
            let (_key, value) = item?;
            let tx = self.get(&hash_from_value(&value)?)?;
            if tx.status == TransactionStatus::Pending {
                out.push(tx);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Whether any transaction for `contract` is currently in flight.
    pub fn has_in_flight(&self, contract: &Address) -> StoreResult<bool> {
        for item in self.contract_index.scan_prefix(contract.as_bytes()) {
            let (_key, value) = item?;
            let tx = self.get(&hash_from_value(&value)?)?;
            if tx.status.is_in_flight() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The next ACTIVATED transaction for a contract, in queue order.
    pub fn next_activated(&self, contract: &Address) -> StoreResult<Option<Transaction>> {
        for item in self.contract_index.scan_prefix(contract.as_bytes()) {
            let (_key, value) = item?;
            let tx = self.get(&hash_from_value(&value)?)?;
            if tx.status == TransactionStatus::Activated {
                return Ok(Some(tx));
            }
        }
        Ok(None)
    }

    /// Every ACTIVATED transaction for a contract, in queue order. The
    /// dispatcher rebuilds its queues from this after a restart.
    pub fn list_activated_by_contract(&self, contract: &Address) -> StoreResult<Vec<Transaction>> {
        let mut out = Vec::new();
        for item in self.contract_index.scan_prefix(contract.as_bytes()) {
            let (_key, value) = item?;
            let tx = self.get(&hash_from_value(&value)?)?;
            if tx.status == TransactionStatus::Activated {
                out.push(tx);
            }
        }
        Ok(out)
    }

    /// Distinct contracts that still have unfinished transactions.
    pub fn contracts_with_work(&self) -> StoreResult<Vec<Address>> {
        let mut out: Vec<Address> = Vec::new();
        for item in self.contract_index.iter() {
            let (key, _value) = item?;
            let addr = address_from_key(&key)?;
            if out.last() != Some(&addr) {
                out.push(addr);
            }
        }
        Ok(out)
    }

    /// All transactions currently in `status`.
    pub fn list_by_status(&self, status: TransactionStatus) -> StoreResult<Vec<Transaction>> {
        let mut out = Vec::new();
        for item in self.status_index.scan_prefix([status_tag(status)]) {
            let (key, _) = item?;
            let hash = hash_from_status_key(&key)?;
            // The index may briefly lead or trail the record; trust the
            // record.
            if let Some(tx) = self.get_opt(&hash)? {
                if tx.status == status {
                    out.push(tx);
                }
            }
        }
        Ok(out)
    }

    /// ACCEPTED transactions with a finalization timestamp set — the
    /// finalization timer's worklist.
    pub fn list_awaiting_finalization(&self) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .list_by_status(TransactionStatus::Accepted)?
            .into_iter()
            .filter(|tx| tx.timestamp_awaiting_finalization.is_some())
            .collect())
    }

    /// Number of PENDING transactions. Ingress backpressure reads this.
    pub fn count_pending(&self) -> StoreResult<usize> {
        Ok(self
            .status_index
            .scan_prefix([status_tag(TransactionStatus::Pending)])
            .count())
    }

    /// Next unused nonce for a sender. Used when enqueueing contract-
    /// emitted child transactions.
    pub fn next_nonce(&self, from: &Address) -> StoreResult<u64> {
        let mut last: Option<u64> = None;
        for item in self.sender_nonce.scan_prefix(from.as_bytes()) {
            let (key, _) = item?;
            last = Some(nonce_from_sender_key(&key)?);
        }
        Ok(last.map(|n| n + 1).unwrap_or(0))
    }

    // -- Status transitions --------------------------------------------------

    /// Atomic compare-and-swap of the status plus an optional field patch.
    ///
    /// Fails with [`StoreError::StaleStatus`] when another worker advanced
    /// the transaction first, and with [`StoreError::IllegalTransition`]
    /// when the requested edge is not in the transition graph. On success
    /// the open round (if any) records both the transition and its
    /// monitoring timestamp, so status and journal always commit together.
    pub fn cas_status(
        &self,
        hash: &TxHash,
        expected: TransactionStatus,
        new: TransactionStatus,
        patch: TxPatch,
        at: Millis,
    ) -> StoreResult<Transaction> {
        if !expected.can_transition_to(new) {
            return Err(StoreError::IllegalTransition {
                hash: *hash,
                from: expected,
                to: new,
            });
        }

        let tx = self.mutate(hash, |tx| {
            if tx.status != expected {
                return Err(StoreError::StaleStatus {
                    hash: *hash,
                    expected,
                    actual: tx.status,
                });
            }
            tx.status = new;
            patch.apply(tx);
            // Only an open round records the transition; closed rounds are
            // history and stay untouched.
            if let Some(round) = tx.last_round_mut() {
                if !round.is_closed() {
                    round.record_status(new);
                    round.record_phase(&new.to_string(), at);
                }
            }
            Ok(())
        })?;

        self.reindex_after_transition(&tx, expected, new)?;
        self.db.flush()?;
        Ok(tx)
    }

    /// Applies a field patch without touching the status. Used by
    /// rotations that stay in the same phase.
    pub fn patch(&self, hash: &TxHash, patch: TxPatch) -> StoreResult<Transaction> {
        self.mutate(hash, |tx| {
            patch.apply(tx);
            Ok(())
        })
    }

    // -- Journal writes ------------------------------------------------------

    /// Appends a round entry at the tail of the consensus history.
    pub fn append_round(&self, hash: &TxHash, entry: ConsensusRoundEntry) -> StoreResult<Transaction> {
        let expected_index = entry.round_index;
        self.mutate(hash, move |tx| {
            if tx.consensus_history.len() as u32 != expected_index {
                return Err(StoreError::Corrupt(format!(
                    "round {} appended at position {}",
                    expected_index,
                    tx.consensus_history.len()
                )));
            }
            tx.consensus_history.push(entry.clone());
            Ok(())
        })
    }

    /// Idempotently stamps a phase timestamp inside an existing round.
    pub fn update_monitoring(
        &self,
        hash: &TxHash,
        round_index: u32,
        phase: &str,
        at: Millis,
    ) -> StoreResult<()> {
        self.with_round(hash, round_index, |round| {
            round.record_phase(phase, at);
        })
        .map(|_| ())
    }

    /// Records the drawn committee on a round.
    pub fn set_round_committee(
        &self,
        hash: &TxHash,
        round_index: u32,
        leader: Address,
        committee: Vec<Address>,
        registry_version: u64,
    ) -> StoreResult<()> {
        self.with_round(hash, round_index, move |round| {
            round.leader = Some(leader);
            round.committee = committee.clone();
            round.registry_version = registry_version;
        })
        .map(|_| ())
    }

    /// Records per-validator votes on a round.
    pub fn record_validator_results(
        &self,
        hash: &TxHash,
        round_index: u32,
        results: Vec<ValidatorResult>,
    ) -> StoreResult<()> {
        self.with_round(hash, round_index, move |round| {
            round.validator_results = results.clone();
        })
        .map(|_| ())
    }

    /// Closes a round with its terminal tag.
    pub fn close_round(&self, hash: &TxHash, round_index: u32, tag: RoundTag) -> StoreResult<()> {
        self.with_round(hash, round_index, move |round| {
            round.consensus_round = Some(tag);
        })
        .map(|_| ())
    }

    /// Attaches a non-fatal warning to a round.
    pub fn set_round_warning(
        &self,
        hash: &TxHash,
        round_index: u32,
        warning: String,
    ) -> StoreResult<()> {
        self.with_round(hash, round_index, move |round| {
            round.warning = Some(warning.clone());
        })
        .map(|_| ())
    }

    // -- Config metadata -----------------------------------------------------

    /// Persists the admin-set finality window.
    pub fn put_finality_window_ms(&self, ms: u64) -> StoreResult<()> {
        self.meta
            .insert(META_FINALITY_WINDOW_MS, &ms.to_be_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Reads the persisted finality window, if one was ever set.
    pub fn get_finality_window_ms(&self) -> StoreResult<Option<u64>> {
        match self.meta.get(META_FINALITY_WINDOW_MS)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt("finality window bytes".into()))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    // -- Internals -----------------------------------------------------------

    /// Read-modify-CAS loop over a single record. The closure may reject
    /// (errors propagate untouched); a lost swap re-reads and retries.
    fn mutate<F>(&self, hash: &TxHash, f: F) -> StoreResult<Transaction>
    where
        F: Fn(&mut Transaction) -> StoreResult<()>,
    {
        loop {
            let old_bytes = self
                .transactions
                .get(hash.as_bytes())?
                .ok_or(StoreError::NotFound(*hash))?;
            let mut tx: Transaction = decode(&old_bytes)?;
            f(&mut tx)?;
            let new_bytes = encode(&tx)?;
            match self.transactions.compare_and_swap(
                hash.as_bytes(),
                Some(old_bytes),
                Some(new_bytes),
            )? {
                Ok(()) => return Ok(tx),
                Err(_) => continue,
            }
        }
    }

    fn with_round<F>(&self, hash: &TxHash, round_index: u32, f: F) -> StoreResult<Transaction>
    where
        F: Fn(&mut ConsensusRoundEntry),
    {
        self.mutate(hash, |tx| {
            let round = tx
                .consensus_history
                .get_mut(round_index as usize)
                .ok_or(StoreError::NoSuchRound {
                    hash: *hash,
                    round_index,
                })?;
            f(round);
            Ok(())
        })
    }

    /// Index maintenance after a won status CAS.
    fn reindex_after_transition(
        &self,
        tx: &Transaction,
        old: TransactionStatus,
        new: TransactionStatus,
    ) -> StoreResult<()> {
        self.status_index.remove(status_key(old, &tx.hash))?;
        self.status_index.insert(status_key(new, &tx.hash), &[])?;

        if let Some(to) = tx.to {
            if new.is_terminal() {
                self.remove_contract_entry(&to, tx.nonce, &tx.hash)?;
            } else if old.is_terminal() {
                // Appeal reopened a terminal failure; the queue entry was
                // dropped at close and must come back.
                let seq = self.db.generate_id()?;
                self.contract_index
                    .insert(contract_key(&to, tx.nonce, seq, &tx.hash), hash_vec(&tx.hash))?;
            }
        }

        if new == TransactionStatus::Canceled {
            self.sender_nonce
                .remove(sender_nonce_key(&tx.from, tx.nonce))?;
        }
        Ok(())
    }

    fn remove_contract_entry(
        &self,
        to: &Address,
        nonce: u64,
        hash: &TxHash,
    ) -> StoreResult<()> {
        let mut prefix = Vec::with_capacity(28);
        prefix.extend_from_slice(to.as_bytes());
        prefix.extend_from_slice(&nonce.to_be_bytes());
        for item in self.contract_index.scan_prefix(&prefix) {
            let (key, value) = item?;
            if value.as_ref() == hash.as_bytes() {
                self.contract_index.remove(key)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

fn encode(tx: &Transaction) -> StoreResult<Vec<u8>> {
    bincode::serialize(tx).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> StoreResult<Transaction> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn hash_vec(hash: &TxHash) -> Vec<u8> {
    hash.as_bytes().to_vec()
}

fn sender_nonce_key(from: &Address, nonce: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(28);
    key.extend_from_slice(from.as_bytes());
    key.extend_from_slice(&nonce.to_be_bytes());
    key
}

fn nonce_from_sender_key(key: &[u8]) -> StoreResult<u64> {
    let arr: [u8; 8] = key[20..]
        .try_into()
        .map_err(|_| StoreError::Corrupt("sender_nonce key".into()))?;
    Ok(u64::from_be_bytes(arr))
}

fn contract_key(to: &Address, nonce: u64, seq: u64, hash: &TxHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(68);
    key.extend_from_slice(to.as_bytes());
    key.extend_from_slice(&nonce.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

fn address_from_key(key: &[u8]) -> StoreResult<Address> {
    let arr: [u8; 20] = key
        .get(..20)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt("contract_index key".into()))?;
    Ok(Address(arr))
}

fn hash_from_value(value: &[u8]) -> StoreResult<TxHash> {
    let arr: [u8; 32] = value
        .try_into()
        .map_err(|_| StoreError::Corrupt("index value".into()))?;
    Ok(TxHash(arr))
}

fn status_tag(status: TransactionStatus) -> u8 {
    use TransactionStatus::*;
    match status {
        Pending => 0,
        Activated => 1,
        Canceled => 2,
        Proposing => 3,
        Committing => 4,
        Revealing => 5,
        Accepted => 6,
        Finalized => 7,
        Undetermined => 8,
        LeaderTimeout => 9,
        ValidatorsTimeout => 10,
    }
}

fn status_key(status: TransactionStatus, hash: &TxHash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(status_tag(status));
    key.extend_from_slice(hash.as_bytes());
    key
}

fn hash_from_status_key(key: &[u8]) -> StoreResult<TxHash> {
    let arr: [u8; 32] = key
        .get(1..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::Corrupt("status_index key".into()))?;
    Ok(TxHash(arr))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
