//! The dispatcher: per-contract FIFO queues, worker leases, and the
//! reclaim path for workers that die mid-round.
//!
//! The in-memory queues are a performance hint, not an authority — every
//! hand-off is a CAS against the store, so a queue that drifts (a canceled
//! transaction, a raced activation) self-corrects by skipping entries the
//! CAS refuses. On restart the queues are rebuilt from a store scan.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::events::{EventBus, StatusEvent};
use crate::primitives::clock::{Clock, Millis};
use crate::primitives::ids::{Address, TxHash, WorkerId};
use crate::store::tx_store::{StoreError, TransactionStore, TxPatch};
use crate::transaction::types::{ConsensusRoundEntry, RoundTag, Transaction, TransactionStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Errors surfaced by dispatcher operations.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("dispatcher shutting down")]
    Shutdown,
}

/// A granted assignment: the transaction (already CASed to PROPOSING with
/// the worker attached) and the lease deadline.
#[derive(Debug, Clone)]
pub struct Lease {
    pub tx: Transaction,
    pub worker: WorkerId,
    pub deadline: Millis,
}

#[derive(Debug)]
struct LeaseInfo {
    worker: WorkerId,
    contract: Address,
    deadline: Millis,
}

#[derive(Debug, Default)]
struct DispatchState {
    /// Per-contract FIFO of ACTIVATED transactions.
    queues: HashMap<Address, VecDeque<TxHash>>,
    /// Round-robin ring over contracts with queued work.
    ring: VecDeque<Address>,
    /// The single in-flight slot per contract.
    in_flight: HashMap<Address, TxHash>,
    /// Live leases by transaction.
    leases: HashMap<TxHash, LeaseInfo>,
}

impl DispatchState {
    fn enqueue(&mut self, contract: Address, hash: TxHash, front: bool) {
        let queue = self.queues.entry(contract).or_default();
        if queue.contains(&hash) {
            return;
        }
        if front {
            queue.push_front(hash);
        } else {
            queue.push_back(hash);
        }
        if !self.ring.contains(&contract) {
            self.ring.push_back(contract);
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Hands ACTIVATED transactions to idle workers, one per contract at a
/// time, round-robin across contracts so no queue starves.
#[derive(Debug)]
pub struct Dispatcher {
    store: Arc<TransactionStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: CoreConfig,
    state: Mutex<DispatchState>,
    notify: Notify,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TransactionStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
            state: Mutex::new(DispatchState::default()),
            notify: Notify::new(),
        }
    }

    /// Rebuilds queues and leases from the store after a restart.
    ///
    /// ACTIVATED rows re-enter their queues in nonce order. Rows that were
    /// in flight when the process died get a short-grace lease with no
    /// live worker behind it, which the reaper promptly reclaims through
    /// the normal WorkerLost path.
    pub fn recover(&self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        for contract in self.store.contracts_with_work()? {
            for tx in self.store.list_activated_by_contract(&contract)? {
                state.enqueue(contract, tx.hash, false);
            }
        }

        for status in [
            TransactionStatus::Proposing,
            TransactionStatus::Committing,
            TransactionStatus::Revealing,
        ] {
            for tx in self.store.list_by_status(status)? {
                let contract = match tx.to {
                    Some(contract) => contract,
                    None => continue,
                };
                let worker = tx.current_worker.unwrap_or_default();
                info!(hash = %tx.hash, "orphaned in-flight transaction, scheduling reclaim");
                state.in_flight.insert(contract, tx.hash);
                state.leases.insert(
                    tx.hash,
                    LeaseInfo {
                        worker,
                        contract,
                        deadline: now,
                    },
                );
            }
        }

        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Queues a freshly activated (or reopened) transaction.
    pub fn enqueue(&self, contract: Address, hash: TxHash) {
        self.state.lock().enqueue(contract, hash, false);
        self.notify.notify_waiters();
    }

    /// Blocks until an assignment is available, then CASes it to
    /// PROPOSING under this worker and grants a lease.
    pub async fn acquire(
        &self,
        worker: WorkerId,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Lease, DispatchError> {
        loop {
            if *cancel.borrow() {
                return Err(DispatchError::Shutdown);
            }
            if let Some(lease) = self.try_acquire(worker)? {
                return Ok(lease);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Err(DispatchError::Shutdown);
                    }
                }
            }
        }
    }

    /// One non-blocking assignment attempt, round-robin over contracts.
    pub fn try_acquire(&self, worker: WorkerId) -> Result<Option<Lease>, StoreError> {
        let mut state = self.state.lock();
        let contracts = state.ring.len();

        for _ in 0..contracts {
            let contract = match state.ring.pop_front() {
                Some(contract) => contract,
                None => break,
            };

            // A busy contract keeps its place in the rotation but yields
            // nothing this pass.
            if state.in_flight.contains_key(&contract) {
                state.ring.push_back(contract);
                continue;
            }

            while let Some(hash) = state
                .queues
                .get_mut(&contract)
                .and_then(|queue| queue.pop_front())
            {
                let at = self.clock.now();
                match self.store.cas_status(
                    &hash,
                    TransactionStatus::Activated,
                    TransactionStatus::Proposing,
                    TxPatch::none().worker(worker),
                    at,
                ) {
                    Ok(tx) => {
                        let deadline = at + self.config.worker_lease.as_millis() as Millis;
                        state.in_flight.insert(contract, hash);
                        state.leases.insert(
                            hash,
                            LeaseInfo {
                                worker,
                                contract,
                                deadline,
                            },
                        );
                        if state
                            .queues
                            .get(&contract)
                            .map(|q| !q.is_empty())
                            .unwrap_or(false)
                        {
                            state.ring.push_back(contract);
                        } else {
                            state.queues.remove(&contract);
                        }
                        drop(state);

                        self.events.publish(StatusEvent {
                            hash,
                            sender: tx.from,
                            contract: tx.to,
                            status: TransactionStatus::Proposing,
                            round_index: tx.consensus_history.len().saturating_sub(1) as u32,
                            tag: None,
                            at,
                        });
                        debug!(hash = %hash, worker = %worker, "assigned");
                        return Ok(Some(Lease {
                            tx,
                            worker,
                            deadline,
                        }));
                    }
                    // Canceled or otherwise advanced while queued: skip it
                    // and try the next in line.
                    Err(StoreError::StaleStatus { actual, .. }) => {
                        debug!(hash = %hash, status = %actual, "queued entry stale, skipping");
                        continue;
                    }
                    Err(e) => {
                        // Put the entry back before propagating so nothing
                        // is lost to a transient store error.
                        state.enqueue(contract, hash, true);
                        return Err(e);
                    }
                }
            }

            state.queues.remove(&contract);
        }

        Ok(None)
    }

    /// Renews a worker's lease. Returns false when the lease is no longer
    /// held (reclaimed, released, or never granted) — the worker must stop
    /// driving the transaction in that case.
    pub fn heartbeat(&self, worker: WorkerId, hash: &TxHash) -> bool {
        let mut state = self.state.lock();
        match state.leases.get_mut(hash) {
            Some(lease) if lease.worker == worker => {
                lease.deadline = self.clock.now() + self.config.worker_lease.as_millis() as Millis;
                true
            }
            _ => false,
        }
    }

    /// Drops the lease and frees the contract's in-flight slot. Called by
    /// the worker when a machine run ends, whatever the outcome.
    pub fn release(&self, hash: &TxHash) {
        let mut state = self.state.lock();
        if let Some(lease) = state.leases.remove(hash) {
            if state.in_flight.get(&lease.contract) == Some(hash) {
                state.in_flight.remove(&lease.contract);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Reclaims every expired lease: the lost round is closed as
    /// WorkerLost, the transaction returns to the head of its queue in
    /// ACTIVATED state, and a fresh round opens for the reassignment.
    pub fn reap_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let expired: Vec<(TxHash, Address, WorkerId)> = {
            let state = self.state.lock();
            state
                .leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(hash, lease)| (*hash, lease.contract, lease.worker))
                .collect()
        };

        let mut reclaimed = 0;
        for (hash, contract, worker) in expired {
            match self.reclaim(&hash, contract) {
                Ok(true) => {
                    warn!(hash = %hash, worker = %worker, "lease expired, reclaimed");
                    reclaimed += 1;
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(hash = %hash, error = %e, "reclaim deferred on transient store error");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    fn reclaim(&self, hash: &TxHash, contract: Address) -> Result<bool, StoreError> {
        let tx = match self.store.get_opt(hash)? {
            Some(tx) => tx,
            None => {
                self.release(hash);
                return Ok(false);
            }
        };

        if !tx.status.is_in_flight() {
            // The worker finished after all; just drop the bookkeeping.
            self.release(hash);
            return Ok(false);
        }

        // The CAS settles ownership first: a worker racing to its own
        // terminal transition either wins (we stand down) or loses (its
        // later writes fail stale). Only the winner touches the journal.
        let at = self.clock.now();
        let reopened = match self.store.cas_status(
            &tx.hash,
            tx.status,
            TransactionStatus::Activated,
            TxPatch {
                current_worker: Some(None),
                blocked_at: Some(Some(at)),
                ..TxPatch::default()
            },
            at,
        ) {
            Ok(tx) => tx,
            Err(StoreError::StaleStatus { .. }) => {
                // Raced with the worker's own final CAS; it won.
                self.release(hash);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let round_index = tx.consensus_history.len().saturating_sub(1) as u32;
        self.store
            .close_round(hash, round_index, RoundTag::WorkerLost)?;

        let mut entry = ConsensusRoundEntry::new(round_index + 1);
        entry.record_phase(&TransactionStatus::Activated.to_string(), at);
        entry.record_status(TransactionStatus::Activated);
        self.store.append_round(hash, entry)?;

        {
            let mut state = self.state.lock();
            state.leases.remove(hash);
            if state.in_flight.get(&contract) == Some(hash) {
                state.in_flight.remove(&contract);
            }
            state.enqueue(contract, *hash, true);
        }
        self.notify.notify_waiters();

        self.events.publish(StatusEvent {
            hash: *hash,
            sender: reopened.from,
            contract: reopened.to,
            status: TransactionStatus::Activated,
            round_index: round_index + 1,
            tag: Some(RoundTag::WorkerLost),
            at,
        });
        Ok(true)
    }

    /// Runs the lease reaper until shutdown. Period is a sixth of the
    /// lease so a lost worker is noticed well before a second lease term.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        let period = std::cmp::max(
            self.config.worker_lease / 6,
            std::time::Duration::from_millis(100),
        );
        info!(period_ms = period.as_millis() as u64, "lease reaper running");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.reap_expired() {
                warn!(error = %e, "lease reap failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("lease reaper stopped");
    }

    /// Current (worker, transaction) assignments, for metrics and status.
    pub fn active_leases(&self) -> Vec<(WorkerId, TxHash)> {
        self.state
            .lock()
            .leases
            .iter()
            .map(|(hash, lease)| (lease.worker, *hash))
            .collect()
    }

    /// Transactions queued across all contracts, for metrics.
    pub fn queued_len(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
