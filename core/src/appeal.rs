//! # Appeal Engine
//!
//! User-initiated re-runs. An appeal reopens an ACCEPTED (or terminally
//! failed) transaction before its finality window expires, enlarges the
//! committee for the next round, and routes the transaction back through
//! the dispatcher so the per-contract serialization invariant is enforced
//! by the same mechanism as a first run.
//!
//! The core records appeal counters and round tags; the economics of
//! repeated failed appeals (reward and window reduction) are a policy
//! concern that lives outside this crate.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{CoreConfig, FinalityWindowHandle, MAX_COMMITTEE_SIZE};
use crate::events::{EventBus, StatusEvent};
use crate::primitives::clock::Clock;
use crate::primitives::ids::TxHash;
use crate::sched::dispatcher::Dispatcher;
use crate::store::tx_store::{StoreError, TransactionStore, TxPatch};
use crate::transaction::types::{ConsensusRoundEntry, RoundTag, TransactionStatus};

// ---------------------------------------------------------------------------
// Errors & results
// ---------------------------------------------------------------------------

/// Why an appeal was refused.
#[derive(Debug, thiserror::Error)]
pub enum AppealError {
    #[error("transaction not found: {0}")]
    NotFound(TxHash),

    #[error("finality window expired")]
    WindowExpired,

    #[error("transaction already finalized")]
    AlreadyFinalized,

    #[error("transaction in state {0} cannot be appealed")]
    InvalidState(TransactionStatus),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for AppealError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(hash) => AppealError::NotFound(hash),
            other => AppealError::Store(other),
        }
    }
}

/// What an accepted appeal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppealReceipt {
    pub appeal_count: u32,
    pub committee_size: usize,
    /// False when the call was a no-op because this appeal round is
    /// already in progress.
    pub reopened: bool,
}

// ---------------------------------------------------------------------------
// AppealEngine
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppealEngine {
    store: Arc<TransactionStore>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    window: FinalityWindowHandle,
    config: CoreConfig,
}

impl AppealEngine {
    pub fn new(
        store: Arc<TransactionStore>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        window: FinalityWindowHandle,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            clock,
            window,
            config,
        }
    }

    /// Opens an appeal on `hash`.
    ///
    /// Atomically (CAS-backed): reopens the transaction to ACTIVATED,
    /// increments `appeal_count`, multiplies the committee size, appends a
    /// round tagged `Appeal`, clears the finalization timestamp so the
    /// timer cannot promote a transaction under appeal, and requeues it.
    ///
    /// Re-appealing while the appeal round is still in progress is a
    /// no-op returning the current counters.
    pub fn appeal(&self, hash: &TxHash) -> Result<AppealReceipt, AppealError> {
        let tx = self.store.get(hash)?;

        match tx.status {
            TransactionStatus::Finalized => return Err(AppealError::AlreadyFinalized),
            TransactionStatus::Accepted => {
                let opened_at = tx
                    .timestamp_awaiting_finalization
                    .unwrap_or(tx.created_at);
                if self.clock.since(opened_at) >= self.window.get() {
                    return Err(AppealError::WindowExpired);
                }
            }
            status if status.is_appealable_failure() => {
                // Terminal failures never started a window; always open.
            }
            // Idempotency: the transaction is already back in the pipeline
            // under an open Appeal round.
            TransactionStatus::Activated
            | TransactionStatus::Proposing
            | TransactionStatus::Committing
            | TransactionStatus::Revealing
                if appeal_in_progress(&tx) =>
            {
                return Ok(AppealReceipt {
                    appeal_count: tx.appeal_count,
                    committee_size: tx.committee_size,
                    reopened: false,
                });
            }
            status => return Err(AppealError::InvalidState(status)),
        }

        let appeal_count = tx.appeal_count + 1;
        let committee_size = std::cmp::min(
            tx.committee_size
                .saturating_mul(self.config.appeal_committee_multiplier as usize),
            MAX_COMMITTEE_SIZE,
        );

        let at = self.clock.now();
        let reopened = match self.store.cas_status(
            hash,
            tx.status,
            TransactionStatus::Activated,
            TxPatch::none()
                .appeal_count(appeal_count)
                .committee_size(committee_size)
                .clear_awaiting_finalization()
                .clear_worker(),
            at,
        ) {
            Ok(tx) => tx,
            Err(StoreError::StaleStatus { actual, .. }) => {
                // Raced with the finalizer or another appeal; re-resolve.
                warn!(hash = %hash, actual = %actual, "appeal raced, re-reading");
                return match actual {
                    TransactionStatus::Finalized => Err(AppealError::AlreadyFinalized),
                    _ => self.appeal(hash),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let round_index = reopened.consensus_history.len() as u32;
        let mut entry = ConsensusRoundEntry::new(round_index);
        entry.consensus_round = Some(RoundTag::Appeal);
        entry.appeal = true;
        entry.record_phase(&TransactionStatus::Activated.to_string(), at);
        entry.record_status(TransactionStatus::Activated);
        self.store.append_round(hash, entry)?;

        if let Some(contract) = reopened.to {
            self.dispatcher.enqueue(contract, *hash);
        }

        self.events.publish(StatusEvent {
            hash: *hash,
            sender: reopened.from,
            contract: reopened.to,
            status: TransactionStatus::Activated,
            round_index,
            tag: Some(RoundTag::Appeal),
            at,
        });

        info!(
            hash = %hash,
            appeal = appeal_count,
            committee = committee_size,
            "appeal opened"
        );
        Ok(AppealReceipt {
            appeal_count,
            committee_size,
            reopened: true,
        })
    }
}

/// Whether the transaction's latest round is an appeal still being
/// re-run.
fn appeal_in_progress(tx: &crate::transaction::types::Transaction) -> bool {
    tx.last_round()
        .map(|round| round.consensus_round == Some(RoundTag::Appeal))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::clock::ManualClock;
    use crate::primitives::ids::Address;
    use crate::transaction::types::{ExecutionMode, Transaction, TransactionKind};
    use std::time::Duration;

    struct Rig {
        store: Arc<TransactionStore>,
        clock: ManualClock,
        window: FinalityWindowHandle,
        engine: AppealEngine,
        dispatcher: Arc<Dispatcher>,
    }

    fn rig(window: Duration) -> Rig {
        let store = Arc::new(TransactionStore::open_temporary().unwrap());
        let clock = ManualClock::new(100_000);
        let events = EventBus::new(16);
        let config = CoreConfig::default();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::new(clock.clone()),
            events.clone(),
            config.clone(),
        ));
        let handle = FinalityWindowHandle::new(window);
        let engine = AppealEngine::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            events,
            Arc::new(clock.clone()),
            handle.clone(),
            config,
        );
        Rig {
            store,
            clock,
            window: handle,
            engine,
            dispatcher,
        }
    }

    /// Builds a transaction sitting in ACCEPTED with one closed round.
    fn accepted_tx(r: &Rig, hash_byte: u8) -> TxHash {
        let hash = TxHash([hash_byte; 32]);
        let tx = Transaction {
            hash,
            from: Address([1; 20]),
            to: Some(Address([2; 20])),
            kind: TransactionKind::Call,
            nonce: hash_byte as u64,
            input: vec![],
            value: 0,
            status: TransactionStatus::Pending,
            execution_mode: ExecutionMode::Normal,
            committee_size: 5,
            max_rotations: 3,
            rotation_count: 0,
            appeal_count: 0,
            consensus_history: Vec::new(),
            triggered_by_hash: None,
            current_worker: None,
            timestamp_awaiting_finalization: None,
            blocked_at: None,
            last_vote_timestamp: None,
            created_at: r.clock.now(),
        };
        r.store.insert(&tx).unwrap();
        r.store
            .append_round(&hash, ConsensusRoundEntry::new(0))
            .unwrap();
        let now = r.clock.now();
        for (from, to) in [
            (TransactionStatus::Pending, TransactionStatus::Activated),
            (TransactionStatus::Activated, TransactionStatus::Proposing),
            (TransactionStatus::Proposing, TransactionStatus::Committing),
            (TransactionStatus::Committing, TransactionStatus::Revealing),
        ] {
            r.store
                .cas_status(&hash, from, to, TxPatch::none(), now)
                .unwrap();
        }
        r.store
            .cas_status(
                &hash,
                TransactionStatus::Revealing,
                TransactionStatus::Accepted,
                TxPatch::none().awaiting_finalization(now),
                now,
            )
            .unwrap();
        r.store
            .close_round(&hash, 0, RoundTag::Accepted)
            .unwrap();
        hash
    }

    #[test]
    fn appeal_inside_window_reopens_with_doubled_committee() {
        let r = rig(Duration::from_secs(100));
        let hash = accepted_tx(&r, 1);

        r.clock.advance(Duration::from_secs(50));
        let receipt = r.engine.appeal(&hash).unwrap();
        assert!(receipt.reopened);
        assert_eq!(receipt.appeal_count, 1);
        assert_eq!(receipt.committee_size, 10);

        let tx = r.store.get(&hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Activated);
        assert_eq!(tx.appeal_count, 1);
        assert_eq!(tx.committee_size, 10);
        assert!(tx.timestamp_awaiting_finalization.is_none());
        assert_eq!(tx.consensus_history.len(), 2);
        assert_eq!(
            tx.consensus_history[1].consensus_round,
            Some(RoundTag::Appeal)
        );
        assert_eq!(r.dispatcher.queued_len(), 1);
    }

    #[test]
    fn appeal_outside_window_refused() {
        let r = rig(Duration::from_secs(100));
        let hash = accepted_tx(&r, 1);

        r.clock.advance(Duration::from_secs(101));
        assert!(matches!(
            r.engine.appeal(&hash),
            Err(AppealError::WindowExpired)
        ));
    }

    #[test]
    fn appeal_on_finalized_refused() {
        let r = rig(Duration::from_secs(100));
        let hash = accepted_tx(&r, 1);
        r.store
            .cas_status(
                &hash,
                TransactionStatus::Accepted,
                TransactionStatus::Finalized,
                TxPatch::none(),
                r.clock.now(),
            )
            .unwrap();

        assert!(matches!(
            r.engine.appeal(&hash),
            Err(AppealError::AlreadyFinalized)
        ));
    }

    #[test]
    fn appeal_on_pending_refused() {
        let r = rig(Duration::from_secs(100));
        let hash = TxHash([9; 32]);
        let tx = Transaction {
            hash,
            from: Address([1; 20]),
            to: Some(Address([2; 20])),
            kind: TransactionKind::Call,
            nonce: 0,
            input: vec![],
            value: 0,
            status: TransactionStatus::Pending,
            execution_mode: ExecutionMode::Normal,
            committee_size: 5,
            max_rotations: 3,
            rotation_count: 0,
            appeal_count: 0,
            consensus_history: Vec::new(),
            triggered_by_hash: None,
            current_worker: None,
            timestamp_awaiting_finalization: None,
            blocked_at: None,
            last_vote_timestamp: None,
            created_at: 0,
        };
        r.store.insert(&tx).unwrap();

        assert!(matches!(
            r.engine.appeal(&hash),
            Err(AppealError::InvalidState(TransactionStatus::Pending))
        ));
    }

    #[test]
    fn repeated_appeal_is_a_no_op() {
        let r = rig(Duration::from_secs(100));
        let hash = accepted_tx(&r, 1);

        let first = r.engine.appeal(&hash).unwrap();
        assert!(first.reopened);

        // The appeal round is open; appealing again changes nothing.
        let second = r.engine.appeal(&hash).unwrap();
        assert!(!second.reopened);
        assert_eq!(second.appeal_count, 1);

        let tx = r.store.get(&hash).unwrap();
        assert_eq!(tx.appeal_count, 1);
        assert_eq!(tx.consensus_history.len(), 2);
    }

    #[test]
    fn terminal_failure_is_appealable() {
        let r = rig(Duration::from_secs(100));
        let hash = accepted_tx(&r, 1);
        // Walk to a terminal failure via an appeal-free path: fake it by
        // reopening and closing as Undetermined.
        let tx = r.store.get(&hash).unwrap();
        drop(tx);
        // Accepted -> Activated (reclaim edge) -> ... simpler: use the
        // appeal itself, then mark its round Undetermined and status.
        r.engine.appeal(&hash).unwrap();
        for (from, to) in [
            (TransactionStatus::Activated, TransactionStatus::Proposing),
            (TransactionStatus::Proposing, TransactionStatus::Undetermined),
        ] {
            r.store
                .cas_status(&hash, from, to, TxPatch::none(), r.clock.now())
                .unwrap();
        }
        r.store
            .close_round(&hash, 1, RoundTag::Undetermined)
            .unwrap();

        let receipt = r.engine.appeal(&hash).unwrap();
        assert!(receipt.reopened);
        assert_eq!(receipt.appeal_count, 2);
        assert_eq!(receipt.committee_size, 20);
    }

    #[test]
    fn committee_growth_is_capped() {
        let r = rig(Duration::from_secs(1_000_000));
        let hash = accepted_tx(&r, 1);

        // Drive appeal_count high enough to hit the ceiling.
        let mut expected = 5usize;
        for round in 1..=6u32 {
            let receipt = r.engine.appeal(&hash).unwrap();
            expected = std::cmp::min(expected * 2, MAX_COMMITTEE_SIZE);
            assert_eq!(receipt.committee_size, expected);
            assert_eq!(receipt.appeal_count, round);

            // Close this appeal round as Undetermined so the next appeal
            // is accepted.
            for (from, to) in [
                (TransactionStatus::Activated, TransactionStatus::Proposing),
                (TransactionStatus::Proposing, TransactionStatus::Undetermined),
            ] {
                r.store
                    .cas_status(&hash, from, to, TxPatch::none(), r.clock.now())
                    .unwrap();
            }
            r.store
                .close_round(&hash, round, RoundTag::Undetermined)
                .unwrap();
        }
        assert_eq!(expected, MAX_COMMITTEE_SIZE);
    }

    #[test]
    fn window_handle_changes_apply_immediately() {
        let r = rig(Duration::from_secs(100));
        let hash = accepted_tx(&r, 1);

        r.clock.advance(Duration::from_secs(50));
        // Admin shrinks the window below the elapsed time.
        r.window.set(Duration::from_secs(10));
        assert!(matches!(
            r.engine.appeal(&hash),
            Err(AppealError::WindowExpired)
        ));
    }
}
