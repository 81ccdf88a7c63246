//! The activation crawler.
//!
//! A periodic scanner that promotes eligible PENDING transactions to
//! ACTIVATED, strictly lowest-nonce-first per contract, and hands them to
//! the dispatcher. Contracts with a transaction already in flight are left
//! alone — activation order is the queue order, and the queue only moves
//! one at a time per contract.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, CRAWLER_BACKOFF_CAP};
use crate::events::{EventBus, StatusEvent};
use crate::primitives::clock::Clock;
use crate::sched::dispatcher::Dispatcher;
use crate::store::tx_store::{StoreError, StoreResult, TransactionStore, TxPatch};
use crate::transaction::types::{ConsensusRoundEntry, TransactionStatus};

/// The crawler task. One per deployment.
#[derive(Debug)]
pub struct Crawler {
    store: Arc<TransactionStore>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl Crawler {
    pub fn new(
        store: Arc<TransactionStore>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            clock,
            config,
        }
    }

    /// Runs the periodic scan until shutdown. Store errors never drop a
    /// transaction — the scan backs off exponentially and retries.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_ms = self.config.crawler_period.as_millis() as u64,
            "crawler running"
        );
        let mut backoff: Option<Duration> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick() {
                Ok(activated) => {
                    if activated > 0 {
                        debug!(activated, "crawler tick");
                    }
                    backoff = None;
                }
                Err(e) => {
                    let next = backoff
                        .map(|b| std::cmp::min(b * 2, CRAWLER_BACKOFF_CAP))
                        .unwrap_or(self.config.crawler_period * 2);
                    warn!(error = %e, backoff_ms = next.as_millis() as u64, "crawler tick failed");
                    backoff = Some(next);
                }
            }

            let sleep = backoff.unwrap_or(self.config.crawler_period);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("crawler stopped");
    }

    /// One scan pass. Public so tests can drive the crawler by hand.
    ///
    /// For each contract with pending work and nothing in flight, the
    /// lowest-nonce PENDING row is CASed to ACTIVATED with round 0 opened
    /// (`monitoring.PENDING` backdated to insertion). A lost CAS means
    /// someone else moved the row; the next tick re-evaluates.
    pub fn tick(&self) -> StoreResult<usize> {
        let mut activated = 0;

        for contract in self.store.contracts_with_work()? {
            if self.store.has_in_flight(&contract)? {
                continue;
            }

            let head = match self.store.list_pending_by_contract(&contract, 1)?.pop() {
                Some(tx) => tx,
                None => continue,
            };

            let now = self.clock.now();
            if head.consensus_history.is_empty() {
                let mut entry = ConsensusRoundEntry::new(0);
                entry.record_phase(&TransactionStatus::Pending.to_string(), head.created_at);
                entry.record_status(TransactionStatus::Pending);
                if let Err(e) = self.store.append_round(&head.hash, entry) {
                    // A concurrent activation already opened round 0; the
                    // CAS below settles who wins.
                    debug!(hash = %head.hash, error = %e, "round 0 already open");
                }
            }

            match self.store.cas_status(
                &head.hash,
                TransactionStatus::Pending,
                TransactionStatus::Activated,
                TxPatch::none(),
                now,
            ) {
                Ok(tx) => {
                    self.dispatcher.enqueue(contract, tx.hash);
                    self.events.publish(StatusEvent {
                        hash: tx.hash,
                        sender: tx.from,
                        contract: tx.to,
                        status: TransactionStatus::Activated,
                        round_index: 0,
                        tag: None,
                        at: now,
                    });
                    activated += 1;
                }
                Err(StoreError::StaleStatus { .. }) => {
                    // Canceled or raced; nothing to do this tick.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(activated)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
