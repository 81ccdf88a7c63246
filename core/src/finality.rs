//! # Finalization Timer
//!
//! The sweep that promotes ACCEPTED transactions to FINALIZED once their
//! finality window has passed without an appeal. Sweeps are cheap store
//! scans; precision is a fraction of the window, which is the user-facing
//! guarantee — this is a deadline for appeals, not a real-time system.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, FinalityWindowHandle};
use crate::events::{EventBus, StatusEvent};
use crate::primitives::clock::Clock;
use crate::store::tx_store::{StoreError, StoreResult, TransactionStore, TxPatch};
use crate::transaction::types::{RoundTag, TransactionStatus};

/// The finalization sweeper. One per deployment.
#[derive(Debug)]
pub struct FinalizationTimer {
    store: Arc<TransactionStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    window: FinalityWindowHandle,
    config: CoreConfig,
}

impl FinalizationTimer {
    pub fn new(
        store: Arc<TransactionStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        window: FinalityWindowHandle,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            window,
            config,
        }
    }

    /// Runs periodic sweeps until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            window_ms = self.window.get().as_millis() as u64,
            "finalization timer running"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.sweep() {
                Ok(finalized) if finalized > 0 => {
                    debug!(finalized, "finalization sweep");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "finalization sweep failed"),
            }

            // The period tracks the current window so admin changes take
            // effect without a restart.
            let period = {
                let mut config = self.config.clone();
                config.finality_window = self.window.get();
                config.finality_sweep_period()
            };
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("finalization timer stopped");
    }

    /// One sweep pass. Public so tests can drive the timer by hand.
    ///
    /// Promotes every ACCEPTED transaction whose window has fully elapsed.
    /// An appeal that lands mid-sweep wins the race: its CAS moves the
    /// transaction out of ACCEPTED first and the promotion here loses
    /// cleanly as a stale status.
    pub fn sweep(&self) -> StoreResult<usize> {
        let window = self.window.get();
        let mut finalized = 0;

        for tx in self.store.list_awaiting_finalization()? {
            let accepted_at = match tx.timestamp_awaiting_finalization {
                Some(at) => at,
                None => continue,
            };
            if self.clock.since(accepted_at) < window {
                continue;
            }

            let at = self.clock.now();
            match self.store.cas_status(
                &tx.hash,
                TransactionStatus::Accepted,
                TransactionStatus::Finalized,
                TxPatch::none(),
                at,
            ) {
                Ok(promoted) => {
                    finalized += 1;
                    info!(hash = %promoted.hash, "finalized");
                    self.events.publish(StatusEvent {
                        hash: promoted.hash,
                        sender: promoted.from,
                        contract: promoted.to,
                        status: TransactionStatus::Finalized,
                        round_index: promoted.consensus_history.len().saturating_sub(1) as u32,
                        tag: Some(RoundTag::Accepted),
                        at,
                    });
                }
                Err(StoreError::StaleStatus { .. }) => {
                    // An appeal got there first. Fine.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(finalized)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
