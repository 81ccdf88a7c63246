//! The consensus worker pool.
//!
//! A fixed fleet of tasks, each driving one transaction at a time through
//! the state machine. Workers heartbeat their lease while the machine
//! runs; a worker that loses its lease abandons the run immediately and
//! lets the dispatcher's reclaim path own recovery. Permanent store
//! errors crash the worker — state must never be silently lost — and the
//! dispatcher reclaims whatever it held.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CoreConfig;
use crate::consensus::machine::{MachineOutcome, StateMachine};
use crate::primitives::ids::WorkerId;
use crate::sched::dispatcher::{DispatchError, Dispatcher};

/// Spawns and tracks the worker fleet.
#[derive(Debug)]
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    machine: Arc<StateMachine>,
    config: CoreConfig,
}

impl WorkerPool {
    pub fn new(dispatcher: Arc<Dispatcher>, machine: Arc<StateMachine>, config: CoreConfig) -> Self {
        Self {
            dispatcher,
            machine,
            config,
        }
    }

    /// Spawns `worker_count` workers. Each runs until shutdown or a
    /// permanent store failure.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|index| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let machine = Arc::clone(&self.machine);
                let config = self.config.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let id = WorkerId::new();
                    info!(worker = %id, index, "worker started");
                    worker_loop(dispatcher, machine, config, id, shutdown).await;
                    info!(worker = %id, index, "worker stopped");
                })
            })
            .collect()
    }
}

async fn worker_loop(
    dispatcher: Arc<Dispatcher>,
    machine: Arc<StateMachine>,
    config: CoreConfig,
    id: WorkerId,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let lease = match dispatcher.acquire(id, &mut shutdown).await {
            Ok(lease) => lease,
            Err(DispatchError::Shutdown) => return,
            Err(DispatchError::Store(e)) if e.is_transient() => {
                warn!(worker = %id, error = %e, "transient store error acquiring work");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            Err(DispatchError::Store(e)) => {
                error!(worker = %id, error = %e, "permanent store error, worker exiting");
                return;
            }
        };

        let hash = lease.tx.hash;
        debug!(worker = %id, hash = %hash, "processing");

        // Drive the machine and the heartbeat together. A false heartbeat
        // means the lease was reclaimed: drop the run on the floor — the
        // transaction is already back in the queue under a WorkerLost tag.
        let run = machine.run(hash, shutdown.clone());
        tokio::pin!(run);
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.reset();

        let outcome = loop {
            tokio::select! {
                result = &mut run => break Some(result),
                _ = heartbeat.tick() => {
                    if !dispatcher.heartbeat(id, &hash) {
                        warn!(worker = %id, hash = %hash, "lease lost, abandoning run");
                        break None;
                    }
                }
            }
        };

        dispatcher.release(&hash);

        match outcome {
            None => {}
            Some(Ok(outcome)) => {
                debug!(worker = %id, hash = %hash, outcome = ?outcome, "run complete");
                if outcome == MachineOutcome::Canceled && *shutdown.borrow() {
                    return;
                }
            }
            Some(Err(e)) if e.is_transient() => {
                warn!(worker = %id, hash = %hash, error = %e, "transient store error mid-run");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Some(Err(e)) => {
                // Persistence is broken; continuing would risk silent
                // state loss. The dispatcher reclaims the lease.
                error!(worker = %id, hash = %hash, error = %e, "permanent store error, worker exiting");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
