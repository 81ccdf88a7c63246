//! # Core Runtime
//!
//! The explicit context object that replaces the global singletons a
//! system like this tends to grow. `CoreRuntime::start` opens storage,
//! builds every component, wires them through constructors, and spawns
//! the task fleet: crawler, lease reaper, worker pool, finalization
//! timer. The node binary holds one `Arc<CoreRuntime>` and calls the
//! handler methods below from its RPC layer; nothing else reaches into
//! the internals.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::appeal::{AppealEngine, AppealError, AppealReceipt};
use crate::config::{CoreConfig, FinalityWindowHandle};
use crate::consensus::machine::{RegistryCapability, StateMachine};
use crate::events::{EventBus, StatusEvent, Subscription, Topic};
use crate::executor::ValidatorExecutor;
use crate::finality::FinalizationTimer;
use crate::primitives::clock::{Clock, SystemClock};
use crate::primitives::ids::{TxHash, WorkerId};
use crate::registry::{SelectionWeighting, ValidatorRegistry};
use crate::sched::crawler::Crawler;
use crate::sched::dispatcher::Dispatcher;
use crate::sched::worker::WorkerPool;
use crate::store::snapshots::SnapshotStore;
use crate::store::tx_store::{StoreError, TransactionStore, TxPatch};
use crate::transaction::envelope::{IngressError, SignedEnvelope};
use crate::transaction::types::{Transaction, TransactionStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced to the RPC layer. The node maps these onto JSON-RPC
/// error codes; everything validation-shaped carries a reason string.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transaction not found: {0}")]
    NotFound(TxHash),

    #[error(transparent)]
    Appeal(#[from] AppealError),

    #[error("internal storage error: {0}")]
    Store(StoreError),
}

impl From<IngressError> for CoreError {
    fn from(e: IngressError) -> Self {
        CoreError::Validation(e.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(hash) => CoreError::NotFound(hash),
            StoreError::DuplicateHash(_) | StoreError::DuplicateNonce { .. } => {
                CoreError::Validation(e.to_string())
            }
            other => CoreError::Store(other),
        }
    }
}

/// Point-in-time counters for `/status` and metrics scrapes.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CoreStats {
    pub pending: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub validators: usize,
    pub subscribers: usize,
    pub finality_window_seconds: u64,
}

// ---------------------------------------------------------------------------
// CoreRuntime
// ---------------------------------------------------------------------------

/// The assembled consensus core.
#[derive(Debug)]
pub struct CoreRuntime {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    store: Arc<TransactionStore>,
    snapshots: Arc<SnapshotStore>,
    registry: Arc<ValidatorRegistry>,
    events: EventBus,
    dispatcher: Arc<Dispatcher>,
    appeal_engine: AppealEngine,
    window: FinalityWindowHandle,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreRuntime {
    /// Starts a runtime over an on-disk store.
    pub fn start<P: AsRef<Path>>(
        config: CoreConfig,
        path: P,
        executor: Arc<dyn ValidatorExecutor>,
    ) -> Result<Arc<Self>, CoreError> {
        let db = sled::open(path).map_err(StoreError::from)?;
        Self::start_with(config, db, executor, SystemClock::shared())
    }

    /// Starts a runtime over a throwaway in-memory store. Dev mode and
    /// tests.
    pub fn start_temporary(
        config: CoreConfig,
        executor: Arc<dyn ValidatorExecutor>,
    ) -> Result<Arc<Self>, CoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(StoreError::from)?;
        Self::start_with(config, db, executor, SystemClock::shared())
    }

    /// Full-control constructor: bring your own sled handle and clock.
    pub fn start_with(
        config: CoreConfig,
        db: sled::Db,
        executor: Arc<dyn ValidatorExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, CoreError> {
        let store = Arc::new(TransactionStore::from_db(db.clone())?);
        let snapshots = Arc::new(SnapshotStore::from_db(db)?);
        let registry = Arc::new(ValidatorRegistry::new(SelectionWeighting::Proportional));
        let events = EventBus::new(config.event_bus_buffer);

        // The persisted window (admin-set) outlives restarts; the config
        // value is only the first-boot default.
        let window = FinalityWindowHandle::new(
            store
                .get_finality_window_ms()?
                .map(Duration::from_millis)
                .unwrap_or(config.finality_window),
        );

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
            config.clone(),
        ));
        dispatcher.recover()?;

        let capability = Arc::new(RegistryCapability::new(Arc::clone(&registry), executor));
        let machine = Arc::new(StateMachine::new(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            capability,
            events.clone(),
            Arc::clone(&clock),
            config.clone(),
        ));

        let appeal_engine = AppealEngine::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            events.clone(),
            Arc::clone(&clock),
            window.clone(),
            config.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Crawler.
        let crawler = Crawler::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            events.clone(),
            Arc::clone(&clock),
            config.clone(),
        );
        let crawler_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            crawler.run(crawler_shutdown).await;
        }));

        // Lease reaper.
        let reaper_dispatcher = Arc::clone(&dispatcher);
        let reaper_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            reaper_dispatcher.run_reaper(reaper_shutdown).await;
        }));

        // Worker fleet.
        let pool = WorkerPool::new(Arc::clone(&dispatcher), machine, config.clone());
        tasks.extend(pool.spawn(shutdown_rx.clone()));

        // Finalization timer.
        let finalizer = FinalizationTimer::new(
            Arc::clone(&store),
            events.clone(),
            Arc::clone(&clock),
            window.clone(),
            config.clone(),
        );
        tasks.push(tokio::spawn(async move {
            finalizer.run(shutdown_rx).await;
        }));

        info!(
            workers = config.worker_count,
            window_ms = window.get().as_millis() as u64,
            "consensus core started"
        );

        Ok(Arc::new(Self {
            config,
            clock,
            store,
            snapshots,
            registry,
            events,
            dispatcher,
            appeal_engine,
            window,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
        }))
    }

    // -- RPC handlers --------------------------------------------------------

    /// `send_raw_transaction`: decode, verify, enforce the queue bound,
    /// persist PENDING, announce.
    pub fn submit_raw(&self, raw: &[u8]) -> Result<TxHash, CoreError> {
        let envelope = SignedEnvelope::decode(raw)?;
        envelope.verify()?;

        if self.store.count_pending()? >= self.config.pending_queue_max {
            return Err(CoreError::Validation("pending queue is full".into()));
        }

        let hash = SignedEnvelope::hash_raw(raw);
        let now = self.clock.now();
        let tx = envelope.into_transaction(hash, &self.config, now)?;
        self.store.insert(&tx)?;

        self.events.publish(StatusEvent {
            hash,
            sender: tx.from,
            contract: tx.to,
            status: TransactionStatus::Pending,
            round_index: 0,
            tag: None,
            at: now,
        });
        info!(hash = %hash, kind = %tx.kind, "transaction accepted");
        Ok(hash)
    }

    /// `get_transaction`: the full record, journal included.
    pub fn get_transaction(&self, hash: &TxHash) -> Result<Transaction, CoreError> {
        Ok(self.store.get(hash)?)
    }

    /// `get_transaction_status`.
    pub fn get_status(&self, hash: &TxHash) -> Result<TransactionStatus, CoreError> {
        Ok(self.store.get(hash)?.status)
    }

    /// `appeal_transaction`.
    pub fn appeal(&self, hash: &TxHash) -> Result<AppealReceipt, AppealError> {
        self.appeal_engine.appeal(hash)
    }

    /// `cancel_transaction`: legal only while PENDING or ACTIVATED.
    /// Cancelling a CANCELED transaction is a no-op returning the same
    /// record.
    pub fn cancel(&self, hash: &TxHash) -> Result<Transaction, CoreError> {
        loop {
            let tx = self.store.get(hash)?;
            match tx.status {
                TransactionStatus::Canceled => return Ok(tx),
                TransactionStatus::Pending | TransactionStatus::Activated => {
                    let at = self.clock.now();
                    match self.store.cas_status(
                        hash,
                        tx.status,
                        TransactionStatus::Canceled,
                        TxPatch::none(),
                        at,
                    ) {
                        Ok(canceled) => {
                            self.events.publish(StatusEvent {
                                hash: *hash,
                                sender: canceled.from,
                                contract: canceled.to,
                                status: TransactionStatus::Canceled,
                                round_index: canceled.consensus_history.len().saturating_sub(1)
                                    as u32,
                                tag: None,
                                at,
                            });
                            info!(hash = %hash, "canceled");
                            return Ok(canceled);
                        }
                        // Moved under us (crawler or dispatcher won);
                        // re-evaluate from the fresh status.
                        Err(StoreError::StaleStatus { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                status => {
                    return Err(CoreError::Validation(format!(
                        "cannot cancel transaction in state {status}"
                    )))
                }
            }
        }
    }

    /// `get_finality_window`.
    pub fn get_finality_window(&self) -> Duration {
        self.window.get()
    }

    /// `set_finality_window` (admin): applies immediately and persists
    /// across restarts.
    pub fn set_finality_window(&self, window: Duration) -> Result<(), CoreError> {
        self.window.set(window);
        self.store
            .put_finality_window_ms(window.as_millis() as u64)?;
        info!(window_ms = window.as_millis() as u64, "finality window updated");
        Ok(())
    }

    /// `subscribe`: attach to a topic on the event bus.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.events.subscribe(topic)
    }

    // -- Component access ----------------------------------------------------

    pub fn registry(&self) -> &Arc<ValidatorRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Current worker assignments, for the status surface.
    pub fn active_workers(&self) -> Vec<(WorkerId, TxHash)> {
        self.dispatcher.active_leases()
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> Result<CoreStats, CoreError> {
        Ok(CoreStats {
            pending: self.store.count_pending()?,
            queued: self.dispatcher.queued_len(),
            in_flight: self.dispatcher.active_leases().len(),
            validators: self.registry.len(),
            subscribers: self.events.subscriber_count(),
            finality_window_seconds: self.window.get().as_secs(),
        })
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Signals every task to stop and waits for them to drain.
    pub async fn shutdown(&self) {
        info!("consensus core shutting down");
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("consensus core stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::primitives::keys::Keypair;
    use crate::transaction::envelope::TxPayload;
    use crate::transaction::types::TransactionKind;
    use crate::primitives::ids::Address;

    fn runtime(validators: u8, config: CoreConfig) -> Arc<CoreRuntime> {
        let executor: Arc<dyn ValidatorExecutor> = Arc::new(MockExecutor::new());
        let runtime = CoreRuntime::start_temporary(config, executor).unwrap();
        for i in 0..validators {
            runtime
                .registry()
                .add(
                    Address([i + 1; 20]),
                    1_000,
                    "ollama",
                    "llama3",
                    serde_json::json!({}),
                )
                .unwrap();
        }
        runtime
    }

    fn signed_call(keypair: &Keypair, nonce: u64) -> Vec<u8> {
        SignedEnvelope::sign(
            TxPayload {
                from: keypair.address(),
                to: Some(Address([0xC0; 20])),
                kind: TransactionKind::Call,
                nonce,
                value: 0,
                input: b"method:ping".to_vec(),
                committee_size: None,
                execution_mode: None,
                max_rotations: None,
            },
            keypair,
        )
        .encode()
    }

    #[tokio::test]
    async fn submit_then_get_roundtrip() {
        let runtime = runtime(3, CoreConfig::default());
        let keypair = Keypair::generate();
        let raw = signed_call(&keypair, 0);

        let hash = runtime.submit_raw(&raw).unwrap();
        let tx = runtime.get_transaction(&hash).unwrap();
        assert_eq!(tx.hash, hash);
        assert_eq!(tx.from, keypair.address());
        assert_eq!(tx.nonce, 0);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_nonce_rejected_at_ingress() {
        let runtime = runtime(3, CoreConfig::default());
        let keypair = Keypair::generate();

        runtime.submit_raw(&signed_call(&keypair, 0)).unwrap();
        // Different input bytes, same (from, nonce).
        let second = SignedEnvelope::sign(
            TxPayload {
                from: keypair.address(),
                to: Some(Address([0xC0; 20])),
                kind: TransactionKind::Call,
                nonce: 0,
                value: 7,
                input: b"method:other".to_vec(),
                committee_size: None,
                execution_mode: None,
                max_rotations: None,
            },
            &keypair,
        );
        let result = runtime.submit_raw(&second.encode());
        assert!(matches!(result, Err(CoreError::Validation(_))));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn garbage_submission_rejected() {
        let runtime = runtime(0, CoreConfig::default());
        assert!(matches!(
            runtime.submit_raw(b"definitely not bincode"),
            Err(CoreError::Validation(_))
        ));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn queue_cap_refuses_new_submissions() {
        let config = CoreConfig {
            pending_queue_max: 2,
            // Keep the crawler from draining the queue mid-test.
            crawler_period: Duration::from_secs(3600),
            ..CoreConfig::default()
        };
        let runtime = runtime(3, config);
        let keypair = Keypair::generate();

        runtime.submit_raw(&signed_call(&keypair, 0)).unwrap();
        runtime.submit_raw(&signed_call(&keypair, 1)).unwrap();
        let third = runtime.submit_raw(&signed_call(&keypair, 2));
        assert!(matches!(third, Err(CoreError::Validation(reason)) if reason.contains("full")));

        // Existing transactions unaffected.
        assert_eq!(runtime.stats().unwrap().pending, 2);
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_pending_and_idempotence() {
        let config = CoreConfig {
            crawler_period: Duration::from_secs(3600),
            ..CoreConfig::default()
        };
        let runtime = runtime(3, config);
        let keypair = Keypair::generate();
        let hash = runtime.submit_raw(&signed_call(&keypair, 0)).unwrap();

        let canceled = runtime.cancel(&hash).unwrap();
        assert_eq!(canceled.status, TransactionStatus::Canceled);

        // Second cancel: same record, no error.
        let again = runtime.cancel(&hash).unwrap();
        assert_eq!(again.status, TransactionStatus::Canceled);
        assert_eq!(again.hash, canceled.hash);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn finality_window_setter_round_trips() {
        let runtime = runtime(0, CoreConfig::default());
        runtime
            .set_finality_window(Duration::from_secs(42))
            .unwrap();
        assert_eq!(runtime.get_finality_window(), Duration::from_secs(42));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_hash_is_not_found() {
        let runtime = runtime(0, CoreConfig::default());
        let missing = TxHash([0xEE; 32]);
        assert!(matches!(
            runtime.get_status(&missing),
            Err(CoreError::NotFound(h)) if h == missing
        ));
        runtime.shutdown().await;
    }
}
