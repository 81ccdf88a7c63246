//! The consensus state machine.
//!
//! One invocation drives one transaction through as many rounds as its
//! rotation budget allows: the leader executes, validators commit and
//! reveal under the equivalence principle, votes are tallied, and the
//! transaction lands on Accepted or one of the terminal failures. Every
//! transition is a CAS against the store; every await honors the
//! cancellation token; every round leaves a closed journal entry behind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{CoreConfig, EXECUTOR_OVERLOAD_RETRIES, EXECUTOR_RETRY_BACKOFF};
use crate::events::{EventBus, StatusEvent};
use crate::executor::{
    EquivalenceEnvelope, ExecutionReceipt, ExecutionResult, ExecutorFailure, ExecutorOutcome,
    ExecutorRequest, ExecutorRole, HostData, ValidatorExecutor,
};
use crate::primitives::clock::Clock;
use crate::primitives::ids::{Address, TxHash};
use crate::registry::{CommitteeSnapshot, RegistryError, ValidatorRegistry};
use crate::store::snapshots::SnapshotStore;
use crate::store::tx_store::{StoreError, StoreResult, TransactionStore, TxPatch};
use crate::transaction::types::{
    ConsensusRoundEntry, ExecutionMode, RoundTag, Transaction, TransactionKind,
    TransactionStatus, ValidatorResult, Vote,
};

// ---------------------------------------------------------------------------
// ValidatorCapability
// ---------------------------------------------------------------------------

/// Everything the state machine is allowed to know about validators:
/// draw a committee, invoke the executor. Nothing else.
#[async_trait]
pub trait ValidatorCapability: Send + Sync + std::fmt::Debug {
    fn select_committee(
        &self,
        hash: &TxHash,
        round_index: u32,
        size: usize,
        exclude: &[Address],
    ) -> Result<CommitteeSnapshot, RegistryError>;

    async fn invoke(&self, request: ExecutorRequest) -> Result<ExecutorOutcome, ExecutorFailure>;
}

/// The production capability: a registry plus an executor client.
#[derive(Debug)]
pub struct RegistryCapability {
    registry: Arc<ValidatorRegistry>,
    executor: Arc<dyn ValidatorExecutor>,
}

impl RegistryCapability {
    pub fn new(registry: Arc<ValidatorRegistry>, executor: Arc<dyn ValidatorExecutor>) -> Self {
        Self { registry, executor }
    }
}

#[async_trait]
impl ValidatorCapability for RegistryCapability {
    fn select_committee(
        &self,
        hash: &TxHash,
        round_index: u32,
        size: usize,
        exclude: &[Address],
    ) -> Result<CommitteeSnapshot, RegistryError> {
        self.registry.select_committee(hash, round_index, size, exclude)
    }

    async fn invoke(&self, request: ExecutorRequest) -> Result<ExecutorOutcome, ExecutorFailure> {
        self.executor.execute(request).await
    }
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// How a full machine run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutcome {
    Accepted,
    Undetermined,
    LeaderTimeout,
    ValidatorsTimeout,
    /// The run was cancelled (shutdown) or lost its claim on the
    /// transaction; the record is left for the dispatcher to reclaim.
    Canceled,
}

/// How a single round ended, internally.
enum RoundExit {
    Done(MachineOutcome),
    /// Round closed and rotation performed; run the next round.
    Rotated,
    Canceled,
}

/// Leader invocation result after retry/timeout handling.
enum LeaderCall {
    Produced(ExecutorOutcome),
    UserError(String),
    Failed(String),
    TimedOut,
    Canceled,
}

/// Validator invocation result after retry/timeout handling.
#[derive(Debug)]
enum ValidatorCall {
    Produced(ExecutorOutcome),
    UserError(String),
    Failed(String),
    TimedOut,
}

/// Bounded-wait outcome.
enum Waited<T> {
    Done(T),
    TimedOut,
    Canceled,
}

/// Waits for `fut`, a timeout, or cancellation — whichever wins.
async fn wait_bounded<F>(
    fut: F,
    limit: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Waited<F::Output>
where
    F: Future,
{
    if *cancel.borrow() {
        return Waited::Canceled;
    }
    tokio::select! {
        out = fut => Waited::Done(out),
        _ = tokio::time::sleep(limit) => Waited::TimedOut,
        changed = cancel.changed() => {
            match changed {
                Ok(()) if !*cancel.borrow() => Waited::TimedOut,
                _ => Waited::Canceled,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StateMachine
// ---------------------------------------------------------------------------

/// The phase driver. Stateless between runs; everything durable lives in
/// the store, everything validator-shaped behind the capability.
#[derive(Debug)]
pub struct StateMachine {
    store: Arc<TransactionStore>,
    snapshots: Arc<SnapshotStore>,
    capability: Arc<dyn ValidatorCapability>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
}

impl StateMachine {
    pub fn new(
        store: Arc<TransactionStore>,
        snapshots: Arc<SnapshotStore>,
        capability: Arc<dyn ValidatorCapability>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            snapshots,
            capability,
            events,
            clock,
            config,
        }
    }

    /// Drives `hash` from its current PROPOSING state to a terminal
    /// outcome, rotating as the budget allows.
    ///
    /// The transaction must already be assigned (status PROPOSING with
    /// this worker recorded) — the dispatcher guarantees that. On
    /// cancellation the record is left in place for lease reclaim.
    pub async fn run(
        &self,
        hash: TxHash,
        mut cancel: watch::Receiver<bool>,
    ) -> StoreResult<MachineOutcome> {
        let started = self.clock.now();

        loop {
            let tx = self.store.get(&hash)?;
            if tx.status != TransactionStatus::Proposing {
                // Reclaimed or advanced by someone else; nothing to do.
                debug!(hash = %hash, status = %tx.status, "machine run superseded");
                return Ok(MachineOutcome::Canceled);
            }

            if self.clock.since(started) >= self.config.global_deadline {
                warn!(hash = %hash, "global consensus deadline breached");
                return match self.terminalize(
                    &tx,
                    TransactionStatus::Proposing,
                    RoundTag::Undetermined,
                    TransactionStatus::Undetermined,
                ) {
                    Ok(_) => Ok(MachineOutcome::Undetermined),
                    Err(StoreError::StaleStatus { .. }) => Ok(MachineOutcome::Canceled),
                    Err(e) => Err(e),
                };
            }

            match self.run_round(&tx, &mut cancel).await {
                Ok(RoundExit::Done(outcome)) => return Ok(outcome),
                Ok(RoundExit::Rotated) => continue,
                Ok(RoundExit::Canceled) => return Ok(MachineOutcome::Canceled),
                // Another actor advanced the transaction out from under us
                // (lease reclaim, cancel, racing appeal). Stale state is
                // recoverable by definition: stop driving, let the current
                // owner own it.
                Err(StoreError::StaleStatus { .. }) => {
                    debug!(hash = %hash, "run superseded mid-round");
                    return Ok(MachineOutcome::Canceled);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -- Round driver --------------------------------------------------------

    async fn run_round(
        &self,
        tx: &Transaction,
        cancel: &mut watch::Receiver<bool>,
    ) -> StoreResult<RoundExit> {
        let hash = tx.hash;
        let round_index = tx.consensus_history.len().saturating_sub(1) as u32;

        // Committee selection. A prior LeaderTimeout round excludes its
        // leader from the fresh draw.
        let exclude = prior_timed_out_leader(tx);
        let committee = match self.capability.select_committee(
            &hash,
            round_index,
            tx.committee_size,
            &exclude,
        ) {
            Ok(committee) => committee,
            Err(RegistryError::Empty) => {
                // Nobody to lead. Close without touching the rotation
                // budget; re-running against the same empty registry
                // cannot recover.
                warn!(hash = %hash, "no validators registered, closing round");
                self.store
                    .set_round_warning(&hash, round_index, "no_leaders".into())?;
                return self
                    .terminalize(
                        tx,
                        TransactionStatus::Proposing,
                        RoundTag::LeaderTimeout,
                        TransactionStatus::LeaderTimeout,
                    )
                    .map(RoundExit::Done);
            }
            Err(e) => {
                warn!(hash = %hash, error = %e, "committee selection failed");
                return self
                    .terminalize(
                        tx,
                        TransactionStatus::Proposing,
                        RoundTag::LeaderTimeout,
                        TransactionStatus::LeaderTimeout,
                    )
                    .map(RoundExit::Done);
            }
        };

        let leader = committee.leader().clone();
        self.store.set_round_committee(
            &hash,
            round_index,
            leader.address,
            committee.addresses(),
            committee.registry_version,
        )?;

        if let Some(previous_leader) = previous_round_leader(tx) {
            if round_index > 0 && previous_leader == leader.address {
                self.store.set_round_warning(
                    &hash,
                    round_index,
                    "leader repeated from previous round".into(),
                )?;
            }
        }

        // An appeal is supposed to re-run against the same registry the
        // original rounds saw; when the set changed in between, the round
        // carries a record of that.
        if round_index > 0 {
            let previous = &tx.consensus_history[round_index as usize - 1];
            let is_appeal_round = tx.last_round().map(|r| r.appeal).unwrap_or(false);
            if is_appeal_round && previous.registry_version != committee.registry_version {
                self.store.set_round_warning(
                    &hash,
                    round_index,
                    format!(
                        "registry changed during appeal: v{} -> v{}",
                        previous.registry_version, committee.registry_version
                    ),
                )?;
            }
        }

        let mode = super::mode_policy::effective_mode(tx.execution_mode, committee.size());
        debug!(
            hash = %hash,
            round = round_index,
            leader = %leader.address,
            committee = committee.size(),
            mode = %mode,
            "round opened"
        );

        // -- PROPOSING: the leader executes -----------------------------------
        let snapshot_ref = match tx.to {
            Some(contract) => self.snapshots.latest_ref(&contract)?,
            None => None,
        };

        let leader_call = self
            .invoke_leader(tx, &leader.address, snapshot_ref, mode, cancel)
            .await;

        let leader_receipt = match leader_call {
            LeaderCall::Produced(outcome) => {
                if outcome.receipt.execution_result == ExecutionResult::NoLeaders {
                    self.store
                        .set_round_warning(&hash, round_index, "no_leaders".into())?;
                    return self
                        .terminalize(
                            tx,
                            TransactionStatus::Proposing,
                            RoundTag::LeaderTimeout,
                            TransactionStatus::LeaderTimeout,
                        )
                        .map(RoundExit::Done);
                }
                if !outcome.receipt.is_acceptable() {
                    // The run itself failed; treat like a leader that never
                    // answered and rotate toward a healthier draw.
                    warn!(hash = %hash, result = ?outcome.receipt.execution_result, "leader receipt unusable");
                    return self.close_or_rotate(
                        tx,
                        round_index,
                        RoundTag::LeaderTimeout,
                        TransactionStatus::Proposing,
                        TransactionStatus::LeaderTimeout,
                    );
                }
                outcome.receipt
            }
            LeaderCall::UserError(message) => ExecutionReceipt {
                execution_result: ExecutionResult::ContractError,
                stdout: None,
                stderr: Some(message),
                state_write: None,
                calldata_emits: Vec::new(),
            },
            LeaderCall::Failed(message) => {
                warn!(hash = %hash, error = %message, "leader execution failed");
                return self.close_or_rotate(
                    tx,
                    round_index,
                    RoundTag::LeaderTimeout,
                    TransactionStatus::Proposing,
                    TransactionStatus::LeaderTimeout,
                );
            }
            LeaderCall::TimedOut => {
                info!(hash = %hash, round = round_index, "leader timed out");
                return self.close_or_rotate(
                    tx,
                    round_index,
                    RoundTag::LeaderTimeout,
                    TransactionStatus::Proposing,
                    TransactionStatus::LeaderTimeout,
                );
            }
            LeaderCall::Canceled => return Ok(RoundExit::Canceled),
        };

        // -- Leader-only modes short-circuit the committee --------------------
        match mode {
            ExecutionMode::LeaderOnly => {
                let results = vec![leader_result(&leader.address, &leader_receipt)];
                self.store
                    .record_validator_results(&hash, round_index, results)?;
                return self
                    .accept(tx, round_index, &leader_receipt, TransactionStatus::Proposing)
                    .map(RoundExit::Done);
            }
            ExecutionMode::LeaderSelfValidator => {
                return self
                    .leader_self_validate(tx, round_index, &leader, &leader_receipt, cancel)
                    .await;
            }
            ExecutionMode::Normal => {}
        }

        // -- COMMITTING: validators run and commit ----------------------------
        let after_commit_cas = self.cas_and_emit(
            tx,
            TransactionStatus::Proposing,
            TransactionStatus::Committing,
            TxPatch::none(),
            None,
        )?;

        let (calls, canceled) = self
            .gather_validator_calls(
                &after_commit_cas,
                &committee,
                &leader_receipt,
                round_index,
                cancel,
            )
            .await?;
        if canceled {
            return Ok(RoundExit::Canceled);
        }

        let committed = 1 + calls
            .values()
            .filter(|c| matches!(c, ValidatorCall::Produced(_) | ValidatorCall::UserError(_)))
            .count();
        let majority = committee.size() / 2 + 1;

        if committed < majority {
            info!(
                hash = %hash,
                round = round_index,
                committed,
                majority,
                "commit quorum missed"
            );
            return self.close_or_rotate(
                tx,
                round_index,
                RoundTag::ValidatorsTimeout,
                TransactionStatus::Committing,
                TransactionStatus::ValidatorsTimeout,
            );
        }

        // -- REVEALING: classify votes ---------------------------------------
        let revealing = self.cas_and_emit(
            &after_commit_cas,
            TransactionStatus::Committing,
            TransactionStatus::Revealing,
            TxPatch {
                last_vote_timestamp: Some(Some(self.clock.now())),
                ..TxPatch::default()
            },
            None,
        )?;

        let results = classify_votes(&leader.address, &leader_receipt, &committee, &calls);
        self.store
            .record_validator_results(&hash, round_index, results.clone())?;

        let agree = results.iter().filter(|r| r.vote == Vote::Agree).count();
        let disagree = results.iter().filter(|r| r.vote == Vote::Disagree).count();
        let timeouts = results.iter().filter(|r| r.vote == Vote::Timeout).count();
        debug!(hash = %hash, round = round_index, agree, disagree, timeouts, "votes tallied");

        if agree >= majority {
            return self
                .accept(&revealing, round_index, &leader_receipt, TransactionStatus::Revealing)
                .map(RoundExit::Done);
        }

        if timeouts == committee.size() - 1 && committee.size() > 1 {
            // Everyone who committed went silent at reveal.
            return self.close_or_rotate(
                &revealing,
                round_index,
                RoundTag::ValidatorsTimeout,
                TransactionStatus::Revealing,
                TransactionStatus::ValidatorsTimeout,
            );
        }

        if disagree >= majority {
            // A real disagreement majority: rotation may still recover it.
            return self.close_or_rotate(
                &revealing,
                round_index,
                RoundTag::Undetermined,
                TransactionStatus::Revealing,
                TransactionStatus::Undetermined,
            );
        }

        // No majority either way (equal counts land here too): terminal.
        self.terminalize(
            &revealing,
            TransactionStatus::Revealing,
            RoundTag::Undetermined,
            TransactionStatus::Undetermined,
        )
        .map(RoundExit::Done)
    }

    // -- Leader self-validation -------------------------------------------

    async fn leader_self_validate(
        &self,
        tx: &Transaction,
        round_index: u32,
        leader: &crate::registry::Validator,
        leader_receipt: &ExecutionReceipt,
        cancel: &mut watch::Receiver<bool>,
    ) -> StoreResult<RoundExit> {
        let request = ExecutorRequest {
            role: ExecutorRole::Validator,
            validator: leader.address,
            tx: tx.clone(),
            contract_snapshot: match tx.to {
                Some(contract) => self.snapshots.latest_ref(&contract)?,
                None => None,
            },
            mode: ExecutionMode::LeaderSelfValidator,
            equivalence: Some(EquivalenceEnvelope::NonComparativeValidator {
                principle: tx.input.clone(),
            }),
            host_data: HostData::default(),
        };

        let verdict = match wait_bounded(
            self.capability.invoke(request),
            self.config.validator_timeout,
            cancel,
        )
        .await
        {
            Waited::Done(Ok(outcome)) => outcome.equivalence.map(|v| v.agree).unwrap_or(false),
            Waited::Done(Err(_)) | Waited::TimedOut => false,
            Waited::Canceled => return Ok(RoundExit::Canceled),
        };

        let vote = if verdict { Vote::Agree } else { Vote::Disagree };
        self.store.record_validator_results(
            &tx.hash,
            round_index,
            vec![ValidatorResult {
                validator: leader.address,
                vote,
                receipt_digest: Some(leader_receipt.digest()),
            }],
        )?;

        if verdict {
            self.accept(tx, round_index, leader_receipt, TransactionStatus::Proposing)
                .map(RoundExit::Done)
        } else {
            self.close_or_rotate(
                tx,
                round_index,
                RoundTag::Undetermined,
                TransactionStatus::Proposing,
                TransactionStatus::Undetermined,
            )
        }
    }

    // -- Leader invocation with overload retry ------------------------------

    async fn invoke_leader(
        &self,
        tx: &Transaction,
        leader: &Address,
        snapshot: Option<crate::store::snapshots::SnapshotRef>,
        mode: ExecutionMode,
        cancel: &mut watch::Receiver<bool>,
    ) -> LeaderCall {
        let deadline = tokio::time::Instant::now() + self.config.leader_timeout;

        for attempt in 0..=EXECUTOR_OVERLOAD_RETRIES {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return LeaderCall::TimedOut;
            }

            let request = ExecutorRequest {
                role: ExecutorRole::Leader,
                validator: *leader,
                tx: tx.clone(),
                contract_snapshot: snapshot,
                mode,
                equivalence: Some(EquivalenceEnvelope::NonComparativeLeader {
                    principle: tx.input.clone(),
                }),
                host_data: HostData::default(),
            };

            match wait_bounded(self.capability.invoke(request), remaining, cancel).await {
                Waited::Done(Ok(outcome)) => return LeaderCall::Produced(outcome),
                Waited::Done(Err(ExecutorFailure::Overloaded(reason))) => {
                    if attempt == EXECUTOR_OVERLOAD_RETRIES {
                        return LeaderCall::Failed(format!("overloaded after retries: {reason}"));
                    }
                    let backoff = EXECUTOR_RETRY_BACKOFF * 2u32.pow(attempt);
                    debug!(hash = %tx.hash, attempt, "executor overloaded, backing off");
                    match wait_bounded(tokio::time::sleep(backoff), remaining, cancel).await {
                        Waited::Done(()) => continue,
                        Waited::TimedOut => return LeaderCall::TimedOut,
                        Waited::Canceled => return LeaderCall::Canceled,
                    }
                }
                Waited::Done(Err(ExecutorFailure::User(message))) => {
                    return LeaderCall::UserError(message)
                }
                Waited::Done(Err(ExecutorFailure::Fatal(message))) => {
                    return LeaderCall::Failed(message)
                }
                Waited::TimedOut => return LeaderCall::TimedOut,
                Waited::Canceled => return LeaderCall::Canceled,
            }
        }
        LeaderCall::TimedOut
    }

    // -- Validator gathering -------------------------------------------------

    /// Invokes every non-leader committee member concurrently and gathers
    /// outcomes until all return or the validator timeout fires. The CAS
    /// to REVEALING happens later; this only collects.
    async fn gather_validator_calls(
        &self,
        tx: &Transaction,
        committee: &CommitteeSnapshot,
        leader_receipt: &ExecutionReceipt,
        _round_index: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> StoreResult<(HashMap<Address, ValidatorCall>, bool)> {
        let snapshot = match tx.to {
            Some(contract) => self.snapshots.latest_ref(&contract)?,
            None => None,
        };

        let mut futures = FuturesUnordered::new();
        for validator in committee.validators() {
            let request = ExecutorRequest {
                role: ExecutorRole::Validator,
                validator: validator.address,
                tx: tx.clone(),
                contract_snapshot: snapshot,
                mode: ExecutionMode::Normal,
                equivalence: Some(EquivalenceEnvelope::Comparative {
                    principle: tx.input.clone(),
                    leader_receipt: leader_receipt.clone(),
                }),
                host_data: HostData::default(),
            };
            let capability = Arc::clone(&self.capability);
            let address = validator.address;
            futures.push(async move {
                let mut attempt = 0;
                let call = loop {
                    match capability.invoke(request.clone()).await {
                        Ok(outcome) => break ValidatorCall::Produced(outcome),
                        Err(ExecutorFailure::Overloaded(reason)) => {
                            if attempt >= EXECUTOR_OVERLOAD_RETRIES {
                                break ValidatorCall::Failed(format!(
                                    "overloaded after retries: {reason}"
                                ));
                            }
                            tokio::time::sleep(EXECUTOR_RETRY_BACKOFF * 2u32.pow(attempt)).await;
                            attempt += 1;
                        }
                        Err(ExecutorFailure::User(message)) => {
                            break ValidatorCall::UserError(message)
                        }
                        Err(ExecutorFailure::Fatal(message)) => {
                            break ValidatorCall::Failed(message)
                        }
                    }
                };
                (address, call)
            });
        }

        let mut calls: HashMap<Address, ValidatorCall> = HashMap::new();
        let expected = committee.size() - 1;
        let timeout = tokio::time::sleep(self.config.validator_timeout);
        tokio::pin!(timeout);

        while calls.len() < expected {
            tokio::select! {
                _ = &mut timeout => break,
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        return Ok((calls, true));
                    }
                }
                next = futures.next() => {
                    match next {
                        Some((address, call)) => { calls.insert(address, call); }
                        None => break,
                    }
                }
            }
        }

        // Whoever never answered is a timeout.
        for validator in committee.validators() {
            calls
                .entry(validator.address)
                .or_insert(ValidatorCall::TimedOut);
        }

        Ok((calls, false))
    }

    // -- Terminal paths ------------------------------------------------------

    /// Closes the round with `tag` and either rotates (budget permitting)
    /// or terminalizes into `terminal_status`.
    fn close_or_rotate(
        &self,
        tx: &Transaction,
        round_index: u32,
        tag: RoundTag,
        current_status: TransactionStatus,
        terminal_status: TransactionStatus,
    ) -> StoreResult<RoundExit> {
        self.store.close_round(&tx.hash, round_index, tag)?;

        if tx.rotation_count < tx.max_rotations {
            let next_rotation = tx.rotation_count + 1;
            info!(
                hash = %tx.hash,
                round = round_index,
                tag = %tag,
                rotation = next_rotation,
                "rotating"
            );

            if current_status != TransactionStatus::Proposing {
                self.cas_and_emit(
                    tx,
                    current_status,
                    TransactionStatus::Proposing,
                    TxPatch::none().rotation_count(next_rotation),
                    Some(tag),
                )?;
            } else {
                // Already in Proposing (leader-phase failures); only the
                // counter moves.
                self.store
                    .patch(&tx.hash, TxPatch::none().rotation_count(next_rotation))?;
            }

            let mut entry = ConsensusRoundEntry::new(round_index + 1);
            entry.record_phase(
                &TransactionStatus::Proposing.to_string(),
                self.clock.now(),
            );
            entry.record_status(TransactionStatus::Proposing);
            self.store.append_round(&tx.hash, entry)?;
            return Ok(RoundExit::Rotated);
        }

        self.terminalize(tx, current_status, tag, terminal_status)
            .map(RoundExit::Done)
    }

    /// CASes the transaction into a terminal failure status, closing the
    /// current round and releasing the worker.
    fn terminalize(
        &self,
        tx: &Transaction,
        from_status: TransactionStatus,
        tag: RoundTag,
        terminal_status: TransactionStatus,
    ) -> StoreResult<MachineOutcome> {
        let round_index = tx.consensus_history.len().saturating_sub(1) as u32;
        self.cas_and_emit(
            tx,
            from_status,
            terminal_status,
            TxPatch::none().clear_worker(),
            Some(tag),
        )?;
        if !tx.consensus_history.is_empty() {
            self.store.close_round(&tx.hash, round_index, tag)?;
        }

        info!(hash = %tx.hash, status = %terminal_status, "transaction closed");
        Ok(match terminal_status {
            TransactionStatus::Undetermined => MachineOutcome::Undetermined,
            TransactionStatus::LeaderTimeout => MachineOutcome::LeaderTimeout,
            TransactionStatus::ValidatorsTimeout => MachineOutcome::ValidatorsTimeout,
            _ => MachineOutcome::Undetermined,
        })
    }

    // -- Accept --------------------------------------------------------------

    /// The accept path: snapshot write, child enqueue, status CAS, events.
    fn accept(
        &self,
        tx: &Transaction,
        round_index: u32,
        receipt: &ExecutionReceipt,
        from_status: TransactionStatus,
    ) -> StoreResult<MachineOutcome> {
        let now = self.clock.now();

        // New contract snapshot when the receipt carries state (or this
        // was a deploy, whose code is the input).
        if let Some(contract) = tx.to {
            let wrote_state = receipt.state_write.is_some();
            if wrote_state || tx.kind == TransactionKind::Deploy {
                let code = match tx.kind {
                    TransactionKind::Deploy => Some(tx.input.clone()),
                    _ => None,
                };
                let storage = receipt.state_write.clone().unwrap_or_default();
                let snapshot =
                    self.snapshots
                        .put_new_version(contract, code, storage, Some(tx.hash))?;
                debug!(
                    hash = %tx.hash,
                    contract = %contract,
                    version = snapshot.version,
                    "snapshot written"
                );
            }
        }

        // Contract-emitted sub-transactions join the queue as ordinary
        // PENDING rows with the parent recorded.
        if let Some(contract) = tx.to {
            for (index, emit) in receipt.calldata_emits.iter().enumerate() {
                self.enqueue_child(tx, contract, index, emit)?;
            }
        }

        self.cas_and_emit(
            tx,
            from_status,
            TransactionStatus::Accepted,
            TxPatch::none()
                .clear_worker()
                .awaiting_finalization(now),
            Some(RoundTag::Accepted),
        )?;
        self.store.close_round(&tx.hash, round_index, RoundTag::Accepted)?;

        info!(hash = %tx.hash, round = round_index, "accepted");
        Ok(MachineOutcome::Accepted)
    }

    fn enqueue_child(
        &self,
        parent: &Transaction,
        contract: Address,
        index: usize,
        emit: &crate::executor::EmittedCall,
    ) -> StoreResult<()> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(parent.hash.as_bytes());
        hasher.update(&(index as u64).to_be_bytes());
        hasher.update(emit.to.as_bytes());
        hasher.update(&emit.input);
        let child_hash = TxHash(*hasher.finalize().as_bytes());

        loop {
            let nonce = self.store.next_nonce(&contract)?;
            let child = Transaction {
                hash: child_hash,
                from: contract,
                to: Some(emit.to),
                kind: TransactionKind::Call,
                nonce,
                input: emit.input.clone(),
                value: emit.value,
                status: TransactionStatus::Pending,
                execution_mode: ExecutionMode::Normal,
                committee_size: self.config.committee_size,
                max_rotations: self.config.max_rotations,
                rotation_count: 0,
                appeal_count: 0,
                consensus_history: Vec::new(),
                triggered_by_hash: Some(parent.hash),
                current_worker: None,
                timestamp_awaiting_finalization: None,
                blocked_at: None,
                last_vote_timestamp: None,
                created_at: self.clock.now(),
            };

            match self.store.insert(&child) {
                Ok(()) => {
                    debug!(parent = %parent.hash, child = %child_hash, "child transaction enqueued");
                    self.events.publish(StatusEvent {
                        hash: child_hash,
                        sender: contract,
                        contract: Some(emit.to),
                        status: TransactionStatus::Pending,
                        round_index: 0,
                        tag: None,
                        at: self.clock.now(),
                    });
                    return Ok(());
                }
                Err(crate::store::tx_store::StoreError::DuplicateNonce { .. }) => continue,
                // Re-acceptance after a crash replays the same child; the
                // existing row wins.
                Err(crate::store::tx_store::StoreError::DuplicateHash(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    // -- Shared helpers ------------------------------------------------------

    /// CAS plus event publication, the only way the machine moves status.
    fn cas_and_emit(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
        new: TransactionStatus,
        patch: TxPatch,
        tag: Option<RoundTag>,
    ) -> StoreResult<Transaction> {
        let at = self.clock.now();
        let updated = self.store.cas_status(&tx.hash, expected, new, patch, at)?;
        self.events.publish(StatusEvent {
            hash: updated.hash,
            sender: updated.from,
            contract: updated.to,
            status: new,
            round_index: updated.consensus_history.len().saturating_sub(1) as u32,
            tag,
            at,
        });
        Ok(updated)
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn leader_result(leader: &Address, receipt: &ExecutionReceipt) -> ValidatorResult {
    ValidatorResult {
        validator: *leader,
        vote: Vote::Agree,
        receipt_digest: Some(receipt.digest()),
    }
}

/// The leader to exclude from the next draw, if the last closed round was
/// a leader timeout.
fn prior_timed_out_leader(tx: &Transaction) -> Vec<Address> {
    let rounds = &tx.consensus_history;
    if rounds.len() < 2 {
        return Vec::new();
    }
    let previous = &rounds[rounds.len() - 2];
    match (previous.consensus_round, previous.leader) {
        (Some(RoundTag::LeaderTimeout), Some(leader)) => vec![leader],
        _ => Vec::new(),
    }
}

fn previous_round_leader(tx: &Transaction) -> Option<Address> {
    let rounds = &tx.consensus_history;
    if rounds.len() < 2 {
        return None;
    }
    rounds[rounds.len() - 2].leader
}

/// Builds the per-committee-member vote list: leader first (implicitly
/// agreeing with its own receipt), then each validator classified from
/// its call outcome.
fn classify_votes(
    leader: &Address,
    leader_receipt: &ExecutionReceipt,
    committee: &CommitteeSnapshot,
    calls: &HashMap<Address, ValidatorCall>,
) -> Vec<ValidatorResult> {
    let mut results = vec![leader_result(leader, leader_receipt)];

    for validator in committee.validators() {
        let (vote, digest) = match calls.get(&validator.address) {
            Some(ValidatorCall::Produced(outcome)) => match outcome.equivalence {
                Some(verdict) if verdict.agree => (Vote::Agree, Some(outcome.receipt.digest())),
                Some(_) => (Vote::Disagree, Some(outcome.receipt.digest())),
                // Committed (receipt in hand) but never revealed a
                // verdict: a timeout, not a disagreement.
                None => (Vote::Timeout, Some(outcome.receipt.digest())),
            },
            Some(ValidatorCall::UserError(_)) => (Vote::Disagree, None),
            Some(ValidatorCall::Failed(_)) => (Vote::Timeout, None),
            Some(ValidatorCall::TimedOut) | None => (Vote::Timeout, None),
        };
        results.push(ValidatorResult {
            validator: validator.address,
            vote,
            receipt_digest: digest,
        });
    }

    results
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{MockBehavior, MockExecutor};
    use crate::primitives::clock::SystemClock;
    use crate::primitives::ids::WorkerId;
    use crate::registry::SelectionWeighting;

    struct Harness {
        store: Arc<TransactionStore>,
        snapshots: Arc<SnapshotStore>,
        registry: Arc<ValidatorRegistry>,
        executor: Arc<MockExecutor>,
        machine: StateMachine,
        events: EventBus,
    }

    fn harness(validators: u8, config: CoreConfig) -> Harness {
        let store = Arc::new(TransactionStore::open_temporary().unwrap());
        let snapshots = Arc::new(SnapshotStore::open_temporary().unwrap());
        let registry = Arc::new(ValidatorRegistry::new(SelectionWeighting::Uniform));
        for i in 0..validators {
            registry
                .add(
                    Address([i + 1; 20]),
                    1_000,
                    "ollama",
                    "llama3",
                    serde_json::json!({}),
                )
                .unwrap();
        }
        let executor = Arc::new(MockExecutor::new());
        let events = EventBus::new(64);
        let executor_dyn: Arc<dyn ValidatorExecutor> = executor.clone();
        let capability = Arc::new(RegistryCapability::new(
            Arc::clone(&registry),
            executor_dyn,
        ));
        let machine = StateMachine::new(
            Arc::clone(&store),
            Arc::clone(&snapshots),
            capability,
            events.clone(),
            SystemClock::shared(),
            config,
        );
        Harness {
            store,
            snapshots,
            registry,
            executor,
            machine,
            events,
        }
    }

    /// Inserts a transaction and walks it to PROPOSING the way the
    /// crawler + dispatcher would.
    fn stage(h: &Harness, committee_size: usize, max_rotations: u32) -> TxHash {
        stage_mode(h, committee_size, max_rotations, ExecutionMode::Normal)
    }

    fn stage_mode(
        h: &Harness,
        committee_size: usize,
        max_rotations: u32,
        mode: ExecutionMode,
    ) -> TxHash {
        let hash = TxHash([0xAA; 32]);
        let tx = Transaction {
            hash,
            from: Address([0xF0; 20]),
            to: Some(Address([0xC0; 20])),
            kind: TransactionKind::Call,
            nonce: 0,
            input: b"method:roll".to_vec(),
            value: 0,
            status: TransactionStatus::Pending,
            execution_mode: mode,
            committee_size,
            max_rotations,
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
        h.store.insert(&tx).unwrap();
        h.store
            .append_round(&hash, ConsensusRoundEntry::new(0))
            .unwrap();
        h.store
            .cas_status(
                &hash,
                TransactionStatus::Pending,
                TransactionStatus::Activated,
                TxPatch::none(),
                1,
            )
            .unwrap();
        h.store
            .cas_status(
                &hash,
                TransactionStatus::Activated,
                TransactionStatus::Proposing,
                TxPatch::none().worker(WorkerId::new()),
                2,
            )
            .unwrap();
        hash
    }

    fn quick_config() -> CoreConfig {
        CoreConfig {
            leader_timeout: Duration::from_millis(200),
            validator_timeout: Duration::from_millis(200),
            global_deadline: Duration::from_secs(30),
            ..CoreConfig::default()
        }
    }

    fn cancel_token() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn unanimous_committee_accepts() {
        let h = harness(5, quick_config());
        let hash = stage(&h, 5, 3);

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Accepted);

        let tx = h.store.get(&hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Accepted);
        assert!(tx.timestamp_awaiting_finalization.is_some());
        assert!(tx.current_worker.is_none());
        assert_eq!(tx.consensus_history.len(), 1);

        let round = &tx.consensus_history[0];
        assert_eq!(round.consensus_round, Some(RoundTag::Accepted));
        assert_eq!(round.validator_results.len(), 5);
        assert!(round
            .validator_results
            .iter()
            .all(|r| r.vote == Vote::Agree));
    }

    #[tokio::test]
    async fn leader_timeout_rotates_to_fresh_leader() {
        let h = harness(5, quick_config());
        let hash = stage(&h, 5, 3);

        // Hang whoever leads round 0; rotation must pick someone else.
        let round0 = h.registry.select_committee(&hash, 0, 5, &[]).unwrap();
        h.executor
            .script(round0.leader().address, MockBehavior::Hang);

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Accepted);

        let tx = h.store.get(&hash).unwrap();
        assert_eq!(tx.rotation_count, 1);
        assert_eq!(tx.consensus_history.len(), 2);
        assert_eq!(
            tx.consensus_history[0].consensus_round,
            Some(RoundTag::LeaderTimeout)
        );
        assert_eq!(
            tx.consensus_history[1].consensus_round,
            Some(RoundTag::Accepted)
        );
        assert_ne!(
            tx.consensus_history[1].leader,
            tx.consensus_history[0].leader
        );
    }

    #[tokio::test]
    async fn split_vote_closes_undetermined() {
        let h = harness(5, quick_config());
        let hash = stage(&h, 5, 0);

        // Committee of 5: leader agrees with itself; script 2 validators
        // to disagree and 1 to time out in reveal. Votes: 2 agree,
        // 2 disagree, 1 timeout — no majority.
        let committee = h.registry.select_committee(&hash, 0, 5, &[]).unwrap();
        let validators = committee.validators();
        h.executor
            .script(validators[0].address, MockBehavior::Disagree);
        h.executor
            .script(validators[1].address, MockBehavior::Disagree);
        h.executor
            .script(validators[2].address, MockBehavior::RevealTimeout);

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Undetermined);

        let tx = h.store.get(&hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Undetermined);
        assert!(tx.timestamp_awaiting_finalization.is_none());
        assert_eq!(h.snapshots.version_count(&Address([0xC0; 20])), 0);

        let votes: Vec<Vote> = tx.consensus_history[0]
            .validator_results
            .iter()
            .map(|r| r.vote)
            .collect();
        assert_eq!(votes.iter().filter(|v| **v == Vote::Agree).count(), 2);
        assert_eq!(votes.iter().filter(|v| **v == Vote::Disagree).count(), 2);
        assert_eq!(votes.iter().filter(|v| **v == Vote::Timeout).count(), 1);
    }

    #[tokio::test]
    async fn leader_only_accepts_on_leader_success_alone() {
        let h = harness(3, quick_config());
        let hash = stage_mode(&h, 3, 0, ExecutionMode::LeaderOnly);

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Accepted);

        let tx = h.store.get(&hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Accepted);
        // The committee never ran: only the leader was invoked.
        assert_eq!(h.executor.calls().len(), 1);
        assert_eq!(h.executor.calls()[0].0, ExecutorRole::Leader);
        // Exactly the leader's own vote on record.
        assert_eq!(tx.consensus_history[0].validator_results.len(), 1);
    }

    #[tokio::test]
    async fn committee_of_one_degrades_to_self_validation() {
        let h = harness(1, quick_config());
        let hash = stage_mode(&h, 1, 0, ExecutionMode::Normal);

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Accepted);

        // Leader run plus one self-validation run, same validator.
        let calls = h.executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, ExecutorRole::Leader);
        assert_eq!(calls[1].0, ExecutorRole::Validator);
        assert_eq!(calls[0].1, calls[1].1);
    }

    #[tokio::test]
    async fn empty_registry_closes_leader_timeout_without_rotation() {
        let h = harness(0, quick_config());
        let hash = stage(&h, 5, 3);

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::LeaderTimeout);

        let tx = h.store.get(&hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::LeaderTimeout);
        assert_eq!(tx.rotation_count, 0, "no rotation penalty");
        assert_eq!(
            tx.consensus_history[0].warning.as_deref(),
            Some("no_leaders")
        );
    }

    #[tokio::test]
    async fn overloaded_leader_retries_and_succeeds() {
        let h = harness(3, quick_config());
        let hash = stage(&h, 3, 0);

        let committee = h.registry.select_committee(&hash, 0, 3, &[]).unwrap();
        h.executor.script(
            committee.leader().address,
            MockBehavior::OverloadedThenAgree { failures: 2 },
        );

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Accepted);
        // 2 refusals + 1 success as leader, plus nothing extra.
        assert!(h.executor.call_count(&committee.leader().address) >= 3);
    }

    #[tokio::test]
    async fn cancellation_leaves_record_for_reclaim() {
        let h = harness(3, quick_config());
        let hash = stage(&h, 3, 0);

        let committee = h.registry.select_committee(&hash, 0, 3, &[]).unwrap();
        h.executor
            .script(committee.leader().address, MockBehavior::Hang);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let machine_fut = h.machine.run(hash, cancel_rx);
        tokio::pin!(machine_fut);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = &mut machine_fut => panic!("machine should still be running"),
        }
        cancel_tx.send(true).unwrap();
        let outcome = machine_fut.await.unwrap();
        assert_eq!(outcome, MachineOutcome::Canceled);

        // Status untouched: the dispatcher's lease reclaim owns recovery.
        let tx = h.store.get(&hash).unwrap();
        assert_eq!(tx.status, TransactionStatus::Proposing);
    }

    #[tokio::test]
    async fn accepted_with_state_write_produces_snapshot_and_children() {
        let h = harness(3, quick_config());
        let hash = stage(&h, 3, 0);
        let contract = Address([0xC0; 20]);

        let committee = h.registry.select_committee(&hash, 0, 3, &[]).unwrap();
        h.executor.script(
            committee.leader().address,
            MockBehavior::Receipt(ExecutionReceipt {
                execution_result: ExecutionResult::Return,
                stdout: None,
                stderr: None,
                state_write: Some(b"new-state".to_vec()),
                calldata_emits: vec![crate::executor::EmittedCall {
                    to: Address([0xD0; 20]),
                    input: b"child-call".to_vec(),
                    value: 0,
                }],
            }),
        );

        let (_guard, cancel) = cancel_token();
        let outcome = h.machine.run(hash, cancel).await.unwrap();
        assert_eq!(outcome, MachineOutcome::Accepted);

        // Snapshot written.
        let snapshot = h.snapshots.latest(&contract).unwrap().unwrap();
        assert_eq!(snapshot.storage, b"new-state");
        assert_eq!(snapshot.produced_by, Some(hash));

        // Child enqueued with lineage.
        let children = h
            .store
            .list_pending_by_contract(&Address([0xD0; 20]), 10)
            .unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].triggered_by_hash, Some(hash));
        assert_eq!(children[0].from, contract);
    }

    #[tokio::test]
    async fn status_events_flow_to_subscribers() {
        let h = harness(3, quick_config());
        let hash = stage(&h, 3, 0);
        let sub = h.events.subscribe(crate::events::Topic::Tx(hash));

        let (_guard, cancel) = cancel_token();
        h.machine.run(hash, cancel).await.unwrap();

        let mut seen = Vec::new();
        while let Some(event) = sub.try_recv() {
            seen.push(event.status);
        }
        assert_eq!(
            seen,
            vec![
                TransactionStatus::Committing,
                TransactionStatus::Revealing,
                TransactionStatus::Accepted,
            ]
        );
    }
}
