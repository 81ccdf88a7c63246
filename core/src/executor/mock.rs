//! A scriptable in-process executor for tests.
//!
//! Behavior is keyed by validator address, so a test can compute the
//! deterministic committee for a round, hang the leader, make two
//! validators disagree, and assert on exactly what the state machine does
//! about it. The default behavior for unscripted validators is agreement.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::executor::{
    EquivalenceVerdict, ExecTimings, ExecutionReceipt, ExecutionResult, ExecutorFailure,
    ExecutorOutcome, ExecutorRequest, ExecutorRole, ValidatorExecutor,
};
use crate::primitives::ids::Address;

// ---------------------------------------------------------------------------
// MockBehavior
// ---------------------------------------------------------------------------

/// What a scripted validator does when invoked.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Produce a successful receipt; as a validator, vote agree.
    Agree,
    /// Produce a receipt; as a validator, vote disagree.
    Disagree,
    /// Never return. The call parks until the caller's timeout or
    /// cancellation fires.
    Hang,
    /// Commit (return a receipt) but never reveal a verdict. Only
    /// meaningful for validator invocations.
    RevealTimeout,
    /// Fail `failures` times with `Overloaded`, then behave like `Agree`.
    OverloadedThenAgree { failures: u32 },
    /// Fail with a user (contract) error.
    FailUser,
    /// Fail fatally.
    FailFatal,
    /// Return this exact receipt (leader runs); validators voting on it
    /// agree.
    Receipt(ExecutionReceipt),
}

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

/// The test double. Shared across the worker fleet via `Arc`.
#[derive(Debug, Default)]
pub struct MockExecutor {
    behaviors: DashMap<Address, MockBehavior>,
    overload_counters: DashMap<Address, AtomicU32>,
    calls: Mutex<Vec<(ExecutorRole, Address)>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a validator. Unscripted validators agree.
    pub fn script(&self, validator: Address, behavior: MockBehavior) {
        self.behaviors.insert(validator, behavior);
    }

    /// Every `(role, validator)` pair invoked so far, in order.
    pub fn calls(&self) -> Vec<(ExecutorRole, Address)> {
        self.calls.lock().clone()
    }

    /// Number of invocations for one validator.
    pub fn call_count(&self, validator: &Address) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(_, addr)| addr == validator)
            .count()
    }

    fn behavior_for(&self, validator: &Address) -> MockBehavior {
        self.behaviors
            .get(validator)
            .map(|b| b.clone())
            .unwrap_or(MockBehavior::Agree)
    }

    fn outcome(receipt: ExecutionReceipt, verdict: Option<bool>) -> ExecutorOutcome {
        ExecutorOutcome {
            receipt,
            equivalence: verdict.map(|agree| EquivalenceVerdict { agree }),
            timings: ExecTimings::default(),
        }
    }
}

#[async_trait]
impl ValidatorExecutor for MockExecutor {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorOutcome, ExecutorFailure> {
        self.calls
            .lock()
            .push((request.role, request.validator));

        let is_validator = request.role == ExecutorRole::Validator;
        match self.behavior_for(&request.validator) {
            MockBehavior::Agree => Ok(Self::outcome(
                ExecutionReceipt::bare(ExecutionResult::Return),
                is_validator.then_some(true),
            )),
            MockBehavior::Disagree => Ok(Self::outcome(
                ExecutionReceipt {
                    stdout: Some("divergent".into()),
                    ..ExecutionReceipt::bare(ExecutionResult::Return)
                },
                is_validator.then_some(false),
            )),
            MockBehavior::Hang => {
                // Park effectively forever; the machine's timeout or
                // cancellation token is expected to abandon this future.
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err(ExecutorFailure::Fatal("hang elapsed".into()))
            }
            MockBehavior::RevealTimeout => Ok(Self::outcome(
                ExecutionReceipt::bare(ExecutionResult::Return),
                None,
            )),
            MockBehavior::OverloadedThenAgree { failures } => {
                let counter = self
                    .overload_counters
                    .entry(request.validator)
                    .or_insert_with(|| AtomicU32::new(0));
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                if seen < failures {
                    Err(ExecutorFailure::Overloaded(format!(
                        "attempt {} refused",
                        seen + 1
                    )))
                } else {
                    Ok(Self::outcome(
                        ExecutionReceipt::bare(ExecutionResult::Return),
                        is_validator.then_some(true),
                    ))
                }
            }
            MockBehavior::FailUser => Err(ExecutorFailure::User("contract raised".into())),
            MockBehavior::FailFatal => Err(ExecutorFailure::Fatal("sandbox died".into())),
            MockBehavior::Receipt(receipt) => {
                Ok(Self::outcome(receipt, is_validator.then_some(true)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::primitives::keys::Keypair;
    use crate::transaction::envelope::{SignedEnvelope, TxPayload};
    use crate::transaction::types::TransactionKind;

    fn request(role: ExecutorRole, validator: Address) -> ExecutorRequest {
        let kp = Keypair::generate();
        let payload = TxPayload {
            from: kp.address(),
            to: Some(Address([3; 20])),
            kind: TransactionKind::Call,
            nonce: 0,
            value: 0,
            input: vec![],
            committee_size: None,
            execution_mode: None,
            max_rotations: None,
        };
        let envelope = SignedEnvelope::sign(payload, &kp);
        let raw = envelope.encode();
        let tx = envelope
            .into_transaction(SignedEnvelope::hash_raw(&raw), &CoreConfig::default(), 0)
            .unwrap();
        ExecutorRequest {
            role,
            validator,
            tx,
            contract_snapshot: None,
            mode: crate::transaction::types::ExecutionMode::Normal,
            equivalence: None,
            host_data: Default::default(),
        }
    }

    #[tokio::test]
    async fn default_behavior_agrees() {
        let exec = MockExecutor::new();
        let outcome = exec
            .execute(request(ExecutorRole::Validator, Address([1; 20])))
            .await
            .unwrap();
        assert_eq!(outcome.equivalence, Some(EquivalenceVerdict { agree: true }));
        assert!(outcome.receipt.is_acceptable());
    }

    #[tokio::test]
    async fn leader_runs_have_no_verdict() {
        let exec = MockExecutor::new();
        let outcome = exec
            .execute(request(ExecutorRole::Leader, Address([1; 20])))
            .await
            .unwrap();
        assert!(outcome.equivalence.is_none());
    }

    #[tokio::test]
    async fn disagree_scripts_a_dissenting_vote() {
        let exec = MockExecutor::new();
        let addr = Address([2; 20]);
        exec.script(addr, MockBehavior::Disagree);

        let outcome = exec
            .execute(request(ExecutorRole::Validator, addr))
            .await
            .unwrap();
        assert_eq!(
            outcome.equivalence,
            Some(EquivalenceVerdict { agree: false })
        );
    }

    #[tokio::test]
    async fn overloaded_then_agree_counts_down() {
        let exec = MockExecutor::new();
        let addr = Address([2; 20]);
        exec.script(addr, MockBehavior::OverloadedThenAgree { failures: 2 });

        assert!(matches!(
            exec.execute(request(ExecutorRole::Leader, addr)).await,
            Err(ExecutorFailure::Overloaded(_))
        ));
        assert!(matches!(
            exec.execute(request(ExecutorRole::Leader, addr)).await,
            Err(ExecutorFailure::Overloaded(_))
        ));
        assert!(exec.execute(request(ExecutorRole::Leader, addr)).await.is_ok());
    }

    #[tokio::test]
    async fn hang_parks_until_timeout() {
        let exec = MockExecutor::new();
        let addr = Address([2; 20]);
        exec.script(addr, MockBehavior::Hang);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            exec.execute(request(ExecutorRole::Leader, addr)),
        )
        .await;
        assert!(result.is_err(), "hang must outlive the caller's timeout");
    }

    #[tokio::test]
    async fn calls_are_recorded() {
        let exec = MockExecutor::new();
        let addr = Address([5; 20]);
        exec.execute(request(ExecutorRole::Leader, addr)).await.unwrap();
        exec.execute(request(ExecutorRole::Validator, addr))
            .await
            .unwrap();
        assert_eq!(exec.call_count(&addr), 2);
        assert_eq!(exec.calls()[0].0, ExecutorRole::Leader);
    }
}
