//! # Executor Protocol
//!
//! The contract between the consensus core and the validator executor —
//! the external process that actually runs contract code, talks to LLMs,
//! and applies the Equivalence Principle. The core builds a structured
//! request, waits (cancellably) for an outcome, and classifies failures
//! into a small taxonomy. It never inspects prompt text and never
//! interprets contract output; it records results and verdicts, nothing
//! more.
//!
//! ## Architecture
//!
//! ```text
//! mod.rs  — request/receipt envelopes, failure taxonomy, the trait
//! mock.rs — a scriptable in-process executor for tests
//! ```
//!
//! The `host_data` fields exist so tests and replay tooling can inject
//! canned LLM and web responses; the core passes them through unaltered.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::primitives::ids::Address;
use crate::store::snapshots::SnapshotRef;
use crate::transaction::types::{ExecutionMode, Transaction};

pub use mock::{MockBehavior, MockExecutor};

// ---------------------------------------------------------------------------
// Request side
// ---------------------------------------------------------------------------

/// Which seat at the table this invocation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorRole {
    Leader,
    Validator,
}

/// The equivalence-principle envelope. The core fills in the structural
/// slots; the executor owns the prompt and the judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EquivalenceEnvelope {
    /// A validator comparing its own result against the leader's.
    Comparative {
        principle: Vec<u8>,
        leader_receipt: ExecutionReceipt,
    },
    /// A validator judging its own output against the principle alone.
    NonComparativeValidator { principle: Vec<u8> },
    /// The leader judging feasibility before producing output.
    NonComparativeLeader { principle: Vec<u8> },
}

/// Replayable inputs for deterministic tests. Passed through unaltered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostData {
    pub mock_response: Option<serde_json::Value>,
    pub mock_web_responses: Option<serde_json::Value>,
}

/// A single executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorRequest {
    pub role: ExecutorRole,
    /// The validator identity (and therefore LLM binding) running this.
    pub validator: Address,
    pub tx: Transaction,
    /// The contract snapshot to execute against. Absent for deploys.
    pub contract_snapshot: Option<SnapshotRef>,
    pub mode: ExecutionMode,
    pub equivalence: Option<EquivalenceEnvelope>,
    pub host_data: HostData,
}

// ---------------------------------------------------------------------------
// Outcome side
// ---------------------------------------------------------------------------

/// Classification of what the contract run produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    /// Normal return with output.
    Return,
    /// The contract rolled its own state back deliberately.
    Rollback,
    /// The contract raised; recorded and accepted as a rollback.
    ContractError,
    /// The run itself failed (sandbox fault, resource exhaustion).
    Error,
    /// The run produced nothing at all.
    None,
    /// The committee was too small to seat a leader for this mode.
    NoLeaders,
}

/// A contract that emitted a sub-transaction during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedCall {
    pub to: Address,
    pub input: Vec<u8>,
    pub value: u128,
}

/// What one run of the contract produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub execution_result: ExecutionResult,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// New storage blob, present when the run wrote state.
    pub state_write: Option<Vec<u8>>,
    /// Sub-transactions emitted by the contract.
    pub calldata_emits: Vec<EmittedCall>,
}

impl ExecutionReceipt {
    /// A receipt with just a result tag and nothing else. Tests and
    /// failure paths use this constantly.
    pub fn bare(result: ExecutionResult) -> Self {
        Self {
            execution_result: result,
            stdout: None,
            stderr: None,
            state_write: None,
            calldata_emits: Vec::new(),
        }
    }

    /// BLAKE3 digest of the canonical encoding. This is the commitment a
    /// validator publishes during the commit phase.
    pub fn digest(&self) -> [u8; 32] {
        let bytes = bincode::serialize(self).expect("receipt serialization is infallible");
        *blake3::hash(&bytes).as_bytes()
    }

    /// Whether this receipt can carry a round to acceptance. A contract
    /// error is an accepted rollback; a sandbox error is not.
    pub fn is_acceptable(&self) -> bool {
        matches!(
            self.execution_result,
            ExecutionResult::Return | ExecutionResult::Rollback | ExecutionResult::ContractError
        )
    }
}

/// The executor's equivalence judgment for a validator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceVerdict {
    pub agree: bool,
}

/// Wall-clock accounting reported by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTimings {
    pub queued_ms: u64,
    pub execution_ms: u64,
}

/// Everything an invocation returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOutcome {
    pub receipt: ExecutionReceipt,
    /// The equivalence verdict for validator runs. `None` on a validator
    /// outcome means the validator committed but never revealed.
    pub equivalence: Option<EquivalenceVerdict>,
    pub timings: ExecTimings,
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Executor failures, classified at the boundary so everything downstream
/// handles tags instead of exceptions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorFailure {
    /// Capacity problem. Worth a backoff and retry within the round.
    #[error("executor overloaded: {0}")]
    Overloaded(String),

    /// The contract itself failed. Recorded as a contract error and the
    /// round proceeds with rollback semantics.
    #[error("contract failure: {0}")]
    User(String),

    /// The executor is broken. The round closes as the phase timeout tag.
    #[error("fatal executor failure: {0}")]
    Fatal(String),
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

/// The validator executor capability. Production wires an RPC client to
/// the sandboxed executor fleet; tests wire [`MockExecutor`].
///
/// Implementations must be cancel-safe: the core drops the future on
/// timeout or shutdown and may re-invoke for the same transaction in a
/// later round.
#[async_trait]
pub trait ValidatorExecutor: Send + Sync + std::fmt::Debug {
    async fn execute(&self, request: ExecutorRequest) -> Result<ExecutorOutcome, ExecutorFailure>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_digest_is_stable_and_content_sensitive() {
        let a = ExecutionReceipt::bare(ExecutionResult::Return);
        let b = ExecutionReceipt::bare(ExecutionResult::Return);
        assert_eq!(a.digest(), b.digest());

        let c = ExecutionReceipt {
            stdout: Some("hi".into()),
            ..ExecutionReceipt::bare(ExecutionResult::Return)
        };
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn acceptability_classification() {
        assert!(ExecutionReceipt::bare(ExecutionResult::Return).is_acceptable());
        assert!(ExecutionReceipt::bare(ExecutionResult::Rollback).is_acceptable());
        assert!(ExecutionReceipt::bare(ExecutionResult::ContractError).is_acceptable());
        assert!(!ExecutionReceipt::bare(ExecutionResult::Error).is_acceptable());
        assert!(!ExecutionReceipt::bare(ExecutionResult::None).is_acceptable());
        assert!(!ExecutionReceipt::bare(ExecutionResult::NoLeaders).is_acceptable());
    }

    #[test]
    fn execution_result_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionResult::ContractError).unwrap(),
            "\"contract_error\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionResult::NoLeaders).unwrap(),
            "\"no_leaders\""
        );
    }

    #[test]
    fn host_data_passes_through_untouched() {
        let data = HostData {
            mock_response: Some(serde_json::json!({"answer": 42})),
            mock_web_responses: None,
        };
        let round_trip: HostData =
            serde_json::from_str(&serde_json::to_string(&data).unwrap()).unwrap();
        assert_eq!(round_trip, data);
    }
}
