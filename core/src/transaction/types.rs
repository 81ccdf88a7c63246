//! Core type definitions for transactions and their consensus journal.
//!
//! These types form the vocabulary of everything the core persists about a
//! transaction. They are kept `Copy`-friendly where possible and carry no
//! behavior beyond what the data itself demands: the transition graph, the
//! terminal classification, and journal bookkeeping.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::primitives::clock::Millis;
use crate::primitives::ids::{Address, TxHash, WorkerId};

// ---------------------------------------------------------------------------
// TransactionKind
// ---------------------------------------------------------------------------

/// Discriminant for the operation a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Plain value transfer between two addresses.
    Transfer,
    /// Contract deployment. `to` is empty; the contract address is derived.
    Deploy,
    /// Call into an existing contract.
    Call,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer => write!(f, "transfer"),
            Self::Deploy => write!(f, "deploy"),
            Self::Call => write!(f, "call"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a transaction.
///
/// The names are the wire format: the status API, the event bus, and the
/// monitoring map all use the upper-snake rendering from [`fmt::Display`].
///
/// ```text
///                    ┌──────────────────────────────────────────┐
///                    ▼                                          │ (appeal /
/// PENDING → ACTIVATED → PROPOSING → COMMITTING → REVEALING      │  reclaim)
///    │          │           │  │        │   │        │  │       │
///    ▼          ▼           │  ▼        │   ▼        ▼  ▼       │
/// CANCELED  CANCELED        │ ACCEPTED ─┼──────→ ACCEPTED ──────┤→ FINALIZED
///                           ▼           ▼            ▼          │
///                    LEADER_TIMEOUT  VALIDATORS_  UNDETERMINED ─┘
///                                    TIMEOUT
/// ```
///
/// Rotation re-enters PROPOSING from COMMITTING or REVEALING without a
/// terminal detour; a reclaim or an appeal re-enters ACTIVATED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Persisted, waiting for the crawler.
    Pending,
    /// Eligible for dispatch; queued per contract.
    Activated,
    /// Withdrawn by the sender before any work started.
    Canceled,
    /// A worker holds the lease; the leader is executing.
    Proposing,
    /// Validators are committing to their local results.
    Committing,
    /// Commitments are being revealed and votes counted.
    Revealing,
    /// Consensus reached; the finality window is running.
    Accepted,
    /// The window elapsed with no appeal. Immutable from here on.
    Finalized,
    /// No majority could be established and rotations are exhausted.
    Undetermined,
    /// The leader never produced a receipt and rotations are exhausted.
    LeaderTimeout,
    /// The committee never reached commit quorum and rotations are
    /// exhausted.
    ValidatorsTimeout,
}

impl TransactionStatus {
    /// Whether this status terminates the lifecycle (no further
    /// transitions except an appeal reopen).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled
                | Self::Finalized
                | Self::Undetermined
                | Self::LeaderTimeout
                | Self::ValidatorsTimeout
        )
    }

    /// Whether a worker is actively driving this transaction. Exactly the
    /// statuses in which `current_worker` must be set and the per-contract
    /// in-flight slot is occupied.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Proposing | Self::Committing | Self::Revealing)
    }

    /// Terminal statuses an appeal can reopen (besides Accepted).
    pub fn is_appealable_failure(&self) -> bool {
        matches!(
            self,
            Self::Undetermined | Self::LeaderTimeout | Self::ValidatorsTimeout
        )
    }

    /// The transition graph. Every CAS in the store checks this; a status
    /// write that is not an edge here is refused as corruption.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (*self, next) {
            (Pending, Activated) | (Pending, Canceled) => true,
            (Activated, Proposing) | (Activated, Canceled) => true,
            // Leader phase: receipt moves forward, leader-only accepts
            // directly, timeouts and the global deadline close, a lost
            // worker lease falls back to Activated.
            (Proposing, Committing)
            | (Proposing, Accepted)
            | (Proposing, LeaderTimeout)
            | (Proposing, Undetermined)
            | (Proposing, Activated) => true,
            // Commit phase: quorum moves forward, rotation re-enters
            // Proposing, timeout closes, reclaim falls back.
            (Committing, Revealing)
            | (Committing, Proposing)
            | (Committing, ValidatorsTimeout)
            | (Committing, Undetermined)
            | (Committing, Activated) => true,
            // Reveal phase: votes decide, rotation re-enters Proposing,
            // reveal-quorum loss closes, reclaim falls back.
            (Revealing, Accepted)
            | (Revealing, Proposing)
            | (Revealing, Undetermined)
            | (Revealing, ValidatorsTimeout)
            | (Revealing, Activated) => true,
            // Finality window: promotion, or an appeal reopen.
            (Accepted, Finalized) | (Accepted, Activated) => true,
            // Terminal failures can only be reopened by an appeal.
            (Undetermined, Activated)
            | (LeaderTimeout, Activated)
            | (ValidatorsTimeout, Activated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Activated => "ACTIVATED",
            Self::Canceled => "CANCELED",
            Self::Proposing => "PROPOSING",
            Self::Committing => "COMMITTING",
            Self::Revealing => "REVEALING",
            Self::Accepted => "ACCEPTED",
            Self::Finalized => "FINALIZED",
            Self::Undetermined => "UNDETERMINED",
            Self::LeaderTimeout => "LEADER_TIMEOUT",
            Self::ValidatorsTimeout => "VALIDATORS_TIMEOUT",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// ExecutionMode
// ---------------------------------------------------------------------------

/// How much of the committee actually runs the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Only the leader executes; its receipt is accepted on success.
    LeaderOnly,
    /// The leader executes and then validates its own result under the
    /// equivalence principle. The degenerate committee of one.
    LeaderSelfValidator,
    /// Full commit–reveal across the committee.
    Normal,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LeaderOnly => "LEADER_ONLY",
            Self::LeaderSelfValidator => "LEADER_SELF_VALIDATOR",
            Self::Normal => "NORMAL",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// RoundTag
// ---------------------------------------------------------------------------

/// Terminal tag of a consensus round, or the cause that reopened one.
///
/// Rendered in CamelCase for the explorer; these strings are a stable
/// contract with the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundTag {
    /// The round reached an agree majority.
    Accepted,
    /// No majority either way, or rotations exhausted after disagreement.
    Undetermined,
    /// The leader produced no receipt within its budget.
    LeaderTimeout,
    /// The committee never reached commit quorum.
    ValidatorsTimeout,
    /// The worker's lease expired mid-round; the dispatcher reclaimed the
    /// transaction.
    WorkerLost,
    /// Round opened by a user appeal with an enlarged committee.
    Appeal,
}

impl fmt::Display for RoundTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accepted => "Accepted",
            Self::Undetermined => "Undetermined",
            Self::LeaderTimeout => "LeaderTimeout",
            Self::ValidatorsTimeout => "ValidatorsTimeout",
            Self::WorkerLost => "WorkerLost",
            Self::Appeal => "Appeal",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Vote & ValidatorResult
// ---------------------------------------------------------------------------

/// A committee member's verdict on the leader's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// The validator's local result is equivalent to the leader's.
    Agree,
    /// The validator's local result contradicts the leader's.
    Disagree,
    /// The validator committed but never revealed, or never committed at
    /// all. Counts toward neither majority.
    Timeout,
    /// The validator was never asked (leader-only modes, shrunken
    /// committees).
    Idle,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Agree => "agree",
            Self::Disagree => "disagree",
            Self::Timeout => "timeout",
            Self::Idle => "idle",
        };
        write!(f, "{}", name)
    }
}

/// One committee member's contribution to a round: its vote and the digest
/// of the receipt it produced (absent when it never revealed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorResult {
    pub validator: Address,
    pub vote: Vote,
    pub receipt_digest: Option<[u8; 32]>,
}

// ---------------------------------------------------------------------------
// ConsensusRoundEntry
// ---------------------------------------------------------------------------

/// One round of the consensus journal.
///
/// Appended when the round opens, closed exactly once with a [`RoundTag`],
/// never mutated after close. The monitoring map records when each phase
/// was entered, keyed by the upper-snake status name — the explorer renders
/// these directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusRoundEntry {
    /// 0-based index within the transaction's history.
    pub round_index: u32,

    /// Phase name → instant the phase was entered for this round.
    pub monitoring: BTreeMap<String, Millis>,

    /// Statuses observed during the round, in order.
    pub status_changes: Vec<TransactionStatus>,

    /// Terminal tag, set exactly once when the round closes. For a round
    /// opened by an appeal this starts as `Appeal` and is overwritten by
    /// the terminal tag when the re-run concludes.
    pub consensus_round: Option<RoundTag>,

    /// Per-validator votes and receipt digests.
    pub validator_results: Vec<ValidatorResult>,

    /// Leader for the round. Unset until the committee is drawn.
    pub leader: Option<Address>,

    /// Committee for the round, leader first.
    pub committee: Vec<Address>,

    /// Registry version the committee was drawn from.
    pub registry_version: u64,

    /// Whether this round was opened by a user appeal. Survives the
    /// terminal tag overwriting the initial `Appeal` marker.
    pub appeal: bool,

    /// Non-fatal anomaly observed during the round (repeated leader after
    /// a shrunken registry, registry change during an appeal).
    pub warning: Option<String>,
}

impl ConsensusRoundEntry {
    pub fn new(round_index: u32) -> Self {
        Self {
            round_index,
            monitoring: BTreeMap::new(),
            status_changes: Vec::new(),
            consensus_round: None,
            validator_results: Vec::new(),
            leader: None,
            committee: Vec::new(),
            registry_version: 0,
            appeal: false,
            warning: None,
        }
    }

    /// Records the instant a phase was entered. Idempotent: the first
    /// write for a phase wins, repeats are ignored.
    pub fn record_phase(&mut self, phase: &str, at: Millis) {
        self.monitoring.entry(phase.to_string()).or_insert(at);
    }

    /// Appends an observed status transition.
    pub fn record_status(&mut self, status: TransactionStatus) {
        self.status_changes.push(status);
    }

    pub fn is_closed(&self) -> bool {
        // An Appeal tag marks the reopen cause, not a terminal state.
        matches!(
            self.consensus_round,
            Some(tag) if tag != RoundTag::Appeal
        )
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// The full persisted transaction record.
///
/// This is what `get_transaction` returns and what every CAS in the store
/// reads, patches, and writes back. The consensus journal rides along so
/// a single read yields a consistent (status, journal) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// BLAKE3 digest of the signed envelope. Primary identity.
    pub hash: TxHash,

    /// Sender address, recovered from the envelope's public key.
    pub from: Address,

    /// Target contract. Empty for deploys until the address is assigned.
    pub to: Option<Address>,

    pub kind: TransactionKind,

    /// Per-sender, monotonically increasing.
    pub nonce: u64,

    /// Opaque method + calldata bytes. The core never parses these.
    pub input: Vec<u8>,

    /// Transferred value, wei-like.
    pub value: u128,

    pub status: TransactionStatus,

    pub execution_mode: ExecutionMode,

    /// Committee size for the next round. Grows on appeal.
    pub committee_size: usize,

    /// Rotation budget per appeal round.
    pub max_rotations: u32,

    /// Rotations consumed in the current appeal round. Never exceeds
    /// `max_rotations`.
    pub rotation_count: u32,

    pub appeal_count: u32,

    /// The append-only consensus journal.
    pub consensus_history: Vec<ConsensusRoundEntry>,

    /// Parent transaction, when this one was emitted by a contract during
    /// execution.
    pub triggered_by_hash: Option<TxHash>,

    /// The worker currently holding the lease. Non-empty exactly while
    /// status is in flight.
    pub current_worker: Option<WorkerId>,

    /// Set on entry into Accepted; the finality window counts from here.
    pub timestamp_awaiting_finalization: Option<Millis>,

    /// Observability: when the transaction last waited on a full fleet.
    pub blocked_at: Option<Millis>,

    /// Observability: when the last vote landed.
    pub last_vote_timestamp: Option<Millis>,

    /// Insertion instant, server-assigned.
    pub created_at: Millis,
}

impl Transaction {
    /// The contract address this transaction serializes against. Deploys
    /// serialize against their derived address so two deploys from the
    /// same sender don't race.
    pub fn contract_address(&self) -> Option<Address> {
        self.to
    }

    /// The most recent journal entry, open or closed.
    pub fn last_round(&self) -> Option<&ConsensusRoundEntry> {
        self.consensus_history.last()
    }

    pub fn last_round_mut(&mut self) -> Option<&mut ConsensusRoundEntry> {
        self.consensus_history.last_mut()
    }

    /// The currently open round, if the last entry has not been closed.
    pub fn open_round(&self) -> Option<&ConsensusRoundEntry> {
        self.consensus_history.last().filter(|r| !r.is_closed())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
