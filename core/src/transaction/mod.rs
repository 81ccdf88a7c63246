//! # Transaction Module
//!
//! The transaction record, its consensus journal, and the signed envelope
//! it arrives in. Every piece of state the core tracks about a transaction
//! — status, committee bookkeeping, per-round monitoring timestamps — lives
//! in the types defined here.
//!
//! ## Architecture
//!
//! ```text
//! types.rs    — Transaction record, status/mode/tag enums, round entries
//! envelope.rs — Signed ingress envelope: decode, verify, hash derivation
//! ```
//!
//! ## Design Decisions
//!
//! - The transaction hash is the BLAKE3 digest of the raw signed envelope
//!   bytes, so the caller can compute it before submitting and the core
//!   can verify it without trusting anyone.
//! - Statuses are a closed enum with an explicit transition graph
//!   ([`TransactionStatus::can_transition_to`]). The store refuses any
//!   write that is not an edge of that graph, which turns "impossible"
//!   state corruption into a loud, typed error.
//! - Round entries are append-only. A closed round is history, not state.

pub mod envelope;
pub mod types;

pub use envelope::{IngressError, SignedEnvelope, TxPayload};
pub use types::{
    ConsensusRoundEntry, ExecutionMode, RoundTag, Transaction, TransactionKind,
    TransactionStatus, ValidatorResult, Vote,
};
