//! # Storage Module
//!
//! sled-backed persistence for the consensus core. The transaction store
//! is the single source of truth: every cross-phase transition is a
//! compare-and-swap against it, and no in-memory structure is ever
//! authoritative.
//!
//! ## Architecture
//!
//! ```text
//! tx_store.rs  — transactions, indices, CAS transitions, journal writes
//! snapshots.rs — append-only versioned contract snapshots
//! ```
//!
//! ## Tree Layout
//!
//! | Tree                 | Key                          | Value                  |
//! |----------------------|------------------------------|------------------------|
//! | `transactions`       | `hash` (32B)                 | `bincode(Transaction)` |
//! | `sender_nonce`       | `from` (20B) ‖ `nonce` (8B BE) | `hash` (32B)         |
//! | `contract_index`     | `to` ‖ `nonce` (BE) ‖ `seq` (BE) | `hash` (32B)       |
//! | `status_index`       | status tag (1B) ‖ `hash`     | empty                  |
//! | `contract_snapshots` | `address` ‖ `version` (8B BE) | `bincode(Snapshot)`   |
//! | `meta`               | key (UTF-8)                  | value (bytes)          |
//!
//! Big-endian numeric key segments make sled's lexicographic ordering match
//! numeric ordering, so "lowest nonce first" is a plain prefix scan.
//!
//! ## Design Decisions
//!
//! 1. **CAS everywhere.** Status transitions go through
//!    `sled::Tree::compare_and_swap` on the full serialized record. Two
//!    workers racing produce one winner and one clean `StaleStatus`.
//! 2. **The transition graph is enforced at the store.** A write that is
//!    not an edge of [`TransactionStatus::can_transition_to`] is refused
//!    even if the caller asked nicely.
//! 3. **Indices follow the record.** Index maintenance happens in the same
//!    call that wins the CAS, keyed off the observed transition, so the
//!    indices can lag a record by at most one in-process step, never
//!    diverge.
//!
//! [`TransactionStatus::can_transition_to`]: crate::transaction::TransactionStatus::can_transition_to

pub mod snapshots;
pub mod tx_store;

pub use snapshots::{ContractSnapshot, SnapshotRef, SnapshotStore};
pub use tx_store::{StoreError, StoreResult, TransactionStore, TxPatch};
