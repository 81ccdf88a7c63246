// Copyright (c) 2026 Conclave Systems. MIT License.
// See LICENSE for details.

//! # Conclave — Consensus Core
//!
//! The engine room of a network whose contracts are allowed to do the one
//! thing classical blockchains forbid: be nondeterministic. Contracts call
//! large language models and the open web, validators each get a slightly
//! different answer, and agreement is reconciled through an Equivalence
//! Principle instead of bit-exact replay.
//!
//! This crate is only the consensus core. It accepts signed transactions,
//! schedules them per contract, drives each one through the commit–reveal
//! state machine (Proposing → Committing → Revealing → Accepted →
//! Finalized), persists every intermediate step, and handles rotations,
//! appeals, and timeouts under concurrent load. The pieces that surround it
//! in a full deployment — the HTTP/WS front, the sandboxed executor fleet,
//! the L1 bridge, the explorer — are collaborators reached through traits
//! and channels, never compiled in.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of the
//! core:
//!
//! - **primitives** — addresses, hashes, clocks, keys. The vocabulary.
//! - **config** — every tunable in one place, env-driven.
//! - **transaction** — the transaction record, its journal, and the signed
//!   ingress envelope.
//! - **store** — sled-backed persistence. All cross-phase transitions are
//!   compare-and-swap; the store is the single source of truth.
//! - **registry** — the validator set and the deterministic committee draw.
//! - **executor** — the protocol spoken to the validator executor, plus a
//!   scriptable mock for tests.
//! - **consensus** — the state machine itself. The core of the core.
//! - **sched** — crawler, dispatcher, worker pool. Per-contract FIFO with
//!   a single in-flight transaction per contract, leases, heartbeats.
//! - **appeal** — user-initiated re-runs with enlarged committees.
//! - **finality** — the timer that promotes Accepted to Finalized once the
//!   appeal window has passed quietly.
//! - **events** — per-topic FIFO fan-out of status changes.
//! - **runtime** — the context object that wires it all together.
//!
//! ## Design Philosophy
//!
//! 1. The store decides. In-memory state is a hint, never an authority.
//! 2. Every cross-phase transition is a CAS. Two workers racing lose
//!    cleanly, not silently.
//! 3. Timeouts are first-class values, not wrappers someone forgot about.
//! 4. If it can strand a transaction, it has a test.

pub mod appeal;
pub mod config;
pub mod consensus;
pub mod events;
pub mod executor;
pub mod finality;
pub mod primitives;
pub mod registry;
pub mod runtime;
pub mod sched;
pub mod store;
pub mod transaction;
