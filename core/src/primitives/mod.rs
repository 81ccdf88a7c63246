//! # Primitives
//!
//! The vocabulary of the consensus core: addresses, transaction hashes,
//! clocks, and keys. Everything here is small, cheap to copy, and free of
//! policy — the interesting decisions live in the modules that consume
//! these types.
//!
//! ## Architecture
//!
//! ```text
//! ids.rs   — Address and TxHash newtypes, hex parsing, worker ids
//! clock.rs — The Clock trait, the system clock, and a manual test clock
//! keys.rs  — Ed25519 keypair wrapper for signing identities
//! ```
//!
//! ## Design Decisions
//!
//! - Addresses are 20 bytes, hex-encoded with an optional `0x` prefix.
//!   The L1 bridge speaks Ethereum's dialect and we match it rather than
//!   translating at every boundary.
//! - Transaction hashes are 32-byte BLAKE3 digests of the signed ingress
//!   envelope. Deterministic, caller-verifiable, collision-resistant.
//! - Time is a `u64` of milliseconds behind a trait, so tests can hold
//!   the clock in one hand and the state machine in the other.

pub mod clock;
pub mod ids;
pub mod keys;

pub use clock::{Clock, ManualClock, Millis, SystemClock};
pub use ids::{Address, AddressParseError, TxHash, WorkerId};
pub use keys::{KeyError, Keypair, PublicKey, SignatureBytes};
