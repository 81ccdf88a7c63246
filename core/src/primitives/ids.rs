//! Address, hash, and worker-id newtypes.
//!
//! These are the identifiers that flow through every store key, every log
//! line, and every API response. They are deliberately boring: fixed-size
//! byte arrays with hex at the edges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::{ADDRESS_LENGTH, HASH_LENGTH};

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A 20-byte account or contract address.
///
/// Displayed as lowercase hex with a `0x` prefix. Parsing accepts the
/// prefix optionally and is case-insensitive, because users will paste
/// addresses from anywhere and normalizing is cheaper than arguing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LENGTH]);

/// Errors raised when parsing an [`Address`] or [`TxHash`] from hex.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("wrong length: expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
}

impl Address {
    /// The all-zero address. Used as a sentinel in tests and nowhere else.
    pub const ZERO: Address = Address([0u8; ADDRESS_LENGTH]);

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LENGTH] {
        &self.0
    }

    /// Derives an address from an Ed25519 public key: the last 20 bytes of
    /// the BLAKE3 digest of the key bytes.
    pub fn from_public_key(public_key_bytes: &[u8; 32]) -> Self {
        let digest = blake3::hash(public_key_bytes);
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(&digest.as_bytes()[HASH_LENGTH - ADDRESS_LENGTH..]);
        Address(out)
    }

    /// Short form for log lines: `0x1234…abcd`.
    pub fn short(&self) -> String {
        let hex = hex::encode(self.0);
        format!("0x{}\u{2026}{}", &hex[..4], &hex[hex.len() - 4..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        if bytes.len() != ADDRESS_LENGTH {
            return Err(AddressParseError::WrongLength {
                expected: ADDRESS_LENGTH,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; ADDRESS_LENGTH];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

// ---------------------------------------------------------------------------
// TxHash
// ---------------------------------------------------------------------------

/// A 32-byte transaction hash: the BLAKE3 digest of the signed ingress
/// envelope. Once persisted, never overwritten.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash(pub [u8; HASH_LENGTH]);

impl TxHash {
    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    /// Digest of arbitrary bytes. The canonical way to derive a hash.
    pub fn digest(bytes: &[u8]) -> Self {
        TxHash(*blake3::hash(bytes).as_bytes())
    }

    /// Short form for log lines: `0x1234…abcd`.
    pub fn short(&self) -> String {
        let hex = hex::encode(self.0);
        format!("0x{}\u{2026}{}", &hex[..4], &hex[hex.len() - 4..])
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for TxHash {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        if bytes.len() != HASH_LENGTH {
            return Err(AddressParseError::WrongLength {
                expected: HASH_LENGTH,
                got: bytes.len(),
            });
        }
        let mut out = [0u8; HASH_LENGTH];
        out.copy_from_slice(&bytes);
        Ok(TxHash(out))
    }
}

// ---------------------------------------------------------------------------
// WorkerId
// ---------------------------------------------------------------------------

/// Identifier of a consensus worker. Stable for the lifetime of the worker
/// task; recorded on the transaction while the worker holds its lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub uuid::Uuid);

impl WorkerId {
    pub fn new() -> Self {
        WorkerId(uuid::Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode_hex(s: &str) -> Result<Vec<u8>, AddressParseError> {
    let trimmed = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    hex::decode(trimmed).map_err(|e| AddressParseError::InvalidHex(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
