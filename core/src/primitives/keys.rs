//! Ed25519 signing identities.
//!
//! Every transaction entering the core carries an Ed25519 signature from
//! its sender. This module wraps `ed25519-dalek` behind a small surface:
//! generate, derive-from-seed, sign, verify, and nothing clever. Private
//! key bytes are never logged; if you add logging here, you will be asked
//! to leave.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::primitives::ids::Address;

/// Errors raised by key and signature operations.
///
/// Deliberately vague about *why* something failed — leaking details about
/// key material through error messages is a classic footgun.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,

    #[error("invalid signature bytes: wrong length")]
    InvalidSignature,
}

/// Raw signature bytes as they travel inside a signed envelope.
///
/// Stored as `Vec<u8>` for serde friendliness but always exactly 64 bytes;
/// anything else simply fails verification.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(pub Vec<u8>);

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({}B)", self.0.len())
    }
}

/// The public half of a signing identity. Safe to share, log, and index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let arr: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
        // Reject bytes that are not a valid curve point up front.
        VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(PublicKey(arr))
    }

    /// The 20-byte address derived from this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(&self.0)
    }

    /// Verifies `signature` over `message`. Returns plain `false` for any
    /// malformed input — no panics, no partial trust.
    pub fn verify(&self, message: &[u8], signature: &SignatureBytes) -> bool {
        let Ok(verifying) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig_arr) = <[u8; SIGNATURE_LENGTH]>::try_from(signature.0.as_slice()) else {
            return false;
        };
        verifying
            .verify(message, &Signature::from_bytes(&sig_arr))
            .is_ok()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{})", self.to_hex())
    }
}

/// An Ed25519 keypair. The signing half of an identity.
///
/// Does NOT implement `Serialize` — persisting private keys must be a
/// deliberate act, not a side effect of shoving a struct into JSON.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic construction from a 32-byte seed. A weak seed makes a
    /// weak key; use this for tests and derived dev identities only.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Reconstructs a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&arr))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// The address this keypair signs for.
    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.signing_key.sign(message).to_bytes().to_vec())
    }

    /// Exports the raw secret. Handle with care; never log.
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.secret_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show the public half only.
        write!(f, "Keypair(pub=0x{})", self.public_key().to_hex())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = Keypair::generate();
        let msg = b"call contract 0xfeed";
        let sig = kp.sign(msg);
        assert!(kp.public_key().verify(msg, &sig));
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"original");
        assert!(!kp.public_key().verify(b"tampered", &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = signer.sign(b"message");
        assert!(!other.public_key().verify(b"message", &sig));
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let kp = Keypair::generate();
        let mut sig = kp.sign(b"message");
        sig.0.truncate(32);
        assert!(!kp.public_key().verify(b"message", &sig));
    }

    #[test]
    fn seed_determinism() {
        let seed = [9u8; 32];
        let a = Keypair::from_seed(&seed);
        let b = Keypair::from_seed(&seed);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.address(), b.address());
    }

    #[test]
    fn hex_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_hex(&hex::encode(kp.secret_key_bytes())).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn public_key_from_bytes_rejects_garbage_length() {
        assert!(PublicKey::from_bytes(&[0u8; 7]).is_err());
    }

    #[test]
    fn debug_output_hides_secret() {
        let kp = Keypair::generate();
        let dbg = format!("{:?}", kp);
        assert!(!dbg.contains(&hex::encode(kp.secret_key_bytes())));
    }
}
