//! The signed ingress envelope.
//!
//! `send_raw_transaction` delivers opaque bytes. This module gives those
//! bytes a shape: a bincode-encoded [`SignedEnvelope`] wrapping a
//! [`TxPayload`], an Ed25519 public key, and a signature over the encoded
//! payload. The transaction hash is the BLAKE3 digest of the raw envelope
//! bytes, so callers can derive it independently before submission.

use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::primitives::clock::Millis;
use crate::primitives::ids::{Address, TxHash};
use crate::primitives::keys::{Keypair, PublicKey, SignatureBytes};
use crate::transaction::types::{
    ExecutionMode, Transaction, TransactionKind, TransactionStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Rejections raised while decoding and validating an ingress envelope.
/// These all map to the JSON-RPC validation error at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("sender address does not match the signing key")]
    SenderMismatch,

    #[error("transaction kind {0} requires a recipient")]
    MissingRecipient(TransactionKind),

    #[error("deploy transactions must not name a recipient")]
    UnexpectedRecipient,

    #[error("requested committee size {0} is out of range")]
    CommitteeSizeOutOfRange(usize),
}

// ---------------------------------------------------------------------------
// TxPayload
// ---------------------------------------------------------------------------

/// The signed portion of a submission: everything the sender asserts.
///
/// Consensus knobs (`committee_size`, `execution_mode`, `max_rotations`)
/// are optional; unset fields take the node's configured defaults at
/// ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPayload {
    pub from: Address,
    pub to: Option<Address>,
    pub kind: TransactionKind,
    pub nonce: u64,
    pub value: u128,
    pub input: Vec<u8>,
    pub committee_size: Option<usize>,
    pub execution_mode: Option<ExecutionMode>,
    pub max_rotations: Option<u32>,
}

impl TxPayload {
    /// Canonical bytes the signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("payload serialization is infallible")
    }
}

// ---------------------------------------------------------------------------
// SignedEnvelope
// ---------------------------------------------------------------------------

/// A payload plus the key and signature vouching for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: TxPayload,
    pub public_key: PublicKey,
    pub signature: SignatureBytes,
}

impl SignedEnvelope {
    /// Signs `payload` with `keypair`, producing a submission-ready
    /// envelope.
    pub fn sign(payload: TxPayload, keypair: &Keypair) -> Self {
        let signature = keypair.sign(&payload.signing_bytes());
        Self {
            payload,
            public_key: keypair.public_key(),
            signature,
        }
    }

    /// Encodes the envelope to the raw bytes `send_raw_transaction`
    /// carries.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("envelope serialization is infallible")
    }

    /// Decodes raw submission bytes.
    pub fn decode(raw: &[u8]) -> Result<Self, IngressError> {
        bincode::deserialize(raw).map_err(|e| IngressError::Malformed(e.to_string()))
    }

    /// The transaction hash for a raw submission: the digest of the exact
    /// bytes the caller sent.
    pub fn hash_raw(raw: &[u8]) -> TxHash {
        TxHash::digest(raw)
    }

    /// Full ingress validation: signature, sender/key binding, and
    /// kind/recipient coherence.
    pub fn verify(&self) -> Result<(), IngressError> {
        if !self
            .public_key
            .verify(&self.payload.signing_bytes(), &self.signature)
        {
            return Err(IngressError::BadSignature);
        }
        if self.public_key.address() != self.payload.from {
            return Err(IngressError::SenderMismatch);
        }
        match (self.payload.kind, self.payload.to) {
            (TransactionKind::Deploy, Some(_)) => Err(IngressError::UnexpectedRecipient),
            (TransactionKind::Deploy, None) => Ok(()),
            (kind, None) => Err(IngressError::MissingRecipient(kind)),
            (_, Some(_)) => Ok(()),
        }
    }

    /// Builds the persisted record from a validated envelope.
    ///
    /// Deploys get their contract address assigned here — the digest of
    /// `(from, nonce)`, truncated to 20 bytes — so the scheduler can
    /// serialize deploys per target like any other transaction.
    pub fn into_transaction(
        self,
        hash: TxHash,
        config: &CoreConfig,
        now: Millis,
    ) -> Result<Transaction, IngressError> {
        let committee_size = self.payload.committee_size.unwrap_or(config.committee_size);
        if committee_size == 0 || committee_size > crate::config::MAX_COMMITTEE_SIZE {
            return Err(IngressError::CommitteeSizeOutOfRange(committee_size));
        }

        let to = match self.payload.kind {
            TransactionKind::Deploy => Some(derive_contract_address(
                &self.payload.from,
                self.payload.nonce,
            )),
            _ => self.payload.to,
        };

        Ok(Transaction {
            hash,
            from: self.payload.from,
            to,
            kind: self.payload.kind,
            nonce: self.payload.nonce,
            input: self.payload.input,
            value: self.payload.value,
            status: TransactionStatus::Pending,
            execution_mode: self
                .payload
                .execution_mode
                .unwrap_or(ExecutionMode::Normal),
            committee_size,
            max_rotations: self.payload.max_rotations.unwrap_or(config.max_rotations),
            rotation_count: 0,
            appeal_count: 0,
            consensus_history: Vec::new(),
            triggered_by_hash: None,
            current_worker: None,
            timestamp_awaiting_finalization: None,
            blocked_at: None,
            last_vote_timestamp: None,
            created_at: now,
        })
    }
}

/// Deterministic contract address for a deploy: last 20 bytes of
/// BLAKE3(from ‖ nonce).
pub fn derive_contract_address(from: &Address, nonce: u64) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(from.as_bytes());
    hasher.update(&nonce.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.as_bytes()[12..]);
    Address(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn call_payload(keypair: &Keypair, nonce: u64) -> TxPayload {
        TxPayload {
            from: keypair.address(),
            to: Some(Address([0xC0; 20])),
            kind: TransactionKind::Call,
            nonce,
            value: 0,
            input: b"method:greet".to_vec(),
            committee_size: None,
            execution_mode: None,
            max_rotations: None,
        }
    }

    #[test]
    fn sign_encode_decode_verify_roundtrip() {
        let kp = Keypair::generate();
        let envelope = SignedEnvelope::sign(call_payload(&kp, 0), &kp);

        let raw = envelope.encode();
        let decoded = SignedEnvelope::decode(&raw).expect("decode");
        assert_eq!(decoded, envelope);
        decoded.verify().expect("verification must pass");
    }

    #[test]
    fn hash_is_stable_over_raw_bytes() {
        let kp = Keypair::generate();
        let raw = SignedEnvelope::sign(call_payload(&kp, 0), &kp).encode();
        assert_eq!(SignedEnvelope::hash_raw(&raw), SignedEnvelope::hash_raw(&raw));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let kp = Keypair::generate();
        let mut envelope = SignedEnvelope::sign(call_payload(&kp, 0), &kp);
        envelope.payload.value = 1_000_000;
        assert!(matches!(envelope.verify(), Err(IngressError::BadSignature)));
    }

    #[test]
    fn mismatched_sender_rejected() {
        let kp = Keypair::generate();
        let mut payload = call_payload(&kp, 0);
        payload.from = Address([0xEE; 20]);
        // Signature is valid over the (forged) payload, but the claimed
        // sender does not match the signing key.
        let signature = kp.sign(&payload.signing_bytes());
        let envelope = SignedEnvelope {
            payload,
            public_key: kp.public_key(),
            signature,
        };
        assert!(matches!(
            envelope.verify(),
            Err(IngressError::SenderMismatch)
        ));
    }

    #[test]
    fn deploy_must_not_name_recipient() {
        let kp = Keypair::generate();
        let mut payload = call_payload(&kp, 0);
        payload.kind = TransactionKind::Deploy;
        let envelope = SignedEnvelope::sign(payload, &kp);
        assert!(matches!(
            envelope.verify(),
            Err(IngressError::UnexpectedRecipient)
        ));
    }

    #[test]
    fn call_requires_recipient() {
        let kp = Keypair::generate();
        let mut payload = call_payload(&kp, 0);
        payload.to = None;
        let envelope = SignedEnvelope::sign(payload, &kp);
        assert!(matches!(
            envelope.verify(),
            Err(IngressError::MissingRecipient(TransactionKind::Call))
        ));
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        assert!(matches!(
            SignedEnvelope::decode(b"not an envelope"),
            Err(IngressError::Malformed(_))
        ));
    }

    #[test]
    fn deploy_gets_derived_contract_address() {
        let kp = Keypair::generate();
        let mut payload = call_payload(&kp, 7);
        payload.kind = TransactionKind::Deploy;
        payload.to = None;
        let envelope = SignedEnvelope::sign(payload, &kp);
        let raw = envelope.encode();

        let tx = envelope
            .into_transaction(SignedEnvelope::hash_raw(&raw), &CoreConfig::default(), 1_000)
            .expect("conversion");
        assert_eq!(tx.to, Some(derive_contract_address(&kp.address(), 7)));
        assert_eq!(tx.status, TransactionStatus::Pending);
    }

    #[test]
    fn defaults_fill_unset_consensus_knobs() {
        let kp = Keypair::generate();
        let config = CoreConfig::default();
        let envelope = SignedEnvelope::sign(call_payload(&kp, 0), &kp);
        let raw = envelope.encode();

        let tx = envelope
            .into_transaction(SignedEnvelope::hash_raw(&raw), &config, 0)
            .expect("conversion");
        assert_eq!(tx.committee_size, config.committee_size);
        assert_eq!(tx.max_rotations, config.max_rotations);
        assert_eq!(tx.execution_mode, ExecutionMode::Normal);
    }

    #[test]
    fn absurd_committee_size_rejected() {
        let kp = Keypair::generate();
        let mut payload = call_payload(&kp, 0);
        payload.committee_size = Some(crate::config::MAX_COMMITTEE_SIZE + 1);
        let envelope = SignedEnvelope::sign(payload, &kp);
        let raw = envelope.encode();

        assert!(matches!(
            envelope.into_transaction(SignedEnvelope::hash_raw(&raw), &CoreConfig::default(), 0),
            Err(IngressError::CommitteeSizeOutOfRange(_))
        ));
    }
}
