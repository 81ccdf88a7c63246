//! # Validator Registry
//!
//! The validator set and the deterministic committee draw.
//!
//! The registry is versioned: every mutation bumps a counter, and a
//! committee records the version it was drawn from. Given the same
//! `(transaction hash, round index, registry version)` the draw always
//! returns the same committee in the same order — reproducibility is what
//! lets an explorer, a re-run, or a dispute check exactly who was supposed
//! to vote.
//!
//! Selection is a keyed draw without replacement: a BLAKE3 stream seeded by
//! `(hash, round_index, version, counter)` picks members one at a time,
//! stake-weighted when stakes are non-uniform (configurable). No `rand`
//! anywhere near this code path — randomness would be a consensus bug, not
//! a feature.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::primitives::ids::{Address, TxHash};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A registered validator: its identity, stake, and the LLM binding the
/// executor uses when this validator runs a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub id: u64,
    pub address: Address,
    pub stake: u64,
    /// LLM provider name (e.g. "openai", "ollama"). Opaque to the core.
    pub provider: String,
    /// Model identifier within the provider. Opaque to the core.
    pub model: String,
    /// Provider-specific configuration, passed through to the executor.
    pub plugin_config: serde_json::Value,
}

/// How the committee draw weighs candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionWeighting {
    /// Every validator is equally likely.
    Uniform,
    /// Probability proportional to stake. Validators with zero stake are
    /// treated as stake 1 so they remain drawable.
    Proportional,
}

/// A committee drawn for one round: members in draw order, leader first.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitteeSnapshot {
    pub registry_version: u64,
    pub members: Vec<Validator>,
}

impl CommitteeSnapshot {
    pub fn leader(&self) -> &Validator {
        &self.members[0]
    }

    pub fn validators(&self) -> &[Validator] {
        &self.members[1..]
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.members.iter().map(|v| v.address).collect()
    }
}

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("validator registry is empty")]
    Empty,

    #[error("validator {0} is already registered")]
    DuplicateAddress(Address),

    #[error("validator {0} is not registered")]
    UnknownAddress(Address),
}

// ---------------------------------------------------------------------------
// ValidatorRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    validators: Vec<Validator>,
    version: u64,
    next_id: u64,
}

/// The shared validator set. Cheap to read, versioned on write.
#[derive(Debug)]
pub struct ValidatorRegistry {
    inner: RwLock<Inner>,
    weighting: SelectionWeighting,
}

impl ValidatorRegistry {
    pub fn new(weighting: SelectionWeighting) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            weighting,
        }
    }

    /// Registers a validator. Addresses are unique.
    pub fn add(
        &self,
        address: Address,
        stake: u64,
        provider: impl Into<String>,
        model: impl Into<String>,
        plugin_config: serde_json::Value,
    ) -> Result<Validator, RegistryError> {
        let mut inner = self.inner.write();
        if inner.validators.iter().any(|v| v.address == address) {
            return Err(RegistryError::DuplicateAddress(address));
        }
        let validator = Validator {
            id: inner.next_id,
            address,
            stake,
            provider: provider.into(),
            model: model.into(),
            plugin_config,
        };
        inner.next_id += 1;
        inner.version += 1;
        inner.validators.push(validator.clone());
        tracing::info!(
            address = %address,
            stake,
            version = inner.version,
            "validator registered"
        );
        Ok(validator)
    }

    /// Removes a validator by address.
    pub fn remove(&self, address: &Address) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let before = inner.validators.len();
        inner.validators.retain(|v| v.address != *address);
        if inner.validators.len() == before {
            return Err(RegistryError::UnknownAddress(*address));
        }
        inner.version += 1;
        tracing::info!(address = %address, version = inner.version, "validator removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<Validator> {
        self.inner.read().validators.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().validators.is_empty()
    }

    /// Current registry version. Bumped on every mutation.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Draws a committee of up to `size` members for `(hash, round_index)`.
    ///
    /// Deterministic given the registry version. `exclude` removes
    /// specific validators from candidacy (the prior leader after a
    /// LeaderTimeout); if exclusion would empty the candidate pool the
    /// exclusion is ignored — a shrunken set repeating its leader beats no
    /// committee at all, and the state machine records a warning for it.
    pub fn select_committee(
        &self,
        hash: &TxHash,
        round_index: u32,
        size: usize,
        exclude: &[Address],
    ) -> Result<CommitteeSnapshot, RegistryError> {
        let inner = self.inner.read();
        if inner.validators.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut candidates: Vec<&Validator> = inner
            .validators
            .iter()
            .filter(|v| !exclude.contains(&v.address))
            .collect();
        if candidates.is_empty() {
            candidates = inner.validators.iter().collect();
        }

        let target = size.clamp(1, candidates.len());
        let mut members = Vec::with_capacity(target);
        let mut counter: u64 = 0;

        while members.len() < target {
            let draw = keyed_draw(hash, round_index, inner.version, counter);
            counter += 1;

            let picked = match self.weighting {
                SelectionWeighting::Uniform => (draw % candidates.len() as u64) as usize,
                SelectionWeighting::Proportional => {
                    let total: u64 = candidates.iter().map(|v| v.stake.max(1)).sum();
                    let mut point = draw % total;
                    let mut index = 0;
                    for (i, v) in candidates.iter().enumerate() {
                        let weight = v.stake.max(1);
                        if point < weight {
                            index = i;
                            break;
                        }
                        point -= weight;
                    }
                    index
                }
            };

            members.push(candidates.remove(picked).clone());
        }

        Ok(CommitteeSnapshot {
            registry_version: inner.version,
            members,
        })
    }
}

/// One step of the deterministic draw stream.
fn keyed_draw(hash: &TxHash, round_index: u32, version: u64, counter: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(hash.as_bytes());
    hasher.update(&round_index.to_be_bytes());
    hasher.update(&version.to_be_bytes());
    hasher.update(&counter.to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(count: u8, weighting: SelectionWeighting) -> ValidatorRegistry {
        let registry = ValidatorRegistry::new(weighting);
        for i in 0..count {
            registry
                .add(
                    Address([i + 1; 20]),
                    1_000,
                    "ollama",
                    "llama3",
                    serde_json::json!({}),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn add_and_remove_bump_version() {
        let registry = registry_with(0, SelectionWeighting::Uniform);
        assert_eq!(registry.version(), 0);

        registry
            .add(Address([1; 20]), 100, "openai", "gpt-4o", serde_json::json!({}))
            .unwrap();
        assert_eq!(registry.version(), 1);

        registry.remove(&Address([1; 20])).unwrap();
        assert_eq!(registry.version(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_address_rejected() {
        let registry = registry_with(1, SelectionWeighting::Uniform);
        assert!(matches!(
            registry.add(Address([1; 20]), 5, "p", "m", serde_json::json!({})),
            Err(RegistryError::DuplicateAddress(_))
        ));
    }

    #[test]
    fn remove_unknown_rejected() {
        let registry = registry_with(1, SelectionWeighting::Uniform);
        assert!(matches!(
            registry.remove(&Address([9; 20])),
            Err(RegistryError::UnknownAddress(_))
        ));
    }

    #[test]
    fn selection_is_deterministic() {
        let registry = registry_with(7, SelectionWeighting::Proportional);
        let hash = TxHash([0xAB; 32]);

        let a = registry.select_committee(&hash, 0, 5, &[]).unwrap();
        let b = registry.select_committee(&hash, 0, 5, &[]).unwrap();
        assert_eq!(a.addresses(), b.addresses());
        assert_eq!(a.registry_version, b.registry_version);
    }

    #[test]
    fn selection_varies_by_round() {
        let registry = registry_with(7, SelectionWeighting::Uniform);
        let hash = TxHash([0xAB; 32]);

        let r0 = registry.select_committee(&hash, 0, 5, &[]).unwrap();
        let r1 = registry.select_committee(&hash, 1, 5, &[]).unwrap();
        let r2 = registry.select_committee(&hash, 2, 5, &[]).unwrap();
        // The keyed stream makes each draw fixed for these inputs; across
        // three rounds at least one ordering must differ.
        assert!(
            r0.addresses() != r1.addresses() || r0.addresses() != r2.addresses(),
            "three rounds produced identical committees"
        );
    }

    #[test]
    fn committee_has_no_duplicates() {
        let registry = registry_with(10, SelectionWeighting::Proportional);
        let committee = registry
            .select_committee(&TxHash([1; 32]), 0, 10, &[])
            .unwrap();
        let mut addrs = committee.addresses();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 10);
    }

    #[test]
    fn size_clamped_to_population() {
        let registry = registry_with(3, SelectionWeighting::Uniform);
        let committee = registry
            .select_committee(&TxHash([1; 32]), 0, 50, &[])
            .unwrap();
        assert_eq!(committee.size(), 3);
    }

    #[test]
    fn exclusion_removes_candidates() {
        let registry = registry_with(4, SelectionWeighting::Uniform);
        let excluded = Address([1; 20]);
        let committee = registry
            .select_committee(&TxHash([1; 32]), 1, 4, &[excluded])
            .unwrap();
        assert!(!committee.addresses().contains(&excluded));
        assert_eq!(committee.size(), 3);
    }

    #[test]
    fn exclusion_ignored_when_it_empties_the_pool() {
        let registry = registry_with(1, SelectionWeighting::Uniform);
        let only = Address([1; 20]);
        let committee = registry
            .select_committee(&TxHash([1; 32]), 1, 1, &[only])
            .unwrap();
        assert_eq!(committee.leader().address, only);
    }

    #[test]
    fn empty_registry_errors() {
        let registry = registry_with(0, SelectionWeighting::Uniform);
        assert!(matches!(
            registry.select_committee(&TxHash([1; 32]), 0, 3, &[]),
            Err(RegistryError::Empty)
        ));
    }

    #[test]
    fn stake_weighting_prefers_heavy_validators() {
        let registry = ValidatorRegistry::new(SelectionWeighting::Proportional);
        let whale = Address([1; 20]);
        registry
            .add(whale, 1_000_000, "p", "m", serde_json::json!({}))
            .unwrap();
        for i in 2..=5u8 {
            registry
                .add(Address([i; 20]), 1, "p", "m", serde_json::json!({}))
                .unwrap();
        }

        // Over many independent draws the whale should lead nearly always.
        let mut whale_led = 0;
        for round in 0..100u32 {
            let committee = registry
                .select_committee(&TxHash([9; 32]), round, 1, &[])
                .unwrap();
            if committee.leader().address == whale {
                whale_led += 1;
            }
        }
        assert!(whale_led > 90, "whale led {} of 100 draws", whale_led);
    }

    #[test]
    fn version_change_reshuffles() {
        let registry = registry_with(6, SelectionWeighting::Uniform);
        let hash = TxHash([3; 32]);
        let before = registry.select_committee(&hash, 0, 4, &[]).unwrap();

        registry
            .add(Address([99; 20]), 1_000, "p", "m", serde_json::json!({}))
            .unwrap();
        let after = registry.select_committee(&hash, 0, 4, &[]).unwrap();
        assert_ne!(before.registry_version, after.registry_version);
    }
}
