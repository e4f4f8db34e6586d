use receipt::{verify_bytes, Hash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Active,
    Suspended,
    Slashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validator {
    pub id: Uuid,
    pub pubkey: Vec<u8>,
    pub weight: u128,
    pub status: ValidatorStatus,
}

impl Validator {
    pub fn is_voting(&self) -> bool {
        matches!(self.status, ValidatorStatus::Active) && self.weight > 0
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("update targets version {expected}, registry is at {actual}")]
    VersionMismatch { expected: u64, actual: u64 },
    #[error("approval weight {got} below quorum {need}")]
    InsufficientApproval { got: u128, need: u128 },
    #[error("approval from unknown or non-voting validator {0}")]
    UnknownApprover(Uuid),
    #[error("bad approval signature from {0}")]
    BadApproval(Uuid),
    #[error("duplicate approval from {0}")]
    DuplicateApproval(Uuid),
    #[error("unknown validator {0}")]
    UnknownValidator(Uuid),
    #[error("validator {0} already registered")]
    AlreadyRegistered(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValidatorChange {
    Add(Validator),
    SetWeight { id: Uuid, weight: u128 },
    SetStatus { id: Uuid, status: ValidatorStatus },
    Remove { id: Uuid },
}

/// A quorum-approved mutation of the validator set. `prev_version` pins the
/// registry state the approvers signed over; the approvals are signatures of
/// the current (pre-update) voting set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryUpdate {
    pub prev_version: u64,
    pub changes: Vec<ValidatorChange>,
    pub approvals: Vec<(Uuid, Vec<u8>)>,
}

impl RegistryUpdate {
    pub fn signing_hash(&self) -> Hash {
        let bytes =
            bincode::serialize(&(self.prev_version, &self.changes)).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }
}

/// Versioned registry of consensus participants. There is no ambient global
/// validator set: the engine holds a handle to one of these, and the only
/// mutation path is a quorum-approved `RegistryUpdate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorRegistry {
    version: u64,
    validators: BTreeMap<Uuid, Validator>,
}

impl ValidatorRegistry {
    /// Genesis construction: the only entry point that does not require
    /// quorum approval.
    pub fn genesis(validators: Vec<Validator>) -> Self {
        Self {
            version: 1,
            validators: validators.into_iter().map(|v| (v.id, v)).collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &Uuid) -> Option<&Validator> {
        self.validators.get(id)
    }

    /// Voting validators in id order. Iteration order is part of the leader
    /// election function, so it must be identical on every node.
    pub fn voting(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values().filter(|v| v.is_voting())
    }

    pub fn total_voting_weight(&self) -> u128 {
        self.voting().map(|v| v.weight).sum()
    }

    /// Supermajority bound used uniformly for commit quorum and registry
    /// updates: 2/3 of voting weight plus one.
    pub fn quorum_threshold(&self) -> u128 {
        (self.total_voting_weight() * 2) / 3 + 1
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn apply_update(&mut self, update: &RegistryUpdate) -> Result<(), RegistryError> {
        if update.prev_version != self.version {
            return Err(RegistryError::VersionMismatch {
                expected: update.prev_version,
                actual: self.version,
            });
        }
        let msg = update.signing_hash();
        let mut approved_weight = 0u128;
        let mut seen = Vec::new();
        for (id, sig) in &update.approvals {
            if seen.contains(id) {
                return Err(RegistryError::DuplicateApproval(*id));
            }
            seen.push(*id);
            let validator = self
                .validators
                .get(id)
                .filter(|v| v.is_voting())
                .ok_or(RegistryError::UnknownApprover(*id))?;
            verify_bytes(&validator.pubkey, sig, &msg)
                .map_err(|_| RegistryError::BadApproval(*id))?;
            approved_weight += validator.weight;
        }
        let need = self.quorum_threshold();
        if approved_weight < need {
            return Err(RegistryError::InsufficientApproval {
                got: approved_weight,
                need,
            });
        }

        for change in &update.changes {
            match change {
                ValidatorChange::Add(v) => {
                    if self.validators.contains_key(&v.id) {
                        return Err(RegistryError::AlreadyRegistered(v.id));
                    }
                    self.validators.insert(v.id, v.clone());
                }
                ValidatorChange::SetWeight { id, weight } => {
                    let v = self
                        .validators
                        .get_mut(id)
                        .ok_or(RegistryError::UnknownValidator(*id))?;
                    v.weight = *weight;
                }
                ValidatorChange::SetStatus { id, status } => {
                    let v = self
                        .validators
                        .get_mut(id)
                        .ok_or(RegistryError::UnknownValidator(*id))?;
                    v.status = *status;
                }
                ValidatorChange::Remove { id } => {
                    self.validators
                        .remove(id)
                        .ok_or(RegistryError::UnknownValidator(*id))?;
                }
            }
        }
        self.version += 1;
        tracing::info!(version = self.version, "validator registry updated");
        Ok(())
    }
}

/// Deterministic, independently-computable leader election. Any validator
/// can recompute who the legitimate proposer is from (height, round) and the
/// registry contents alone; nobody is trusted about their own role.
pub fn leader_for(height: u64, round: u64, registry: &ValidatorRegistry) -> Option<Uuid> {
    let total = registry.total_voting_weight();
    if total == 0 {
        return None;
    }
    let seed = bincode::serialize(&(height, round, registry.version())).unwrap_or_default();
    let digest = blake3::hash(&seed);
    let mut slot_bytes = [0u8; 16];
    slot_bytes.copy_from_slice(&digest.as_bytes()[..16]);
    let mut slot = u128::from_le_bytes(slot_bytes) % total;
    for v in registry.voting() {
        if slot < v.weight {
            return Some(v.id);
        }
        slot -= v.weight;
    }
    None
}
