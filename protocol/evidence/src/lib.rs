//! Misbehavior detection over the consensus message stream.
//!
//! The detector watches proposals and votes as they arrive and emits
//! [`Evidence`] when a validator signs two conflicting messages for the same
//! height and round, or signs with a key that is not its registered one.
//! Detection is deterministic and side-effect free: the detector never touches
//! consensus state, and enforcement (weight removal) goes through the normal
//! quorum-gated registry-update path.

use consensus::{vote_signing_bytes, SignedProposal, ValidatorRegistry, Vote};
use receipt::{verify_bytes, Hash};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvidenceKind {
    /// Two differently-hashed signed proposals from one proposer at the same
    /// height and round.
    DoubleProposal,
    /// Two differing signed votes from one voter at the same height and round.
    ConflictingVotes,
    /// A message whose claimed validator id has no registered key, or whose
    /// signature does not verify under the registered key.
    ForeignKey,
}

impl EvidenceKind {
    fn tag(self) -> u8 {
        match self {
            EvidenceKind::DoubleProposal => 1,
            EvidenceKind::ConflictingVotes => 2,
            EvidenceKind::ForeignKey => 3,
        }
    }
}

/// The signed artifacts backing a piece of evidence, carried verbatim so any
/// third party can re-verify the conflict without trusting the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EvidenceArtifacts {
    ProposalPair(Box<SignedProposal>, Box<SignedProposal>),
    VotePair(Box<Vote>, Box<Vote>),
    LoneProposal(Box<SignedProposal>),
    LoneVote(Box<Vote>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_id: Hash,
    pub kind: EvidenceKind,
    pub accused: Uuid,
    pub height: u64,
    pub round: u64,
    pub artifacts: EvidenceArtifacts,
}

impl Evidence {
    /// Re-verify the evidence against a registry snapshot. Returns `Ok` only
    /// if the artifacts really demonstrate the claimed offense.
    pub fn verify(&self, registry: &ValidatorRegistry) -> anyhow::Result<()> {
        match (&self.kind, &self.artifacts) {
            (EvidenceKind::DoubleProposal, EvidenceArtifacts::ProposalPair(a, b)) => {
                let validator = registry
                    .get(&self.accused)
                    .ok_or_else(|| anyhow::anyhow!("accused {} not in registry", self.accused))?;
                for signed in [a.as_ref(), b.as_ref()] {
                    anyhow::ensure!(
                        signed.proposal.proposer_id == self.accused
                            && signed.proposal.height == self.height
                            && signed.proposal.round == self.round,
                        "artifact does not match accusation"
                    );
                    verify_bytes(
                        &validator.pubkey,
                        &signed.signature,
                        &signed.proposal.hash(),
                    )?;
                }
                anyhow::ensure!(
                    a.proposal.hash() != b.proposal.hash(),
                    "proposals are identical"
                );
                Ok(())
            }
            (EvidenceKind::ConflictingVotes, EvidenceArtifacts::VotePair(a, b)) => {
                let validator = registry
                    .get(&self.accused)
                    .ok_or_else(|| anyhow::anyhow!("accused {} not in registry", self.accused))?;
                for vote in [a.as_ref(), b.as_ref()] {
                    anyhow::ensure!(
                        vote.voter_id == self.accused
                            && vote.height == self.height
                            && vote.round == self.round,
                        "artifact does not match accusation"
                    );
                    let msg =
                        vote_signing_bytes(&vote.proposal_hash, vote.height, vote.round, vote.choice);
                    verify_bytes(&validator.pubkey, &vote.signature, &msg)?;
                }
                anyhow::ensure!(
                    a.proposal_hash != b.proposal_hash || a.choice != b.choice,
                    "votes are identical"
                );
                Ok(())
            }
            (EvidenceKind::ForeignKey, artifacts) => {
                let (claimed, signature, msg) = match artifacts {
                    EvidenceArtifacts::LoneVote(v) => (
                        v.voter_id,
                        v.signature.clone(),
                        vote_signing_bytes(&v.proposal_hash, v.height, v.round, v.choice),
                    ),
                    EvidenceArtifacts::LoneProposal(p) => (
                        p.proposal.proposer_id,
                        p.signature.clone(),
                        p.proposal.hash().to_vec(),
                    ),
                    _ => anyhow::bail!("foreign-key evidence needs a lone artifact"),
                };
                anyhow::ensure!(claimed == self.accused, "artifact does not match accusation");
                match registry.get(&claimed) {
                    None => Ok(()),
                    Some(v) => {
                        anyhow::ensure!(
                            verify_bytes(&v.pubkey, &signature, &msg).is_err(),
                            "signature verifies under the registered key"
                        );
                        Ok(())
                    }
                }
            }
            _ => anyhow::bail!("artifacts do not match evidence kind"),
        }
    }
}

fn pair_id(kind: EvidenceKind, accused: Uuid, height: u64, round: u64, a: &[u8], b: &[u8]) -> Hash {
    // Order the artifact encodings lexicographically so the same conflict
    // observed in either order hashes to the same id.
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[kind.tag()]);
    hasher.update(accused.as_bytes());
    hasher.update(&height.to_le_bytes());
    hasher.update(&round.to_le_bytes());
    hasher.update(lo);
    hasher.update(hi);
    *hasher.finalize().as_bytes()
}

fn lone_id(accused: Uuid, height: u64, round: u64, artifact: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[EvidenceKind::ForeignKey.tag()]);
    hasher.update(accused.as_bytes());
    hasher.update(&height.to_le_bytes());
    hasher.update(&round.to_le_bytes());
    hasher.update(artifact);
    *hasher.finalize().as_bytes()
}

#[derive(Default)]
struct DetectorInner {
    // First message seen per (validator, height, round). Later conflicting
    // messages are paired against the first so replays reproduce the same
    // evidence id.
    proposals: HashMap<(Uuid, u64, u64), SignedProposal>,
    votes: HashMap<(Uuid, u64, u64), Vote>,
    emitted: HashSet<Hash>,
    log: Vec<Evidence>,
}

pub struct MisbehaviorDetector {
    inner: Mutex<DetectorInner>,
}

impl Default for MisbehaviorDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MisbehaviorDetector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DetectorInner::default()),
        }
    }

    /// Inspect a proposal. Returns newly emitted evidence, if any.
    pub fn observe_proposal(
        &self,
        signed: &SignedProposal,
        registry: &ValidatorRegistry,
    ) -> Option<Evidence> {
        let proposer = signed.proposal.proposer_id;
        let height = signed.proposal.height;
        let round = signed.proposal.round;
        let proposal_hash = signed.proposal.hash();

        let foreign = match registry.get(&proposer) {
            None => true,
            Some(v) => verify_bytes(&v.pubkey, &signed.signature, &proposal_hash).is_err(),
        };
        if foreign {
            let bytes = bincode::serialize(signed).unwrap_or_default();
            let id = lone_id(proposer, height, round, &bytes);
            return self.emit(Evidence {
                evidence_id: id,
                kind: EvidenceKind::ForeignKey,
                accused: proposer,
                height,
                round,
                artifacts: EvidenceArtifacts::LoneProposal(Box::new(signed.clone())),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let key = (proposer, height, round);
        let first_seen = inner.proposals.get(&key).cloned();
        match first_seen {
            None => {
                inner.proposals.insert(key, signed.clone());
                None
            }
            Some(first) if first.proposal.hash() == proposal_hash => None,
            Some(first) => {
                let a = bincode::serialize(&first).unwrap_or_default();
                let b = bincode::serialize(signed).unwrap_or_default();
                let id = pair_id(EvidenceKind::DoubleProposal, proposer, height, round, &a, &b);
                let evidence = Evidence {
                    evidence_id: id,
                    kind: EvidenceKind::DoubleProposal,
                    accused: proposer,
                    height,
                    round,
                    artifacts: EvidenceArtifacts::ProposalPair(
                        Box::new(first),
                        Box::new(signed.clone()),
                    ),
                };
                drop(inner);
                self.emit(evidence)
            }
        }
    }

    /// Inspect a vote. Returns newly emitted evidence, if any.
    pub fn observe_vote(&self, vote: &Vote, registry: &ValidatorRegistry) -> Option<Evidence> {
        let msg = vote_signing_bytes(&vote.proposal_hash, vote.height, vote.round, vote.choice);
        let foreign = match registry.get(&vote.voter_id) {
            None => true,
            Some(v) => verify_bytes(&v.pubkey, &vote.signature, &msg).is_err(),
        };
        if foreign {
            let bytes = bincode::serialize(vote).unwrap_or_default();
            let id = lone_id(vote.voter_id, vote.height, vote.round, &bytes);
            return self.emit(Evidence {
                evidence_id: id,
                kind: EvidenceKind::ForeignKey,
                accused: vote.voter_id,
                height: vote.height,
                round: vote.round,
                artifacts: EvidenceArtifacts::LoneVote(Box::new(vote.clone())),
            });
        }

        let mut inner = self.inner.lock().unwrap();
        let key = (vote.voter_id, vote.height, vote.round);
        let first_seen = inner.votes.get(&key).cloned();
        match first_seen {
            None => {
                inner.votes.insert(key, vote.clone());
                None
            }
            Some(first)
                if first.proposal_hash == vote.proposal_hash && first.choice == vote.choice =>
            {
                None
            }
            Some(first) => {
                let a = bincode::serialize(&first).unwrap_or_default();
                let b = bincode::serialize(vote).unwrap_or_default();
                let id = pair_id(
                    EvidenceKind::ConflictingVotes,
                    vote.voter_id,
                    vote.height,
                    vote.round,
                    &a,
                    &b,
                );
                let evidence = Evidence {
                    evidence_id: id,
                    kind: EvidenceKind::ConflictingVotes,
                    accused: vote.voter_id,
                    height: vote.height,
                    round: vote.round,
                    artifacts: EvidenceArtifacts::VotePair(
                        Box::new(first),
                        Box::new(vote.clone()),
                    ),
                };
                drop(inner);
                self.emit(evidence)
            }
        }
    }

    fn emit(&self, evidence: Evidence) -> Option<Evidence> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.emitted.insert(evidence.evidence_id) {
            return None;
        }
        warn!(
            accused = %evidence.accused,
            height = evidence.height,
            round = evidence.round,
            kind = ?evidence.kind,
            id = %hex::encode(&evidence.evidence_id[..8]),
            "slashing evidence emitted"
        );
        inner.log.push(evidence.clone());
        Some(evidence)
    }

    /// All evidence emitted so far, in emission order.
    pub fn evidence(&self) -> Vec<Evidence> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop first-seen records below a finalized height so the maps do not
    /// grow without bound. Emitted evidence ids are kept.
    pub fn prune_below(&self, height: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.proposals.retain(|(_, h, _), _| *h >= height);
        inner.votes.retain(|(_, h, _), _| *h >= height);
    }
}
