pub mod registry;

pub use registry::{
    leader_for, RegistryError, RegistryUpdate, Validator, ValidatorChange, ValidatorRegistry,
    ValidatorStatus,
};

use pool::BundlePool;
use receipt::{sign_bytes, verify_bytes, Hash};
use scoring::{GovernanceParams, PoEBundle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

pub const GENESIS_BLOCK_HASH: Hash = [0u8; 32];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockProposal {
    pub height: u64,
    pub round: u64,
    pub prev_block_hash: Hash,
    pub bundles: Vec<PoEBundle>,
    pub proposer_id: Uuid,
    pub timestamp_ms: u64,
}

impl BlockProposal {
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedProposal {
    pub proposal: BlockProposal,
    pub signature: Vec<u8>,
}

pub fn sign_proposal(proposal: &BlockProposal, key: &ed25519_dalek::SigningKey) -> SignedProposal {
    let signature = sign_bytes(key, &proposal.hash());
    SignedProposal {
        proposal: proposal.clone(),
        signature,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Accept,
    Reject,
    Abstain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub proposal_hash: Hash,
    pub height: u64,
    pub round: u64,
    pub choice: VoteChoice,
    pub voter_id: Uuid,
    pub signature: Vec<u8>,
}

pub fn vote_signing_bytes(
    proposal_hash: &Hash,
    height: u64,
    round: u64,
    choice: VoteChoice,
) -> Vec<u8> {
    bincode::serialize(&(proposal_hash, height, round, choice)).unwrap_or_default()
}

pub fn sign_vote(
    proposal_hash: Hash,
    height: u64,
    round: u64,
    choice: VoteChoice,
    voter_id: Uuid,
    key: &ed25519_dalek::SigningKey,
) -> Vote {
    let signature = sign_bytes(key, &vote_signing_bytes(&proposal_hash, height, round, choice));
    Vote {
        proposal_hash,
        height,
        round,
        choice,
        voter_id,
        signature,
    }
}

/// Aggregated signature set binding one proposal hash to a supermajority of
/// voting weight. Signers are sorted by validator id so the encoding is
/// canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalityProof {
    pub proposal_hash: Hash,
    pub height: u64,
    pub round: u64,
    pub signers: Vec<(Uuid, Vec<u8>)>,
    pub total_weight: u128,
}

impl FinalityProof {
    /// Standalone verification against a registry snapshot: every signature
    /// checks out and the signed weight meets quorum.
    pub fn verify(&self, registry: &ValidatorRegistry) -> anyhow::Result<()> {
        let msg =
            vote_signing_bytes(&self.proposal_hash, self.height, self.round, VoteChoice::Accept);
        let mut weight = 0u128;
        let mut last: Option<Uuid> = None;
        for (id, sig) in &self.signers {
            if let Some(prev) = last {
                if *id <= prev {
                    anyhow::bail!("finality proof signers out of canonical order");
                }
            }
            last = Some(*id);
            let validator = registry
                .get(id)
                .filter(|v| v.is_voting())
                .ok_or_else(|| anyhow::anyhow!("signer {} not in voting set", id))?;
            verify_bytes(&validator.pubkey, sig, &msg)?;
            weight += validator.weight;
        }
        if weight < registry.quorum_threshold() {
            anyhow::bail!(
                "finality proof weight {} below quorum {}",
                weight,
                registry.quorum_threshold()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedBlock {
    pub proposal: BlockProposal,
    pub proof: FinalityProof,
}

impl FinalizedBlock {
    pub fn hash(&self) -> Hash {
        self.proof.proposal_hash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Propose,
    Vote,
    Commit,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub height: u64,
    pub round: u64,
    pub phase: Phase,
    pub finalized_height: u64,
    pub registry_version: u64,
}

#[derive(Debug, Error)]
pub enum ConsensusFault {
    #[error("proposal from {got}, elected leader for h{height}/r{round} is {expected:?}")]
    NotTheLeader {
        got: Uuid,
        expected: Option<Uuid>,
        height: u64,
        round: u64,
    },
    #[error("message for h{got_height}/r{got_round}, engine at h{height}/r{round}")]
    StaleRound {
        got_height: u64,
        got_round: u64,
        height: u64,
        round: u64,
    },
    #[error("vote from unknown or non-voting validator {0}")]
    UnknownVoter(Uuid),
    #[error("bad signature from {0}")]
    BadSignature(Uuid),
    #[error("already voted for a different proposal at h{height}/r{round}")]
    WouldEquivocate { height: u64, round: u64 },
}

#[derive(Debug, Default)]
struct Tally {
    accept_weight: u128,
    voters: HashMap<Uuid, Vec<u8>>,
}

struct EngineInner {
    height: u64,
    round: u64,
    phase: Phase,
    prev_block_hash: Hash,
    current_proposal: Option<SignedProposal>,
    own_votes: HashMap<(u64, u64), Hash>,
    own_proposals: HashMap<(u64, u64), SignedProposal>,
    tallies: HashMap<(Hash, u64, u64), Tally>,
    finalized: Vec<FinalizedBlock>,
}

/// One validator's consensus state machine. Cross-validator state is never
/// shared memory: the engine consumes signed messages and emits signed
/// messages, and the node layer moves them over whatever bus is configured.
pub struct QuorumEngine {
    local_id: Uuid,
    key: ed25519_dalek::SigningKey,
    registry: Arc<Mutex<ValidatorRegistry>>,
    params: Arc<Mutex<GovernanceParams>>,
    pool: Arc<BundlePool>,
    max_bundles_per_block: usize,
    inner: Mutex<EngineInner>,
}

impl QuorumEngine {
    pub fn new(
        local_id: Uuid,
        key: ed25519_dalek::SigningKey,
        registry: Arc<Mutex<ValidatorRegistry>>,
        params: Arc<Mutex<GovernanceParams>>,
        pool: Arc<BundlePool>,
        max_bundles_per_block: usize,
    ) -> Self {
        Self {
            local_id,
            key,
            registry,
            params,
            pool,
            max_bundles_per_block,
            inner: Mutex::new(EngineInner {
                height: 1,
                round: 0,
                phase: Phase::Idle,
                prev_block_hash: GENESIS_BLOCK_HASH,
                current_proposal: None,
                own_votes: HashMap::new(),
                own_proposals: HashMap::new(),
                tallies: HashMap::new(),
                finalized: Vec::new(),
            }),
        }
    }

    pub fn status(&self) -> EngineStatus {
        let inner = self.inner.lock().unwrap();
        EngineStatus {
            height: inner.height,
            round: inner.round,
            phase: inner.phase,
            finalized_height: inner.finalized.len() as u64,
            registry_version: self.registry.lock().unwrap().version(),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn current_round(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.height, inner.round)
    }

    /// True when this validator is the elected leader for the current round.
    pub fn is_local_leader(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let registry = self.registry.lock().unwrap();
        leader_for(inner.height, inner.round, &registry) == Some(self.local_id)
    }

    /// Leader path: pull the top-priority bundles from the pool and sign a
    /// proposal for the current (height, round). Signing is once per round:
    /// repeated calls while the round is still open return the recorded
    /// proposal unchanged, so an honest leader never equivocates on itself.
    pub fn build_proposal(&self, now_ms: u64) -> anyhow::Result<SignedProposal> {
        let mut inner = self.inner.lock().unwrap();
        {
            let registry = self.registry.lock().unwrap();
            let elected = leader_for(inner.height, inner.round, &registry);
            if elected != Some(self.local_id) {
                anyhow::bail!(ConsensusFault::NotTheLeader {
                    got: self.local_id,
                    expected: elected,
                    height: inner.height,
                    round: inner.round,
                });
            }
        }
        if let Some(existing) = inner.own_proposals.get(&(inner.height, inner.round)) {
            return Ok(existing.clone());
        }
        let bundles = self.pool.peek_top(self.max_bundles_per_block, now_ms);
        let proposal = BlockProposal {
            height: inner.height,
            round: inner.round,
            prev_block_hash: inner.prev_block_hash,
            bundles,
            proposer_id: self.local_id,
            timestamp_ms: now_ms,
        };
        let signed = sign_proposal(&proposal, &self.key);
        inner
            .own_proposals
            .insert((proposal.height, proposal.round), signed.clone());
        inner.phase = Phase::Propose;
        tracing::info!(
            height = proposal.height,
            round = proposal.round,
            bundles = proposal.bundles.len(),
            "built proposal"
        );
        Ok(signed)
    }

    /// Validator path: check a proposal and answer with a signed vote. A
    /// structurally bad proposal from the legitimate leader earns a Reject
    /// vote; a proposal from anyone else is a fault, not a vote.
    pub fn handle_proposal(&self, signed: &SignedProposal) -> anyhow::Result<Option<Vote>> {
        let proposal = &signed.proposal;
        let proposal_hash = proposal.hash();
        let mut inner = self.inner.lock().unwrap();
        if proposal.height != inner.height || proposal.round != inner.round {
            anyhow::bail!(ConsensusFault::StaleRound {
                got_height: proposal.height,
                got_round: proposal.round,
                height: inner.height,
                round: inner.round,
            });
        }

        let choice = {
            let registry = self.registry.lock().unwrap();
            let elected = leader_for(proposal.height, proposal.round, &registry);
            if elected != Some(proposal.proposer_id) {
                anyhow::bail!(ConsensusFault::NotTheLeader {
                    got: proposal.proposer_id,
                    expected: elected,
                    height: proposal.height,
                    round: proposal.round,
                });
            }
            let proposer = registry
                .get(&proposal.proposer_id)
                .filter(|v| v.is_voting())
                .ok_or(ConsensusFault::UnknownVoter(proposal.proposer_id))?;
            verify_bytes(&proposer.pubkey, &signed.signature, &proposal_hash)
                .map_err(|_| ConsensusFault::BadSignature(proposal.proposer_id))?;

            let params = self.params.lock().unwrap();
            match self.validate_content(proposal, &inner, &params) {
                Ok(()) => VoteChoice::Accept,
                Err(err) => {
                    tracing::warn!(
                        height = proposal.height,
                        round = proposal.round,
                        %err,
                        "rejecting proposal"
                    );
                    VoteChoice::Reject
                }
            }
        };

        // Never vote for two different proposals at one (height, round).
        let key = (proposal.height, proposal.round);
        if let Some(prev) = inner.own_votes.get(&key) {
            if *prev != proposal_hash {
                anyhow::bail!(ConsensusFault::WouldEquivocate {
                    height: proposal.height,
                    round: proposal.round,
                });
            }
            return Ok(None);
        }
        inner.own_votes.insert(key, proposal_hash);
        inner.current_proposal = Some(signed.clone());
        inner.phase = Phase::Vote;

        let vote = sign_vote(
            proposal_hash,
            proposal.height,
            proposal.round,
            choice,
            self.local_id,
            &self.key,
        );
        Ok(Some(vote))
    }

    fn validate_content(
        &self,
        proposal: &BlockProposal,
        inner: &EngineInner,
        params: &GovernanceParams,
    ) -> anyhow::Result<()> {
        if proposal.prev_block_hash != inner.prev_block_hash {
            anyhow::bail!(
                "prev hash {} does not extend chain tip {}",
                hex::encode(proposal.prev_block_hash),
                hex::encode(inner.prev_block_hash)
            );
        }
        if proposal.bundles.len() > self.max_bundles_per_block {
            anyhow::bail!(
                "proposal carries {} bundles, cap is {}",
                proposal.bundles.len(),
                self.max_bundles_per_block
            );
        }
        let mut seen = Vec::new();
        for bundle in &proposal.bundles {
            let id = bundle.bundle_id();
            if seen.contains(&id) {
                anyhow::bail!("duplicate bundle {}", hex::encode(id));
            }
            seen.push(id);
            bundle.verify_signature()?;
            bundle.verify_scores(params)?;
        }
        Ok(())
    }

    /// Tally a vote. Returns the finalized block once Accept weight for the
    /// current proposal reaches quorum.
    pub fn handle_vote(&self, vote: &Vote) -> anyhow::Result<Option<FinalizedBlock>> {
        let mut inner = self.inner.lock().unwrap();
        if vote.height != inner.height || vote.round != inner.round {
            anyhow::bail!(ConsensusFault::StaleRound {
                got_height: vote.height,
                got_round: vote.round,
                height: inner.height,
                round: inner.round,
            });
        }
        let (voter_weight, quorum) = {
            let registry = self.registry.lock().unwrap();
            let voter = registry
                .get(&vote.voter_id)
                .filter(|v| v.is_voting())
                .ok_or(ConsensusFault::UnknownVoter(vote.voter_id))?;
            let msg = vote_signing_bytes(&vote.proposal_hash, vote.height, vote.round, vote.choice);
            verify_bytes(&voter.pubkey, &vote.signature, &msg)
                .map_err(|_| ConsensusFault::BadSignature(vote.voter_id))?;
            (voter.weight, registry.quorum_threshold())
        };

        if vote.choice != VoteChoice::Accept {
            return Ok(None);
        }
        let tally_key = (vote.proposal_hash, vote.height, vote.round);
        let tally = inner.tallies.entry(tally_key).or_default();
        if tally.voters.contains_key(&vote.voter_id) {
            return Ok(None);
        }
        tally.voters.insert(vote.voter_id, vote.signature.clone());
        tally.accept_weight += voter_weight;

        if tally.accept_weight < quorum {
            return Ok(None);
        }
        self.try_finalize(&mut inner, vote.proposal_hash, vote.height, vote.round)
    }

    fn try_finalize(
        &self,
        inner: &mut EngineInner,
        proposal_hash: Hash,
        height: u64,
        round: u64,
    ) -> anyhow::Result<Option<FinalizedBlock>> {
        let Some(signed) = inner.current_proposal.clone() else {
            // Quorum observed before the proposal arrived; nothing to append
            // until it does.
            return Ok(None);
        };
        if signed.proposal.hash() != proposal_hash {
            return Ok(None);
        }
        let tally = inner
            .tallies
            .get(&(proposal_hash, height, round))
            .ok_or_else(|| anyhow::anyhow!("missing tally for finalizing proposal"))?;

        let mut signers: Vec<(Uuid, Vec<u8>)> = tally
            .voters
            .iter()
            .map(|(id, sig)| (*id, sig.clone()))
            .collect();
        signers.sort_by_key(|(id, _)| *id);
        let proof = FinalityProof {
            proposal_hash,
            height,
            round,
            signers,
            total_weight: tally.accept_weight,
        };
        let block = FinalizedBlock {
            proposal: signed.proposal.clone(),
            proof,
        };

        let included: Vec<Hash> = block
            .proposal
            .bundles
            .iter()
            .map(|b| b.bundle_id())
            .collect();
        self.pool.remove(&included);

        inner.finalized.push(block.clone());
        inner.prev_block_hash = proposal_hash;
        inner.height += 1;
        inner.round = 0;
        inner.phase = Phase::Idle;
        inner.current_proposal = None;
        let min_height = inner.height;
        inner.tallies.retain(|(_, h, _), _| *h >= min_height);
        inner.own_votes.retain(|(h, _), _| *h >= min_height);
        inner.own_proposals.retain(|(h, _), _| *h >= min_height);
        tracing::info!(
            height = block.proposal.height,
            hash = %hex::encode(proposal_hash),
            weight = block.proof.total_weight,
            "finalized block"
        );
        Ok(Some(block))
    }

    /// Round timer expiry without quorum. Discards the stale round's state
    /// and elects a new leader at the next round number. Returns the new
    /// (height, round) if the view actually changed.
    pub fn on_round_timeout(&self, height: u64, round: u64) -> Option<(u64, u64)> {
        let mut inner = self.inner.lock().unwrap();
        if height != inner.height || round != inner.round {
            return None;
        }
        inner.round += 1;
        inner.phase = Phase::Propose;
        inner.current_proposal = None;
        let (h, r) = (inner.height, inner.round);
        inner
            .tallies
            .retain(|(_, th, tr), _| *th > h || (*th == h && *tr >= r));
        tracing::warn!(height = h, round = r, "view change");
        Some((h, r))
    }

    pub fn registry(&self) -> Arc<Mutex<ValidatorRegistry>> {
        self.registry.clone()
    }

    /// Apply a quorum-approved validator-set update. Slashing enforcement
    /// flows through here like any other registry mutation.
    pub fn apply_registry_update(&self, update: &RegistryUpdate) -> Result<u64, RegistryError> {
        let mut registry = self.registry.lock().unwrap();
        registry.apply_update(update)?;
        Ok(registry.version())
    }

    pub fn params(&self) -> GovernanceParams {
        *self.params.lock().unwrap()
    }

    /// Governance params arrive as versioned transactions; a replayed or
    /// out-of-date version is rejected rather than applied.
    pub fn update_params(&self, params: GovernanceParams) -> anyhow::Result<()> {
        let mut current = self.params.lock().unwrap();
        if params.version <= current.version {
            anyhow::bail!(
                "params version {} does not advance current version {}",
                params.version,
                current.version
            );
        }
        *current = params;
        tracing::info!(version = params.version, "governance params updated");
        Ok(())
    }

    // Chain store queries for the audit/explorer boundary.

    pub fn finalized_height(&self) -> u64 {
        self.inner.lock().unwrap().finalized.len() as u64
    }

    pub fn block_at_height(&self, height: u64) -> Option<FinalizedBlock> {
        let inner = self.inner.lock().unwrap();
        inner
            .finalized
            .iter()
            .find(|b| b.proposal.height == height)
            .cloned()
    }

    pub fn blocks_for_app(&self, app_id: Uuid, from_ms: u64, to_ms: u64) -> Vec<FinalizedBlock> {
        let inner = self.inner.lock().unwrap();
        inner
            .finalized
            .iter()
            .filter(|b| {
                b.proposal.timestamp_ms >= from_ms
                    && b.proposal.timestamp_ms <= to_ms
                    && b.proposal
                        .bundles
                        .iter()
                        .any(|bundle| bundle.app_id == app_id)
            })
            .cloned()
            .collect()
    }

    pub fn chain_tip(&self) -> Hash {
        self.inner.lock().unwrap().prev_block_hash
    }
}
