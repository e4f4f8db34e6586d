use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

pub type Hash = [u8; 32];

pub const GENESIS_PREV_HASH: Hash = [0u8; 32];
pub const RECEIPT_VERSION: u16 = 1;

/// Hard per-receipt ceilings on each usage dimension. A single receipt
/// covers one execution event, so anything above these is garbage input,
/// not legitimate load.
pub const MAX_CPU_MS: u64 = 86_400_000;
pub const MAX_MEM_MB_S: u64 = 1_000_000_000;
pub const MAX_STORAGE_GB_DAY: u64 = 1_000_000;
pub const MAX_EGRESS_MB: u64 = 10_000_000;
pub const MAX_RECEIPT_COUNT: u64 = 1_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageVector {
    pub cpu_ms: u64,
    pub mem_mb_s: u64,
    pub storage_gb_day: u64,
    pub egress_mb: u64,
    pub receipt_count: u64,
}

impl UsageVector {
    pub fn checked_add(&self, other: &UsageVector) -> anyhow::Result<UsageVector> {
        Ok(UsageVector {
            cpu_ms: self
                .cpu_ms
                .checked_add(other.cpu_ms)
                .ok_or_else(|| anyhow::anyhow!("cpu_ms overflow"))?,
            mem_mb_s: self
                .mem_mb_s
                .checked_add(other.mem_mb_s)
                .ok_or_else(|| anyhow::anyhow!("mem_mb_s overflow"))?,
            storage_gb_day: self
                .storage_gb_day
                .checked_add(other.storage_gb_day)
                .ok_or_else(|| anyhow::anyhow!("storage_gb_day overflow"))?,
            egress_mb: self
                .egress_mb
                .checked_add(other.egress_mb)
                .ok_or_else(|| anyhow::anyhow!("egress_mb overflow"))?,
            receipt_count: self
                .receipt_count
                .checked_add(other.receipt_count)
                .ok_or_else(|| anyhow::anyhow!("receipt_count overflow"))?,
        })
    }
}

/// One signed execution event, chained to its predecessor by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReceipt {
    pub version: u16,
    pub app_id: Uuid,
    pub task_id: String,
    pub op: String,
    pub timestamp_ms: u64,
    pub usage: UsageVector,
    pub prev_hash: Hash,
    pub hash: Hash,
    pub signer: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Canonical pre-image of a receipt: every field except `hash` and
/// `signature`, in declaration order. Hashes and signatures are computed
/// over this encoding, never over JSON.
#[derive(Serialize)]
struct ReceiptPreimage<'a> {
    version: u16,
    app_id: &'a Uuid,
    task_id: &'a str,
    op: &'a str,
    timestamp_ms: u64,
    usage: &'a UsageVector,
    prev_hash: &'a Hash,
    signer: &'a [u8],
}

impl StepReceipt {
    pub fn compute_hash(&self) -> Hash {
        let preimage = ReceiptPreimage {
            version: self.version,
            app_id: &self.app_id,
            task_id: &self.task_id,
            op: &self.op,
            timestamp_ms: self.timestamp_ms,
            usage: &self.usage,
            prev_hash: &self.prev_hash,
            signer: &self.signer,
        };
        let bytes = bincode::serialize(&preimage).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    /// Canonical byte encoding of the full receipt, used as a Merkle leaf.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// The key of the causal chain this receipt belongs to.
    pub fn chain_key(&self) -> String {
        format!("{}/{}", self.app_id, self.task_id)
    }
}

pub fn sign_bytes(key: &ed25519_dalek::SigningKey, msg: &[u8]) -> Vec<u8> {
    use ed25519_dalek::Signer;
    key.sign(msg).to_bytes().to_vec()
}

pub fn verify_bytes(pubkey: &[u8], signature: &[u8], msg: &[u8]) -> anyhow::Result<()> {
    use ed25519_dalek::Verifier;
    let key_bytes: [u8; 32] = pubkey
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)?;
    let sig = ed25519_dalek::Signature::from_slice(signature)?;
    key.verify(msg, &sig)?;
    Ok(())
}

/// Build and sign a receipt chained onto `prev_hash`.
pub fn make_receipt(
    key: &ed25519_dalek::SigningKey,
    app_id: Uuid,
    task_id: &str,
    op: &str,
    timestamp_ms: u64,
    usage: UsageVector,
    prev_hash: Hash,
) -> StepReceipt {
    let mut receipt = StepReceipt {
        version: RECEIPT_VERSION,
        app_id,
        task_id: task_id.to_string(),
        op: op.to_string(),
        timestamp_ms,
        usage,
        prev_hash,
        hash: [0u8; 32],
        signer: key.verifying_key().to_bytes().to_vec(),
        signature: vec![],
    };
    receipt.hash = receipt.compute_hash();
    receipt.signature = sign_bytes(key, &receipt.hash);
    receipt
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("signature invalid")]
    BadSignature,
    #[error("self-hash does not match content")]
    HashMismatch,
    #[error("chain discontinuity: expected prev {expected}, got {got}")]
    ChainDiscontinuity { expected: String, got: String },
    #[error("chain halted pending operator resync")]
    ChainHalted,
    #[error("malformed usage vector: {0}")]
    MalformedUsage(String),
    #[error("timestamp {timestamp_ms} outside skew window ({max_skew_ms}ms around {now_ms})")]
    TimestampSkew {
        timestamp_ms: u64,
        now_ms: u64,
        max_skew_ms: u64,
    },
    #[error("unsupported receipt version {0}")]
    UnsupportedVersion(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChainStatus {
    Live,
    Halted,
}

/// One rejection, kept for the audit trail. Rejections are never silently
/// dropped; auditors can replay why a receipt was refused.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub chain_key: String,
    pub receipt_hash: String,
    pub reason: RejectReason,
    pub at_ms: u64,
}

#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, entry: AuditEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Validates receipts against signature, self-hash, usage ceilings, clock
/// skew, and per-chain hash linkage. State per chain is a single tip hash,
/// so distinct chains validate independently.
pub struct ReceiptValidator {
    tips: HashMap<String, Hash>,
    halted: HashMap<String, RejectReason>,
    audit: AuditLog,
    max_skew_ms: u64,
}

impl ReceiptValidator {
    pub fn new(max_skew_ms: u64, audit_capacity: usize) -> Self {
        Self {
            tips: HashMap::new(),
            halted: HashMap::new(),
            audit: AuditLog::new(audit_capacity),
            max_skew_ms,
        }
    }

    pub fn validate(&mut self, receipt: &StepReceipt, now_ms: u64) -> Verdict {
        let chain_key = receipt.chain_key();
        if let Some(reason) = self.check(receipt, &chain_key, now_ms) {
            if matches!(reason, RejectReason::ChainDiscontinuity { .. }) {
                tracing::warn!(chain = %chain_key, "chain discontinuity, halting chain");
                self.halted.insert(chain_key.clone(), reason.clone());
            }
            self.audit.record(AuditEntry {
                chain_key,
                receipt_hash: hex::encode(receipt.hash),
                reason: reason.clone(),
                at_ms: now_ms,
            });
            return Verdict::Rejected(reason);
        }
        self.tips.insert(chain_key, receipt.hash);
        Verdict::Accepted
    }

    fn check(&self, receipt: &StepReceipt, chain_key: &str, now_ms: u64) -> Option<RejectReason> {
        if self.halted.contains_key(chain_key) {
            return Some(RejectReason::ChainHalted);
        }
        if receipt.version != RECEIPT_VERSION {
            return Some(RejectReason::UnsupportedVersion(receipt.version));
        }
        if let Some(problem) = malformed_usage(&receipt.usage) {
            return Some(RejectReason::MalformedUsage(problem));
        }
        let skew = receipt.timestamp_ms.abs_diff(now_ms);
        if skew > self.max_skew_ms {
            return Some(RejectReason::TimestampSkew {
                timestamp_ms: receipt.timestamp_ms,
                now_ms,
                max_skew_ms: self.max_skew_ms,
            });
        }
        if receipt.compute_hash() != receipt.hash {
            return Some(RejectReason::HashMismatch);
        }
        if verify_bytes(&receipt.signer, &receipt.signature, &receipt.hash).is_err() {
            return Some(RejectReason::BadSignature);
        }
        let expected = self.tips.get(chain_key).copied().unwrap_or(GENESIS_PREV_HASH);
        if receipt.prev_hash != expected {
            return Some(RejectReason::ChainDiscontinuity {
                expected: hex::encode(expected),
                got: hex::encode(receipt.prev_hash),
            });
        }
        None
    }

    pub fn chain_status(&self, chain_key: &str) -> ChainStatus {
        if self.halted.contains_key(chain_key) {
            ChainStatus::Halted
        } else {
            ChainStatus::Live
        }
    }

    pub fn halted_chains(&self) -> Vec<String> {
        self.halted.keys().cloned().collect()
    }

    /// Operator-triggered recovery of a halted chain. Sets the tip that the
    /// next receipt must chain onto and clears the halt.
    pub fn resync(&mut self, chain_key: &str, new_tip: Hash) -> anyhow::Result<()> {
        if self.halted.remove(chain_key).is_none() {
            anyhow::bail!("chain {} is not halted", chain_key);
        }
        self.tips.insert(chain_key.to_string(), new_tip);
        tracing::info!(chain = %chain_key, tip = %hex::encode(new_tip), "chain resynced");
        Ok(())
    }

    pub fn tip(&self, chain_key: &str) -> Option<Hash> {
        self.tips.get(chain_key).copied()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.entries()
    }
}

fn malformed_usage(usage: &UsageVector) -> Option<String> {
    if usage.receipt_count == 0 {
        return Some("receipt_count must be nonzero".into());
    }
    if usage.cpu_ms > MAX_CPU_MS {
        return Some(format!("cpu_ms {} above ceiling", usage.cpu_ms));
    }
    if usage.mem_mb_s > MAX_MEM_MB_S {
        return Some(format!("mem_mb_s {} above ceiling", usage.mem_mb_s));
    }
    if usage.storage_gb_day > MAX_STORAGE_GB_DAY {
        return Some(format!("storage_gb_day {} above ceiling", usage.storage_gb_day));
    }
    if usage.egress_mb > MAX_EGRESS_MB {
        return Some(format!("egress_mb {} above ceiling", usage.egress_mb));
    }
    if usage.receipt_count > MAX_RECEIPT_COUNT {
        return Some(format!("receipt_count {} above ceiling", usage.receipt_count));
    }
    None
}
