use receipt::{sign_bytes, verify_bytes, Hash, StepReceipt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub const LOG_BLOCK_VERSION: u16 = 1;

/// Merkle root over leaves in the given order. Odd nodes are promoted, not
/// duplicated. The empty set folds to the zero hash, but an empty LogBlock
/// is never emitted.
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut layer: Vec<Hash> = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        for pair in layer.chunks(2) {
            if pair.len() == 2 {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&pair[0]);
                hasher.update(&pair[1]);
                next.push(*hasher.finalize().as_bytes());
            } else {
                next.push(pair[0]);
            }
        }
        layer = next;
    }
    layer[0]
}

pub fn receipt_leaf(r: &StepReceipt) -> Hash {
    *blake3::hash(&r.canonical_bytes()).as_bytes()
}

/// Merkle-aggregated, signed batch of StepReceipts for one causal chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBlock {
    pub version: u16,
    pub app_id: Uuid,
    pub chain_key: String,
    pub height: u64,
    pub merkle_root: Hash,
    pub receipt_hashes: Vec<Hash>,
    pub receipt_count: u32,
    pub usage_total: receipt::UsageVector,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub incomplete: bool,
    pub aggregator_key: Vec<u8>,
    pub aggregator_sig: Vec<u8>,
}

#[derive(Serialize)]
struct LogBlockPreimage<'a> {
    version: u16,
    app_id: &'a Uuid,
    chain_key: &'a str,
    height: u64,
    merkle_root: &'a Hash,
    receipt_hashes: &'a [Hash],
    receipt_count: u32,
    usage_total: &'a receipt::UsageVector,
    window_start_ms: u64,
    window_end_ms: u64,
    incomplete: bool,
    aggregator_key: &'a [u8],
}

impl LogBlock {
    pub fn signing_hash(&self) -> Hash {
        let preimage = LogBlockPreimage {
            version: self.version,
            app_id: &self.app_id,
            chain_key: &self.chain_key,
            height: self.height,
            merkle_root: &self.merkle_root,
            receipt_hashes: &self.receipt_hashes,
            receipt_count: self.receipt_count,
            usage_total: &self.usage_total,
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
            incomplete: self.incomplete,
            aggregator_key: &self.aggregator_key,
        };
        let bytes = bincode::serialize(&preimage).unwrap_or_default();
        *blake3::hash(&bytes).as_bytes()
    }

    pub fn verify_signature(&self) -> anyhow::Result<()> {
        verify_bytes(&self.aggregator_key, &self.aggregator_sig, &self.signing_hash())
    }
}

/// Recompute the Merkle root from the claimed receipt set and compare it to
/// the stored root. Any single-bit mutation of a receipt breaks this.
pub fn verify_log_block(block: &LogBlock, receipts: &[StepReceipt]) -> anyhow::Result<()> {
    block.verify_signature()?;
    if receipts.len() != block.receipt_count as usize {
        anyhow::bail!(
            "receipt count mismatch: block claims {}, got {}",
            block.receipt_count,
            receipts.len()
        );
    }
    let leaves: Vec<Hash> = receipts.iter().map(receipt_leaf).collect();
    if merkle_root(&leaves) != block.merkle_root {
        anyhow::bail!("merkle root mismatch");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub max_receipts: usize,
    pub window_ms: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_receipts: 256,
            window_ms: 10_000,
        }
    }
}

#[derive(Debug)]
struct OpenBatch {
    app_id: Uuid,
    receipts: Vec<StepReceipt>,
    opened_ms: u64,
}

/// Batches validated receipts per chain and closes a LogBlock when either
/// the count threshold or the time window triggers, whichever comes first.
/// Closed batches are never reopened; heights increase strictly per chain.
pub struct Aggregator {
    config: AggregatorConfig,
    key: ed25519_dalek::SigningKey,
    open: HashMap<String, OpenBatch>,
    heights: HashMap<String, u64>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, key: ed25519_dalek::SigningKey) -> Self {
        Self {
            config,
            key,
            open: HashMap::new(),
            heights: HashMap::new(),
        }
    }

    /// Accepts an already-validated receipt. Returns the closed LogBlock if
    /// this receipt filled the batch.
    pub fn ingest(&mut self, r: StepReceipt, now_ms: u64) -> anyhow::Result<Option<LogBlock>> {
        let chain_key = r.chain_key();
        let batch = self.open.entry(chain_key.clone()).or_insert_with(|| OpenBatch {
            app_id: r.app_id,
            receipts: Vec::new(),
            opened_ms: now_ms,
        });
        batch.receipts.push(r);
        if batch.receipts.len() >= self.config.max_receipts {
            let batch = self.open.remove(&chain_key).expect("batch present");
            let block = self.close(chain_key, batch, now_ms, false)?;
            return Ok(Some(block));
        }
        Ok(None)
    }

    /// Time sweep: closes every batch whose window has elapsed.
    pub fn tick(&mut self, now_ms: u64) -> anyhow::Result<Vec<LogBlock>> {
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, b)| now_ms.saturating_sub(b.opened_ms) >= self.config.window_ms)
            .map(|(k, _)| k.clone())
            .collect();
        let mut out = Vec::new();
        for chain_key in expired {
            let batch = self.open.remove(&chain_key).expect("batch present");
            out.push(self.close(chain_key, batch, now_ms, false)?);
        }
        Ok(out)
    }

    /// Shutdown flush. Partial batches go out marked incomplete rather than
    /// being dropped, so a gap after a crash is detectable instead of being
    /// misattributed to the next batch.
    pub fn flush_all(&mut self, now_ms: u64) -> anyhow::Result<Vec<LogBlock>> {
        let keys: Vec<String> = self.open.keys().cloned().collect();
        let mut out = Vec::new();
        for chain_key in keys {
            let batch = self.open.remove(&chain_key).expect("batch present");
            out.push(self.close(chain_key, batch, now_ms, true)?);
        }
        Ok(out)
    }

    pub fn open_batches(&self) -> usize {
        self.open.len()
    }

    pub fn height(&self, chain_key: &str) -> u64 {
        self.heights.get(chain_key).copied().unwrap_or(0)
    }

    fn close(
        &mut self,
        chain_key: String,
        batch: OpenBatch,
        now_ms: u64,
        incomplete: bool,
    ) -> anyhow::Result<LogBlock> {
        if batch.receipts.is_empty() {
            anyhow::bail!("refusing to close an empty batch for {}", chain_key);
        }
        let mut usage_total = receipt::UsageVector::default();
        for r in &batch.receipts {
            usage_total = usage_total.checked_add(&r.usage)?;
        }
        let leaves: Vec<Hash> = batch.receipts.iter().map(receipt_leaf).collect();
        let height = self.heights.entry(chain_key.clone()).or_insert(0);
        *height += 1;

        let mut block = LogBlock {
            version: LOG_BLOCK_VERSION,
            app_id: batch.app_id,
            chain_key: chain_key.clone(),
            height: *height,
            merkle_root: merkle_root(&leaves),
            receipt_hashes: batch.receipts.iter().map(|r| r.hash).collect(),
            receipt_count: batch.receipts.len() as u32,
            usage_total,
            window_start_ms: batch.opened_ms,
            window_end_ms: now_ms,
            incomplete,
            aggregator_key: self.key.verifying_key().to_bytes().to_vec(),
            aggregator_sig: vec![],
        };
        block.aggregator_sig = sign_bytes(&self.key, &block.signing_hash());
        tracing::debug!(
            chain = %chain_key,
            height = block.height,
            receipts = block.receipt_count,
            incomplete,
            "closed log block"
        );
        Ok(block)
    }
}
