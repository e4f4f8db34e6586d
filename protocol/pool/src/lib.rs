use receipt::Hash;
use scoring::{Fixed, PoEBundle};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("bundle {0} already pooled")]
    Duplicate(String),
    #[error("bundle priority too low for a full pool")]
    PriorityTooLow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Pool was at capacity; the named bundle was evicted to make room.
    InsertedEvicting(Hash),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    /// Age at which the aging multiplier doubles. Priority grows without
    /// bound as a bundle waits, so nothing starves indefinitely.
    pub age_half_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            age_half_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    bundle: PoEBundle,
    inserted_at_ms: u64,
    seq: u64,
}

impl Entry {
    /// priority = policy_score × fee_rate × (1 + age / age_half).
    fn priority(&self, now_ms: u64, age_half_ms: u64) -> Fixed {
        let base = self
            .bundle
            .policy_score
            .checked_mul(self.bundle.fee_rate)
            .unwrap_or(Fixed(u128::MAX));
        let age_ms = now_ms.saturating_sub(self.inserted_at_ms);
        let aging = Fixed::ONE
            .checked_add(
                Fixed::from_int(age_ms)
                    .checked_div(Fixed::from_int(age_half_ms.max(1)))
                    .unwrap_or(Fixed::ZERO),
            )
            .unwrap_or(Fixed(u128::MAX));
        base.checked_mul(aging).unwrap_or(Fixed(u128::MAX))
    }
}

struct Inner {
    entries: HashMap<Hash, Entry>,
    next_seq: u64,
}

/// Priority queue of scored bundles awaiting consensus inclusion. Producers
/// (scorers) insert concurrently; the proposer reads a consistent snapshot.
/// Every operation runs under one lock, so a bundle is either fully visible
/// or not at all.
pub struct BundlePool {
    config: PoolConfig,
    inner: Mutex<Inner>,
}

impl BundlePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn insert(&self, bundle: PoEBundle, now_ms: u64) -> Result<InsertOutcome, PoolError> {
        let id = bundle.bundle_id();
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&id) {
            return Err(PoolError::Duplicate(hex::encode(id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let incoming = Entry {
            bundle,
            inserted_at_ms: now_ms,
            seq,
        };

        if inner.entries.len() < self.config.capacity {
            inner.entries.insert(id, incoming);
            return Ok(InsertOutcome::Inserted);
        }

        // Capacity pressure: the lowest-priority entry goes. Among equal
        // priorities the oldest insertion is the victim, so a tied cohort
        // turns over FIFO and fresh producers are never locked out.
        let age_half = self.config.age_half_ms;
        let incoming_rank = (incoming.priority(now_ms, age_half), seq);
        let victim = inner
            .entries
            .iter()
            .map(|(vid, e)| ((e.priority(now_ms, age_half), e.seq), *vid))
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(rank, vid)| (rank, vid));

        match victim {
            Some((rank, vid)) if rank < incoming_rank => {
                inner.entries.remove(&vid);
                inner.entries.insert(id, incoming);
                tracing::debug!(evicted = %hex::encode(vid), "evicted lowest-priority bundle");
                Ok(InsertOutcome::InsertedEvicting(vid))
            }
            _ => Err(PoolError::PriorityTooLow),
        }
    }

    /// Top-K bundles by current priority, oldest first among ties. Computed
    /// under the lock: a consistent snapshot for proposal construction.
    pub fn peek_top(&self, k: usize, now_ms: u64) -> Vec<PoEBundle> {
        let inner = self.inner.lock().unwrap();
        let age_half = self.config.age_half_ms;
        let mut ranked: Vec<(Fixed, u64, &Entry)> = inner
            .entries
            .values()
            .map(|e| (e.priority(now_ms, age_half), e.seq, e))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(k)
            .map(|(_, _, e)| e.bundle.clone())
            .collect()
    }

    /// Remove bundles included in a finalized block.
    pub fn remove(&self, ids: &[Hash]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.entries.len();
        for id in ids {
            inner.entries.remove(id);
        }
        before - inner.entries.len()
    }

    /// Drop bundles older than `max_age_ms`. Returns the evicted ids.
    pub fn expire(&self, now_ms: u64, max_age_ms: u64) -> Vec<Hash> {
        let mut inner = self.inner.lock().unwrap();
        let stale: Vec<Hash> = inner
            .entries
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.inserted_at_ms) > max_age_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            inner.entries.remove(id);
        }
        stale
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.inner.lock().unwrap().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
