use aggregate::{merkle_root, receipt_leaf, verify_log_block, Aggregator, AggregatorConfig};
use ed25519_dalek::SigningKey;
use receipt::{make_receipt, StepReceipt, UsageVector, GENESIS_PREV_HASH};
use uuid::Uuid;

const NOW: u64 = 1_700_000_000_000;

fn usage(cpu_ms: u64) -> UsageVector {
    UsageVector {
        cpu_ms,
        mem_mb_s: 10,
        storage_gb_day: 0,
        egress_mb: 1,
        receipt_count: 1,
    }
}

fn chain_of(key: &SigningKey, app_id: Uuid, n: usize) -> Vec<StepReceipt> {
    let mut prev = GENESIS_PREV_HASH;
    let mut out = Vec::new();
    for i in 0..n {
        let r = make_receipt(key, app_id, "task-0", "run", NOW + i as u64, usage(50), prev);
        prev = r.hash;
        out.push(r);
    }
    out
}

fn aggregator(max_receipts: usize, window_ms: u64) -> Aggregator {
    Aggregator::new(
        AggregatorConfig {
            max_receipts,
            window_ms,
        },
        SigningKey::from_bytes(&[42u8; 32]),
    )
}

#[test]
fn batch_closes_on_count_threshold() {
    let key = SigningKey::from_bytes(&[1u8; 32]);
    let app_id = Uuid::new_v4();
    let mut agg = aggregator(3, 60_000);
    let receipts = chain_of(&key, app_id, 3);

    assert!(agg.ingest(receipts[0].clone(), NOW).unwrap().is_none());
    assert!(agg.ingest(receipts[1].clone(), NOW).unwrap().is_none());
    let block = agg.ingest(receipts[2].clone(), NOW).unwrap().expect("closed");
    assert_eq!(block.height, 1);
    assert_eq!(block.receipt_count, 3);
    assert!(!block.incomplete);
    assert_eq!(block.usage_total.cpu_ms, 150);
    verify_log_block(&block, &receipts).unwrap();
}

#[test]
fn batch_closes_on_window_elapse() {
    let key = SigningKey::from_bytes(&[2u8; 32]);
    let app_id = Uuid::new_v4();
    let mut agg = aggregator(100, 10_000);
    let receipts = chain_of(&key, app_id, 2);
    for r in &receipts {
        assert!(agg.ingest(r.clone(), NOW).unwrap().is_none());
    }
    assert!(agg.tick(NOW + 5_000).unwrap().is_empty());
    let closed = agg.tick(NOW + 10_000).unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].receipt_count, 2);
    assert!(!closed[0].incomplete);
}

#[test]
fn heights_increase_strictly_per_chain() {
    let key = SigningKey::from_bytes(&[3u8; 32]);
    let app_id = Uuid::new_v4();
    let mut agg = aggregator(2, 60_000);
    let receipts = chain_of(&key, app_id, 6);
    let mut heights = Vec::new();
    for r in receipts {
        if let Some(block) = agg.ingest(r, NOW).unwrap() {
            heights.push(block.height);
        }
    }
    assert_eq!(heights, vec![1, 2, 3]);
}

#[test]
fn shutdown_flush_marks_partial_batches_incomplete() {
    let key = SigningKey::from_bytes(&[4u8; 32]);
    let app_id = Uuid::new_v4();
    let mut agg = aggregator(100, 60_000);
    for r in chain_of(&key, app_id, 3) {
        agg.ingest(r, NOW).unwrap();
    }
    let flushed = agg.flush_all(NOW + 1).unwrap();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].incomplete);
    assert_eq!(flushed[0].receipt_count, 3);
    assert_eq!(agg.open_batches(), 0);
}

#[test]
fn single_bit_mutation_breaks_merkle_equality() {
    let key = SigningKey::from_bytes(&[5u8; 32]);
    let app_id = Uuid::new_v4();
    let mut agg = aggregator(4, 60_000);
    let receipts = chain_of(&key, app_id, 4);
    let mut block = None;
    for r in &receipts {
        if let Some(b) = agg.ingest(r.clone(), NOW).unwrap() {
            block = Some(b);
        }
    }
    let block = block.expect("closed");
    verify_log_block(&block, &receipts).unwrap();

    let mut mutated = receipts.clone();
    mutated[2].usage.egress_mb ^= 1;
    assert!(verify_log_block(&block, &mutated).is_err());
}

#[test]
fn merkle_root_promotes_odd_leaf() {
    let key = SigningKey::from_bytes(&[6u8; 32]);
    let app_id = Uuid::new_v4();
    let receipts = chain_of(&key, app_id, 3);
    let leaves: Vec<_> = receipts.iter().map(receipt_leaf).collect();
    let root = merkle_root(&leaves);
    assert_ne!(root, [0u8; 32]);
    // Order matters: swapping two leaves changes the root.
    let swapped = vec![leaves[1], leaves[0], leaves[2]];
    assert_ne!(merkle_root(&swapped), root);
}
