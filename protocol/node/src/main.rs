use aggregate::{Aggregator, AggregatorConfig, LogBlock};
use axum::{
    extract::{Path, Query},
    routing::{get, post},
    Json, Router,
};
use consensus::{
    QuorumEngine, RegistryUpdate, SignedProposal, Validator, ValidatorRegistry, ValidatorStatus,
    Vote,
};
use ed25519_dalek::SigningKey;
use evidence::{Evidence, MisbehaviorDetector};
use pool::{BundlePool, PoolConfig};
use receipt::{ReceiptValidator, StepReceipt, Verdict};
use scoring::{Fixed, GovernanceParams, PoEBundle, Scorer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use uuid::Uuid;

const RECEIPT_QUEUE_DEPTH: usize = 10_000;
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum ConsensusMessage {
    Propose(SignedProposal),
    Vote(Vote),
    Timeout { height: u64, round: u64 },
}

trait ConsensusBus: Send + Sync {
    fn broadcast(&self, msg: ConsensusMessage);
}

#[derive(Clone)]
struct LocalBus {
    tx: broadcast::Sender<ConsensusMessage>,
}

impl LocalBus {
    fn new(capacity: usize) -> (Self, broadcast::Receiver<ConsensusMessage>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsensusMessage> {
        self.tx.subscribe()
    }
}

impl ConsensusBus for LocalBus {
    fn broadcast(&self, msg: ConsensusMessage) {
        let _ = self.tx.send(msg);
    }
}

/// Single-node operation: consensus messages have nowhere to go, so the node
/// finalizes only through its own proposer/vote path.
#[derive(Default)]
struct NoopBus;

impl ConsensusBus for NoopBus {
    fn broadcast(&self, _msg: ConsensusMessage) {}
}

#[derive(Clone)]
struct Node {
    id: String,
    engine: Arc<QuorumEngine>,
    pool: Arc<BundlePool>,
    validator: Arc<Mutex<ReceiptValidator>>,
    aggregator: Arc<Mutex<Aggregator>>,
    scorer: Arc<Scorer>,
    detector: Arc<MisbehaviorDetector>,
    bus: Arc<dyn ConsensusBus + Send + Sync>,
    receipts_tx: mpsc::Sender<StepReceipt>,
    /// Closed LogBlocks per app, waiting for the next scoring pass.
    pending_blocks: Arc<Mutex<HashMap<Uuid, Vec<LogBlock>>>>,
    /// Every bundle this node has scored, for the settlement collaborator.
    bundle_events: Arc<Mutex<Vec<PoEBundle>>>,
    config: Arc<GenesisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenesisValidator {
    pubkey: String,
    weight: u128,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenesisConfig {
    chain_id: String,
    validators: Vec<GenesisValidator>,
    params: GovernanceParams,
    max_skew_ms: u64,
    audit_capacity: usize,
    batch_max_receipts: usize,
    batch_window_ms: u64,
    pool_capacity: usize,
    pool_age_half_ms: u64,
    pool_max_age_ms: u64,
    max_bundles_per_block: usize,
    block_time_ms: u64,
    round_timeout_ms: u64,
    fee_rate: Fixed,
    policy_score: Fixed,
}

impl GenesisConfig {
    fn devnet(node_id: &str) -> Self {
        let key = derive_signing_key(node_id);
        Self {
            chain_id: "proved-devnet".into(),
            validators: vec![GenesisValidator {
                pubkey: hex::encode(key.verifying_key().to_bytes()),
                weight: 1_000,
            }],
            params: GovernanceParams::devnet_defaults(),
            max_skew_ms: 300_000,
            audit_capacity: 4_096,
            batch_max_receipts: 256,
            batch_window_ms: 5_000,
            pool_capacity: 1_024,
            pool_age_half_ms: 30_000,
            pool_max_age_ms: 600_000,
            max_bundles_per_block: 32,
            block_time_ms: 1_000,
            round_timeout_ms: 5_000,
            fee_rate: Fixed::ONE,
            policy_score: Fixed::ONE,
        }
    }

    fn registry(&self) -> anyhow::Result<ValidatorRegistry> {
        let mut validators = Vec::new();
        for gv in &self.validators {
            let pubkey = hex::decode(&gv.pubkey)?;
            validators.push(Validator {
                id: validator_id(&pubkey),
                pubkey,
                weight: gv.weight,
                status: ValidatorStatus::Active,
            });
        }
        anyhow::ensure!(!validators.is_empty(), "genesis has no validators");
        Ok(ValidatorRegistry::genesis(validators))
    }
}

fn load_genesis_from_file(path: &str) -> anyhow::Result<GenesisConfig> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Validator ids are derived from the public key, so every node computes the
/// same id for the same key without coordination.
fn validator_id(pubkey: &[u8]) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, pubkey)
}

fn derive_signing_key(node_id: &str) -> SigningKey {
    let digest = blake3::hash(node_id.as_bytes());
    SigningKey::from_bytes(digest.as_bytes())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn create_node(
    node_id: &str,
    config: GenesisConfig,
    bus: Arc<dyn ConsensusBus + Send + Sync>,
    receipts_tx: mpsc::Sender<StepReceipt>,
) -> anyhow::Result<Node> {
    let signing_key = derive_signing_key(node_id);
    let local_id = validator_id(&signing_key.verifying_key().to_bytes());
    let registry = config.registry()?;
    if registry.get(&local_id).is_none() {
        warn!(node = node_id, "local key is not in the genesis validator set");
    }

    let pool = Arc::new(BundlePool::new(PoolConfig {
        capacity: config.pool_capacity,
        age_half_ms: config.pool_age_half_ms,
    }));
    let engine = Arc::new(QuorumEngine::new(
        local_id,
        signing_key.clone(),
        Arc::new(Mutex::new(registry)),
        Arc::new(Mutex::new(config.params)),
        pool.clone(),
        config.max_bundles_per_block,
    ));
    let aggregator = Aggregator::new(
        AggregatorConfig {
            max_receipts: config.batch_max_receipts,
            window_ms: config.batch_window_ms,
        },
        signing_key.clone(),
    );

    Ok(Node {
        id: node_id.to_string(),
        engine,
        pool,
        validator: Arc::new(Mutex::new(ReceiptValidator::new(
            config.max_skew_ms,
            config.audit_capacity,
        ))),
        aggregator: Arc::new(Mutex::new(aggregator)),
        scorer: Arc::new(Scorer::new(signing_key)),
        detector: Arc::new(MisbehaviorDetector::new()),
        bus,
        receipts_tx,
        pending_blocks: Arc::new(Mutex::new(HashMap::new())),
        bundle_events: Arc::new(Mutex::new(Vec::new())),
        config: Arc::new(config),
    })
}

#[derive(Serialize)]
struct Status {
    node: String,
    chain_id: String,
    height: u64,
    round: u64,
    finalized_height: u64,
    chain_tip: String,
    pool_len: usize,
    halted_chains: Vec<String>,
    registry_version: u64,
    evidence_count: usize,
}

#[derive(Deserialize)]
struct BlocksQuery {
    app_id: Uuid,
    from_ms: u64,
    to_ms: u64,
}

#[derive(Deserialize)]
struct ResyncRequest {
    new_tip: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-0".into());
    info!("proved node starting ({})", node_id);

    let config = if let Ok(path) = env::var("GENESIS_PATH") {
        info!("loading genesis from {}", path);
        load_genesis_from_file(&path)?
    } else {
        GenesisConfig::devnet(&node_id)
    };

    let (bus, bus_rx) = LocalBus::new(BUS_CAPACITY);
    let (receipts_tx, receipts_rx) = mpsc::channel(RECEIPT_QUEUE_DEPTH);
    let node = create_node(&node_id, config, Arc::new(bus), receipts_tx)?;

    spawn_receipt_intake(node.clone(), receipts_rx);
    spawn_window_ticker(node.clone());
    spawn_bus_listener(node.clone(), bus_rx);
    spawn_view_watchdog(node.clone());
    let proposer = spawn_proposer(node.clone());

    let app = router(node.clone());
    let listen = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8645".into());
    let addr: SocketAddr = listen.parse()?;
    info!("API listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app.into_make_service());

    tokio::select! {
        _ = proposer => {}
        res = server => {
            if let Err(err) = res {
                warn!("server error: {err}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    flush_and_score(&node, now_millis());
    Ok(())
}

/// Shutdown path: close every open batch with the incomplete marker and
/// score what came out, so a restart sees a gap instead of misattributed
/// receipts.
fn flush_and_score(node: &Node, now_ms: u64) {
    match node.aggregator.lock().unwrap().flush_all(now_ms) {
        Ok(blocks) => {
            for block in blocks {
                stash_block(node, block);
            }
        }
        Err(err) => warn!("shutdown flush failed: {err}"),
    }
    run_scoring_pass(node, now_ms);
}

fn router(node: Node) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(
            "/status",
            get({
                let node = node.clone();
                move || {
                    let node = node.clone();
                    async move { Json(status_of(&node)) }
                }
            }),
        )
        .route(
            "/receipts",
            post({
                let node = node.clone();
                move |Json(receipt): Json<StepReceipt>| {
                    let node = node.clone();
                    async move {
                        match node.receipts_tx.send(receipt).await {
                            Ok(()) => Json("accepted"),
                            Err(_) => Json("intake queue closed"),
                        }
                    }
                }
            }),
        )
        .route(
            "/block/:height",
            get({
                let node = node.clone();
                move |Path(height): Path<u64>| {
                    let node = node.clone();
                    async move { Json(node.engine.block_at_height(height)) }
                }
            }),
        )
        .route(
            "/blocks",
            get({
                let node = node.clone();
                move |Query(q): Query<BlocksQuery>| {
                    let node = node.clone();
                    async move { Json(node.engine.blocks_for_app(q.app_id, q.from_ms, q.to_ms)) }
                }
            }),
        )
        .route(
            "/bundles/events",
            get({
                let node = node.clone();
                move || {
                    let node = node.clone();
                    async move { Json(node.bundle_events.lock().unwrap().clone()) }
                }
            }),
        )
        .route(
            "/evidence",
            get({
                let node = node.clone();
                move || {
                    let node = node.clone();
                    async move { Json(node.detector.evidence()) }
                }
            }),
        )
        .route(
            "/audit",
            get({
                let node = node.clone();
                move || {
                    let node = node.clone();
                    async move { Json(node.validator.lock().unwrap().audit_entries()) }
                }
            }),
        )
        .route(
            "/governance/params",
            post({
                let node = node.clone();
                move |Json(params): Json<GovernanceParams>| {
                    let node = node.clone();
                    async move {
                        // Re-run construction so an out-of-band params update
                        // passes the same validation as genesis.
                        match GovernanceParams::new(
                            params.version,
                            params.weights,
                            params.scales,
                            params.emission_scalar,
                            params.adoption_factor,
                        ) {
                            Ok(valid) => match node.engine.update_params(valid) {
                                Ok(()) => Json("ok".to_string()),
                                Err(err) => Json(err.to_string()),
                            },
                            Err(err) => Json(err.to_string()),
                        }
                    }
                }
            }),
        )
        .route(
            "/governance/validators",
            post({
                let node = node.clone();
                move |Json(update): Json<RegistryUpdate>| {
                    let node = node.clone();
                    async move {
                        match node.engine.apply_registry_update(&update) {
                            Ok(version) => Json(format!("registry at v{version}")),
                            Err(err) => Json(err.to_string()),
                        }
                    }
                }
            }),
        )
        .route(
            "/chains/:app_id/:task_id/resync",
            post({
                let node = node.clone();
                move |Path((app_id, task_id)): Path<(Uuid, String)>,
                      Json(req): Json<ResyncRequest>| {
                    let node = node.clone();
                    async move {
                        let chain_key = format!("{app_id}/{task_id}");
                        let Ok(bytes) = hex::decode(&req.new_tip) else {
                            return Json("new_tip is not hex".to_string());
                        };
                        let Ok(tip) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                            return Json("new_tip must be 32 bytes".to_string());
                        };
                        match node.validator.lock().unwrap().resync(&chain_key, tip) {
                            Ok(()) => Json("resynced".to_string()),
                            Err(err) => Json(err.to_string()),
                        }
                    }
                }
            }),
        )
}

fn status_of(node: &Node) -> Status {
    let engine = node.engine.status();
    Status {
        node: node.id.clone(),
        chain_id: node.config.chain_id.clone(),
        height: engine.height,
        round: engine.round,
        finalized_height: engine.finalized_height,
        chain_tip: hex::encode(node.engine.chain_tip()),
        pool_len: node.pool.len(),
        halted_chains: node.validator.lock().unwrap().halted_chains(),
        registry_version: engine.registry_version,
        evidence_count: node.detector.len(),
    }
}

/// Intake worker: validate each receipt and feed survivors to the
/// aggregator. Count-triggered batch closes land in the per-app pending set.
fn spawn_receipt_intake(node: Node, mut rx: mpsc::Receiver<StepReceipt>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(receipt) = rx.recv().await {
            ingest_receipt(&node, receipt, now_millis());
        }
    })
}

fn ingest_receipt(node: &Node, receipt: StepReceipt, now_ms: u64) {
    let verdict = node.validator.lock().unwrap().validate(&receipt, now_ms);
    match verdict {
        Verdict::Accepted => {}
        Verdict::Rejected(reason) => {
            tracing::debug!(chain = %receipt.chain_key(), %reason, "receipt rejected");
            return;
        }
    }
    let closed = node.aggregator.lock().unwrap().ingest(receipt, now_ms);
    match closed {
        Ok(Some(block)) => stash_block(node, block),
        Ok(None) => {}
        Err(err) => warn!("aggregation failed: {err}"),
    }
}

fn stash_block(node: &Node, block: LogBlock) {
    node.pending_blocks
        .lock()
        .unwrap()
        .entry(block.app_id)
        .or_default()
        .push(block);
}

/// Billing-window ticker: close elapsed batches, then score everything
/// pending into signed bundles and pool them for consensus.
fn spawn_window_ticker(node: Node) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(node.config.batch_window_ms));
        loop {
            interval.tick().await;
            run_scoring_pass(&node, now_millis());
        }
    })
}

fn run_scoring_pass(node: &Node, now_ms: u64) {
    match node.aggregator.lock().unwrap().tick(now_ms) {
        Ok(blocks) => {
            for block in blocks {
                stash_block(node, block);
            }
        }
        Err(err) => warn!("window close failed: {err}"),
    }

    let drained: Vec<(Uuid, Vec<LogBlock>)> =
        node.pending_blocks.lock().unwrap().drain().collect();
    let params = node.engine.params();
    for (app_id, blocks) in drained {
        match node.scorer.score(
            &blocks,
            &params,
            node.config.fee_rate,
            node.config.policy_score,
        ) {
            Ok(bundle) => {
                node.bundle_events.lock().unwrap().push(bundle.clone());
                match node.pool.insert(bundle, now_ms) {
                    Ok(outcome) => {
                        tracing::debug!(app = %app_id, ?outcome, "bundle pooled");
                    }
                    Err(err) => warn!(app = %app_id, %err, "bundle not pooled"),
                }
            }
            Err(err) => warn!(app = %app_id, %err, "scoring failed"),
        }
    }

    let expired = node.pool.expire(now_ms, node.config.pool_max_age_ms);
    if !expired.is_empty() {
        warn!(count = expired.len(), "expired stale bundles");
    }
    node.detector.prune_below(node.engine.current_round().0);
}

fn spawn_bus_listener(node: Node, mut rx: broadcast::Receiver<ConsensusMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => handle_message(&node, msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "consensus bus lagged, catching up");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn handle_message(node: &Node, msg: ConsensusMessage) {
    match msg {
        ConsensusMessage::Propose(signed) => {
            inspect(node, |detector, registry| {
                detector.observe_proposal(&signed, registry)
            });
            match node.engine.handle_proposal(&signed) {
                Ok(Some(vote)) => {
                    node.bus.broadcast(ConsensusMessage::Vote(vote.clone()));
                    deliver_vote(node, &vote);
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(%err, "proposal not handled"),
            }
        }
        ConsensusMessage::Vote(vote) => deliver_vote(node, &vote),
        ConsensusMessage::Timeout { height, round } => {
            if let Some((h, r)) = node.engine.on_round_timeout(height, round) {
                info!(height = h, round = r, "followed view change");
            }
        }
    }
}

fn deliver_vote(node: &Node, vote: &Vote) {
    inspect(node, |detector, registry| {
        detector.observe_vote(vote, registry)
    });
    match node.engine.handle_vote(vote) {
        Ok(Some(block)) => {
            info!(
                height = block.proposal.height,
                hash = %hex::encode(block.hash()),
                bundles = block.proposal.bundles.len(),
                "block finalized"
            );
        }
        Ok(None) => {}
        Err(err) => tracing::debug!(%err, "vote not tallied"),
    }
}

fn inspect<F>(node: &Node, observe: F)
where
    F: FnOnce(&MisbehaviorDetector, &ValidatorRegistry) -> Option<Evidence>,
{
    let registry = node.engine.registry().lock().unwrap().clone();
    if let Some(ev) = observe(&node.detector, &registry) {
        warn!(accused = %ev.accused, kind = ?ev.kind, "misbehavior observed");
    }
}

fn spawn_proposer(node: Node) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(node.config.block_time_ms));
        loop {
            interval.tick().await;
            if !node.engine.is_local_leader() {
                continue;
            }
            match node.engine.build_proposal(now_millis()) {
                Ok(signed) => {
                    node.bus
                        .broadcast(ConsensusMessage::Propose(signed.clone()));
                    handle_message(&node, ConsensusMessage::Propose(signed));
                }
                Err(err) => tracing::debug!(%err, "no proposal this tick"),
            }
        }
    })
}

/// Fires a view change when a round makes no progress for a full timeout.
fn spawn_view_watchdog(node: Node) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(node.config.round_timeout_ms));
        interval.tick().await;
        let mut last = node.engine.current_round();
        loop {
            interval.tick().await;
            let current = node.engine.current_round();
            if current == last && node.engine.on_round_timeout(current.0, current.1).is_some() {
                node.bus.broadcast(ConsensusMessage::Timeout {
                    height: current.0,
                    round: current.1,
                });
            }
            last = node.engine.current_round();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use receipt::{make_receipt, UsageVector, GENESIS_PREV_HASH};

    fn devnet_for(node_ids: &[&str]) -> GenesisConfig {
        let mut config = GenesisConfig::devnet(node_ids[0]);
        config.validators = node_ids
            .iter()
            .map(|id| GenesisValidator {
                pubkey: hex::encode(derive_signing_key(id).verifying_key().to_bytes()),
                weight: 1_000,
            })
            .collect();
        config.block_time_ms = 100;
        config.round_timeout_ms = 1_000;
        config.batch_window_ms = 200;
        config.batch_max_receipts = 4;
        config
    }

    fn submit_chain(node: &Node, app_id: Uuid, count: u64) {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut prev = GENESIS_PREV_HASH;
        for i in 0..count {
            let usage = UsageVector {
                cpu_ms: 1000,
                mem_mb_s: 1000,
                storage_gb_day: 1,
                egress_mb: 10,
                receipt_count: 100,
            };
            let receipt = make_receipt(
                &key,
                app_id,
                "task-0",
                "step",
                now_millis() + i,
                usage,
                prev,
            );
            prev = receipt.hash;
            ingest_receipt(node, receipt, now_millis());
        }
    }

    #[tokio::test]
    async fn receipts_flow_to_a_finalized_block() -> anyhow::Result<()> {
        let ids = ["node-a", "node-b", "node-c"];
        let config = devnet_for(&ids);

        let (bus, _seed_rx) = LocalBus::new(BUS_CAPACITY);
        let bus = Arc::new(bus);
        let mut nodes = Vec::new();
        let mut tasks = Vec::new();
        for id in &ids {
            let (tx, rx) = mpsc::channel(RECEIPT_QUEUE_DEPTH);
            let node = create_node(id, config.clone(), bus.clone(), tx)?;
            let bus_rx = bus.subscribe();
            tasks.push(spawn_receipt_intake(node.clone(), rx));
            tasks.push(spawn_bus_listener(node.clone(), bus_rx));
            tasks.push(spawn_window_ticker(node.clone()));
            tasks.push(spawn_view_watchdog(node.clone()));
            tasks.push(spawn_proposer(node.clone()));
            nodes.push(node);
        }

        let app_id = Uuid::from_u128(42);
        submit_chain(&nodes[0], app_id, 8);

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        for task in &tasks {
            task.abort();
        }

        // Scoring ran on the node that saw the receipts.
        assert!(!nodes[0].bundle_events.lock().unwrap().is_empty());

        // Every node finalized, and they agree on block 1.
        for node in &nodes {
            assert!(node.engine.finalized_height() >= 1, "no finality on {}", node.id);
        }
        let first: Vec<String> = nodes
            .iter()
            .map(|n| hex::encode(n.engine.block_at_height(1).expect("block 1").hash()))
            .collect();
        assert!(first.windows(2).all(|w| w[0] == w[1]), "diverged: {first:?}");
        Ok(())
    }

    #[tokio::test]
    async fn single_node_devnet_finalizes_alone() -> anyhow::Result<()> {
        let mut config = GenesisConfig::devnet("solo");
        config.block_time_ms = 100;
        let (tx, rx) = mpsc::channel(RECEIPT_QUEUE_DEPTH);
        let node = create_node("solo", config, Arc::new(NoopBus), tx)?;
        let intake = spawn_receipt_intake(node.clone(), rx);
        let proposer = spawn_proposer(node.clone());

        tokio::time::sleep(Duration::from_millis(800)).await;
        proposer.abort();
        intake.abort();

        assert!(node.engine.finalized_height() >= 1);
        Ok(())
    }

    #[tokio::test]
    async fn bus_listener_survives_a_message_burst() -> anyhow::Result<()> {
        let config = GenesisConfig::devnet("lagged");
        let (bus, bus_rx) = LocalBus::new(BUS_CAPACITY);
        let bus = Arc::new(bus);
        let (tx, _rx) = mpsc::channel(8);
        let node = create_node("lagged", config, bus.clone(), tx)?;

        // Overrun the receiver before the listener starts draining, so its
        // first recv observes the overflow.
        for _ in 0..BUS_CAPACITY * 2 {
            bus.broadcast(ConsensusMessage::Timeout {
                height: 999,
                round: 999,
            });
        }
        let listener = spawn_bus_listener(node.clone(), bus_rx);

        let signed = node.engine.build_proposal(now_millis()).unwrap();
        bus.broadcast(ConsensusMessage::Propose(signed));
        tokio::time::sleep(Duration::from_millis(500)).await;
        listener.abort();

        // The proposal behind the burst still reached the engine.
        assert_eq!(node.engine.finalized_height(), 1);
        Ok(())
    }

    #[test]
    fn shutdown_flushes_partial_batches() {
        let (tx, _rx) = mpsc::channel(8);
        let node = create_node("node-a", GenesisConfig::devnet("node-a"), Arc::new(NoopBus), tx)
            .unwrap();
        // Two receipts, far below the batch ceiling: the batch stays open.
        submit_chain(&node, Uuid::from_u128(9), 2);
        assert_eq!(node.aggregator.lock().unwrap().open_batches(), 1);

        flush_and_score(&node, now_millis());

        assert_eq!(node.aggregator.lock().unwrap().open_batches(), 0);
        assert_eq!(node.bundle_events.lock().unwrap().len(), 1);
        assert!(node.pending_blocks.lock().unwrap().is_empty());
    }

    #[test]
    fn genesis_config_round_trips_through_json() {
        let config = GenesisConfig::devnet("node-a");
        let bytes = serde_json::to_vec(&config).unwrap();
        let back: GenesisConfig = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.chain_id, config.chain_id);
        assert_eq!(back.validators.len(), 1);
        assert_eq!(back.params.version, config.params.version);
    }

    #[test]
    fn rejected_receipt_lands_in_the_audit_trail() {
        let (tx, _rx) = mpsc::channel(8);
        let node = create_node("node-a", GenesisConfig::devnet("node-a"), Arc::new(NoopBus), tx)
            .unwrap();
        let key = SigningKey::from_bytes(&[1u8; 32]);
        let mut receipt = make_receipt(
            &key,
            Uuid::from_u128(1),
            "task",
            "step",
            now_millis(),
            UsageVector {
                receipt_count: 1,
                ..Default::default()
            },
            GENESIS_PREV_HASH,
        );
        receipt.usage.cpu_ms = 7; // breaks the self-hash
        ingest_receipt(&node, receipt, now_millis());
        assert_eq!(node.validator.lock().unwrap().audit_entries().len(), 1);
        assert!(node.bundle_events.lock().unwrap().is_empty());
    }
}
