use consensus::{
    sign_proposal, sign_vote, QuorumEngine, RegistryUpdate, Validator, ValidatorChange,
    ValidatorRegistry, ValidatorStatus, VoteChoice,
};
use ed25519_dalek::SigningKey;
use pool::{BundlePool, PoolConfig};
use scoring::GovernanceParams;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const NOW: u64 = 1_700_000_000_000;

fn make_validator(seed: u8, weight: u128) -> (Validator, SigningKey) {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let v = Validator {
        id: Uuid::from_u128(seed as u128),
        pubkey: key.verifying_key().to_bytes().to_vec(),
        weight,
        status: ValidatorStatus::Active,
    };
    (v, key)
}

fn engine_for(v: &Validator, key: SigningKey, registry: &ValidatorRegistry) -> QuorumEngine {
    QuorumEngine::new(
        v.id,
        key,
        Arc::new(Mutex::new(registry.clone())),
        Arc::new(Mutex::new(GovernanceParams::devnet_defaults())),
        Arc::new(BundlePool::new(PoolConfig::default())),
        8,
    )
}

#[tokio::test]
async fn three_validators_finalize_an_empty_block() {
    let (v1, k1) = make_validator(1, 10);
    let (v2, k2) = make_validator(2, 10);
    let (v3, k3) = make_validator(3, 10);
    let registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);

    let engines = vec![
        engine_for(&v1, k1, &registry),
        engine_for(&v2, k2, &registry),
        engine_for(&v3, k3, &registry),
    ];

    let leader = engines
        .iter()
        .find(|e| e.is_local_leader())
        .expect("one engine is leader");
    let proposal = leader.build_proposal(NOW).unwrap();

    let mut votes = Vec::new();
    for engine in &engines {
        if let Some(vote) = engine.handle_proposal(&proposal).unwrap() {
            assert_eq!(vote.choice, VoteChoice::Accept);
            votes.push(vote);
        }
    }
    assert_eq!(votes.len(), 3);

    // Quorum is 21 of 30: the block lands after the third vote everywhere.
    let mut finalized_hashes = Vec::new();
    for engine in &engines {
        let mut finalized = None;
        for vote in &votes {
            if let Some(block) = engine.handle_vote(vote).unwrap() {
                finalized = Some(block);
            }
        }
        let block = finalized.expect("engine finalized");
        block.proof.verify(&registry).unwrap();
        finalized_hashes.push(block.hash());
        assert_eq!(engine.finalized_height(), 1);
        assert_eq!(engine.current_round(), (2, 0));
    }
    assert!(finalized_hashes.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn two_of_three_equal_weights_are_not_quorum() {
    let (v1, k1) = make_validator(4, 10);
    let (v2, k2) = make_validator(5, 10);
    let (v3, _k3) = make_validator(6, 10);
    let registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);

    let e1 = engine_for(&v1, k1, &registry);
    let e2 = engine_for(&v2, k2, &registry);
    let engines = [&e1, &e2];

    let Some(leader) = engines.iter().find(|e| e.is_local_leader()) else {
        // v3 is the elected leader and it is offline; nothing to propose.
        return;
    };
    let proposal = leader.build_proposal(NOW).unwrap();
    let votes: Vec<_> = engines
        .iter()
        .filter_map(|e| e.handle_proposal(&proposal).unwrap())
        .collect();
    for engine in engines {
        for vote in &votes {
            assert!(engine.handle_vote(vote).unwrap().is_none());
        }
        assert_eq!(engine.finalized_height(), 0);
    }
}

#[tokio::test]
async fn view_change_rotates_leaders_until_progress() {
    let validators: Vec<(Validator, SigningKey)> =
        (10u8..14).map(|s| make_validator(s, 10)).collect();
    let registry =
        ValidatorRegistry::genesis(validators.iter().map(|(v, _)| v.clone()).collect());

    // Validator 10 stays offline; the other three drive view changes until
    // one of them is elected. f = 10 of 40 weight, quorum of 27 is reachable.
    let live: Vec<QuorumEngine> = validators[1..]
        .iter()
        .map(|(v, k)| engine_for(v, k.clone(), &registry))
        .collect();

    let mut rounds_used = 0;
    for _attempt in 0..8 {
        if let Some(leader) = live.iter().find(|e| e.is_local_leader()) {
            let proposal = leader.build_proposal(NOW).unwrap();
            let votes: Vec<_> = live
                .iter()
                .filter_map(|e| e.handle_proposal(&proposal).unwrap())
                .collect();
            let mut done = false;
            for engine in &live {
                for vote in &votes {
                    if engine.handle_vote(vote).unwrap().is_some() {
                        done = true;
                    }
                }
            }
            assert!(done, "three live accept votes meet quorum");
            break;
        }
        // Elected leader is the offline validator: every live engine times
        // the round out and moves on.
        for engine in &live {
            let (h, r) = engine.current_round();
            assert!(engine.on_round_timeout(h, r).is_some());
        }
        rounds_used += 1;
    }
    assert!(live.iter().all(|e| e.finalized_height() == 1));
    assert!(rounds_used < 8, "bounded rounds to finality");
}

#[tokio::test]
async fn conflicting_proposals_cannot_both_finalize() {
    let (v1, k1) = make_validator(20, 10);
    let (v2, k2) = make_validator(21, 10);
    let (v3, k3) = make_validator(22, 10);
    let registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);

    let keys = [k1.clone(), k2.clone(), k3.clone()];
    let engines = vec![
        engine_for(&v1, k1, &registry),
        engine_for(&v2, k2, &registry),
        engine_for(&v3, k3, &registry),
    ];
    let li = engines
        .iter()
        .position(|e| e.is_local_leader())
        .expect("leader exists");

    // A byzantine leader signs a second proposal out of band; the engine
    // itself only ever re-issues the first.
    let proposal_a = engines[li].build_proposal(NOW).unwrap();
    let mut forked = proposal_a.proposal.clone();
    forked.timestamp_ms += 1;
    let proposal_b = sign_proposal(&forked, &keys[li]);
    assert_ne!(proposal_a.proposal.hash(), proposal_b.proposal.hash());

    // Each engine votes for whichever arrived first and refuses to answer
    // the conflicting one, so neither side can assemble 2/3 weight.
    let vote_a = engines[0].handle_proposal(&proposal_a).unwrap().unwrap();
    let vote_b = engines[1].handle_proposal(&proposal_b).unwrap().unwrap();
    assert!(engines[0].handle_proposal(&proposal_b).is_err());
    assert!(engines[1].handle_proposal(&proposal_a).is_err());

    let vote_c = engines[2].handle_proposal(&proposal_a).unwrap().unwrap();
    for engine in &engines {
        let _ = engine.handle_vote(&vote_a);
        let _ = engine.handle_vote(&vote_b);
        let _ = engine.handle_vote(&vote_c);
    }
    // Proposal A gathered two accepts (20 of 30 < 21): still no finality,
    // and B with a single vote certainly has none.
    for engine in &engines {
        assert_eq!(engine.finalized_height(), 0);
    }
}

#[tokio::test]
async fn duplicate_votes_do_not_double_count() {
    let (v1, k1) = make_validator(30, 10);
    let (v2, k2) = make_validator(31, 10);
    let (v3, k3) = make_validator(32, 10);
    let registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);
    let engines = vec![
        engine_for(&v1, k1, &registry),
        engine_for(&v2, k2, &registry),
        engine_for(&v3, k3, &registry),
    ];
    let leader = engines.iter().find(|e| e.is_local_leader()).unwrap();
    let proposal = leader.build_proposal(NOW).unwrap();
    let votes: Vec<_> = engines
        .iter()
        .filter_map(|e| e.handle_proposal(&proposal).unwrap())
        .collect();

    let observer = &engines[0];
    assert!(observer.handle_vote(&votes[0]).unwrap().is_none());
    for _ in 0..5 {
        assert!(observer.handle_vote(&votes[0]).unwrap().is_none());
        assert!(observer.handle_vote(&votes[1]).unwrap().is_none());
    }
    assert!(observer.handle_vote(&votes[2]).unwrap().is_some());
}

#[test]
fn registry_update_requires_quorum_of_current_set() {
    let (v1, k1) = make_validator(40, 10);
    let (v2, k2) = make_validator(41, 10);
    let (v3, _k3) = make_validator(42, 10);
    let mut registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);

    let (new_v, _) = make_validator(43, 5);
    let mut update = RegistryUpdate {
        prev_version: registry.version(),
        changes: vec![ValidatorChange::Add(new_v.clone())],
        approvals: vec![],
    };
    let msg = update.signing_hash();
    update.approvals.push((v1.id, receipt::sign_bytes(&k1, &msg)));
    assert!(registry.apply_update(&update).is_err());

    update.approvals.push((v2.id, receipt::sign_bytes(&k2, &msg)));
    registry.apply_update(&update).unwrap();
    assert_eq!(registry.version(), 2);
    assert!(registry.get(&new_v.id).is_some());
}

#[test]
fn slashing_flows_through_the_registry_path() {
    let (v1, k1) = make_validator(50, 10);
    let (v2, k2) = make_validator(51, 10);
    let (v3, k3) = make_validator(52, 10);
    let mut registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);

    let mut update = RegistryUpdate {
        prev_version: registry.version(),
        changes: vec![ValidatorChange::SetStatus {
            id: v3.id,
            status: ValidatorStatus::Slashed,
        }],
        approvals: vec![],
    };
    let msg = update.signing_hash();
    for (id, key) in [(v1.id, &k1), (v2.id, &k2), (v3.id, &k3)] {
        update.approvals.push((id, receipt::sign_bytes(key, &msg)));
    }
    registry.apply_update(&update).unwrap();
    assert_eq!(registry.total_voting_weight(), 20);
    assert!(!registry.get(&v3.id).unwrap().is_voting());
}

#[test]
fn leader_reissues_the_same_proposal_within_a_round() {
    let (v, k) = make_validator(60, 10);
    let registry = ValidatorRegistry::genesis(vec![v.clone()]);
    let engine = engine_for(&v, k, &registry);

    // Proposal timestamps differ across ticks, but the signed proposal for
    // an open round must not: the second call hands back the first.
    let first = engine.build_proposal(NOW).unwrap();
    let again = engine.build_proposal(NOW + 2_000).unwrap();
    assert_eq!(first.proposal.hash(), again.proposal.hash());
    assert_eq!(first.signature, again.signature);

    // A view change opens a new round and a fresh proposal with it.
    let (h, r) = engine.current_round();
    engine.on_round_timeout(h, r).unwrap();
    let next_round = engine.build_proposal(NOW + 3_000).unwrap();
    assert_eq!(next_round.proposal.round, r + 1);
    assert_ne!(next_round.proposal.hash(), first.proposal.hash());
}

#[test]
fn votes_for_other_rounds_are_not_tallied() {
    let (v1, k1) = make_validator(70, 10);
    let (v2, k2) = make_validator(71, 10);
    let (v3, k3) = make_validator(72, 10);
    let registry = ValidatorRegistry::genesis(vec![v1.clone(), v2.clone(), v3.clone()]);
    let engines = vec![
        engine_for(&v1, k1, &registry),
        engine_for(&v2, k2.clone(), &registry),
        engine_for(&v3, k3, &registry),
    ];
    let leader = engines.iter().find(|e| e.is_local_leader()).unwrap();
    let proposal = leader.build_proposal(NOW).unwrap();
    let votes: Vec<_> = engines
        .iter()
        .filter_map(|e| e.handle_proposal(&proposal).unwrap())
        .collect();

    // A validly signed vote for a round the engine is not in bounces
    // instead of opening a tally entry.
    let stray = sign_vote(
        proposal.proposal.hash(),
        1,
        5,
        VoteChoice::Accept,
        v2.id,
        &k2,
    );
    let observer = &engines[0];
    assert!(observer.handle_vote(&stray).is_err());

    for vote in &votes[..2] {
        assert!(observer.handle_vote(vote).unwrap().is_none());
    }
    assert!(observer.handle_vote(&votes[2]).unwrap().is_some());
}

#[test]
fn params_updates_require_a_version_bump() {
    let (v, k) = make_validator(80, 10);
    let registry = ValidatorRegistry::genesis(vec![v.clone()]);
    let engine = engine_for(&v, k, &registry);

    let current = engine.params();
    assert!(engine.update_params(current).is_err());

    let mut next = current;
    next.version = current.version + 1;
    engine.update_params(next).unwrap();
    assert_eq!(engine.params().version, current.version + 1);
    assert!(engine.update_params(next).is_err());
}
