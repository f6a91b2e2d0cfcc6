//! End-to-end scheduling tests
//!
//! Drives the builder, the checkers and operator execution against an
//! in-memory cluster.
//!
//! Run with: cargo test -p shardplan-scheduler --test scheduling

use proptest::prelude::*;
use shardplan_core::{Peer, PeerRole, Region, ScheduleOptions, Store};
use shardplan_placement::fit::isolation_level;
use shardplan_scheduler::cluster::ClusterView;
use shardplan_scheduler::operator::is_valid_transition;
use shardplan_scheduler::{
    Builder, CheckerController, ClusterSnapshot, MemoryCluster, MergeChecker, OpKind, OpStatus, OpStep, Operator,
    RuleChecker,
};
use std::collections::BTreeMap;
use std::sync::Arc;

fn cluster(opts: ScheduleOptions, stores: impl IntoIterator<Item = Store>) -> Arc<MemoryCluster> {
    let c = MemoryCluster::with_memory_rules(opts).unwrap();
    for store in stores {
        c.put_store(store);
    }
    Arc::new(c)
}

fn plain_stores(n: u64) -> Vec<Store> {
    (1..=n).map(Store::new).collect()
}

fn rules_enabled() -> ScheduleOptions {
    ScheduleOptions {
        placement_rules_enabled: true,
        ..Default::default()
    }
}

/// Apply a step the way a store would report it back
fn apply_step(region: &mut Region, step: &OpStep) {
    match step {
        OpStep::AddLearner { to_store, peer_id } | OpStep::AddLightLearner { to_store, peer_id } => {
            region.peers.push(Peer::learner(*peer_id, *to_store));
        }
        OpStep::PromoteLearner { to_store, .. } => {
            for peer in region.peers.iter_mut().filter(|p| p.store_id == *to_store) {
                peer.role = PeerRole::Voter;
            }
        }
        OpStep::RemovePeer { from_store } => region.peers.retain(|p| p.store_id != *from_store),
        OpStep::TransferLeader { to_store, .. } => region.leader = region.get_store_peer(*to_store).copied(),
        OpStep::MergeRegion { .. } | OpStep::SplitRegion { .. } => {}
    }
}

/// Apply every step of `op`, checking no peer is added onto an occupied store
fn apply_all(mut region: Region, op: &Operator) -> Region {
    for step in op.steps() {
        if let OpStep::AddLearner { to_store, .. } | OpStep::AddLightLearner { to_store, .. } = step {
            assert!(
                region.get_store_peer(*to_store).is_none(),
                "store {} still holds a peer before {:?}",
                to_store,
                op.steps()
            );
        }
        apply_step(&mut region, step);
    }
    region
}

/// Store to is-learner map of a region
fn peer_layout(region: &Region) -> BTreeMap<u64, bool> {
    region.peers.iter().map(|p| (p.store_id, p.is_learner())).collect()
}

fn four_peers() -> Region {
    let leader = Peer::voter(11, 1);
    Region::new(
        1,
        b"",
        b"",
        vec![leader, Peer::voter(12, 2), Peer::voter(13, 3), Peer::learner(14, 4)],
        Some(leader),
    )
}

// ===== Builder =====

#[test]
fn test_demote_leader_and_drop_learner() {
    let c = cluster(ScheduleOptions::default(), plain_stores(4));
    let region = four_peers();

    let op = Builder::new("test", c.as_ref(), &region)
        .set_peers(vec![Peer::learner(11, 1), Peer::voter(12, 2)])
        .build(OpKind::empty())
        .unwrap();

    let new_id = match op.steps() {
        [OpStep::RemovePeer { from_store: 3 }, OpStep::RemovePeer { from_store: 4 }, OpStep::TransferLeader { from_store: 1, to_store: 2 }, OpStep::RemovePeer { from_store: 1 }, OpStep::AddLearner { to_store: 1, peer_id }] => {
            *peer_id
        }
        steps => panic!("unexpected steps {:?}", steps),
    };
    assert_ne!(new_id, 11);

    let done = apply_all(region, &op);
    assert_eq!(peer_layout(&done), BTreeMap::from([(1, true), (2, false)]));
    assert_eq!(done.leader_store_id(), Some(2));
}

#[test]
fn test_demote_follower_and_drop_learner() {
    let c = cluster(ScheduleOptions::default(), plain_stores(4));
    let region = four_peers();

    let op = Builder::new("test", c.as_ref(), &region)
        .set_peers(vec![Peer::voter(11, 1), Peer::voter(12, 2), Peer::learner(13, 3)])
        .build(OpKind::empty())
        .unwrap();

    match op.steps() {
        [OpStep::RemovePeer { from_store: 3 }, OpStep::AddLearner { to_store: 3, peer_id }, OpStep::RemovePeer { from_store: 4 }] => {
            assert_ne!(*peer_id, 13)
        }
        steps => panic!("unexpected steps {:?}", steps),
    }

    let done = apply_all(region, &op);
    assert_eq!(peer_layout(&done), BTreeMap::from([(1, false), (2, false), (3, true)]));
    assert_eq!(done.leader_store_id(), Some(1));
}

#[test]
fn test_demote_follower() {
    let c = cluster(ScheduleOptions::default(), plain_stores(3));
    let leader = Peer::voter(11, 1);
    let region = Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2), Peer::voter(13, 3)], Some(leader));

    let op = Builder::new("test", c.as_ref(), &region)
        .set_peers(vec![Peer::voter(11, 1), Peer::voter(12, 2), Peer::learner(13, 3)])
        .build(OpKind::empty())
        .unwrap();
    assert_eq!(op.steps()[0], OpStep::RemovePeer { from_store: 3 });
    assert_eq!(op.len(), 2);

    let done = apply_all(region, &op);
    assert_eq!(peer_layout(&done), BTreeMap::from([(1, false), (2, false), (3, true)]));
    assert_eq!(done.leader_store_id(), Some(1));
}

#[test]
fn test_demote_leader() {
    let c = cluster(ScheduleOptions::default(), plain_stores(3));
    let leader = Peer::voter(11, 1);
    let region = Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2), Peer::voter(13, 3)], Some(leader));

    let op = Builder::new("test", c.as_ref(), &region)
        .set_peers(vec![Peer::learner(11, 1), Peer::voter(12, 2), Peer::voter(13, 3)])
        .build(OpKind::empty())
        .unwrap();
    match op.steps() {
        [OpStep::TransferLeader { from_store: 1, to_store: 2 }, OpStep::RemovePeer { from_store: 1 }, OpStep::AddLearner { to_store: 1, peer_id }] => {
            assert_ne!(*peer_id, 11)
        }
        steps => panic!("unexpected steps {:?}", steps),
    }
    assert!(op.kind().contains(OpKind::LEADER | OpKind::REGION));

    let done = apply_all(region, &op);
    assert_eq!(peer_layout(&done), BTreeMap::from([(1, true), (2, false), (3, false)]));
    assert_eq!(done.leader_store_id(), Some(2));
}

#[test]
fn test_replace_voters_and_learner() {
    let c = cluster(ScheduleOptions::default(), plain_stores(5));
    let leader = Peer::voter(1, 1);
    let region = Region::new(1, b"", b"", vec![leader, Peer::voter(2, 2), Peer::learner(3, 3)], Some(leader));

    let op = Builder::new("test", c.as_ref(), &region)
        .set_peers(vec![Peer::voter(0, 4), Peer::learner(0, 5)])
        .build(OpKind::empty())
        .unwrap();

    let shape: Vec<(&str, u64)> = op
        .steps()
        .iter()
        .map(|s| match s {
            OpStep::AddLearner { to_store, .. } => ("add-learner", *to_store),
            OpStep::PromoteLearner { to_store, .. } => ("promote", *to_store),
            OpStep::RemovePeer { from_store } => ("remove", *from_store),
            OpStep::TransferLeader { to_store, .. } => ("transfer-leader", *to_store),
            other => panic!("unexpected step {:?}", other),
        })
        .collect();
    assert_eq!(
        shape,
        vec![
            ("add-learner", 4),
            ("promote", 4),
            ("remove", 2),
            ("add-learner", 5),
            ("remove", 3),
            ("transfer-leader", 4),
            ("remove", 1),
        ]
    );
    assert_eq!(op.steps()[5], OpStep::TransferLeader { from_store: 1, to_store: 4 });
    assert!(op.kind().contains(OpKind::LEADER | OpKind::REGION));
}

#[test]
fn test_operator_runs_to_success() {
    let c = cluster(ScheduleOptions::default(), plain_stores(4));
    let leader = Peer::voter(11, 1);
    let mut region = Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2), Peer::voter(13, 3)], Some(leader))
        .with_approximate(10, 100);

    let op = Builder::new("test", c.as_ref(), &region)
        .add_peer(Peer::voter(0, 4))
        .set_leader(4)
        .remove_peer(1)
        .build(OpKind::REPLICA)
        .unwrap();
    assert!(op.start());

    let mut sent = 0;
    while let Some(step) = op.check(&region).cloned() {
        apply_step(&mut region, &step);
        sent += 1;
        assert!(sent <= op.len());
    }
    assert_eq!(sent, op.len());
    assert_eq!(op.status(), OpStatus::Success);
    assert_eq!(region.leader_store_id(), Some(4));
    let history = op.history();
    assert!(history.iter().any(|h| h.from_store == 1 && h.to_store == 4 && h.kind == OpKind::LEADER));
    assert!(history.iter().any(|h| h.from_store == 1 && h.to_store == 0));

    // Further heartbeats change nothing
    assert!(op.check(&region).is_none());
    assert_eq!(op.status(), OpStatus::Success);
    assert!(!op.cancel());
    assert_eq!(op.current_step(), op.len());
}

#[test]
fn test_repeated_heartbeats_are_idempotent() {
    let c = cluster(ScheduleOptions::default(), plain_stores(4));
    let leader = Peer::voter(11, 1);
    let region = Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2), Peer::voter(13, 3)], Some(leader));
    let op = Builder::new("test", c.as_ref(), &region)
        .add_peer(Peer::voter(14, 4))
        .build(OpKind::empty())
        .unwrap();
    assert!(op.start());

    let mut learner_added = region.clone();
    apply_step(&mut learner_added, &op.steps()[0]);
    for _ in 0..3 {
        assert_eq!(op.check(&learner_added), Some(&OpStep::PromoteLearner { to_store: 4, peer_id: 14 }));
        assert_eq!(op.current_step(), 1);
        assert_eq!(op.status(), OpStatus::Started);
    }

    let mut promoted = learner_added.clone();
    apply_step(&mut promoted, &op.steps()[1]);
    assert!(op.check(&promoted).is_none());
    assert_eq!(op.status(), OpStatus::Success);
    assert!(op.check(&promoted).is_none());
    assert_eq!(op.current_step(), 2);
}

#[test]
fn test_status_transitions_are_closed() {
    for from in OpStatus::ALL {
        for to in OpStatus::ALL {
            if from.is_end() {
                assert!(!is_valid_transition(from, to), "{:?} -> {:?}", from, to);
            }
        }
    }

    let c = cluster(ScheduleOptions::default(), plain_stores(3));
    let leader = Peer::voter(11, 1);
    let region = Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2), Peer::voter(13, 3)], Some(leader));
    let op = Builder::new("test", c.as_ref(), &region).set_leader(2).build(OpKind::empty()).unwrap();
    assert!(op.cancel());
    assert!(!op.start());
    assert!(!op.replace());
    assert_eq!(op.status(), OpStatus::Canceled);
    assert!(op.is_end());
    assert!(op.check(&region).is_none());
}

// ===== Checkers =====

#[test]
fn test_merge_skips_empty_region() {
    let opts = ScheduleOptions {
        key_type: shardplan_core::KeyType::Raw,
        ..Default::default()
    };
    let c = cluster(opts, plain_stores(3));
    let peers = |base: u64| vec![Peer::voter(base + 1, 1), Peer::voter(base + 2, 2), Peer::voter(base + 3, 3)];
    c.put_region(Region::new(1, b"", b"b", peers(10), Some(Peer::voter(11, 1))).with_approximate(1, 1));
    c.put_region(Region::new(2, b"b", b"d", peers(20), Some(Peer::voter(21, 1))).with_approximate(0, 0));
    c.put_region(Region::new(3, b"d", b"", peers(30), Some(Peer::voter(31, 1))).with_approximate(1, 1));

    let mut checker = MergeChecker::new(c.clone());
    checker.skip_warm_up();
    assert!(checker.check(&c.get_region(2).unwrap()).is_none());
    assert!(checker.check(&c.get_region(1).unwrap()).is_some());
}

#[test]
fn test_rule_adds_missing_peer_on_distinct_store() {
    let opts = ScheduleOptions {
        location_labels: vec!["zone".into()],
        ..rules_enabled()
    };
    let c = cluster(
        opts,
        vec![
            Store::new(1).with_label("zone", "z1"),
            Store::new(2).with_label("zone", "z2"),
            Store::new(3).with_label("zone", "z3"),
            Store::new(4).with_label("zone", "z1"),
        ],
    );
    let leader = Peer::voter(11, 1);
    let region = Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2)], Some(leader)).with_approximate(10, 10);

    let op = RuleChecker::new(c).check(&region).unwrap();
    assert_eq!(op.desc(), "add-rule-peer");
    assert!(matches!(op.step(0), Some(OpStep::AddLearner { to_store: 3, .. })));
}

#[test]
fn test_rule_removes_orphan_peer() {
    let c = cluster(rules_enabled(), plain_stores(4));
    let leader = Peer::voter(11, 1);
    let region = Region::new(
        1,
        b"",
        b"",
        vec![leader, Peer::voter(12, 2), Peer::voter(13, 3), Peer::voter(14, 4)],
        Some(leader),
    )
    .with_approximate(10, 10);

    let op = RuleChecker::new(c).check(&region).unwrap();
    assert_eq!(op.desc(), "remove-orphan-peer");
    let removed: Vec<u64> = op
        .steps()
        .iter()
        .filter_map(|s| match s {
            OpStep::RemovePeer { from_store } => Some(*from_store),
            _ => None,
        })
        .collect();
    assert_eq!(removed.len(), 1);
    assert!((1..=4).contains(&removed[0]));
}

#[test]
fn test_isolation_level_at_rack() {
    let labels: Vec<String> = vec!["zone".into(), "rack".into(), "host".into()];
    let stores: Vec<Store> = (1..=3)
        .map(|id| {
            Store::new(id)
                .with_label("zone", "z1")
                .with_label("rack", format!("r{}", id))
                .with_label("host", format!("h{}", id))
        })
        .collect();
    let refs: Vec<Option<&Store>> = stores.iter().map(Some).collect();
    assert_eq!(isolation_level(&refs, &labels), 2);
}

#[test]
fn test_controller_over_snapshot() {
    let json = r#"{
        "options": {"placement_rules_enabled": true},
        "stores": [],
        "regions": []
    }"#;
    let mut snapshot = ClusterSnapshot::from_json(json).unwrap();
    snapshot.stores = plain_stores(4);
    let leader = Peer::voter(11, 1);
    snapshot.regions = vec![
        Region::new(1, b"", b"m", vec![leader, Peer::voter(12, 2)], Some(leader)).with_approximate(100, 100_000_000),
        Region::new(
            2,
            b"m",
            b"",
            vec![Peer::voter(21, 1), Peer::voter(22, 2), Peer::voter(23, 3)],
            Some(Peer::voter(21, 1)),
        )
        .with_approximate(100, 100_000_000),
    ];

    let manager = Arc::new(shardplan_placement::RuleManager::new(Arc::new(
        shardplan_storage::MemoryRuleStorage::new(),
    )));
    let c = Arc::new(MemoryCluster::from_snapshot(snapshot, manager).unwrap());
    let controller = CheckerController::new(c.clone()).skip_merge_warm_up();

    let ops: Vec<Operator> = c
        .regions()
        .iter()
        .filter_map(|r| controller.check_region(r))
        .flatten()
        .collect();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].region_id(), 1);
    assert_eq!(ops[0].desc(), "add-rule-peer");
    // Allocated ids never collide with ids from the snapshot
    match ops[0].step(0) {
        Some(OpStep::AddLearner { peer_id, .. }) => assert!(*peer_id > 23),
        other => panic!("unexpected step {:?}", other),
    }
}

// ===== Builder safety =====

fn layout() -> impl Strategy<Value = BTreeMap<u64, bool>> {
    prop::collection::btree_map(1u64..=6, any::<bool>(), 1..=5)
}

proptest! {
    #[test]
    fn prop_builder_steps_keep_region_safe(origin in layout(), target in layout()) {
        let c = cluster(ScheduleOptions::default(), plain_stores(6));

        // bool: learner
        let mut origin = origin;
        let leader_store = *origin.keys().next().unwrap();
        origin.insert(leader_store, false);
        let peers: Vec<Peer> = origin
            .iter()
            .map(|(&store, &learner)| if learner { Peer::learner(store * 10, store) } else { Peer::voter(store * 10, store) })
            .collect();
        let leader = Peer::voter(leader_store * 10, leader_store);
        let mut region = Region::new(1, b"", b"", peers, Some(leader));

        let target_peers: Vec<Peer> = target
            .iter()
            .map(|(&store, &learner)| if learner { Peer::learner(0, store) } else { Peer::voter(0, store) })
            .collect();
        let op = match Builder::new("prop", c.as_ref(), &region).set_peers(target_peers).build(OpKind::empty()) {
            Ok(op) => op,
            Err(_) => return Ok(()),
        };

        for step in op.steps() {
            let current_leader = region.leader_store_id();
            match step {
                OpStep::AddLearner { to_store, .. } => prop_assert!(region.get_store_peer(*to_store).is_none()),
                OpStep::PromoteLearner { to_store, .. } => {
                    prop_assert!(region.get_store_learner(*to_store).is_some())
                }
                OpStep::RemovePeer { from_store } => prop_assert_ne!(Some(*from_store), current_leader),
                OpStep::TransferLeader { to_store, .. } => prop_assert!(region.get_store_voter(*to_store).is_some()),
                other => prop_assert!(false, "unexpected step {:?}", other),
            }
            apply_step(&mut region, step);
            prop_assert!(region.voters().count() > 0);
        }

        let result: BTreeMap<u64, bool> = region.peers.iter().map(|p| (p.store_id, p.is_learner())).collect();
        prop_assert_eq!(result, target);
        let leader = region.leader_store_id().and_then(|s| region.get_store_voter(s));
        prop_assert!(leader.is_some());
    }
}
