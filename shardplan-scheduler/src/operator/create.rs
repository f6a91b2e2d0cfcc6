//! Operator factories
//!
//! Thin wrappers over [`Builder`] for the operations checkers need, plus
//! the split and merge operators which are not expressed as peer diffs.

use super::builder::{BuildError, Builder, Result};
use super::kind::OpKind;
use super::step::{OpStep, SplitPolicy};
use super::Operator;
use crate::cluster::ClusterView;
use crate::metrics::record_operator_created;
use rand::seq::SliceRandom;
use shardplan_core::codec::hex_key;
use shardplan_core::{Peer, Region};
use shardplan_placement::PeerRoleType;
use std::collections::BTreeMap;

/// Add one peer to the region
pub fn create_add_peer_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    peer: Peer,
    kind: OpKind,
) -> Result<Operator> {
    Builder::new(desc, cluster, region).add_peer(peer).build(kind)
}

/// Promote a learner to voter
pub fn create_promote_learner_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    peer: Peer,
) -> Result<Operator> {
    Builder::new(desc, cluster, region)
        .promote_learner(peer.store_id)
        .build(OpKind::empty())
}

/// Remove the peer on a store, moving the leadership away first if needed
pub fn create_remove_peer_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    kind: OpKind,
    region: &Region,
    store_id: u64,
) -> Result<Operator> {
    Builder::new(desc, cluster, region).remove_peer(store_id).build(kind)
}

pub fn create_transfer_leader_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    target_store: u64,
    kind: OpKind,
) -> Result<Operator> {
    Builder::new(desc, cluster, region)
        .set_leader(target_store)
        .build(kind)
}

/// Move the region onto `roles`, a store to role map
///
/// A store with [`PeerRoleType::Leader`] becomes the target leader.
pub fn create_move_region_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    kind: OpKind,
    roles: &BTreeMap<u64, PeerRoleType>,
) -> Result<Operator> {
    let mut peers = Vec::with_capacity(roles.len());
    for (&store_id, role) in roles {
        // Keep existing peer ids where the store already holds a peer
        let id = region.get_store_peer(store_id).map(|p| p.id).unwrap_or(0);
        peers.push(Peer {
            id,
            store_id,
            role: role.peer_role(),
        });
    }
    let mut builder = Builder::new(desc, cluster, region).set_peers(peers);
    if let Some((&leader, _)) = roles.iter().find(|(_, r)| **r == PeerRoleType::Leader) {
        builder = builder.set_leader(leader);
    }
    builder.build(kind)
}

/// Replace the peer on `old_store` with `peer`
pub fn create_move_peer_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    kind: OpKind,
    old_store: u64,
    peer: Peer,
) -> Result<Operator> {
    Builder::new(desc, cluster, region)
        .remove_peer(old_store)
        .add_peer(peer)
        .build(kind)
}

/// Replace the leader's peer and hand the leadership to the new one
pub fn create_move_leader_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    kind: OpKind,
    old_store: u64,
    peer: Peer,
) -> Result<Operator> {
    Builder::new(desc, cluster, region)
        .add_peer(peer)
        .set_leader(peer.store_id)
        .remove_peer(old_store)
        .build(kind)
}

/// Split the region at `keys`, or by `policy` when no keys are given
pub fn create_split_region_operator(
    desc: &str,
    region: &Region,
    kind: OpKind,
    policy: SplitPolicy,
    keys: Vec<Vec<u8>>,
) -> Operator {
    let mut brief = format!("split: region {} use policy {}", region.id, policy);
    if !keys.is_empty() {
        let hex: Vec<String> = keys.iter().map(|k| hex_key(k)).collect();
        brief.push_str(&format!(" and keys [{}]", hex.join(",")));
    }
    let step = OpStep::SplitRegion {
        start_key: region.start_key.clone(),
        end_key: region.end_key.clone(),
        policy,
        split_keys: keys,
    };
    record_operator_created(desc);
    Operator::new(desc, brief, region.id, region.epoch, kind | OpKind::SPLIT, vec![step])
}

/// Whether both regions hold peers on the same stores with the same roles
fn is_region_match(a: &Region, b: &Region) -> bool {
    a.peers.len() == b.peers.len()
        && a.peers.iter().all(|p| {
            b.get_store_peer(p.store_id)
                .map(|q| q.is_learner() == p.is_learner())
                .unwrap_or(false)
        })
}

/// Merge `source` into the adjacent `target`
///
/// Returns two operators: the first moves the source's peers onto the
/// target's stores and then merges; the second waits on the target until
/// its range has absorbed the source.
pub fn create_merge_region_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    source: &Region,
    target: &Region,
    kind: OpKind,
) -> Result<Vec<Operator>> {
    if source.peers.len() != target.peers.len() {
        return Err(BuildError::PeerCountMismatch {
            from_count: source.peers.len(),
            to_count: target.peers.len(),
        });
    }

    let mut steps = Vec::new();
    let mut kind = kind;
    if !is_region_match(source, target) {
        let layout = target.peers.iter().map(|p| Peer { id: 0, ..*p });
        let relocate = Builder::new("", cluster, source).set_peers(layout).build(OpKind::empty())?;
        kind |= relocate.kind();
        steps.extend(relocate.steps().iter().cloned());
    }

    steps.push(OpStep::MergeRegion {
        from_region: source.meta(),
        to_region: target.meta(),
        is_passive: false,
    });
    let brief = format!("merge: region {} to {}", source.id, target.id);
    let active = Operator::new(desc, brief.clone(), source.id, source.epoch, kind | OpKind::MERGE, steps);

    let passive = Operator::new(
        desc,
        brief,
        target.id,
        target.epoch,
        kind | OpKind::MERGE,
        vec![OpStep::MergeRegion {
            from_region: source.meta(),
            to_region: target.meta(),
            is_passive: true,
        }],
    );
    record_operator_created(desc);
    Ok(vec![active, passive])
}

/// Move the region onto `peers` with a random voter as leader
///
/// Added peers are light learners and skip store limits.
pub fn create_scatter_region_operator(
    desc: &str,
    cluster: &dyn ClusterView,
    region: &Region,
    peers: BTreeMap<u64, Peer>,
) -> Result<Operator> {
    let voters: Vec<u64> = peers.values().filter(|p| !p.is_learner()).map(|p| p.store_id).collect();
    let leader = voters
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or(BuildError::NoVoter)?;
    Builder::new(desc, cluster, region)
        .set_peers(peers.into_values())
        .set_leader(leader)
        .enable_light_weight()
        .build(OpKind::empty())
}
