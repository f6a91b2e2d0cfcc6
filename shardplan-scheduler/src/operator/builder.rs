//! Operator builder
//!
//! Turns a target peer layout into an ordered list of steps. The builder
//! diffs origin and target peers into peers to add, remove and promote,
//! then repeatedly picks one step plan until the diff is empty:
//!
//! 1. Replace: add (or promote) one peer and remove one of the same role
//! 2. Promote a learner
//! 3. Remove a peer
//! 4. Add a peer
//!
//! Each plan also fixes where the leader sits before the add and before
//! the remove. Every eligible leader combination is tried and the best is
//! kept by the comparator in [`Planner::compare_plan`]. A peer is never
//! removed while it holds the leadership.

use super::kind::OpKind;
use super::step::OpStep;
use super::Operator;
use crate::cluster::ClusterView;
use crate::filter::{filter_target, Filter, StoreStateFilter};
use crate::metrics::record_operator_created;
use shardplan_core::{Peer, PeerRole, Region, RegionEpoch, ScheduleOptions, ShardplanError};
use shardplan_placement::{match_label_constraints, Rule};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const BUILDER_SCOPE: &str = "operator-builder";

/// Builder errors
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("cannot build operator for region {0} with no leader")]
    NoLeader(u64),

    #[error("cannot build operator for region {0} which matches no placement rule")]
    NoRule(u64),

    #[error("cannot use peer with store id 0")]
    InvalidPeer,

    #[error("cannot add peer to store {0}: already has a peer")]
    PeerExists(u64),

    #[error("cannot remove peer from store {0}: not found")]
    PeerNotFound(u64),

    #[error("cannot remove peer from store {0}: it is the target leader")]
    RemoveLeader(u64),

    #[error("cannot promote peer on store {0}: not a learner")]
    NotLearner(u64),

    #[error("cannot transfer leader to store {0}: not found")]
    LeaderNotFound(u64),

    #[error("cannot transfer leader to store {0}: it is a learner")]
    LeaderIsLearner(u64),

    #[error("cannot create operator: target leader on store {0} is not allowed")]
    LeaderNotAllowed(u64),

    #[error("cannot create operator: target peers have no voter")]
    NoVoter,

    #[error("fail to build operator: plan is empty, maybe no valid leader")]
    EmptyPlan,

    #[error("no operator step is built")]
    NoStep,

    #[error("mismatched peer count: {from_count} in region to merge, {to_count} in target")]
    PeerCountMismatch { from_count: usize, to_count: usize },

    #[error("Cluster error: {0}")]
    Cluster(#[from] ShardplanError),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Peers keyed by store id
pub type PeerMap = BTreeMap<u64, Peer>;

fn store_ids(peers: &PeerMap) -> Vec<u64> {
    peers.keys().copied().collect()
}

/// Builds one operator for one region
pub struct Builder<'a> {
    cluster: &'a dyn ClusterView,
    desc: String,
    region_id: u64,
    region_epoch: RegionEpoch,
    rules: Vec<Arc<Rule>>,
    origin_peers: PeerMap,
    origin_leader_store: u64,
    target_peers: PeerMap,
    target_leader_store: Option<u64>,
    light_weight: bool,
    err: Option<BuildError>,
}

impl<'a> Builder<'a> {
    /// Start from the region's current layout
    pub fn new(desc: impl Into<String>, cluster: &'a dyn ClusterView, region: &Region) -> Self {
        let mut err = None;
        let mut origin_peers = PeerMap::new();
        for peer in &region.peers {
            if peer.store_id == 0 {
                err = Some(BuildError::InvalidPeer);
                break;
            }
            origin_peers.insert(peer.store_id, *peer);
        }

        let origin_leader_store = region.leader_store_id().unwrap_or(0);
        if err.is_none() && !origin_peers.contains_key(&origin_leader_store) {
            err = Some(BuildError::NoLeader(region.id));
        }

        let mut rules = Vec::new();
        if err.is_none() && cluster.options().placement_rules_enabled {
            rules = cluster.fit_region(region).rules();
            if rules.is_empty() {
                err = Some(BuildError::NoRule(region.id));
            }
        }

        Self {
            cluster,
            desc: desc.into(),
            region_id: region.id,
            region_epoch: region.epoch,
            rules,
            target_peers: origin_peers.clone(),
            origin_peers,
            origin_leader_store,
            target_leader_store: Some(origin_leader_store),
            light_weight: false,
            err,
        }
    }

    fn fail(mut self, err: BuildError) -> Self {
        self.err = Some(err);
        self
    }

    /// Add a peer; an id of 0 is allocated at build time
    pub fn add_peer(mut self, peer: Peer) -> Self {
        if self.err.is_some() {
            return self;
        }
        if peer.store_id == 0 {
            return self.fail(BuildError::InvalidPeer);
        }
        if self.target_peers.contains_key(&peer.store_id) {
            return self.fail(BuildError::PeerExists(peer.store_id));
        }
        self.target_peers.insert(peer.store_id, peer);
        self
    }

    pub fn remove_peer(mut self, store_id: u64) -> Self {
        if self.err.is_some() {
            return self;
        }
        if !self.target_peers.contains_key(&store_id) {
            return self.fail(BuildError::PeerNotFound(store_id));
        }
        if self.target_leader_store == Some(store_id) {
            return self.fail(BuildError::RemoveLeader(store_id));
        }
        self.target_peers.remove(&store_id);
        self
    }

    pub fn promote_learner(mut self, store_id: u64) -> Self {
        if self.err.is_some() {
            return self;
        }
        match self.target_peers.get_mut(&store_id) {
            None => self.fail(BuildError::PeerNotFound(store_id)),
            Some(peer) if !peer.is_learner() => self.fail(BuildError::NotLearner(store_id)),
            Some(peer) => {
                peer.role = PeerRole::Voter;
                self
            }
        }
    }

    pub fn set_leader(mut self, store_id: u64) -> Self {
        if self.err.is_some() {
            return self;
        }
        match self.target_peers.get(&store_id) {
            None => self.fail(BuildError::LeaderNotFound(store_id)),
            Some(peer) if peer.is_learner() => self.fail(BuildError::LeaderIsLearner(store_id)),
            Some(_) => {
                self.target_leader_store = Some(store_id);
                self
            }
        }
    }

    /// Replace the whole target layout; the target leader is dropped if absent
    pub fn set_peers(mut self, peers: impl IntoIterator<Item = Peer>) -> Self {
        if self.err.is_some() {
            return self;
        }
        let mut target = PeerMap::new();
        for peer in peers {
            if peer.store_id == 0 {
                return self.fail(BuildError::InvalidPeer);
            }
            target.insert(peer.store_id, peer);
        }
        if let Some(leader) = self.target_leader_store {
            if !target.contains_key(&leader) {
                self.target_leader_store = None;
            }
        }
        self.target_peers = target;
        self
    }

    /// Add peers as light learners, which skip store limits
    pub fn enable_light_weight(mut self) -> Self {
        self.light_weight = true;
        self
    }

    /// Build the operator; `kind` is extended with the kinds of emitted steps
    pub fn build(self, kind: OpKind) -> Result<Operator> {
        if let Some(err) = self.err {
            return Err(err);
        }
        let (mut planner, brief) = self.prepare()?;
        let kind = planner.build_steps(kind)?;

        debug!(
            desc = %self.desc,
            region_id = self.region_id,
            steps = planner.steps.len(),
            %kind,
            "Operator built"
        );
        record_operator_created(&self.desc);
        Ok(Operator::new(
            self.desc,
            brief,
            self.region_id,
            self.region_epoch,
            kind,
            planner.steps,
        ))
    }

    /// Diff origin and target into a planner and a brief
    fn prepare(&self) -> Result<(Planner<'a>, String)> {
        if !self.target_peers.values().any(|p| !p.is_learner()) {
            return Err(BuildError::NoVoter);
        }

        let mut to_add = PeerMap::new();
        let mut to_remove = PeerMap::new();
        let mut to_promote = PeerMap::new();

        for (store_id, origin) in &self.origin_peers {
            match self.target_peers.get(store_id) {
                None => {
                    to_remove.insert(*store_id, *origin);
                }
                Some(target) => {
                    if origin.is_learner() && !target.is_learner() {
                        to_promote.insert(*store_id, Peer { id: origin.id, ..*target });
                    } else if !origin.is_learner() && target.is_learner() {
                        // Demotion: remove the voter, re-add as a learner
                        to_remove.insert(*store_id, *origin);
                    }
                }
            }
        }

        for (store_id, target) in &self.target_peers {
            let demoted = match self.origin_peers.get(store_id) {
                None => false,
                Some(origin) => target.is_learner() && !origin.is_learner(),
            };
            if self.origin_peers.contains_key(store_id) && !demoted {
                continue;
            }
            let mut peer = *target;
            if peer.id == 0 || demoted {
                peer.id = self.cluster.alloc_id()?;
            }
            to_add.insert(*store_id, peer);
        }

        let target_leader = self
            .target_leader_store
            .filter(|s| self.target_peers.get(s).map(|p| !p.is_learner()).unwrap_or(false));

        let planner = Planner {
            cluster: self.cluster,
            opts: self.cluster.options(),
            rules: self.rules.clone(),
            target_leader,
            light_weight: self.light_weight,
            current_peers: self.origin_peers.clone(),
            current_leader: self.origin_leader_store,
            to_add,
            to_remove,
            to_promote,
            peer_add_step: HashMap::new(),
            steps: Vec::new(),
        };

        if let Some(leader) = target_leader {
            let peer = self.target_peers[&leader];
            if !planner.allow_leader(&peer) {
                return Err(BuildError::LeaderNotAllowed(leader));
            }
        }

        let brief = planner.brief(self.origin_leader_store);
        Ok((planner, brief))
    }
}

/// One round of the step search
#[derive(Debug, Clone, Copy, Default)]
struct StepPlan {
    leader_before_add: Option<u64>,
    add: Option<Peer>,
    promote: Option<Peer>,
    leader_before_remove: Option<u64>,
    remove: Option<Peer>,
}

impl StepPlan {
    fn remove_store(&self) -> Option<u64> {
        self.remove.map(|p| p.store_id)
    }
}

/// Mutable state of the step search
struct Planner<'a> {
    cluster: &'a dyn ClusterView,
    opts: Arc<ScheduleOptions>,
    rules: Vec<Arc<Rule>>,
    target_leader: Option<u64>,
    light_weight: bool,
    current_peers: PeerMap,
    current_leader: u64,
    to_add: PeerMap,
    to_remove: PeerMap,
    to_promote: PeerMap,
    /// Step count right after a peer was added on a store
    peer_add_step: HashMap<u64, usize>,
    steps: Vec<OpStep>,
}

impl Planner<'_> {
    fn brief(&self, origin_leader: u64) -> String {
        let (add, remove, promote) = (
            store_ids(&self.to_add),
            store_ids(&self.to_remove),
            store_ids(&self.to_promote),
        );
        if !add.is_empty() && !remove.is_empty() {
            format!("mv peer: store {:?} to {:?}", remove, add)
        } else if !add.is_empty() {
            format!("add peer: store {:?}", add)
        } else if !remove.is_empty() && !promote.is_empty() {
            format!("rm peer: store {:?}, promote peer: store {:?}", remove, promote)
        } else if !remove.is_empty() {
            format!("rm peer: store {:?}", remove)
        } else if !promote.is_empty() {
            format!("promote peer: store {:?}", promote)
        } else if let Some(leader) = self.target_leader {
            format!("transfer leader: store {} to {}", origin_leader, leader)
        } else {
            String::new()
        }
    }

    fn build_steps(&mut self, mut kind: OpKind) -> Result<OpKind> {
        while !(self.to_add.is_empty() && self.to_remove.is_empty() && self.to_promote.is_empty()) {
            let plan = self.peer_plan().ok_or(BuildError::EmptyPlan)?;

            if let Some(leader) = plan.leader_before_add {
                if leader != self.current_leader {
                    self.exec_transfer_leader(leader);
                    kind |= OpKind::LEADER;
                }
            }
            if let Some(peer) = plan.add {
                self.exec_add_peer(peer);
                kind |= OpKind::REGION;
            }
            if let Some(peer) = plan.promote {
                self.exec_promote_learner(peer);
                kind |= OpKind::REGION;
            }
            if let Some(leader) = plan.leader_before_remove {
                if leader != self.current_leader {
                    self.exec_transfer_leader(leader);
                    kind |= OpKind::LEADER;
                }
            }
            if let Some(peer) = plan.remove {
                self.exec_remove_peer(peer);
                kind |= OpKind::REGION;
            }
        }

        if let Some(leader) = self.target_leader {
            if leader != self.current_leader && self.current_peers.contains_key(&leader) {
                self.exec_transfer_leader(leader);
                kind |= OpKind::LEADER;
            }
        }

        if self.steps.is_empty() {
            return Err(BuildError::NoStep);
        }
        Ok(kind)
    }

    // ===== Step emission =====

    fn exec_transfer_leader(&mut self, store_id: u64) {
        self.steps.push(OpStep::TransferLeader {
            from_store: self.current_leader,
            to_store: store_id,
        });
        self.current_leader = store_id;
    }

    fn exec_add_peer(&mut self, peer: Peer) {
        let step = if self.light_weight {
            OpStep::AddLightLearner {
                to_store: peer.store_id,
                peer_id: peer.id,
            }
        } else {
            OpStep::AddLearner {
                to_store: peer.store_id,
                peer_id: peer.id,
            }
        };
        self.steps.push(step);
        if !peer.is_learner() {
            self.steps.push(OpStep::PromoteLearner {
                to_store: peer.store_id,
                peer_id: peer.id,
            });
        }
        self.current_peers.insert(peer.store_id, peer);
        self.peer_add_step.insert(peer.store_id, self.steps.len());
        self.to_add.remove(&peer.store_id);
    }

    fn exec_promote_learner(&mut self, peer: Peer) {
        self.steps.push(OpStep::PromoteLearner {
            to_store: peer.store_id,
            peer_id: peer.id,
        });
        self.current_peers.insert(peer.store_id, peer);
        self.to_promote.remove(&peer.store_id);
    }

    fn exec_remove_peer(&mut self, peer: Peer) {
        self.steps.push(OpStep::RemovePeer {
            from_store: peer.store_id,
        });
        self.current_peers.remove(&peer.store_id);
        self.to_remove.remove(&peer.store_id);
    }

    // ===== Plan search =====

    fn peer_plan(&self) -> Option<StepPlan> {
        self.plan_replace()
            .or_else(|| self.plan_promote_peer())
            .or_else(|| self.plan_remove_peer())
            .or_else(|| self.plan_add_peer())
    }

    /// Peers to add whose store is free; a demoted store waits for its removal
    fn ready_adds(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.to_add
            .values()
            .filter(move |p| !self.to_remove.contains_key(&p.store_id))
    }

    fn plan_replace(&self) -> Option<StepPlan> {
        let mut best = None;
        for remove in self.to_remove.values().filter(|p| !p.is_learner()) {
            for add in self.ready_adds().filter(|p| !p.is_learner()) {
                let plan = StepPlan {
                    remove: Some(*remove),
                    add: Some(*add),
                    ..Default::default()
                };
                best = self.plan_replace_leaders(best, plan);
            }
            for promote in self.to_promote.values() {
                let plan = StepPlan {
                    remove: Some(*remove),
                    promote: Some(*promote),
                    ..Default::default()
                };
                best = self.plan_replace_leaders(best, plan);
            }
        }
        for remove in self.to_remove.values().filter(|p| p.is_learner()) {
            for add in self.ready_adds().filter(|p| p.is_learner()) {
                let plan = StepPlan {
                    remove: Some(*remove),
                    add: Some(*add),
                    ..Default::default()
                };
                best = self.plan_replace_leaders(best, plan);
            }
        }
        best
    }

    fn plan_replace_leaders(&self, mut best: Option<StepPlan>, mut next: StepPlan) -> Option<StepPlan> {
        let leaders = self.current_leaders();
        let remove_store = next.remove_store();
        for &leader_before_add in &leaders {
            next.leader_before_add = Some(leader_before_add);
            for &leader_before_remove in &leaders {
                if Some(leader_before_remove) != remove_store {
                    next.leader_before_remove = Some(leader_before_remove);
                    best = self.compare_plan(best, next);
                }
            }
            // The promoted peer takes over before the remove
            if let Some(promote) = next.promote {
                if Some(promote.store_id) != remove_store && self.allow_leader(&promote) {
                    next.leader_before_remove = Some(promote.store_id);
                    best = self.compare_plan(best, next);
                }
            }
            // The added voter takes over before the remove
            if let Some(add) = next.add {
                if !add.is_learner() && Some(add.store_id) != remove_store && self.allow_leader(&add) {
                    next.leader_before_remove = Some(add.store_id);
                    best = self.compare_plan(best, next);
                }
            }
        }
        best
    }

    fn plan_promote_peer(&self) -> Option<StepPlan> {
        self.to_promote.values().next().map(|peer| StepPlan {
            promote: Some(*peer),
            ..Default::default()
        })
    }

    fn plan_remove_peer(&self) -> Option<StepPlan> {
        let mut best = None;
        let leaders = self.current_leaders();
        for remove in self.to_remove.values() {
            for &leader in leaders.iter().filter(|l| **l != remove.store_id) {
                let plan = StepPlan {
                    remove: Some(*remove),
                    leader_before_remove: Some(leader),
                    ..Default::default()
                };
                best = self.compare_plan(best, plan);
            }
        }
        best
    }

    fn plan_add_peer(&self) -> Option<StepPlan> {
        let mut best = None;
        let leaders = self.current_leaders();
        for add in self.ready_adds() {
            for &leader in &leaders {
                let plan = StepPlan {
                    add: Some(*add),
                    leader_before_add: Some(leader),
                    ..Default::default()
                };
                best = self.compare_plan(best, plan);
            }
        }
        best
    }

    /// Stores of current peers that may hold the leadership, sorted
    fn current_leaders(&self) -> Vec<u64> {
        self.current_peers
            .values()
            .filter(|p| self.allow_leader(p))
            .map(|p| p.store_id)
            .collect()
    }

    fn allow_leader(&self, peer: &Peer) -> bool {
        if peer.is_learner() {
            return false;
        }
        if peer.store_id == self.current_leader {
            return true;
        }
        let store = match self.cluster.get_store(peer.store_id) {
            Some(store) => store,
            None => return false,
        };
        let filters: [Box<dyn Filter>; 1] = [Box::new(StoreStateFilter::transfer_leader(BUILDER_SCOPE))];
        if !filter_target(&self.opts, &store, &filters) {
            return false;
        }
        self.rules.is_empty()
            || self
                .rules
                .iter()
                .any(|r| r.role.allows_leader() && match_label_constraints(Some(&store), &r.label_constraints))
    }

    // ===== Plan comparison =====

    /// Keep `best` unless `next` wins on the first differing criterion
    fn compare_plan(&self, best: Option<StepPlan>, next: StepPlan) -> Option<StepPlan> {
        let best = match best {
            None => return Some(next),
            Some(best) => best,
        };
        let criteria: [fn(&Self, &StepPlan) -> i64; 6] = [
            Self::prefer_replace_by_nearest,
            Self::prefer_up_store_as_leader,
            Self::prefer_old_peer_as_leader,
            Self::prefer_add_or_promote_target_leader,
            Self::prefer_target_leader,
            Self::prefer_less_leader_transfer,
        ];
        for criterion in criteria {
            let (sb, sn) = (criterion(self, &best), criterion(self, &next));
            if sb > sn {
                return Some(best);
            }
            if sb < sn {
                return Some(next);
            }
        }
        Some(best)
    }

    /// Number of leading location labels two stores share
    fn label_match(&self, x: u64, y: u64) -> i64 {
        let (sx, sy) = match (self.cluster.get_store(x), self.cluster.get_store(y)) {
            (Some(sx), Some(sy)) => (sx, sy),
            _ => return 0,
        };
        let labels = &self.opts.location_labels;
        labels
            .iter()
            .position(|l| sx.get_label_value(l) != sy.get_label_value(l))
            .unwrap_or(labels.len()) as i64
    }

    /// Replace a peer with one close to it in the topology
    fn prefer_replace_by_nearest(&self, p: &StepPlan) -> i64 {
        let remove = match p.remove {
            Some(remove) => remove,
            None => return 0,
        };
        if let Some(add) = p.add {
            self.label_match(add.store_id, remove.store_id)
        } else if let Some(promote) = p.promote {
            self.label_match(promote.store_id, remove.store_id)
        } else {
            0
        }
    }

    /// Avoid sending snapshots from a store that is not up
    fn prefer_up_store_as_leader(&self, p: &StepPlan) -> i64 {
        if p.add.is_none() {
            return 1;
        }
        p.leader_before_add
            .and_then(|s| self.cluster.get_store(s))
            .map(|s| s.is_up() as i64)
            .unwrap_or(0)
    }

    /// Freshly added peers may reject the leadership
    fn prefer_old_peer_as_leader(&self, p: &StepPlan) -> i64 {
        let add_step = |store: Option<u64>| -> i64 {
            store
                .and_then(|s| self.peer_add_step.get(&s))
                .copied()
                .unwrap_or(0) as i64
        };
        let mut score = -add_step(p.leader_before_add);
        if p.add.is_some() && p.add.map(|a| a.store_id) == p.leader_before_remove {
            score -= self.steps.len() as i64;
        } else {
            score -= add_step(p.leader_before_remove);
        }
        score
    }

    fn prefer_add_or_promote_target_leader(&self, p: &StepPlan) -> i64 {
        let target = match self.target_leader {
            Some(target) => target,
            None => return 0,
        };
        let hits = |peer: Option<Peer>| peer.map(|x| x.store_id == target).unwrap_or(false);
        (hits(p.promote) || hits(p.add)) as i64
    }

    fn prefer_target_leader(&self, p: &StepPlan) -> i64 {
        let target = match self.target_leader {
            Some(target) => target,
            None => return 1,
        };
        let hit = match p.leader_before_remove {
            Some(leader) => leader == target,
            None => p.leader_before_add == Some(target),
        };
        hit as i64
    }

    fn prefer_less_leader_transfer(&self, p: &StepPlan) -> i64 {
        let current = self.current_leader;
        let stays = |leader: Option<u64>, with: u64| leader.map(|l| l == with).unwrap_or(true);
        if stays(p.leader_before_add, current) {
            2 + stays(p.leader_before_remove, current) as i64
        } else {
            // Only the add-side leader is set here
            let add_leader = p.leader_before_add.unwrap_or(current);
            stays(p.leader_before_remove, add_leader) as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use shardplan_core::Store;
    use shardplan_placement::{LabelConstraint, LabelConstraintOp, PeerRoleType};

    fn cluster(stores: u64) -> MemoryCluster {
        let cluster = MemoryCluster::with_memory_rules(ScheduleOptions::default()).unwrap();
        for id in 1..=stores {
            cluster.put_store(Store::new(id));
        }
        cluster
    }

    fn region(peers: Vec<Peer>, leader: Peer) -> Region {
        Region::new(1, b"", b"", peers, Some(leader)).with_approximate(10, 100)
    }

    fn three_voters() -> Region {
        let leader = Peer::voter(11, 1);
        region(vec![leader, Peer::voter(12, 2), Peer::voter(13, 3)], leader)
    }

    #[test]
    fn test_add_peer() {
        let c = cluster(4);
        let op = Builder::new("test", &c, &three_voters())
            .add_peer(Peer::voter(0, 4))
            .build(OpKind::empty())
            .unwrap();
        let id = match op.step(0) {
            Some(OpStep::AddLearner { to_store: 4, peer_id }) => *peer_id,
            other => panic!("unexpected step {:?}", other),
        };
        assert_eq!(op.steps()[1], OpStep::PromoteLearner { to_store: 4, peer_id: id });
        assert_eq!(op.len(), 2);
        assert_eq!(op.brief(), "add peer: store [4]");
        assert_eq!(op.kind(), OpKind::REGION);
    }

    #[test]
    fn test_remove_leader_transfers_first() {
        let c = cluster(3);
        let op = Builder::new("test", &c, &three_voters())
            .set_leader(2)
            .remove_peer(1)
            .build(OpKind::empty())
            .unwrap();
        assert_eq!(
            op.steps(),
            &[
                OpStep::TransferLeader { from_store: 1, to_store: 2 },
                OpStep::RemovePeer { from_store: 1 },
            ]
        );
        assert!(op.kind().contains(OpKind::LEADER | OpKind::REGION));
    }

    #[test]
    fn test_remove_target_leader_is_rejected() {
        let c = cluster(3);
        let err = Builder::new("test", &c, &three_voters())
            .remove_peer(1)
            .build(OpKind::empty())
            .unwrap_err();
        assert!(matches!(err, BuildError::RemoveLeader(1)));
    }

    #[test]
    fn test_replace_voter() {
        let c = cluster(4);
        let op = Builder::new("test", &c, &three_voters())
            .remove_peer(3)
            .add_peer(Peer::voter(20, 4))
            .build(OpKind::REPLICA)
            .unwrap();
        assert_eq!(
            op.steps(),
            &[
                OpStep::AddLearner { to_store: 4, peer_id: 20 },
                OpStep::PromoteLearner { to_store: 4, peer_id: 20 },
                OpStep::RemovePeer { from_store: 3 },
            ]
        );
        assert_eq!(op.brief(), "mv peer: store [3] to [4]");
        assert!(op.kind().contains(OpKind::REPLICA | OpKind::REGION));
    }

    #[test]
    fn test_replace_prefers_nearest() {
        let mut opts = ScheduleOptions::default();
        opts.location_labels = vec!["zone".into()];
        let c = MemoryCluster::with_memory_rules(opts).unwrap();
        c.put_store(Store::new(1).with_label("zone", "z1"));
        c.put_store(Store::new(2).with_label("zone", "z2"));
        c.put_store(Store::new(3).with_label("zone", "z3"));
        c.put_store(Store::new(4).with_label("zone", "z3"));
        c.put_store(Store::new(5).with_label("zone", "z2"));

        // 4 sits in the zone of 3, 5 in the zone of 2
        let op = Builder::new("test", &c, &three_voters())
            .remove_peer(2)
            .remove_peer(3)
            .add_peer(Peer::voter(30, 4))
            .add_peer(Peer::voter(31, 5))
            .build(OpKind::empty())
            .unwrap();
        let removes_after_add: Vec<(u64, u64)> = op
            .steps()
            .windows(3)
            .filter_map(|w| match (&w[0], &w[2]) {
                (OpStep::AddLearner { to_store, .. }, OpStep::RemovePeer { from_store }) => Some((*to_store, *from_store)),
                _ => None,
            })
            .collect();
        assert_eq!(removes_after_add, vec![(5, 2), (4, 3)]);
    }

    #[test]
    fn test_promote_learner() {
        let c = cluster(3);
        let leader = Peer::voter(11, 1);
        let r = region(vec![leader, Peer::voter(12, 2), Peer::learner(13, 3)], leader);
        let op = Builder::new("test", &c, &r)
            .promote_learner(3)
            .build(OpKind::empty())
            .unwrap();
        assert_eq!(op.steps(), &[OpStep::PromoteLearner { to_store: 3, peer_id: 13 }]);
        assert_eq!(op.brief(), "promote peer: store [3]");

        let err = Builder::new("test", &c, &r).promote_learner(2).build(OpKind::empty()).unwrap_err();
        assert!(matches!(err, BuildError::NotLearner(2)));
    }

    #[test]
    fn test_demote_voter_gets_new_id() {
        let c = cluster(3);
        let leader = Peer::voter(11, 1);
        let op = Builder::new("test", &c, &three_voters())
            .set_peers(vec![leader, Peer::voter(12, 2), Peer::learner(13, 3)])
            .build(OpKind::empty())
            .unwrap();
        match op.steps() {
            [OpStep::RemovePeer { from_store: 3 }, OpStep::AddLearner { to_store: 3, peer_id }] => {
                assert_ne!(*peer_id, 13)
            }
            steps => panic!("unexpected steps {:?}", steps),
        }
    }

    #[test]
    fn test_transfer_leader_only() {
        let c = cluster(3);
        let op = Builder::new("test", &c, &three_voters())
            .set_leader(3)
            .build(OpKind::empty())
            .unwrap();
        assert_eq!(op.steps(), &[OpStep::TransferLeader { from_store: 1, to_store: 3 }]);
        assert_eq!(op.brief(), "transfer leader: store 1 to 3");
        assert_eq!(op.kind(), OpKind::LEADER);
    }

    #[test]
    fn test_target_leader_not_allowed() {
        let c = cluster(3);
        c.update_store(3, |s| s.blocked = true).unwrap();
        let err = Builder::new("test", &c, &three_voters())
            .set_leader(3)
            .build(OpKind::empty())
            .unwrap_err();
        assert!(matches!(err, BuildError::LeaderNotAllowed(3)));
    }

    #[test]
    fn test_validation_errors() {
        let c = cluster(4);
        let r = three_voters();
        let build = |b: Builder| b.build(OpKind::empty()).unwrap_err();

        assert!(matches!(build(Builder::new("t", &c, &r).add_peer(Peer::voter(0, 2))), BuildError::PeerExists(2)));
        assert!(matches!(build(Builder::new("t", &c, &r).remove_peer(4)), BuildError::PeerNotFound(4)));
        assert!(matches!(build(Builder::new("t", &c, &r).set_leader(4)), BuildError::LeaderNotFound(4)));
        assert!(matches!(
            build(Builder::new("t", &c, &r).set_peers(vec![Peer::learner(0, 4)])),
            BuildError::NoVoter
        ));
        assert!(matches!(build(Builder::new("t", &c, &r)), BuildError::NoStep));

        let mut leaderless = r.clone();
        leaderless.leader = None;
        assert!(matches!(build(Builder::new("t", &c, &leaderless)), BuildError::NoLeader(1)));
    }

    #[test]
    fn test_no_valid_leader_fails() {
        let c = cluster(3);
        // The only other voter cannot lead, so the leader cannot move off store 1
        c.update_store(2, |s| s.blocked = true).unwrap();
        let leader = Peer::voter(11, 1);
        let r = region(vec![leader, Peer::voter(12, 2)], leader);
        let err = Builder::new("t", &c, &r)
            .set_peers(vec![Peer::voter(12, 2)])
            .build(OpKind::empty())
            .unwrap_err();
        assert!(matches!(err, BuildError::EmptyPlan));
    }

    #[test]
    fn test_rules_restrict_leader() {
        let mut opts = ScheduleOptions::default();
        opts.placement_rules_enabled = true;
        let c = MemoryCluster::with_memory_rules(opts).unwrap();
        c.put_store(Store::new(1).with_label("zone", "z1"));
        c.put_store(Store::new(2).with_label("zone", "z1"));
        c.put_store(Store::new(3).with_label("zone", "z2"));
        let rules = c.rule_manager();
        rules
            .set_rule(
                Rule::new("pd", "default", PeerRoleType::Voter, 2)
                    .with_label_constraints(vec![LabelConstraint::new("zone", LabelConstraintOp::In, &["z1"])]),
            )
            .unwrap();
        rules
            .set_rule(
                Rule::new("pd", "z2", PeerRoleType::Follower, 1)
                    .with_label_constraints(vec![LabelConstraint::new("zone", LabelConstraintOp::In, &["z2"])]),
            )
            .unwrap();

        let err = Builder::new("t", &c, &three_voters())
            .set_leader(3)
            .build(OpKind::empty())
            .unwrap_err();
        assert!(matches!(err, BuildError::LeaderNotAllowed(3)));

        let op = Builder::new("t", &c, &three_voters()).set_leader(2).build(OpKind::empty()).unwrap();
        assert_eq!(op.len(), 1);
    }

    #[test]
    fn test_light_weight() {
        let c = cluster(4);
        let op = Builder::new("t", &c, &three_voters())
            .add_peer(Peer::learner(40, 4))
            .enable_light_weight()
            .build(OpKind::empty())
            .unwrap();
        assert_eq!(op.steps(), &[OpStep::AddLightLearner { to_store: 4, peer_id: 40 }]);
    }
}
