//! Placement rule checker
//!
//! Drives a region toward its placement rules. For the first rule fit that
//! needs work, in rule order:
//! 1. Add a peer when the rule has fewer peers than its count
//! 2. Replace a down or offline peer
//! 3. Fix a peer whose role differs from the rule's
//! 4. Move a peer to a strictly better isolated store
//!
//! When every rule is satisfied, orphan peers are removed one at a time.
//! Regions matching no rule are split at the rule boundaries.

use super::strategy::ReplicaStrategy;
use super::CheckerError;
use crate::cache::TtlCache;
use crate::cluster::ClusterView;
use crate::filter::{filter_target, Filter, StoreStateFilter};
use crate::metrics::record_checker_event;
use crate::operator::{
    create_add_peer_operator, create_move_leader_operator, create_move_peer_operator,
    create_promote_learner_operator, create_remove_peer_operator, create_split_region_operator,
    create_transfer_leader_operator, Builder, OpKind, Operator, PriorityLevel, SplitPolicy,
};
use shardplan_core::{Peer, Region, Store};
use shardplan_placement::{match_label_constraints, PeerRoleType, RegionFit, RuleFit};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const CHECKER_NAME: &str = "rule-checker";

/// How long a region stays on the waiting list
pub const WAITING_LIST_TTL: Duration = Duration::from_secs(3 * 60);

type Result<T> = std::result::Result<T, CheckerError>;

pub struct RuleChecker {
    cluster: Arc<dyn ClusterView>,
    /// Regions for which no suitable store was found
    waiting_list: TtlCache,
}

impl RuleChecker {
    pub fn new(cluster: Arc<dyn ClusterView>) -> Self {
        Self {
            cluster,
            waiting_list: TtlCache::new(WAITING_LIST_TTL),
        }
    }

    /// Regions worth re-checking once stores become available
    pub fn get_waiting_regions(&self) -> Vec<u64> {
        self.waiting_list.ids()
    }

    #[instrument(skip_all, fields(region_id = region.id))]
    pub fn check(&self, region: &Region) -> Option<Operator> {
        if region.leader.is_none() {
            record_checker_event(CHECKER_NAME, "skip-no-leader");
            return None;
        }
        record_checker_event(CHECKER_NAME, "check");

        let fit = self.cluster.fit_region(region);
        if fit.rule_fits.is_empty() {
            return self.fix_range(region);
        }

        match self.fix_region(region, &fit) {
            Ok(op) => {
                if op.is_some() {
                    self.waiting_list.remove(region.id);
                }
                op
            }
            Err(e) => {
                if matches!(e, CheckerError::NoStoreToAdd | CheckerError::NoStoreToReplace(_)) {
                    self.waiting_list.put(region.id);
                }
                debug!(error = %e, "Fail to fix region placement");
                None
            }
        }
    }

    fn fix_region(&self, region: &Region, fit: &RegionFit) -> Result<Option<Operator>> {
        for rule_fit in &fit.rule_fits {
            if let Some(op) = self.fix_rule_peer(region, fit, rule_fit)? {
                return Ok(Some(op));
            }
        }
        self.fix_orphan_peers(region, fit)
    }

    /// Split a region that spans several rule ranges
    fn fix_range(&self, region: &Region) -> Option<Operator> {
        let keys = self
            .cluster
            .rule_manager()
            .get_split_keys(&region.start_key, &region.end_key);
        if keys.is_empty() {
            return None;
        }
        record_checker_event(CHECKER_NAME, "split-range");
        Some(create_split_region_operator(
            "rule-split-region",
            region,
            OpKind::empty(),
            SplitPolicy::UseKey,
            keys,
        ))
    }

    fn fix_rule_peer(&self, region: &Region, fit: &RegionFit, rule_fit: &RuleFit) -> Result<Option<Operator>> {
        if rule_fit.peers.len() < rule_fit.rule.count {
            return self.add_rule_peer(region, rule_fit).map(Some);
        }
        for peer in &rule_fit.peers {
            if self.is_down_peer(region, peer) {
                record_checker_event(CHECKER_NAME, "replace-down");
                return self
                    .replace_rule_peer(region, rule_fit, peer, "replace-rule-down-peer")
                    .map(Some);
            }
            if self.is_offline_peer(peer) {
                record_checker_event(CHECKER_NAME, "replace-offline");
                return self
                    .replace_rule_peer(region, rule_fit, peer, "replace-rule-offline-peer")
                    .map(Some);
            }
        }
        for peer in &rule_fit.peers_with_different_role {
            if let Some(op) = self.fix_loose_match_peer(region, fit, rule_fit, peer)? {
                return Ok(Some(op));
            }
        }
        self.fix_better_location(region, rule_fit)
    }

    fn rule_fit_stores(&self, rule_fit: &RuleFit) -> Vec<Arc<Store>> {
        rule_fit
            .peers
            .iter()
            .filter_map(|p| self.cluster.get_store(p.store_id))
            .collect()
    }

    fn new_rule_peer(rule_fit: &RuleFit, store_id: u64) -> Peer {
        Peer {
            id: 0,
            store_id,
            role: rule_fit.rule.role.peer_role(),
        }
    }

    fn add_rule_peer(&self, region: &Region, rule_fit: &RuleFit) -> Result<Operator> {
        let cluster = self.cluster.as_ref();
        let strategy = ReplicaStrategy::for_rule(CHECKER_NAME, cluster, region, &rule_fit.rule);
        let store = strategy
            .select_store_to_add(&self.rule_fit_stores(rule_fit), Vec::new())
            .ok_or(CheckerError::NoStoreToAdd)?;

        record_checker_event(CHECKER_NAME, "add-rule-peer");
        let peer = Self::new_rule_peer(rule_fit, store);
        let mut op = create_add_peer_operator("add-rule-peer", cluster, region, peer, OpKind::REPLICA)?;
        op.set_priority_level(PriorityLevel::High);
        Ok(op)
    }

    fn replace_rule_peer(
        &self,
        region: &Region,
        rule_fit: &RuleFit,
        peer: &Peer,
        desc: &'static str,
    ) -> Result<Operator> {
        let cluster = self.cluster.as_ref();
        let strategy = ReplicaStrategy::for_rule(CHECKER_NAME, cluster, region, &rule_fit.rule);
        let store = strategy
            .select_store_to_replace(&self.rule_fit_stores(rule_fit), peer.store_id)
            .ok_or(CheckerError::NoStoreToReplace(peer.store_id))?;

        let new_peer = Self::new_rule_peer(rule_fit, store);
        let mut op = self.move_peer(desc, region, peer.store_id, new_peer)?;
        op.set_priority_level(PriorityLevel::High);
        Ok(op)
    }

    /// Move a peer, handing over the leadership if it sits on `old_store`
    fn move_peer(&self, desc: &str, region: &Region, old_store: u64, new_peer: Peer) -> Result<Operator> {
        let cluster = self.cluster.as_ref();
        let op = if region.leader_store_id() == Some(old_store) {
            create_move_leader_operator(desc, cluster, region, OpKind::REPLICA, old_store, new_peer)?
        } else {
            create_move_peer_operator(desc, cluster, region, OpKind::REPLICA, old_store, new_peer)?
        };
        Ok(op)
    }

    fn fix_loose_match_peer(
        &self,
        region: &Region,
        fit: &RegionFit,
        rule_fit: &RuleFit,
        peer: &Peer,
    ) -> Result<Option<Operator>> {
        let cluster = self.cluster.as_ref();
        let role = rule_fit.rule.role;

        if peer.is_learner() && role != PeerRoleType::Learner {
            record_checker_event(CHECKER_NAME, "fix-peer-role");
            return Ok(Some(create_promote_learner_operator("fix-peer-role", cluster, region, *peer)?));
        }

        let leader = match region.leader {
            Some(leader) => leader,
            None => return Ok(None),
        };
        if leader.id != peer.id && role == PeerRoleType::Leader {
            if !self.allow_leader(fit, peer) {
                return Err(CheckerError::PeerCannotBeLeader(peer.store_id));
            }
            record_checker_event(CHECKER_NAME, "fix-leader-role");
            let op = create_transfer_leader_operator(
                "fix-leader-role",
                cluster,
                region,
                peer.store_id,
                OpKind::empty(),
            )?;
            return Ok(Some(op));
        }
        if leader.id == peer.id && role == PeerRoleType::Follower {
            let target = region
                .peers
                .iter()
                .find(|p| p.id != peer.id && self.allow_leader(fit, p))
                .ok_or(CheckerError::NoNewLeader)?;
            record_checker_event(CHECKER_NAME, "fix-follower-role");
            let op = create_transfer_leader_operator(
                "fix-follower-role",
                cluster,
                region,
                target.store_id,
                OpKind::empty(),
            )?;
            return Ok(Some(op));
        }
        Ok(None)
    }

    fn fix_better_location(&self, region: &Region, rule_fit: &RuleFit) -> Result<Option<Operator>> {
        if rule_fit.rule.location_labels.is_empty() || rule_fit.rule.count <= 1 {
            return Ok(None);
        }
        let strategy = ReplicaStrategy::for_rule(CHECKER_NAME, self.cluster.as_ref(), region, &rule_fit.rule);
        let stores = self.rule_fit_stores(rule_fit);
        let old_store = match strategy.select_store_to_remove(&stores) {
            Some(store) => store,
            None => return Ok(None),
        };
        let new_store = match strategy.select_store_to_improve(&stores, old_store) {
            Some(store) => store,
            None => {
                debug!(old_store, "No replacement store for a better location");
                return Ok(None);
            }
        };

        record_checker_event(CHECKER_NAME, "move-to-better-location");
        let new_peer = Self::new_rule_peer(rule_fit, new_store);
        self.move_peer("move-to-better-location", region, old_store, new_peer)
            .map(Some)
    }

    fn fix_orphan_peers(&self, region: &Region, fit: &RegionFit) -> Result<Option<Operator>> {
        let orphan = match fit.orphan_peers.first() {
            Some(peer) => *peer,
            None => return Ok(None),
        };
        if !fit.rule_fits.iter().all(|rf| rf.is_satisfied()) {
            record_checker_event(CHECKER_NAME, "skip-remove-orphan-peer");
            return Ok(None);
        }

        record_checker_event(CHECKER_NAME, "remove-orphan-peer");
        let cluster = self.cluster.as_ref();
        if region.leader_store_id() == Some(orphan.store_id) {
            // The leader has to move to a peer some rule lets lead
            let target = region
                .peers
                .iter()
                .find(|p| p.id != orphan.id && self.allow_leader(fit, p))
                .ok_or(CheckerError::NoNewLeader)?;
            let op = Builder::new("remove-orphan-peer", cluster, region)
                .set_leader(target.store_id)
                .remove_peer(orphan.store_id)
                .build(OpKind::empty())?;
            return Ok(Some(op));
        }
        let op = create_remove_peer_operator("remove-orphan-peer", cluster, OpKind::empty(), region, orphan.store_id)?;
        Ok(Some(op))
    }

    fn is_down_peer(&self, region: &Region, peer: &Peer) -> bool {
        let max_down_time = self.cluster.options().max_store_down_time();
        region
            .down_peers
            .iter()
            .filter(|d| d.peer.id == peer.id)
            .any(|d| match self.cluster.get_store(peer.store_id) {
                None => {
                    warn!(store_id = peer.store_id, "Lost the store of a down peer");
                    false
                }
                Some(store) => store.down_time() >= max_down_time && d.down_seconds >= max_down_time.as_secs(),
            })
    }

    fn is_offline_peer(&self, peer: &Peer) -> bool {
        match self.cluster.get_store(peer.store_id) {
            None => {
                warn!(store_id = peer.store_id, "Lost the store of a peer");
                false
            }
            Some(store) => !store.is_up(),
        }
    }

    /// Voter on a healthy store matched by a rule that allows leaders
    fn allow_leader(&self, fit: &RegionFit, peer: &Peer) -> bool {
        if peer.is_learner() {
            return false;
        }
        let store = match self.cluster.get_store(peer.store_id) {
            Some(store) => store,
            None => return false,
        };
        let filters: [Box<dyn Filter>; 1] = [Box::new(StoreStateFilter::transfer_leader(CHECKER_NAME))];
        if !filter_target(&self.cluster.options(), &store, &filters) {
            return false;
        }
        fit.rule_fits.iter().any(|rf| {
            rf.rule.role.allows_leader() && match_label_constraints(Some(&store), &rf.rule.label_constraints)
        })
    }
}
