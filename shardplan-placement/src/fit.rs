//! Region fitting
//!
//! Matches the peers of a region against the rules that apply to it. Rules
//! are processed in priority order; each takes the best subset of the peers
//! not yet claimed. Whatever is left becomes an orphan.
//!
//! Subset quality, in order:
//! 1. More peers
//! 2. Fewer peers that need a role change
//! 3. Higher isolation level over the rule's location labels

use crate::label_constraint::match_label_constraints;
use crate::rule::{PeerRoleType, Rule};
use shardplan_core::{Peer, Region, Store, StoreSet};
use std::cmp::Ordering;
use std::sync::Arc;

/// Peers assigned to one rule
#[derive(Debug, Clone)]
pub struct RuleFit {
    pub rule: Arc<Rule>,
    /// Peers claimed by the rule, sorted by peer id
    pub peers: Vec<Peer>,
    /// Claimed peers whose current role differs from the rule's role
    pub peers_with_different_role: Vec<Peer>,
    /// Location diversity of `peers`
    pub isolation_level: usize,
}

impl RuleFit {
    /// Exactly `count` peers, all in the right role
    pub fn is_satisfied(&self) -> bool {
        self.peers.len() == self.rule.count && self.peers_with_different_role.is_empty()
    }

    pub fn contains_peer(&self, peer_id: u64) -> bool {
        self.peers.iter().any(|p| p.id == peer_id)
    }
}

/// Assignment of a region's peers to rules
#[derive(Debug, Clone, Default)]
pub struct RegionFit {
    pub rule_fits: Vec<RuleFit>,
    pub orphan_peers: Vec<Peer>,
}

impl RegionFit {
    pub fn is_satisfied(&self) -> bool {
        !self.rule_fits.is_empty()
            && self.rule_fits.iter().all(RuleFit::is_satisfied)
            && self.orphan_peers.is_empty()
    }

    /// Rule fit that claimed the peer
    pub fn get_rule_fit(&self, peer_id: u64) -> Option<&RuleFit> {
        self.rule_fits.iter().find(|rf| rf.contains_peer(peer_id))
    }

    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rule_fits.iter().map(|rf| rf.rule.clone()).collect()
    }
}

#[derive(Clone)]
struct FitPeer {
    peer: Peer,
    store: Option<Arc<Store>>,
    is_leader: bool,
}

impl FitPeer {
    /// The peer can reach the role without being re-created
    fn match_role_loose(&self, role: PeerRoleType) -> bool {
        role != PeerRoleType::Learner || self.peer.is_learner()
    }

    /// The peer already has the role
    fn match_role_strict(&self, role: PeerRoleType) -> bool {
        match role {
            PeerRoleType::Voter => !self.peer.is_learner(),
            PeerRoleType::Leader => self.is_leader,
            PeerRoleType::Follower => !self.peer.is_learner() && !self.is_leader,
            PeerRoleType::Learner => self.peer.is_learner(),
        }
    }
}

/// Assign the region's peers to `rules`
pub fn fit_region<S: StoreSet + ?Sized>(stores: &S, region: &Region, rules: &[Arc<Rule>]) -> RegionFit {
    let leader_id = region.leader.map(|l| l.id);
    let mut peers: Vec<FitPeer> = region
        .peers
        .iter()
        .map(|p| FitPeer {
            peer: *p,
            store: stores.get_store(p.store_id),
            is_leader: Some(p.id) == leader_id,
        })
        .collect();
    peers.sort_by_key(|p| p.peer.id);

    let mut fit = RegionFit::default();
    for rule in rules {
        let rule_fit = fit_rule(&peers, rule);
        peers.retain(|p| !rule_fit.contains_peer(p.peer.id));
        fit.rule_fits.push(rule_fit);
    }
    fit.orphan_peers = peers.into_iter().map(|p| p.peer).collect();
    fit
}

fn fit_rule(peers: &[FitPeer], rule: &Arc<Rule>) -> RuleFit {
    let candidates: Vec<&FitPeer> = peers
        .iter()
        .filter(|p| match_label_constraints(p.store.as_deref(), &rule.label_constraints))
        .filter(|p| p.match_role_loose(rule.role))
        .collect();

    if candidates.len() <= rule.count {
        return new_rule_fit(rule, &candidates);
    }

    let mut best: Option<RuleFit> = None;
    for_each_combination(candidates.len(), rule.count, |indexes| {
        let selected: Vec<&FitPeer> = indexes.iter().map(|&i| candidates[i]).collect();
        let rule_fit = new_rule_fit(rule, &selected);
        let better = best
            .as_ref()
            .map(|b| compare_rule_fit(&rule_fit, b) == Ordering::Greater)
            .unwrap_or(true);
        if better {
            best = Some(rule_fit);
        }
    });
    best.unwrap_or_else(|| new_rule_fit(rule, &[]))
}

fn new_rule_fit(rule: &Arc<Rule>, peers: &[&FitPeer]) -> RuleFit {
    let stores: Vec<Option<&Store>> = peers.iter().map(|p| p.store.as_deref()).collect();
    RuleFit {
        rule: rule.clone(),
        peers: peers.iter().map(|p| p.peer).collect(),
        peers_with_different_role: peers
            .iter()
            .filter(|p| !p.match_role_strict(rule.role))
            .map(|p| p.peer)
            .collect(),
        isolation_level: isolation_level(&stores, &rule.location_labels),
    }
}

/// Visit every `k`-subset of `0..n` in lexicographic order
fn for_each_combination<F: FnMut(&[usize])>(n: usize, k: usize, mut f: F) {
    if k > n {
        return;
    }
    let mut indexes: Vec<usize> = (0..k).collect();
    loop {
        f(&indexes);

        // Rightmost index that can still move forward
        let Some(pos) = (0..k).rev().find(|&i| indexes[i] != i + n - k) else {
            return;
        };
        indexes[pos] += 1;
        for i in pos + 1..k {
            indexes[i] = indexes[i - 1] + 1;
        }
    }
}

/// Isolation level of a set of stores.
///
/// For two stores it is `len(labels) - i` where `i` is the first label whose
/// values differ, or 0 when every label matches. Larger sets take the minimum
/// over all pairs. Fewer than two stores are fully isolated.
pub fn isolation_level(stores: &[Option<&Store>], labels: &[String]) -> usize {
    if labels.is_empty() {
        return 0;
    }
    if stores.len() < 2 {
        return labels.len();
    }

    let mut level = labels.len();
    for i in 0..stores.len() {
        for j in i + 1..stores.len() {
            level = level.min(pair_isolation_level(stores[i], stores[j], labels));
        }
    }
    level
}

fn pair_isolation_level(a: Option<&Store>, b: Option<&Store>, labels: &[String]) -> usize {
    let value = |s: Option<&Store>, key: &str| s.map(|s| s.get_label_value(key).to_string()).unwrap_or_default();
    labels
        .iter()
        .position(|key| value(a, key) != value(b, key))
        .map(|i| labels.len() - i)
        .unwrap_or(0)
}

/// Compare two fits of the same rule
pub fn compare_rule_fit(a: &RuleFit, b: &RuleFit) -> Ordering {
    a.peers
        .len()
        .cmp(&b.peers.len())
        .then(b.peers_with_different_role.len().cmp(&a.peers_with_different_role.len()))
        .then(a.isolation_level.cmp(&b.isolation_level))
}

/// Compare two fits of the same region; `Greater` means `a` is better
pub fn compare_region_fit(a: &RegionFit, b: &RegionFit) -> Ordering {
    for (ra, rb) in a.rule_fits.iter().zip(b.rule_fits.iter()) {
        let ord = compare_rule_fit(ra, rb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    b.orphan_peers.len().cmp(&a.orphan_peers.len())
}
