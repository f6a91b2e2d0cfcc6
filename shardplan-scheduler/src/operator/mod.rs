//! Operators
//!
//! An operator is an ordered, immutable list of steps for one region plus
//! a status tracked through [`status::StatusTracker`]. The executor starts
//! it, feeds every fresh region heartbeat into [`Operator::check`] and sends
//! out the step it returns, until the operator succeeds or times out.
//!
//! Operators are built by [`builder::Builder`] or by the factories in
//! [`create`].

pub mod builder;
pub mod create;
pub mod influence;
pub mod kind;
pub mod status;
pub mod step;

pub use builder::{BuildError, Builder};
pub use create::*;
pub use influence::{OpInfluence, StoreInfluence};
pub use kind::{OpKind, ParseOpKindError};
pub use status::{is_valid_transition, OpStatus, StatusTracker};
pub use step::{OpStep, SplitPolicy};

use chrono::{DateTime, TimeZone, Utc};
use shardplan_core::{Region, RegionEpoch};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::metrics::record_steps_finished;

/// How long a leader-only operator may run
pub const LEADER_OPERATOR_WAIT_TIME: Duration = Duration::from_secs(10);

/// How long an operator that moves data may run
pub const REGION_OPERATOR_WAIT_TIME: Duration = Duration::from_secs(10 * 60);

/// How long a created operator may wait before it starts
pub const OPERATOR_EXPIRE_TIME: Duration = Duration::from_secs(3);

/// Scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PriorityLevel {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// One finished step, as reported by [`Operator::history`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpHistory {
    pub finish_time: DateTime<Utc>,
    pub from_store: u64,
    pub to_store: u64,
    pub kind: OpKind,
}

/// Ordered plan of steps for one region
#[derive(Debug)]
pub struct Operator {
    desc: String,
    brief: String,
    region_id: u64,
    region_epoch: RegionEpoch,
    kind: OpKind,
    steps: Vec<OpStep>,
    current_step: AtomicUsize,
    /// Unix micros at which each step was observed finished
    step_times: Vec<AtomicI64>,
    status: StatusTracker,
    level: PriorityLevel,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        brief: impl Into<String>,
        region_id: u64,
        region_epoch: RegionEpoch,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        let level = if kind.contains(OpKind::ADMIN) {
            PriorityLevel::High
        } else {
            PriorityLevel::Normal
        };
        let step_times = steps.iter().map(|_| AtomicI64::new(0)).collect();
        Self {
            desc: desc.into(),
            brief: brief.into(),
            region_id,
            region_epoch,
            kind,
            steps,
            current_step: AtomicUsize::new(0),
            step_times,
            status: StatusTracker::new(),
            level,
        }
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn set_desc(&mut self, desc: impl Into<String>) {
        self.desc = desc.into();
    }

    pub fn brief(&self) -> &str {
        &self.brief
    }

    /// Add kind flags
    pub fn attach_kind(&mut self, kind: OpKind) {
        self.kind |= kind;
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn region_epoch(&self) -> RegionEpoch {
        self.region_epoch
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, i: usize) -> Option<&OpStep> {
        self.steps.get(i)
    }

    pub fn steps(&self) -> &[OpStep] {
        &self.steps
    }

    /// Index of the first unfinished step
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> OpStatus {
        self.status.status()
    }

    pub fn priority_level(&self) -> PriorityLevel {
        self.level
    }

    pub fn set_priority_level(&mut self, level: PriorityLevel) {
        self.level = level;
    }

    /// Move `Created -> Started`
    pub fn start(&self) -> bool {
        self.status.to(OpStatus::Started)
    }

    pub fn has_started(&self) -> bool {
        self.status.reach_time_of(OpStatus::Started).is_some()
    }

    pub fn cancel(&self) -> bool {
        self.status.to(OpStatus::Canceled)
    }

    /// Mark as superseded by a newer operator
    pub fn replace(&self) -> bool {
        self.status.to(OpStatus::Replaced)
    }

    pub fn is_end(&self) -> bool {
        self.status.is_end()
    }

    /// Advance past finished steps and return the next step to send.
    ///
    /// Returns `None` once every step finished or the operator ended. A
    /// timeout check runs afterwards, which also records success.
    pub fn check(&self, region: &Region) -> Option<&OpStep> {
        if self.is_end() {
            return None;
        }
        let next = self.advance(region);
        self.check_timeout();
        next
    }

    fn advance(&self, region: &Region) -> Option<&OpStep> {
        let start = self.current_step();
        for i in start..self.steps.len() {
            if self.steps[i].is_finish(region) {
                self.step_times[i].store(Utc::now().timestamp_micros(), Ordering::SeqCst);
                self.current_step.store(i + 1, Ordering::SeqCst);
            } else {
                record_steps_finished((i - start) as u64);
                return Some(&self.steps[i]);
            }
        }
        record_steps_finished((self.steps.len() - start) as u64);
        None
    }

    /// Move to `Success` when every step finished
    pub fn check_success(&self) -> bool {
        if self.current_step() >= self.steps.len() {
            return self.status.to(OpStatus::Success);
        }
        false
    }

    /// Move a started operator to `Timeout` once its wait time elapsed
    pub fn check_timeout(&self) -> bool {
        if self.check_success() {
            return false;
        }
        self.status.check_timeout(self.wait_time())
    }

    /// Move a created operator to `Expired` once it waited too long
    pub fn check_expired(&self) -> bool {
        self.status.check_expired(OPERATOR_EXPIRE_TIME)
    }

    fn wait_time(&self) -> Duration {
        if self.kind.contains(OpKind::REGION) {
            REGION_OPERATOR_WAIT_TIME
        } else {
            LEADER_OPERATOR_WAIT_TIME
        }
    }

    /// Conf changes already visible in the region, up to the current step
    pub fn conf_ver_changed(&self, region: &Region) -> u64 {
        if self.steps.is_empty() {
            return 0;
        }
        let current = self.current_step().min(self.steps.len() - 1);
        self.steps[..=current]
            .iter()
            .map(|s| s.conf_ver_changed(region))
            .sum()
    }

    /// Influence of every step
    pub fn total_influence(&self, inf: &mut OpInfluence, region: &Region) {
        for step in &self.steps {
            step.influence(inf, region);
        }
    }

    /// Influence of the steps not finished yet
    pub fn unfinished_influence(&self, inf: &mut OpInfluence, region: &Region) {
        for step in &self.steps[self.current_step().min(self.steps.len())..] {
            step.influence(inf, region);
        }
    }

    /// Influence of the operator while it is running
    pub fn influence(&self, inf: &mut OpInfluence, region: &Region) {
        if !self.is_end() {
            self.unfinished_influence(inf, region);
        }
    }

    /// Time since creation
    pub fn elapsed_time(&self) -> Duration {
        self.status.since(OpStatus::Created)
    }

    /// Time since start, zero if not started
    pub fn running_time(&self) -> Duration {
        if self.has_started() {
            self.status.since(OpStatus::Started)
        } else {
            Duration::ZERO
        }
    }

    pub fn get_reach_time_of(&self, status: OpStatus) -> Option<DateTime<Utc>> {
        self.status.reach_time_of(status)
    }

    /// Peer and leader movements of the finished steps
    pub fn history(&self) -> Vec<OpHistory> {
        let finished = self.current_step().min(self.steps.len());
        let mut histories = Vec::new();
        for (step, time) in self.steps[..finished].iter().zip(&self.step_times) {
            let finish_time = match Utc.timestamp_micros(time.load(Ordering::SeqCst)).single() {
                Some(t) => t,
                None => continue,
            };
            let (from_store, to_store, kind) = match step {
                OpStep::TransferLeader { from_store, to_store } => (*from_store, *to_store, OpKind::LEADER),
                OpStep::AddLearner { to_store, .. } | OpStep::AddLightLearner { to_store, .. } => {
                    (0, *to_store, OpKind::REGION)
                }
                OpStep::RemovePeer { from_store } => (*from_store, 0, OpKind::REGION),
                _ => continue,
            };
            histories.push(OpHistory {
                finish_time,
                from_store,
                to_store,
                kind,
            });
        }
        histories
    }

    #[cfg(test)]
    pub(crate) fn status_tracker(&self) -> &StatusTracker {
        &self.status
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(
            f,
            "{} {{{}}} (kind:{}, region:{}({},{}), status:{}, currentStep:{}, steps:[{}])",
            self.desc,
            self.brief,
            self.kind,
            self.region_id,
            self.region_epoch.version,
            self.region_epoch.conf_ver,
            self.status(),
            self.current_step(),
            steps.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardplan_core::Peer;

    fn region() -> Region {
        let leader = Peer::voter(11, 1);
        Region::new(1, b"", b"", vec![leader, Peer::voter(12, 2)], Some(leader)).with_approximate(30, 300)
    }

    fn move_op() -> Operator {
        Operator::new(
            "test",
            "mv peer: store [2] to [3]",
            1,
            RegionEpoch::default(),
            OpKind::REGION,
            vec![
                OpStep::AddLearner { to_store: 3, peer_id: 13 },
                OpStep::PromoteLearner { to_store: 3, peer_id: 13 },
                OpStep::RemovePeer { from_store: 2 },
            ],
        )
    }

    #[test]
    fn test_check_walks_steps() {
        let op = move_op();
        assert!(op.start());

        let mut r = region();
        assert_eq!(op.check(&r), Some(&OpStep::AddLearner { to_store: 3, peer_id: 13 }));
        assert_eq!(op.current_step(), 0);

        r.peers.push(Peer::learner(13, 3));
        assert_eq!(op.check(&r), Some(&OpStep::PromoteLearner { to_store: 3, peer_id: 13 }));
        assert_eq!(op.conf_ver_changed(&r), 1);

        r.peers.retain(|p| p.store_id != 3);
        r.peers.push(Peer::voter(13, 3));
        r.peers.retain(|p| p.store_id != 2);
        assert_eq!(op.check(&r), None);
        assert_eq!(op.status(), OpStatus::Success);
        assert_eq!(op.check(&r), None);

        let history = op.history();
        assert_eq!(history.len(), 2);
        assert_eq!((history[0].to_store, history[0].kind), (3, OpKind::REGION));
        assert_eq!(history[1].from_store, 2);
    }

    #[test]
    fn test_check_timeout_uses_kind_wait_time() {
        let leader_op = Operator::new(
            "transfer",
            "",
            1,
            RegionEpoch::default(),
            OpKind::LEADER,
            vec![OpStep::TransferLeader { from_store: 1, to_store: 2 }],
        );
        assert!(leader_op.start());
        leader_op
            .status_tracker()
            .shift_reach_time(OpStatus::Started, Duration::from_secs(11));
        assert!(leader_op.check(&region()).is_some());
        assert_eq!(leader_op.status(), OpStatus::Timeout);

        let region_op = move_op();
        assert!(region_op.start());
        region_op
            .status_tracker()
            .shift_reach_time(OpStatus::Started, Duration::from_secs(11));
        assert!(!region_op.check_timeout());
        assert_eq!(region_op.status(), OpStatus::Started);
    }

    #[test]
    fn test_check_expired() {
        let op = move_op();
        assert!(!op.check_expired());
        op.status_tracker()
            .shift_reach_time(OpStatus::Created, OPERATOR_EXPIRE_TIME + Duration::from_secs(1));
        assert!(op.check_expired());
        assert!(!op.start());
        assert!(op.check(&region()).is_none());
    }

    #[test]
    fn test_influence_split() {
        let op = move_op();
        let r = region();
        let mut total = OpInfluence::new();
        op.total_influence(&mut total, &r);
        assert_eq!(total.get(3).unwrap().region_count, 1);
        assert_eq!(total.get(2).unwrap().region_count, -1);

        let mut with_learner = r.clone();
        with_learner.peers.push(Peer::learner(13, 3));
        op.start();
        op.check(&with_learner);

        let mut unfinished = OpInfluence::new();
        op.unfinished_influence(&mut unfinished, &r);
        assert!(unfinished.get(3).is_none());
        assert_eq!(unfinished.get(2).unwrap().region_count, -1);
    }

    #[test]
    fn test_admin_priority_and_display() {
        let mut op = Operator::new(
            "admin-op",
            "rm peer: store [2]",
            7,
            RegionEpoch { conf_ver: 3, version: 4 },
            OpKind::ADMIN | OpKind::REGION,
            vec![OpStep::RemovePeer { from_store: 2 }],
        );
        assert_eq!(op.priority_level(), PriorityLevel::High);
        op.set_priority_level(PriorityLevel::Urgent);
        op.attach_kind(OpKind::REPLICA);
        op.set_desc("admin-remove");
        assert_eq!(
            op.to_string(),
            "admin-remove {rm peer: store [2]} (kind:region,admin,replica, region:7(4,3), status:CREATED, currentStep:0, steps:[remove peer on store 2])"
        );
        assert!(op.cancel());
        assert!(op.is_end());
        assert!(!op.replace());
    }
}
