//! Rule range index
//!
//! The keyspace is cut at every rule start key and non-empty end key. Each
//! resulting range records the rules overlapping it and the subset to apply
//! after `override` resolution. The index is immutable and rebuilt on every
//! rule change.

use crate::error::{Result, RuleError};
use crate::rule::{prepare_rules_for_apply, sort_rules, Rule};
use shardplan_core::codec::hex_key;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointType {
    Start,
    End,
}

struct SplitPoint {
    typ: PointType,
    key: Vec<u8>,
    rule: Arc<Rule>,
}

/// Rules covering one range of the keyspace
#[derive(Debug, Clone)]
pub struct RangeRules {
    pub start_key: Vec<u8>,
    /// Every overlapping rule, in priority order
    pub rules: Vec<Arc<Rule>>,
    /// Rules left after override resolution
    pub apply_rules: Vec<Arc<Rule>>,
}

/// Range index over all rules
#[derive(Debug, Clone, Default)]
pub struct RuleList {
    ranges: Vec<RangeRules>,
}

impl RuleList {
    /// Build the index; every key must be covered by at least one rule
    pub fn build(rules: &BTreeMap<(String, String), Arc<Rule>>) -> Result<Self> {
        if rules.is_empty() {
            return Err(RuleError::BuildRuleList("no rule left".into()));
        }

        let mut points = Vec::with_capacity(rules.len() * 2);
        for rule in rules.values() {
            points.push(SplitPoint {
                typ: PointType::Start,
                key: rule.start_key.clone(),
                rule: rule.clone(),
            });
            if !rule.end_key.is_empty() {
                points.push(SplitPoint {
                    typ: PointType::End,
                    key: rule.end_key.clone(),
                    rule: rule.clone(),
                });
            }
        }
        points.sort_by(|a, b| a.key.cmp(&b.key));

        if !points[0].key.is_empty() {
            return Err(RuleError::BuildRuleList(format!(
                "no rule for range {{, {}}}",
                hex_key(&points[0].key)
            )));
        }

        let mut ranges = Vec::new();
        let mut active: Vec<Arc<Rule>> = Vec::new();
        for (i, point) in points.iter().enumerate() {
            match point.typ {
                PointType::Start => active.push(point.rule.clone()),
                PointType::End => active.retain(|r| !Arc::ptr_eq(r, &point.rule)),
            }

            let next = points.get(i + 1);
            if next.map(|n| n.key != point.key).unwrap_or(true) {
                if active.is_empty() {
                    let end = next.map(|n| hex_key(&n.key)).unwrap_or_default();
                    return Err(RuleError::BuildRuleList(format!(
                        "no rule for range {{{}, {}}}",
                        hex_key(&point.key),
                        end
                    )));
                }

                let mut sorted = active.clone();
                sort_rules(&mut sorted);
                ranges.push(RangeRules {
                    start_key: point.key.clone(),
                    apply_rules: prepare_rules_for_apply(sorted.clone()),
                    rules: sorted,
                });
            }
        }

        Ok(Self { ranges })
    }

    /// Number of ranges in the index
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Index of the first range whose start key is greater than `key`
    fn upper_bound(&self, key: &[u8]) -> usize {
        self.ranges.partition_point(|r| r.start_key.as_slice() <= key)
    }

    /// Range containing `key`
    pub fn get_range(&self, key: &[u8]) -> Option<&RangeRules> {
        let i = self.upper_bound(key);
        if i == 0 {
            return None;
        }
        self.ranges.get(i - 1)
    }

    /// Every rule overlapping `key`
    pub fn get_rules_by_key(&self, key: &[u8]) -> Vec<Arc<Rule>> {
        self.get_range(key).map(|r| r.rules.clone()).unwrap_or_default()
    }

    /// Rules to apply to a region, empty when the region spans several ranges
    pub fn get_rules_for_apply_region(&self, start: &[u8], end: &[u8]) -> Vec<Arc<Rule>> {
        let i = self.upper_bound(start);
        if let Some(next) = self.ranges.get(i) {
            if end.is_empty() || end > next.start_key.as_slice() {
                return Vec::new();
            }
        }
        if i == 0 {
            return Vec::new();
        }
        self.ranges[i - 1].apply_rules.clone()
    }

    /// Range boundaries strictly inside `(start, end)`
    pub fn get_split_keys(&self, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        let i = self.upper_bound(start);
        self.ranges[i..]
            .iter()
            .take_while(|r| end.is_empty() || r.start_key.as_slice() < end)
            .map(|r| r.start_key.clone())
            .collect()
    }

    pub fn ranges(&self) -> &[RangeRules] {
        &self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::PeerRoleType;

    fn rule_map(rules: Vec<Rule>) -> BTreeMap<(String, String), Arc<Rule>> {
        rules.into_iter().map(|r| (r.key(), Arc::new(r))).collect()
    }

    fn ids(rules: &[Arc<Rule>]) -> Vec<&str> {
        rules.iter().map(|r| r.id.as_str()).collect()
    }

    fn sample() -> RuleList {
        RuleList::build(&rule_map(vec![
            Rule::new("pd", "default", PeerRoleType::Voter, 3),
            Rule::new("pd", "meta", PeerRoleType::Voter, 5)
                .with_range(b"b", b"d")
                .with_index(1)
                .with_override(true),
            Rule::new("tiflash", "learner", PeerRoleType::Learner, 1).with_range(b"c", b"f"),
        ]))
        .unwrap()
    }

    #[test]
    fn test_build_ranges() {
        let rl = sample();
        let starts: Vec<&[u8]> = rl.ranges().iter().map(|r| r.start_key.as_slice()).collect();
        assert_eq!(starts, vec![&b""[..], b"b", b"c", b"d", b"f"]);

        assert_eq!(ids(&rl.get_rules_by_key(b"a")), vec!["default"]);
        assert_eq!(ids(&rl.get_rules_by_key(b"bb")), vec!["default", "meta"]);
        assert_eq!(ids(&rl.get_rules_by_key(b"c")), vec!["default", "meta", "learner"]);
        assert_eq!(ids(&rl.get_rules_by_key(b"zz")), vec!["default"]);
    }

    #[test]
    fn test_apply_rules_respect_override() {
        let rl = sample();
        assert_eq!(ids(&rl.get_rules_for_apply_region(b"b", b"c")), vec!["meta"]);
        assert_eq!(ids(&rl.get_rules_for_apply_region(b"c", b"d")), vec!["meta", "learner"]);
        assert_eq!(ids(&rl.get_rules_for_apply_region(b"f", b"")), vec!["default"]);
    }

    #[test]
    fn test_region_spanning_ranges_gets_no_rules() {
        let rl = sample();
        assert!(rl.get_rules_for_apply_region(b"a", b"c").is_empty());
        assert!(rl.get_rules_for_apply_region(b"e", b"").is_empty());
        assert!(rl.get_rules_for_apply_region(b"", b"").is_empty());
    }

    #[test]
    fn test_split_keys() {
        let rl = sample();
        assert_eq!(rl.get_split_keys(b"a", b"e"), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert_eq!(rl.get_split_keys(b"b", b"c"), Vec::<Vec<u8>>::new());
        assert_eq!(rl.get_split_keys(b"e", b""), vec![b"f".to_vec()]);
    }

    #[test]
    fn test_build_errors() {
        assert!(matches!(
            RuleList::build(&BTreeMap::new()),
            Err(RuleError::BuildRuleList(msg)) if msg == "no rule left"
        ));

        let gap = rule_map(vec![
            Rule::new("g", "1", PeerRoleType::Voter, 1).with_range(b"", b"b"),
            Rule::new("g", "2", PeerRoleType::Voter, 1).with_range(b"c", b""),
        ]);
        assert!(RuleList::build(&gap).is_err());

        let tail = rule_map(vec![Rule::new("g", "1", PeerRoleType::Voter, 1).with_range(b"", b"b")]);
        assert!(RuleList::build(&tail).is_err());

        let head = rule_map(vec![Rule::new("g", "1", PeerRoleType::Voter, 1).with_range(b"a", b"")]);
        assert!(RuleList::build(&head).is_err());
    }
}
