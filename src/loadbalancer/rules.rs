//! Set algebra over security group ingress rules
//!
//! The provider stores rules in a compound form: one permission may list many
//! CIDR ranges or peer groups. Comparisons are only meaningful after ungrouping,
//! where every element has exactly one peer.

use std::collections::BTreeSet;

use crate::cloud::IpPermission;

/// Prefix of the description marker put on rules this controller owns
pub const RULE_MARKER_PREFIX: &str = "kubernetes.io/rule/";
/// Marker for client traffic rules on a load balancer's primary group
pub const CLIENT_RULE_MARKER: &str = "kubernetes.io/rule/client";
/// Marker for the path-MTU discovery ICMP rules
pub const MTU_RULE_MARKER: &str = "kubernetes.io/rule/mtu";

/// Description marker for a rule owned on behalf of a load balancer
pub fn rule_description(marker: &str, load_balancer_name: &str) -> String {
    format!("{marker}={load_balancer_name}")
}

/// Description of a single-peer rule, if it has one
pub fn peer_description(permission: &IpPermission) -> Option<&str> {
    permission
        .ip_ranges
        .iter()
        .find_map(|r| r.description.as_deref())
        .or_else(|| {
            permission
                .user_id_group_pairs
                .iter()
                .find_map(|p| p.description.as_deref())
        })
}

/// True if the rule carries one of our markers for the given load balancer
pub fn is_owned_by(permission: &IpPermission, load_balancer_name: &str) -> bool {
    peer_description(permission)
        .and_then(|d| d.strip_prefix(RULE_MARKER_PREFIX))
        .and_then(|rest| rest.split_once('='))
        .map(|(_, owner)| owner == load_balancer_name)
        .unwrap_or(false)
}

/// A set of ingress rules with value semantics
///
/// Equality is defined over the ungrouped form, so a compound rule equals the
/// set of its single-peer expansions.
#[derive(Clone, Debug, Default)]
pub struct IpPermissionSet(BTreeSet<IpPermission>);

impl IpPermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: IpPermission) {
        self.0.insert(permission);
    }

    pub fn delete(&mut self, permission: &IpPermission) {
        self.0.remove(permission);
    }

    pub fn contains(&self, permission: &IpPermission) -> bool {
        self.0.contains(permission)
    }

    /// Remove every element matching the predicate
    pub fn delete_if<F>(&mut self, predicate: F)
    where
        F: Fn(&IpPermission) -> bool,
    {
        self.0.retain(|p| !predicate(p));
    }

    pub fn union(&self, other: &IpPermissionSet) -> IpPermissionSet {
        IpPermissionSet(self.0.union(&other.0).cloned().collect())
    }

    /// Elements of `self` that are not in `other`
    pub fn difference(&self, other: &IpPermissionSet) -> IpPermissionSet {
        IpPermissionSet(self.0.difference(&other.0).cloned().collect())
    }

    /// Expand every rule into single-peer rules; rules without peers vanish
    pub fn ungroup(&self) -> IpPermissionSet {
        let mut out = BTreeSet::new();
        for permission in &self.0 {
            for range in &permission.ip_ranges {
                out.insert(IpPermission {
                    ip_ranges: vec![range.clone()],
                    user_id_group_pairs: Vec::new(),
                    ..permission.clone()
                });
            }
            for pair in &permission.user_id_group_pairs {
                out.insert(IpPermission {
                    ip_ranges: Vec::new(),
                    user_id_group_pairs: vec![pair.clone()],
                    ..permission.clone()
                });
            }
        }
        IpPermissionSet(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpPermission> {
        self.0.iter()
    }

    /// Elements in a stable order, ready for an API request
    pub fn list(&self) -> Vec<IpPermission> {
        self.0.iter().cloned().collect()
    }
}

impl PartialEq for IpPermissionSet {
    fn eq(&self, other: &Self) -> bool {
        self.ungroup().0 == other.ungroup().0
    }
}

impl Eq for IpPermissionSet {}

impl FromIterator<IpPermission> for IpPermissionSet {
    fn from_iter<I: IntoIterator<Item = IpPermission>>(iter: I) -> Self {
        IpPermissionSet(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a IpPermission> for IpPermissionSet {
    fn from_iter<I: IntoIterator<Item = &'a IpPermission>>(iter: I) -> Self {
        IpPermissionSet(iter.into_iter().cloned().collect())
    }
}

impl IntoIterator for IpPermissionSet {
    type Item = IpPermission;
    type IntoIter = std::collections::btree_set::IntoIter<IpPermission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{IpRange, UserIdGroupPair};

    fn tcp(port: i32, cidrs: &[&str]) -> IpPermission {
        IpPermission {
            ip_protocol: "tcp".into(),
            from_port: Some(port),
            to_port: Some(port),
            ip_ranges: cidrs.iter().map(|c| IpRange::new(*c)).collect(),
            user_id_group_pairs: Vec::new(),
        }
    }

    #[test]
    fn test_ungroup_expands_compound_rules() {
        let mut group_rule = tcp(443, &["10.0.0.0/8"]);
        group_rule.user_id_group_pairs.push(UserIdGroupPair::group("sg-1"));

        let set: IpPermissionSet = [tcp(80, &["1.1.1.1/32", "2.2.2.2/32"]), group_rule]
            .into_iter()
            .collect();
        let ungrouped = set.ungroup();

        assert_eq!(ungrouped.len(), 4);
        for rule in ungrouped.iter() {
            assert_eq!(rule.ip_ranges.len() + rule.user_id_group_pairs.len(), 1);
        }
    }

    #[test]
    fn test_ungroup_is_idempotent() {
        let set: IpPermissionSet = [
            tcp(80, &["1.1.1.1/32", "2.2.2.2/32"]),
            tcp(81, &["3.3.3.3/32"]),
        ]
        .into_iter()
        .collect();
        let once = set.ungroup();
        let twice = once.ungroup();
        assert_eq!(once.list(), twice.list());
    }

    #[test]
    fn test_rule_without_peers_is_dropped() {
        let set: IpPermissionSet = [tcp(80, &[])].into_iter().collect();
        assert!(set.ungroup().is_empty());
    }

    #[test]
    fn test_difference_removes_exactly_extra_peer() {
        let actual: IpPermissionSet = [tcp(80, &["A", "B"])].into_iter().collect();
        let desired: IpPermissionSet = [tcp(80, &["A"])].into_iter().collect();

        let remove = actual.ungroup().difference(&desired.ungroup());
        let add = desired.ungroup().difference(&actual.ungroup());

        assert_eq!(remove.list(), vec![tcp(80, &["B"])]);
        assert!(add.is_empty());
    }

    #[test]
    fn test_differences_are_disjoint_and_empty_iff_equal() {
        let a: IpPermissionSet = [tcp(80, &["A", "B"]), tcp(443, &["A"])].into_iter().collect();
        let b: IpPermissionSet = [tcp(80, &["B"]), tcp(8080, &["C"])].into_iter().collect();

        let a_minus_b = a.ungroup().difference(&b.ungroup());
        let b_minus_a = b.ungroup().difference(&a.ungroup());
        assert!(a_minus_b.iter().all(|p| !b_minus_a.contains(p)));
        assert!(a != b);

        let same: IpPermissionSet = [tcp(80, &["B", "A"]), tcp(443, &["A"])].into_iter().collect();
        assert!(a.ungroup().difference(&same.ungroup()).is_empty());
        assert!(same.ungroup().difference(&a.ungroup()).is_empty());
        assert_eq!(a, same);
    }

    #[test]
    fn test_empty_sets_are_equal() {
        assert_eq!(IpPermissionSet::new(), IpPermissionSet::new());
    }

    #[test]
    fn test_compound_equals_ungrouped() {
        let compound: IpPermissionSet = [tcp(80, &["A", "B"])].into_iter().collect();
        let split: IpPermissionSet = [tcp(80, &["A"]), tcp(80, &["B"])].into_iter().collect();
        assert_eq!(compound, split);
    }

    #[test]
    fn test_union_insert_delete() {
        let mut a: IpPermissionSet = [tcp(80, &["A"])].into_iter().collect();
        let b: IpPermissionSet = [tcp(443, &["A"])].into_iter().collect();

        let both = a.union(&b);
        assert_eq!(both.len(), 2);
        // union returns a new value
        assert_eq!(a.len(), 1);

        a.insert(tcp(22, &["A"]));
        assert!(a.contains(&tcp(22, &["A"])));
        a.delete(&tcp(22, &["A"]));
        assert!(!a.contains(&tcp(22, &["A"])));
    }

    fn described_range(marker: &str, owner: &str) -> IpRange {
        IpRange::new("A").with_description(rule_description(marker, owner))
    }

    #[test]
    fn test_delete_if_scopes_by_owner_marker() {
        let owned = IpPermission {
            ip_ranges: vec![described_range(CLIENT_RULE_MARKER, "lb1")],
            ..tcp(80, &[])
        };
        let other_owner = IpPermission {
            ip_ranges: vec![described_range(CLIENT_RULE_MARKER, "lb2")],
            ..tcp(80, &[])
        };
        let unmarked = tcp(22, &["B"]);

        let mut set: IpPermissionSet = [owned.clone(), other_owner.clone(), unmarked.clone()]
            .into_iter()
            .collect();
        set.delete_if(|p| !is_owned_by(p, "lb1"));

        assert_eq!(set.list(), vec![owned]);
    }

    #[test]
    fn test_is_owned_by_requires_marker_prefix() {
        let foreign = IpPermission {
            ip_ranges: vec![IpRange::new("A").with_description("office=lb1")],
            ..tcp(80, &[])
        };
        assert!(!is_owned_by(&foreign, "lb1"));

        let mtu = IpPermission {
            ip_ranges: vec![described_range(MTU_RULE_MARKER, "lb1")],
            ..tcp(80, &[])
        };
        assert!(is_owned_by(&mtu, "lb1"));
    }
}
