//! Security group rules as comparable values
//!
//! The API groups rule members (CIDRs and peer groups) under one port range.
//! Comparing grouped rules is order- and grouping-sensitive, so both sides
//! are ungrouped into single-member `NormalizedRule`s and diffed as sets.

use ccm_api::{GroupPeer, IpPermission};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, BTreeSet};

/// The single member of a normalized rule
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleSource {
    Cidr(String),
    /// Peer group id; the owning account is dropped, ids are unique
    Group(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalizedRule {
    /// Lowercase protocol, "-1" for all
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub source: RuleSource,
}

fn normalize_protocol(protocol: &str) -> String {
    match protocol.to_ascii_lowercase().as_str() {
        "6" => "tcp".to_string(),
        "17" => "udp".to_string(),
        "1" => "icmp".to_string(),
        "all" => "-1".to_string(),
        other => other.to_string(),
    }
}

fn normalize_cidr(cidr: &str) -> String {
    cidr.parse::<IpNetwork>()
        .ok()
        .and_then(|n| IpNetwork::new(n.network(), n.prefix()).ok())
        .map(|n| n.to_string())
        .unwrap_or_else(|| cidr.to_string())
}

impl NormalizedRule {
    pub fn tcp_cidr(port: u16, cidr: &str) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: i32::from(port),
            to_port: i32::from(port),
            source: RuleSource::Cidr(normalize_cidr(cidr)),
        }
    }

    pub fn tcp_group(port: u16, group_id: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: i32::from(port),
            to_port: i32::from(port),
            source: RuleSource::Group(group_id.into()),
        }
    }

    /// The port when the rule covers exactly one
    pub fn single_port(&self) -> Option<u16> {
        (self.from_port == self.to_port)
            .then(|| u16::try_from(self.from_port).ok())
            .flatten()
    }

    pub fn references_group(&self, group_id: &str) -> bool {
        matches!(&self.source, RuleSource::Group(g) if g == group_id)
    }

    pub fn is_cidr(&self) -> bool {
        matches!(self.source, RuleSource::Cidr(_))
    }
}

/// Splits grouped permissions into one rule per member
pub fn ungroup(permissions: &[IpPermission]) -> BTreeSet<NormalizedRule> {
    let mut rules = BTreeSet::new();
    for perm in permissions {
        let protocol = normalize_protocol(&perm.protocol);
        let rule = |source| NormalizedRule {
            protocol: protocol.clone(),
            from_port: perm.from_port,
            to_port: perm.to_port,
            source,
        };
        for cidr in &perm.ip_ranges {
            rules.insert(rule(RuleSource::Cidr(normalize_cidr(cidr))));
        }
        for peer in &perm.peers {
            rules.insert(rule(RuleSource::Group(peer.group_id.clone())));
        }
    }
    rules
}

/// Groups rules back by protocol and port range, for the API
pub fn regroup(rules: &BTreeSet<NormalizedRule>) -> Vec<IpPermission> {
    let mut grouped: BTreeMap<(&str, i32, i32), IpPermission> = BTreeMap::new();
    for rule in rules {
        let perm = grouped
            .entry((rule.protocol.as_str(), rule.from_port, rule.to_port))
            .or_insert_with(|| IpPermission {
                protocol: rule.protocol.clone(),
                from_port: rule.from_port,
                to_port: rule.to_port,
                ..Default::default()
            });
        match &rule.source {
            RuleSource::Cidr(cidr) => perm.ip_ranges.push(cidr.clone()),
            RuleSource::Group(group) => perm.peers.push(GroupPeer::new(group.clone())),
        }
    }
    grouped.into_values().collect()
}

/// Rules to revoke and to authorize on one group
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleDiff {
    pub to_add: BTreeSet<NormalizedRule>,
    pub to_delete: BTreeSet<NormalizedRule>,
}

impl RuleDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_delete.is_empty()
    }
}

/// Structural set difference between desired and existing rules
///
/// Only existing rules accepted by `managed` are candidates for deletion;
/// anything else on the group belongs to someone else.
pub fn diff_rules<F>(
    desired: &BTreeSet<NormalizedRule>,
    existing: &BTreeSet<NormalizedRule>,
    managed: F,
) -> RuleDiff
where
    F: Fn(&NormalizedRule) -> bool,
{
    RuleDiff {
        to_add: desired.difference(existing).cloned().collect(),
        to_delete: existing
            .difference(desired)
            .filter(|r| managed(r))
            .cloned()
            .collect(),
    }
}
