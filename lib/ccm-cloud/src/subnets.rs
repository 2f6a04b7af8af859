//! Load balancer placement

use crate::Cloud;
use ccm_api::{Filter, RouteTable, Subnet};
use ccm_core::{ApiResultExt, CcmError, Result, Tags};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Role of subnets hosting internet-facing load balancers
pub const ELB_ROLE: &str = "elb";
/// Role of subnets hosting internal load balancers
pub const INTERNAL_ELB_ROLE: &str = "internal-elb";

pub fn lb_role(internal: bool) -> &'static str {
    if internal {
        INTERNAL_ELB_ROLE
    } else {
        ELB_ROLE
    }
}

/// Table a subnet routes through, and whether it is explicitly associated
/// with a table other than the main one
fn effective_table<'a>(subnet: &Subnet, tables: &'a [RouteTable]) -> Option<(&'a RouteTable, bool)> {
    if let Some(table) = tables
        .iter()
        .find(|t| t.subnet_ids.iter().any(|id| id == &subnet.id))
    {
        return Some((table, !table.main));
    }
    tables
        .iter()
        .find(|t| t.main && t.net_id == subnet.net_id)
        .map(|t| (t, false))
}

/// Picks one subnet per zone among `subnets`, ordered by zone
///
/// With `require_internet`, only subnets whose effective route table has an
/// internet gateway route qualify. Subnets explicitly associated with a
/// route table win over subnets using the main table; remaining ties go to
/// the smallest id.
pub fn select_one_per_zone(
    subnets: &[Subnet],
    tables: &[RouteTable],
    require_internet: bool,
) -> Vec<String> {
    let mut best: BTreeMap<&str, (bool, &str)> = BTreeMap::new();

    for subnet in subnets {
        let table = effective_table(subnet, tables);
        if require_internet {
            let public = table
                .map(|(t, _)| t.routes.iter().any(|r| r.is_internet_route()))
                .unwrap_or(false);
            if !public {
                debug!(subnet = %subnet.id, "Skipping subnet without internet route");
                continue;
            }
        }
        let explicit = table.map(|(_, explicit)| explicit).unwrap_or(false);
        let candidate = (explicit, subnet.id.as_str());

        best.entry(subnet.zone.as_str())
            .and_modify(|current| {
                let better = (candidate.0 && !current.0)
                    || (candidate.0 == current.0 && candidate.1 < current.1);
                if better {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    best.into_values().map(|(_, id)| id.to_string()).collect()
}

/// SubnetResolver finds where load balancers are placed
pub struct SubnetResolver {
    cloud: Cloud,
}

impl SubnetResolver {
    pub fn new(cloud: Cloud) -> Self {
        Self { cloud }
    }

    /// Cluster subnets grouped by role tag; a subnet appears under each of its roles
    pub async fn find_subnets(&self) -> Result<BTreeMap<String, Vec<Subnet>>> {
        let subnets = self
            .cloud
            .compute
            .describe_subnets(&[self.cloud.tagger.cluster_filter()])
            .await
            .with_key("DescribeSubnets", self.cloud.cluster_id())?;

        let mut by_role: BTreeMap<String, Vec<Subnet>> = BTreeMap::new();
        for subnet in subnets {
            let roles: Vec<String> = Tags::new(&subnet.tags).roles().map(str::to_string).collect();
            for role in roles {
                by_role.entry(role).or_default().push(subnet.clone());
            }
        }
        Ok(by_role)
    }

    /// One subnet per zone for a load balancer of the given kind
    pub async fn find_route_subnets(&self, internal: bool) -> Result<Vec<String>> {
        let role = lb_role(internal);
        let candidates = self.find_subnets().await?.remove(role).unwrap_or_default();
        if candidates.is_empty() {
            return Err(CcmError::NoSubnetForRole(role.to_string()));
        }

        let nets: BTreeSet<&str> = candidates.iter().map(|s| s.net_id.as_str()).collect();
        let tables = self
            .cloud
            .compute
            .describe_route_tables(&[Filter::new("vpc-id", nets.iter().copied())])
            .await
            .with_key("DescribeRouteTables", role)?;

        let selected = select_one_per_zone(&candidates, &tables, !internal);
        if selected.is_empty() {
            return Err(CcmError::NoSubnetForRole(role.to_string()));
        }
        debug!(role, subnets = ?selected, "Selected load balancer subnets");
        Ok(selected)
    }

    /// Subnets for a load balancer: the override when given, discovery otherwise
    pub async fn resolve_lb_subnets(&self, subnet_override: Option<&str>, internal: bool) -> Result<Vec<String>> {
        let Some(id) = subnet_override else {
            return self.find_route_subnets(internal).await;
        };
        let found = self
            .cloud
            .compute
            .describe_subnets(&[Filter::new("subnet-id", [id])])
            .await
            .with_key("DescribeSubnets", id)?;
        if !found.iter().any(|s| s.id == id) {
            return Err(CcmError::not_found("subnet", id));
        }
        Ok(vec![id.to_string()])
    }

    /// Net of the first subnet of `subnet_ids`
    pub async fn net_of(&self, subnet_ids: &[String]) -> Result<String> {
        let first = subnet_ids
            .first()
            .ok_or_else(|| CcmError::not_found("subnet", "<none>"))?;
        let subnets = self
            .cloud
            .compute
            .describe_subnets(&[Filter::new("subnet-id", [first.as_str()])])
            .await
            .with_key("DescribeSubnets", first)?;
        subnets
            .into_iter()
            .find(|s| &s.id == first)
            .map(|s| s.net_id)
            .ok_or_else(|| CcmError::not_found("subnet", first.as_str()))
    }
}
