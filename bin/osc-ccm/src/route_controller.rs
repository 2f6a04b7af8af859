//! Route controller keeping pod CIDR routes in the cluster route table

use crate::provider::Provider;
use ccm_cloud::PodRoute;
use ccm_core::CcmError;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Route changes of one synchronization
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoutePlan {
    /// (node name, pod CIDR)
    pub create: Vec<(String, String)>,
    pub delete: Vec<String>,
}

fn within(cluster: &IpNetwork, destination: &str) -> bool {
    match destination.parse::<IpNetwork>() {
        Ok(dest) => cluster.contains(dest.ip()) && dest.prefix() >= cluster.prefix(),
        Err(_) => false,
    }
}

/// Diffs the pod CIDRs of the nodes against the routes of the table
///
/// A route is deleted when its target VM belongs to a node that left the
/// cluster, or when it is a blackhole inside the cluster CIDR. Destinations
/// still wanted by a node are replaced by `create_route` instead.
pub fn plan_routes(
    pod_cidrs: &BTreeMap<String, String>,
    routes: &[PodRoute],
    cluster_cidr: Option<&IpNetwork>,
) -> RoutePlan {
    let wanted: BTreeSet<&str> = pod_cidrs.values().map(String::as_str).collect();
    let mut plan = RoutePlan::default();

    for (node, cidr) in pod_cidrs {
        let routed = routes.iter().any(|r| {
            &r.destination == cidr && !r.blackhole && r.node_name.as_deref() == Some(node.as_str())
        });
        if !routed {
            plan.create.push((node.clone(), cidr.clone()));
        }
    }

    for route in routes {
        if wanted.contains(route.destination.as_str()) {
            continue;
        }
        let node_gone = route
            .node_name
            .as_ref()
            .map(|n| !pod_cidrs.contains_key(n))
            .unwrap_or(false);
        let stale_blackhole = route.blackhole
            && cluster_cidr
                .map(|c| within(c, &route.destination))
                .unwrap_or(false);
        if node_gone || stale_blackhole {
            plan.delete.push(route.destination.clone());
        }
    }
    plan
}

pub struct RouteController {
    client: Client,
    provider: Arc<Provider>,
}

impl RouteController {
    pub fn new(client: Client, provider: Arc<Provider>) -> Self {
        Self { client, provider }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let interval = self.provider.cloud().config.route_sync_interval();
        info!(?interval, "Starting route reconciliation");

        loop {
            match self.sync().await {
                Ok(plan) => info!(
                    created = plan.create.len(),
                    deleted = plan.delete.len(),
                    "Synchronized routes"
                ),
                Err(e) => error!(error = %e, "Error synchronizing routes"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn sync(&self) -> anyhow::Result<RoutePlan> {
        let cluster_cidr = match &self.provider.cloud().config.cluster_cidr {
            Some(cidr) => Some(
                cidr.parse::<IpNetwork>()
                    .map_err(|_| CcmError::InvalidCidr(cidr.clone()))?,
            ),
            None => None,
        };

        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes.list(&ListParams::default()).await?;
        let pod_cidrs: BTreeMap<String, String> = nodes
            .items
            .iter()
            .filter_map(|node| {
                let cidr = node.spec.as_ref()?.pod_cidr.clone()?;
                Some((node.name_any(), cidr))
            })
            .collect();

        let routes = self.provider.routes().list_routes().await?;
        let plan = plan_routes(&pod_cidrs, &routes, cluster_cidr.as_ref());
        debug!(?plan, "Route plan");

        for (node, cidr) in &plan.create {
            if let Err(e) = self.provider.routes().create_route(node, cidr).await {
                warn!(%node, %cidr, error = %e, "Failed to create route");
            }
        }
        for destination in &plan.delete {
            if let Err(e) = self.provider.routes().delete_route(destination).await {
                warn!(%destination, error = %e, "Failed to delete route");
            }
        }
        Ok(plan)
    }
}
