//! Pod network routes in the cluster route table

use crate::{Cloud, VmDirectory};
use ccm_api::{Filter, RouteTable};
use ccm_core::{ApiResultExt, CcmError, Result};
use ipnetwork::IpNetwork;
use std::sync::Arc;
use tracing::{debug, info};

/// A route of the cluster table relevant to pod networking
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRoute {
    pub destination: String,
    pub target_vm_id: Option<String>,
    /// Node of the target VM, when it is still a cluster VM
    pub node_name: Option<String>,
    pub blackhole: bool,
}

/// RouteManager maintains node routes in the cluster route table
pub struct RouteManager {
    cloud: Cloud,
    directory: Arc<VmDirectory>,
}

impl RouteManager {
    pub fn new(cloud: Cloud, directory: Arc<VmDirectory>) -> Self {
        Self { cloud, directory }
    }

    /// The configured route table, or the single cluster-tagged one
    pub async fn find_route_table(&self) -> Result<RouteTable> {
        let (filter, key) = match &self.cloud.config.route_table_id {
            Some(id) => (Filter::new("route-table-id", [id.as_str()]), id.clone()),
            None => (
                self.cloud.tagger.cluster_filter(),
                self.cloud.tagger.cluster_tag_key(),
            ),
        };
        let mut tables = self
            .cloud
            .compute
            .describe_route_tables(&[filter])
            .await
            .with_key("DescribeRouteTables", &key)?;

        match tables.len() {
            0 => Err(CcmError::not_found("route table", key)),
            1 => Ok(tables.remove(0)),
            _ => Err(CcmError::AmbiguousMatch {
                kind: "route table",
                key,
                candidates: tables.into_iter().map(|t| t.id).collect(),
            }),
        }
    }

    /// Instance-targeted and blackhole routes of the cluster table
    ///
    /// Nodes are named from the cached cluster listing as it is. Blackholes
    /// and routes to VMs outside the cluster are never in it, so a missing
    /// target does not force a refresh.
    pub async fn list_routes(&self) -> Result<Vec<PodRoute>> {
        let table = self.find_route_table().await?;
        let vms = self.directory.list_cluster_vms(&[]).await?;

        Ok(table
            .routes
            .into_iter()
            .filter(|r| r.target_vm_id.is_some() || r.is_blackhole())
            .map(|r| PodRoute {
                node_name: r
                    .target_vm_id
                    .as_deref()
                    .and_then(|id| vms.get(id))
                    .map(|vm| vm.node_name.clone()),
                blackhole: r.is_blackhole(),
                destination: r.destination,
                target_vm_id: r.target_vm_id,
            })
            .collect())
    }

    /// Routes `cidr` to the VM of `node_name`
    pub async fn create_route(&self, node_name: &str, cidr: &str) -> Result<()> {
        let destination: IpNetwork = cidr
            .parse()
            .map_err(|_| CcmError::InvalidCidr(cidr.to_string()))?;
        let destination = destination.to_string();
        let vm = self.directory.find_instance_by_node_name(node_name).await?;
        let table = self.find_route_table().await?;

        let mut present = false;
        if let Some(route) = table.routes.iter().find(|r| r.destination == destination) {
            if route.is_blackhole() || route.target_vm_id.as_deref() != Some(vm.id.as_str()) {
                info!(table = %table.id, %destination, "Replacing stale route");
                self.cloud
                    .compute
                    .delete_route(&table.id, &destination)
                    .await
                    .with_key("DeleteRoute", &destination)?;
            } else {
                present = true;
            }
        }

        if present {
            debug!(table = %table.id, %destination, vm = %vm.id, "Route already present");
        } else {
            info!(table = %table.id, %destination, vm = %vm.id, node = node_name, "Creating route");
            self.cloud
                .compute
                .create_route(&table.id, &destination, &vm.id)
                .await
                .with_key("CreateRoute", &destination)?;
        }

        // Forwarding pod traffic needs the check off
        if vm.source_dest_check {
            self.cloud
                .compute
                .set_source_dest_check(&vm.id, false)
                .await
                .with_key("SetSourceDestCheck", &vm.id)?;
        }
        Ok(())
    }

    /// Removes the route to `cidr`; absent routes are fine
    pub async fn delete_route(&self, cidr: &str) -> Result<()> {
        let table = self.find_route_table().await?;
        if !table.routes.iter().any(|r| r.destination == cidr) {
            debug!(table = %table.id, destination = cidr, "Route already gone");
            return Ok(());
        }
        info!(table = %table.id, destination = cidr, "Deleting route");
        match self.cloud.compute.delete_route(&table.id, cidr).await {
            Err(e) if e.is_not_found() => Ok(()),
            res => res.with_key("DeleteRoute", cidr),
        }
    }
}
