//! Cloud provider entry points
//!
//! Provider is the surface the host controllers program against: load
//! balancers keyed by Service, instances and zones keyed by node name or
//! provider id, and the pod routes of the cluster route table.

use ccm_api::{Vm, VmState};
use ccm_cloud::{region_from_zone, Cloud, RouteManager, VmDirectory};
use ccm_core::{CcmError, Result};
use ccm_lb::{
    filter_target_nodes, parse_spec, IngressStatus, LoadBalancerReconciler, LoadBalancerRef, MetricsSink,
};
use k8s_openapi::api::core::v1::{Node, NodeAddress, Service};
use std::sync::Arc;
use tracing::debug;

/// Failure domain of a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zone {
    pub failure_domain: String,
    pub region: String,
}

pub struct Provider {
    cloud: Cloud,
    directory: Arc<VmDirectory>,
    load_balancers: LoadBalancerReconciler,
    routes: RouteManager,
}

fn address(type_: &str, address: &str) -> NodeAddress {
    NodeAddress {
        type_: type_.to_string(),
        address: address.to_string(),
    }
}

/// Addresses reported on the Node object
pub fn vm_addresses(vm: &Vm) -> Vec<NodeAddress> {
    let mut addresses = vec![address("InternalIP", &vm.private_ip)];
    if let Some(ip) = &vm.public_ip {
        addresses.push(address("ExternalIP", ip));
    }
    if !vm.private_dns.is_empty() {
        addresses.push(address("InternalDNS", &vm.private_dns));
        addresses.push(address("Hostname", &vm.private_dns));
    }
    if let Some(dns) = vm.public_dns.as_deref().filter(|d| !d.is_empty()) {
        addresses.push(address("ExternalDNS", dns));
    }
    addresses
}

impl Provider {
    pub fn new(cloud: Cloud, metrics: Arc<dyn MetricsSink>) -> Self {
        let directory = Arc::new(VmDirectory::new(cloud.clone()));
        Self {
            load_balancers: LoadBalancerReconciler::new(cloud.clone(), directory.clone())
                .with_metrics(metrics),
            routes: RouteManager::new(cloud.clone(), directory.clone()),
            directory,
            cloud,
        }
    }

    pub fn cloud(&self) -> &Cloud {
        &self.cloud
    }

    pub fn load_balancers(&self) -> &LoadBalancerReconciler {
        &self.load_balancers
    }

    pub fn routes(&self) -> &RouteManager {
        &self.routes
    }

    pub async fn get_load_balancer(&self, service: &Service) -> Result<Option<IngressStatus>> {
        let spec = parse_spec(service, &self.cloud.config)?;
        self.load_balancers.get(&spec).await
    }

    /// Creates or converges the load balancer of `service` over `nodes`
    pub async fn ensure_load_balancer(&self, service: &Service, nodes: &[Node]) -> Result<IngressStatus> {
        let spec = parse_spec(service, &self.cloud.config)?;
        let targets = filter_target_nodes(service, nodes)?;
        debug!(lb = %spec.name, service = %spec.service_name, nodes = targets.len(), "Ensuring load balancer");
        self.load_balancers.ensure(&spec, &targets).await
    }

    /// Updates the backends of an existing load balancer
    pub async fn update_load_balancer(&self, service: &Service, nodes: &[Node]) -> Result<()> {
        let spec = parse_spec(service, &self.cloud.config)?;
        let targets = filter_target_nodes(service, nodes)?;
        self.load_balancers.update(&spec, &targets).await
    }

    /// Deletes the load balancer of `service`, whatever its type and ports now
    pub async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<()> {
        let target = LoadBalancerRef::from_service(service)?;
        debug!(lb = %target.name, service = %target.service_name, "Deleting load balancer");
        self.load_balancers.ensure_deleted(&target).await
    }

    pub async fn node_addresses(&self, node_name: &str) -> Result<Vec<NodeAddress>> {
        let vm = self.directory.find_instance_by_node_name(node_name).await?;
        Ok(vm_addresses(&vm))
    }

    pub async fn node_addresses_by_provider_id(&self, provider_id: &str) -> Result<Vec<NodeAddress>> {
        let vm = self.directory.find_instance_by_provider_id(provider_id).await?;
        Ok(vm_addresses(&vm))
    }

    /// Instance id in the `/<zone>/<id>` form
    pub async fn instance_id(&self, node_name: &str) -> Result<String> {
        let vm = self.directory.find_instance_by_node_name(node_name).await?;
        Ok(format!("/{}/{}", vm.zone, vm.id))
    }

    pub async fn instance_type(&self, node_name: &str) -> Result<String> {
        let vm = self.directory.find_instance_by_node_name(node_name).await?;
        Ok(vm.vm_type)
    }

    pub async fn instance_type_by_provider_id(&self, provider_id: &str) -> Result<String> {
        let vm = self.directory.find_instance_by_provider_id(provider_id).await?;
        Ok(vm.vm_type)
    }

    /// False once the VM is gone or terminating
    pub async fn instance_exists(&self, provider_id: &str) -> Result<bool> {
        match self.directory.find_instance_by_provider_id(provider_id).await {
            Ok(vm) => Ok(vm.state.is_alive()),
            Err(CcmError::InstanceNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn instance_shutdown(&self, provider_id: &str) -> Result<bool> {
        let vm = self.directory.find_instance_by_provider_id(provider_id).await?;
        Ok(matches!(vm.state, VmState::Stopping | VmState::Stopped))
    }

    pub async fn zone_by_node_name(&self, node_name: &str) -> Result<Zone> {
        let vm = self.directory.find_instance_by_node_name(node_name).await?;
        Ok(Zone {
            region: region_from_zone(&vm.zone).to_string(),
            failure_domain: vm.zone,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccm_api::fake::FakeCloud;
    use ccm_api::{LoadBalancerDescription, TagMap};
    use ccm_core::CloudConfig;
    use k8s_openapi::api::core::v1::ServiceSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use ccm_lb::NoopMetrics;
    use std::collections::BTreeSet;

    fn vm(id: &str, node: &str, state: VmState) -> Vm {
        Vm {
            id: id.to_string(),
            node_name: node.to_string(),
            private_ip: "10.0.1.10".to_string(),
            public_ip: Some("198.51.100.7".to_string()),
            private_dns: node.to_string(),
            public_dns: None,
            subnet_id: "subnet-1".to_string(),
            net_id: "vpc-1".to_string(),
            security_group_ids: BTreeSet::new(),
            state,
            zone: "eu-west-2a".to_string(),
            vm_type: "tinav5.c2r4p1".to_string(),
            source_dest_check: true,
            tags: Default::default(),
        }
    }

    fn provider_with_fake(vms: Vec<Vm>) -> (Arc<FakeCloud>, Provider) {
        let fake = Arc::new(FakeCloud::new());
        fake.state().vms = vms;
        let config = CloudConfig {
            cluster_id: "foo".into(),
            region: "eu-west-2".into(),
            ..Default::default()
        };
        let provider = Provider::new(Cloud::from_api(fake.clone(), config), Arc::new(NoopMetrics));
        (fake, provider)
    }

    fn provider(vms: Vec<Vm>) -> Provider {
        provider_with_fake(vms).1
    }

    #[tokio::test]
    async fn test_node_addresses() {
        let provider = provider(vec![vm("i-1", "ip-10-0-1-10.eu-west-2.compute.internal", VmState::Running)]);
        let addresses = provider
            .node_addresses("ip-10-0-1-10.eu-west-2.compute.internal")
            .await
            .unwrap();
        let types: Vec<&str> = addresses.iter().map(|a| a.type_.as_str()).collect();
        assert_eq!(types, vec!["InternalIP", "ExternalIP", "InternalDNS", "Hostname"]);
        assert_eq!(addresses[1].address, "198.51.100.7");
    }

    #[tokio::test]
    async fn test_instance_id_and_zone() {
        let provider = provider(vec![vm("i-1", "node-a", VmState::Running)]);
        assert_eq!(provider.instance_id("node-a").await.unwrap(), "/eu-west-2a/i-1");
        assert_eq!(provider.instance_type("node-a").await.unwrap(), "tinav5.c2r4p1");
        assert_eq!(
            provider.zone_by_node_name("node-a").await.unwrap(),
            Zone {
                failure_domain: "eu-west-2a".into(),
                region: "eu-west-2".into(),
            }
        );
        assert!(matches!(
            provider.instance_id("node-b").await,
            Err(CcmError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let provider = provider(vec![
            vm("i-1", "node-a", VmState::Running),
            vm("i-2", "node-b", VmState::Stopped),
            vm("i-3", "node-c", VmState::Terminated),
        ]);
        assert!(provider.instance_exists("aws:///eu-west-2a/i-1").await.unwrap());
        assert!(!provider.instance_exists("aws:///eu-west-2a/i-3").await.unwrap());
        assert!(!provider.instance_exists("osc:///eu-west-2a/i-9").await.unwrap());

        assert!(!provider.instance_shutdown("i-1").await.unwrap());
        assert!(provider.instance_shutdown("i-2").await.unwrap());
        assert!(matches!(
            provider.instance_exists("gce://i-1").await,
            Err(CcmError::InvalidProviderId(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_service_without_ports() {
        let (fake, provider) = provider_with_fake(Vec::new());
        let owner: TagMap = [
            ("OscK8sClusterID/foo".to_string(), "owned".to_string()),
            ("OscK8sService".to_string(), "default/web".to_string()),
        ]
        .into_iter()
        .collect();
        fake.state().load_balancers.insert(
            "aweb1".into(),
            LoadBalancerDescription {
                name: "aweb1".into(),
                tags: owner,
                ..Default::default()
            },
        );

        let service = Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("default".into()),
                uid: Some("web-1".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(provider.ensure_load_balancer(&service, &[]).await.is_err());

        provider.ensure_load_balancer_deleted(&service).await.unwrap();
        assert!(fake.state().load_balancers.is_empty());
        assert_eq!(fake.calls_to("DeleteLoadBalancer").len(), 1);
    }
}
