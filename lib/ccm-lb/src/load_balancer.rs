//! Load balancer reconciler
//!
//! Each entry point is one pass: read the remote state, compare it with the
//! LoadBalancerSpec and issue the calls that close the gap. Nothing is
//! retried here; not-ready and remote failures go back to the control loop.

use crate::health_check;
use crate::ingress::IngressStatus;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::policy::{
    attributes_patch, has_attributes, plan_backend_policies, proxy_protocol_policy,
    PROXY_PROTOCOL_POLICY_NAME,
};
use crate::security::{ingress_group_name, SecurityPolicy};
use crate::spec::{LoadBalancerRef, LoadBalancerSpec, PublicIpRequest};
use ccm_api::{CreateLoadBalancerRequest, Filter, Listener, LoadBalancerDescription, Vm};
use ccm_cloud::{Cloud, SubnetResolver, VmDirectory};
use ccm_core::tags::IP_POOL_TAG;
use ccm_core::{ApiResultExt, CcmError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Listener changes of an update pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListenerPlan {
    /// Frontend ports to delete
    pub delete: Vec<u16>,
    pub create: Vec<Listener>,
    /// Kept listeners whose certificate changed: (frontend port, certificate)
    pub certificates: Vec<(u16, String)>,
}

impl ListenerPlan {
    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.create.is_empty() && self.certificates.is_empty()
    }
}

/// Compares listeners by frontend port; a port whose forwarding changed is
/// deleted and recreated.
pub fn plan_listeners(desired: &[Listener], current: &[Listener]) -> ListenerPlan {
    let mut plan = ListenerPlan::default();
    for existing in current {
        let kept = desired.iter().any(|d| d.same_forwarding(existing));
        if !kept {
            plan.delete.push(existing.frontend_port);
        }
    }
    for wanted in desired {
        match current.iter().find(|c| c.same_forwarding(wanted)) {
            None => plan.create.push(wanted.clone()),
            Some(existing) => {
                if let Some(cert) = &wanted.certificate_id {
                    if existing.certificate_id.as_ref() != Some(cert) {
                        plan.certificates.push((wanted.frontend_port, cert.clone()));
                    }
                }
            }
        }
    }
    plan
}

/// LoadBalancerReconciler converges remote load balancers to their spec
pub struct LoadBalancerReconciler {
    cloud: Cloud,
    directory: Arc<VmDirectory>,
    subnets: SubnetResolver,
    security: SecurityPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl LoadBalancerReconciler {
    pub fn new(cloud: Cloud, directory: Arc<VmDirectory>) -> Self {
        Self {
            subnets: SubnetResolver::new(cloud.clone()),
            security: SecurityPolicy::new(cloud.clone()),
            cloud,
            directory,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn security(&self) -> &SecurityPolicy {
        &self.security
    }

    async fn instrument<T, F>(&self, operation: &str, pass: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let res = pass.await;
        let outcome = match &res {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        self.metrics.observe(operation, outcome, start.elapsed());
        res
    }

    /// The load balancer of `target`, failing when it is not ours
    async fn describe_owned(&self, target: &LoadBalancerRef) -> Result<Option<LoadBalancerDescription>> {
        let found = self
            .cloud
            .load_balancer
            .describe_load_balancer(&target.name)
            .await
            .with_key("DescribeLoadBalancer", &target.name)?;
        match found {
            Some(lb) if !self.cloud.tagger.ownership(&lb.tags, &target.service_name).is_owned() => {
                Err(CcmError::OwnedByAnotherCluster(target.name.clone()))
            }
            other => Ok(other),
        }
    }

    /// VMs of the target nodes; nodes without an alive VM are skipped
    async fn resolve_backends(&self, spec: &LoadBalancerSpec, nodes: &[String]) -> Result<Vec<Vm>> {
        let mut by_node = self.directory.get_vms_by_node_name(nodes).await?;
        let mut backends = Vec::with_capacity(by_node.len());
        for node in nodes {
            match by_node.remove(node) {
                Some(vm) => backends.push(vm),
                None => warn!(lb = %spec.name, %node, "No alive VM for node, skipping"),
            }
        }
        if backends.is_empty() {
            return Err(CcmError::NoBackends(spec.name.clone()));
        }
        Ok(backends)
    }

    /// Address of the requested public IP
    async fn resolve_public_ip(&self, spec: &LoadBalancerSpec) -> Result<Option<String>> {
        let Some(request) = &spec.public_ip else {
            return Ok(None);
        };
        let (filter, key) = match request {
            PublicIpRequest::ById(id) => (Filter::new("allocation-id", [id.as_str()]), id),
            PublicIpRequest::ByPool(pool) => (Filter::tag(IP_POOL_TAG, pool.as_str()), pool),
        };
        let mut ips = self
            .cloud
            .compute
            .describe_public_ips(&[filter])
            .await
            .with_key("DescribePublicIps", key)?;
        ips.sort_by(|a, b| a.id.cmp(&b.id));

        let picked = match request {
            PublicIpRequest::ById(id) => ips.into_iter().find(|ip| &ip.id == id),
            PublicIpRequest::ByPool(_) => ips.into_iter().find(|ip| ip.link_id.is_none()),
        };
        match picked {
            Some(ip) => {
                debug!(lb = %spec.name, ip = %ip.address, "Using public IP");
                Ok(Some(ip.address))
            }
            None => Err(CcmError::not_found("public ip", key.as_str())),
        }
    }

    /// Sets the proxy protocol policy on exactly the requested backend ports
    async fn reconcile_proxy_protocol(
        &self,
        spec: &LoadBalancerSpec,
        current: &BTreeMap<u16, Vec<String>>,
    ) -> Result<()> {
        let changes = plan_backend_policies(&spec.proxy_protocol, &spec.listeners, current);
        if changes.is_empty() {
            return Ok(());
        }
        let lb = spec.name.as_str();
        let api = &self.cloud.load_balancer;

        let attaches = changes
            .iter()
            .any(|c| c.policy_names.iter().any(|n| n == PROXY_PROTOCOL_POLICY_NAME));
        if attaches {
            let policies = api
                .describe_policies(lb)
                .await
                .with_key("DescribePolicies", lb)?;
            if !policies.iter().any(|p| p.name == PROXY_PROTOCOL_POLICY_NAME) {
                match api.create_policy(lb, &proxy_protocol_policy()).await {
                    Err(e) if e.is_duplicate() => {}
                    res => res.with_key("CreatePolicy", lb)?,
                }
            }
        }

        for change in changes {
            info!(%lb, port = change.backend_port, policies = ?change.policy_names, "Setting backend policies");
            api.set_backend_policies(lb, change.backend_port, &change.policy_names)
                .await
                .with_key("SetBackendPolicies", lb)?;
        }
        Ok(())
    }

    async fn reconcile_attributes(&self, spec: &LoadBalancerSpec) -> Result<()> {
        if !has_attributes(&spec.attributes) {
            return Ok(());
        }
        let lb = spec.name.as_str();
        let current = self
            .cloud
            .load_balancer
            .describe_attributes(lb)
            .await
            .with_key("DescribeAttributes", lb)?;
        if let Some(patch) = attributes_patch(&spec.attributes, &current) {
            info!(%lb, "Updating load balancer attributes");
            self.cloud
                .load_balancer
                .modify_attributes(lb, &patch)
                .await
                .with_key("ModifyAttributes", lb)?;
        }
        Ok(())
    }

    async fn reconcile_backends(
        &self,
        spec: &LoadBalancerSpec,
        current: &BTreeSet<String>,
        backends: &[Vm],
    ) -> Result<()> {
        let lb = spec.name.as_str();
        let desired: BTreeSet<String> = backends.iter().map(|vm| vm.id.clone()).collect();

        let added: Vec<String> = desired.difference(current).cloned().collect();
        if !added.is_empty() {
            info!(%lb, vms = ?added, "Registering backends");
            self.cloud
                .load_balancer
                .register_vms(lb, &added)
                .await
                .with_key("RegisterVms", lb)?;
        }
        let removed: Vec<String> = current.difference(&desired).cloned().collect();
        if !removed.is_empty() {
            info!(%lb, vms = ?removed, "Deregistering backends");
            self.cloud
                .load_balancer
                .deregister_vms(lb, &removed)
                .await
                .with_key("DeregisterVms", lb)?;
        }
        Ok(())
    }

    async fn reconcile_listeners(&self, spec: &LoadBalancerSpec, current: &[Listener]) -> Result<()> {
        let lb = spec.name.as_str();
        let plan = plan_listeners(&spec.listeners, current);
        if plan.is_empty() {
            return Ok(());
        }
        let api = &self.cloud.load_balancer;
        if !plan.delete.is_empty() {
            info!(%lb, ports = ?plan.delete, "Deleting listeners");
            api.delete_listeners(lb, &plan.delete)
                .await
                .with_key("DeleteListeners", lb)?;
        }
        if !plan.create.is_empty() {
            info!(%lb, listeners = plan.create.len(), "Creating listeners");
            api.create_listeners(lb, &plan.create)
                .await
                .with_key("CreateListeners", lb)?;
        }
        for (port, certificate) in &plan.certificates {
            info!(%lb, %port, "Updating listener certificate");
            api.set_listener_certificate(lb, *port, certificate)
                .await
                .with_key("SetListenerCertificate", lb)?;
        }
        Ok(())
    }

    /// First address of `hostname`, IPv4 preferred; `None` until it resolves
    async fn resolve_hostname(&self, hostname: &str) -> Option<String> {
        match self.cloud.dns.resolve(hostname).await {
            Ok(addrs) => addrs
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| addrs.first())
                .map(IpAddr::to_string),
            Err(e) => {
                debug!(%hostname, error = %e, "Load balancer hostname does not resolve yet");
                None
            }
        }
    }

    /// Addresses to publish for a load balancer
    pub async fn ingress_status(
        &self,
        spec: &LoadBalancerSpec,
        lb: &LoadBalancerDescription,
    ) -> Result<IngressStatus> {
        let mut status = IngressStatus::default();
        if spec.ingress_address.wants_hostname() {
            status.hostname = lb.dns_name.clone();
        }
        if spec.ingress_address.wants_ip() {
            let ip = match (&lb.public_ip, &lb.dns_name) {
                (Some(ip), _) => Some(ip.clone()),
                (None, Some(hostname)) => self.resolve_hostname(hostname).await,
                (None, None) => None,
            };
            let ip = ip.ok_or_else(|| CcmError::LoadBalancerNotReady(spec.name.clone()))?;
            status.ip = Some(ip);
            status.ip_mode = Some(
                spec.ingress_ip_mode
                    .resolve(spec.proxy_protocol.is_enabled())
                    .to_string(),
            );
        }
        if status.is_empty() {
            return Err(CcmError::LoadBalancerNotReady(spec.name.clone()));
        }
        Ok(status)
    }

    /// Security groups to attach to the load balancer
    fn load_balancer_groups(spec: &LoadBalancerSpec, ingress_group: &str) -> Vec<String> {
        let mut groups = vec![ingress_group.to_string()];
        for extra in &spec.extra_security_groups {
            if !groups.contains(extra) {
                groups.push(extra.clone());
            }
        }
        groups
    }

    /// Creates or converges the load balancer of `spec` backed by `nodes`
    ///
    /// A freshly created load balancer is reported as not ready; the next
    /// pass goes through the update path and returns its status.
    pub async fn ensure(&self, spec: &LoadBalancerSpec, nodes: &[String]) -> Result<IngressStatus> {
        self.instrument("ensure", self.ensure_pass(spec, nodes)).await
    }

    async fn ensure_pass(&self, spec: &LoadBalancerSpec, nodes: &[String]) -> Result<IngressStatus> {
        let current = self.describe_owned(&spec.reference()).await?;
        if current.is_none() && spec.public_ip.is_some() && !self.cloud.load_balancer.supports_public_ip() {
            return Err(CcmError::InvalidSpec(format!(
                "load balancer {}: a public IP cannot be requested on this platform",
                spec.name
            )));
        }
        let backends = self.resolve_backends(spec, nodes).await?;
        let net_id = backends[0].net_id.clone();

        let subnets = match &current {
            Some(_) => Vec::new(),
            None => {
                self.subnets
                    .resolve_lb_subnets(spec.subnet_override.as_deref(), spec.internal)
                    .await?
            }
        };

        let ingress_group = self.security.resolve_ingress_security_group(spec, &net_id).await?;
        let worker_groups = self.security.find_role_security_groups(spec, &backends).await?;
        if spec.security_group_override.is_none() {
            let previous_ports: BTreeSet<u16> = current
                .iter()
                .flat_map(|lb| lb.listeners.iter().map(|l| l.frontend_port))
                .collect();
            self.security
                .reconcile_ingress_rules(spec, &ingress_group, &previous_ports)
                .await?;
        }
        self.security
            .reconcile_internal_rules(spec, &ingress_group, &worker_groups)
            .await?;
        let groups = Self::load_balancer_groups(spec, &ingress_group);

        match current {
            None => self.create(spec, subnets, groups, &backends).await,
            Some(lb) => self.converge(spec, &lb, groups, &backends).await,
        }
    }

    async fn create(
        &self,
        spec: &LoadBalancerSpec,
        subnets: Vec<String>,
        groups: Vec<String>,
        backends: &[Vm],
    ) -> Result<IngressStatus> {
        let lb = spec.name.as_str();
        let api = &self.cloud.load_balancer;

        let mut tags = self.cloud.tagger.owner_tags(Some(&spec.service_name));
        tags.extend(spec.additional_tags.clone());
        let request = CreateLoadBalancerRequest {
            name: spec.name.clone(),
            listeners: spec.listeners.clone(),
            subnets,
            security_groups: groups,
            internal: spec.internal,
            public_ip: self.resolve_public_ip(spec).await?,
            tags,
        };
        let dns_name = api
            .create_load_balancer(&request)
            .await
            .with_key("CreateLoadBalancer", lb)?;
        info!(%lb, service = %spec.service_name, dns = ?dns_name, "Created load balancer");

        api.configure_health_check(lb, &spec.health_check)
            .await
            .with_key("ConfigureHealthCheck", lb)?;
        let vm_ids: Vec<String> = backends.iter().map(|vm| vm.id.clone()).collect();
        api.register_vms(lb, &vm_ids)
            .await
            .with_key("RegisterVms", lb)?;

        if spec.proxy_protocol.is_enabled() {
            self.reconcile_proxy_protocol(spec, &BTreeMap::new()).await?;
        }
        self.reconcile_attributes(spec).await?;

        Err(CcmError::LoadBalancerNotReady(spec.name.clone()))
    }

    async fn converge(
        &self,
        spec: &LoadBalancerSpec,
        lb: &LoadBalancerDescription,
        groups: Vec<String>,
        backends: &[Vm],
    ) -> Result<IngressStatus> {
        let name = spec.name.as_str();
        self.reconcile_listeners(spec, &lb.listeners).await?;
        self.reconcile_backends(spec, &lb.backend_vm_ids, backends).await?;
        self.reconcile_proxy_protocol(spec, &lb.backend_policies).await?;

        if health_check::needs_update(lb.health_check.as_ref(), &spec.health_check) {
            info!(lb = %name, target = %spec.health_check.target(), "Updating health check");
            self.cloud
                .load_balancer
                .configure_health_check(name, &spec.health_check)
                .await
                .with_key("ConfigureHealthCheck", name)?;
        }

        let attached: BTreeSet<&String> = lb.security_groups.iter().collect();
        if attached != groups.iter().collect::<BTreeSet<_>>() {
            info!(lb = %name, groups = ?groups, "Applying security groups");
            self.cloud
                .load_balancer
                .apply_security_groups(name, &groups)
                .await
                .with_key("ApplySecurityGroups", name)?;
        }

        self.reconcile_attributes(spec).await?;
        self.ingress_status(spec, lb).await
    }

    /// Updates backends and worker rules of an existing load balancer
    pub async fn update(&self, spec: &LoadBalancerSpec, nodes: &[String]) -> Result<()> {
        self.instrument("update", self.update_pass(spec, nodes)).await
    }

    async fn update_pass(&self, spec: &LoadBalancerSpec, nodes: &[String]) -> Result<()> {
        let lb = self
            .describe_owned(&spec.reference())
            .await?
            .ok_or_else(|| CcmError::not_found("load balancer", spec.name.as_str()))?;
        let backends = self.resolve_backends(spec, nodes).await?;
        self.reconcile_backends(spec, &lb.backend_vm_ids, &backends).await?;

        match self
            .security
            .find_ingress_security_group(spec, &backends[0].net_id)
            .await?
        {
            Some(group) => {
                let workers = self.security.find_role_security_groups(spec, &backends).await?;
                self.security
                    .reconcile_internal_rules(spec, &group.id, &workers)
                    .await?;
            }
            None => warn!(lb = %spec.name, "Ingress security group not found, skipping worker rules"),
        }
        Ok(())
    }

    /// Deletes the load balancer of `target` when this cluster owns it
    pub async fn ensure_deleted(&self, target: &LoadBalancerRef) -> Result<()> {
        self.instrument("delete", self.delete_pass(target)).await
    }

    async fn delete_pass(&self, target: &LoadBalancerRef) -> Result<()> {
        let lb = match self.describe_owned(target).await {
            Ok(Some(lb)) => lb,
            Ok(None) => {
                debug!(lb = %target.name, "Load balancer already gone");
                return Ok(());
            }
            Err(CcmError::OwnedByAnotherCluster(_)) => {
                info!(lb = %target.name, "Load balancer belongs to someone else, leaving it");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let name = target.name.as_str();
        let api = &self.cloud.load_balancer;

        if !lb.backend_vm_ids.is_empty() {
            let vm_ids: Vec<String> = lb.backend_vm_ids.iter().cloned().collect();
            match api.deregister_vms(name, &vm_ids).await {
                Err(e) if e.is_not_found() => {}
                res => res.with_key("DeregisterVms", name)?,
            }
        }

        let owned_groups = self.owned_ingress_groups(target, &lb).await?;
        self.security.mark_for_deletion(&owned_groups).await?;

        match api.delete_load_balancer(name).await {
            Err(e) if e.is_not_found() => {}
            res => res.with_key("DeleteLoadBalancer", name)?,
        }
        info!(lb = %name, service = %target.service_name, "Deleted load balancer");
        Ok(())
    }

    /// Groups attached to `lb` that were created for it
    async fn owned_ingress_groups(
        &self,
        target: &LoadBalancerRef,
        lb: &LoadBalancerDescription,
    ) -> Result<Vec<String>> {
        if lb.security_groups.is_empty() {
            return Ok(Vec::new());
        }
        let expected = ingress_group_name(&target.name);
        let groups = self
            .cloud
            .compute
            .describe_security_groups(&[Filter::new(
                "group-id",
                lb.security_groups.iter().map(String::as_str),
            )])
            .await
            .with_key("DescribeSecurityGroups", &target.name)?;
        Ok(groups
            .into_iter()
            .filter(|g| g.name == expected)
            .filter(|g| self.cloud.tagger.ownership(&g.tags, &target.service_name).is_owned())
            .map(|g| g.id)
            .collect())
    }

    /// Status of the load balancer of `spec`, `None` when absent or foreign
    pub async fn get(&self, spec: &LoadBalancerSpec) -> Result<Option<IngressStatus>> {
        let lb = match self.describe_owned(&spec.reference()).await {
            Ok(Some(lb)) => lb,
            Ok(None) | Err(CcmError::OwnedByAnotherCluster(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match self.ingress_status(spec, &lb).await {
            Ok(status) => Ok(Some(status)),
            Err(e) if e.is_not_ready() => Ok(Some(IngressStatus::default())),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusMetrics;
    use crate::spec::tests::{config, port, service};
    use crate::spec::{annotations, parse_spec};
    use ccm_api::fake::FakeCloud;
    use ccm_api::{
        ApiError, IpPermission, PublicIp, Route, RouteState, RouteTable, SecurityGroup, Subnet, TagMap,
        VmState,
    };
    use ccm_core::tags::Tags;

    fn cluster_tags(extra: &[&str]) -> TagMap {
        let mut tags = TagMap::new();
        tags.insert("OscK8sClusterID/foo".into(), "owned".into());
        for key in extra {
            tags.insert(key.to_string(), String::new());
        }
        tags
    }

    fn vm(id: &str, node: &str) -> Vm {
        Vm {
            id: id.into(),
            node_name: node.into(),
            private_ip: "10.0.1.10".into(),
            public_ip: None,
            private_dns: node.into(),
            public_dns: None,
            subnet_id: "subnet-nodes".into(),
            net_id: "vpc-1".into(),
            security_group_ids: ["sg-worker".to_string()].into_iter().collect(),
            state: VmState::Running,
            zone: "eu-west-2a".into(),
            vm_type: "tinav5.c2r4p1".into(),
            source_dest_check: true,
            tags: cluster_tags(&[]),
        }
    }

    fn setup() -> (Arc<FakeCloud>, LoadBalancerReconciler) {
        let fake = Arc::new(FakeCloud::new());
        {
            let mut state = fake.state();
            state.vms.push(vm("i-foo", "node-a"));
            state.security_groups.push(SecurityGroup {
                id: "sg-worker".into(),
                name: "worker".into(),
                net_id: "vpc-1".into(),
                tags: cluster_tags(&["OscK8sRole/worker"]),
                ..Default::default()
            });
            state.subnets.push(Subnet {
                id: "subnet-elb".into(),
                net_id: "vpc-1".into(),
                zone: "eu-west-2a".into(),
                cidr: "10.0.0.0/24".into(),
                tags: cluster_tags(&["OscK8sRole/elb"]),
            });
            state.route_tables.push(RouteTable {
                id: "rtb-main".into(),
                net_id: "vpc-1".into(),
                main: true,
                routes: vec![Route {
                    destination: "0.0.0.0/0".into(),
                    target_vm_id: None,
                    gateway_id: Some("igw-1".into()),
                    state: RouteState::Active,
                }],
                ..Default::default()
            });
        }
        let cloud = Cloud::from_api(fake.clone(), config());
        let directory = Arc::new(VmDirectory::new(cloud.clone()));
        (fake, LoadBalancerReconciler::new(cloud, directory))
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn http_spec(annotations: &[(&str, &str)]) -> LoadBalancerSpec {
        parse_spec(&service(vec![port("http", 80, 8080)], annotations), &config()).unwrap()
    }

    fn operations_on(fake: &FakeCloud, target: &str) -> Vec<&'static str> {
        fake.mutating_calls()
            .into_iter()
            .filter(|c| c.target == target)
            .map(|c| c.operation)
            .collect()
    }

    #[test]
    fn test_plan_listeners() {
        let current = vec![Listener::tcp(80, 8080), Listener::tcp(443, 8443)];
        let mut secure = Listener::tcp(443, 8443);
        secure.frontend_protocol = "SSL".into();
        secure.certificate_id = Some("cert-1".into());
        let plan = plan_listeners(&[Listener::tcp(80, 8080), secure.clone()], &current);
        assert_eq!(plan.delete, vec![443]);
        assert_eq!(plan.create, vec![secure.clone()]);
        assert!(plan.certificates.is_empty());

        let mut rotated = secure.clone();
        rotated.certificate_id = Some("cert-2".into());
        let plan = plan_listeners(&[rotated], &[secure]);
        assert_eq!(plan.certificates, vec![(443, "cert-2".to_string())]);
        assert!(plan.delete.is_empty() && plan.create.is_empty());
    }

    #[tokio::test]
    async fn test_create_reports_not_ready() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        let err = reconciler.ensure(&spec, &nodes(&["node-a"])).await.unwrap_err();
        assert!(err.is_not_ready());

        assert_eq!(
            operations_on(&fake, &spec.name),
            vec!["CreateLoadBalancer", "ConfigureHealthCheck", "RegisterVms"]
        );
        let state = fake.state();
        let lb = &state.load_balancers[&spec.name];
        assert_eq!(lb.listeners, vec![Listener::tcp(80, 8080)]);
        assert_eq!(lb.health_check.as_ref().map(|h| h.target()), Some("TCP:8080".to_string()));
        assert_eq!(lb.backend_vm_ids, ["i-foo".to_string()].into_iter().collect());
        assert_eq!(lb.subnets, vec!["subnet-elb"]);
        assert_eq!(Tags::new(&lb.tags).service_name(), Some("default/web"));
    }

    #[tokio::test]
    async fn test_second_ensure_is_idempotent() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        let nodes = nodes(&["node-a"]);
        assert!(reconciler.ensure(&spec, &nodes).await.is_err());

        fake.clear_calls();
        let status = reconciler.ensure(&spec, &nodes).await.unwrap();
        assert_eq!(status.hostname, Some(format!("{}.lbu.outscale.test", spec.name)));
        assert_eq!(status.ip, None);
        assert!(fake.mutating_calls().is_empty(), "{:?}", fake.mutating_calls());
        assert_eq!(fake.state().load_balancers.len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_create_completes_on_next_ensure() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        let nodes = nodes(&["node-a"]);
        fake.fail_next(
            "ConfigureHealthCheck",
            ApiError::new("ConfigureHealthCheck", Some("Throttling"), "slow down"),
        );
        let err = reconciler.ensure(&spec, &nodes).await.unwrap_err();
        assert!(!err.is_not_ready());
        {
            let state = fake.state();
            let lb = &state.load_balancers[&spec.name];
            assert!(lb.health_check.is_none());
            assert!(lb.backend_vm_ids.is_empty());
        }

        fake.clear_calls();
        let status = reconciler.ensure(&spec, &nodes).await.unwrap();
        assert!(status.hostname.is_some());
        assert!(fake.calls_to("CreateLoadBalancer").is_empty());
        assert_eq!(fake.calls_to("RegisterVms").len(), 1);
        assert_eq!(fake.calls_to("ConfigureHealthCheck").len(), 1);
        {
            let state = fake.state();
            let lb = &state.load_balancers[&spec.name];
            assert_eq!(lb.health_check.as_ref().map(|h| h.target()), Some("TCP:8080".to_string()));
            assert_eq!(lb.backend_vm_ids, ["i-foo".to_string()].into_iter().collect());
        }

        fake.clear_calls();
        reconciler.ensure(&spec, &nodes).await.unwrap();
        assert!(fake.mutating_calls().is_empty(), "{:?}", fake.mutating_calls());
    }

    #[tokio::test]
    async fn test_leftover_ingress_group_is_adopted() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        fake.state().security_groups.push(SecurityGroup {
            id: "sg-left".into(),
            name: ingress_group_name(&spec.name),
            net_id: "vpc-1".into(),
            ..Default::default()
        });

        assert!(reconciler.ensure(&spec, &nodes(&["node-a"])).await.unwrap_err().is_not_ready());
        assert!(fake.calls_to("CreateSecurityGroup").is_empty());
        let state = fake.state();
        assert_eq!(state.load_balancers[&spec.name].security_groups, vec!["sg-left"]);
        let group = state.security_groups.iter().find(|g| g.id == "sg-left").unwrap();
        assert_eq!(Tags::new(&group.tags).service_name(), Some("default/web"));
    }

    #[tokio::test]
    async fn test_foreign_load_balancer_is_left_alone() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        fake.state().load_balancers.insert(
            spec.name.clone(),
            LoadBalancerDescription {
                name: spec.name.clone(),
                tags: [("OscK8sClusterID/bar".to_string(), "owned".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
        );

        assert!(matches!(
            reconciler.update(&spec, &nodes(&["node-a"])).await,
            Err(CcmError::OwnedByAnotherCluster(_))
        ));
        assert!(matches!(
            reconciler.ensure(&spec, &nodes(&["node-a"])).await,
            Err(CcmError::OwnedByAnotherCluster(_))
        ));
        reconciler.ensure_deleted(&spec.reference()).await.unwrap();
        assert_eq!(reconciler.get(&spec).await.unwrap(), None);
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_frontend_port_change() {
        let (fake, reconciler) = setup();
        let nodes = nodes(&["node-a"]);
        assert!(reconciler.ensure(&http_spec(&[]), &nodes).await.is_err());

        let moved = parse_spec(&service(vec![port("http", 8080, 8080)], &[]), &config()).unwrap();
        fake.clear_calls();
        reconciler.ensure(&moved, &nodes).await.unwrap();

        let deletes = fake.calls_to("DeleteListeners");
        let creates = fake.calls_to("CreateListeners");
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].detail, "[80]");
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].detail, "[8080]");
        assert_eq!(fake.calls_to("RevokeIngress").len(), 1);
        assert_eq!(fake.calls_to("AuthorizeIngress").len(), 1);

        let state = fake.state();
        let ingress_group = state
            .security_groups
            .iter()
            .find(|g| g.name == ingress_group_name(&moved.name))
            .unwrap();
        assert_eq!(ingress_group.ingress, vec![IpPermission::tcp_port(8080).with_cidr("0.0.0.0/0")]);
    }

    #[tokio::test]
    async fn test_enable_proxy_protocol() {
        let (fake, reconciler) = setup();
        let nodes = nodes(&["node-a"]);
        let ports = || vec![port("http", 80, 8080), port("https", 443, 8443)];
        let plain = parse_spec(&service(ports(), &[]), &config()).unwrap();
        assert!(reconciler.ensure(&plain, &nodes).await.is_err());
        reconciler.ensure(&plain, &nodes).await.unwrap();

        let proxied = parse_spec(&service(ports(), &[(annotations::PROXY_PROTOCOL, "*")]), &config()).unwrap();
        fake.clear_calls();
        let status = reconciler.ensure(&proxied, &nodes).await.unwrap();
        assert!(status.hostname.is_some());

        assert_eq!(fake.calls_to("DescribePolicies").len(), 1);
        assert_eq!(fake.calls_to("CreatePolicy").len(), 1);
        assert_eq!(fake.calls_to("SetBackendPolicies").len(), 2);

        fake.clear_calls();
        reconciler.ensure(&proxied, &nodes).await.unwrap();
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_after_type_switch() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        assert!(reconciler.ensure(&spec, &nodes(&["node-a"])).await.is_err());

        // No node ports left and an annotation that no longer parses
        let mut switched = service(Vec::new(), &[(annotations::HC_TIMEOUT, "soon")]);
        if let Some(svc_spec) = switched.spec.as_mut() {
            svc_spec.type_ = Some("ClusterIP".into());
        }
        let target = LoadBalancerRef::from_service(&switched).unwrap();
        reconciler.ensure_deleted(&target).await.unwrap();

        let state = fake.state();
        assert!(state.load_balancers.is_empty());
        let group = state
            .security_groups
            .iter()
            .find(|g| g.name == ingress_group_name(&spec.name))
            .unwrap();
        assert!(Tags::new(&group.tags).marked_for_deletion());
    }

    #[tokio::test]
    async fn test_delete_missing_load_balancer() {
        let (fake, reconciler) = setup();
        reconciler.ensure_deleted(&http_spec(&[]).reference()).await.unwrap();
        assert!(fake.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_then_sweep() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        assert!(reconciler.ensure(&spec, &nodes(&["node-a"])).await.is_err());

        reconciler.ensure_deleted(&spec.reference()).await.unwrap();
        assert_eq!(
            operations_on(&fake, &spec.name),
            vec![
                "CreateLoadBalancer",
                "ConfigureHealthCheck",
                "RegisterVms",
                "DeregisterVms",
                "DeleteLoadBalancer"
            ]
        );
        let group_id = {
            let state = fake.state();
            assert!(state.load_balancers.is_empty());
            let group = state
                .security_groups
                .iter()
                .find(|g| g.name == ingress_group_name(&spec.name))
                .unwrap();
            assert!(Tags::new(&group.tags).marked_for_deletion());
            group.id.clone()
        };

        let report = reconciler.security().sweep().await.unwrap();
        assert_eq!(report.deleted, vec![group_id]);
        let state = fake.state();
        assert_eq!(state.security_groups.len(), 1);
        assert!(state.security_groups[0].ingress.is_empty());
    }

    #[tokio::test]
    async fn test_update_membership() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[]);
        assert!(matches!(
            reconciler.update(&spec, &nodes(&["node-a"])).await,
            Err(CcmError::NotFound { .. })
        ));

        assert!(reconciler.ensure(&spec, &nodes(&["node-a"])).await.is_err());
        fake.state().vms.push(vm("i-bar", "node-b"));
        fake.clear_calls();
        reconciler.update(&spec, &nodes(&["node-b", "node-gone"])).await.unwrap();

        assert_eq!(operations_on(&fake, &spec.name), vec!["RegisterVms", "DeregisterVms"]);
        let backends = fake.state().load_balancers[&spec.name].backend_vm_ids.clone();
        assert_eq!(backends, ["i-bar".to_string()].into_iter().collect());

        assert!(matches!(
            reconciler.update(&spec, &nodes(&["node-gone"])).await,
            Err(CcmError::NoBackends(_))
        ));
    }

    #[tokio::test]
    async fn test_ip_ingress_from_dns() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[(annotations::INGRESS_ADDRESS, "ip")]);
        let nodes = nodes(&["node-a"]);
        assert!(reconciler.ensure(&spec, &nodes).await.is_err());

        // Not resolvable yet
        assert!(reconciler.ensure(&spec, &nodes).await.unwrap_err().is_not_ready());

        let hostname = format!("{}.lbu.outscale.test", spec.name);
        fake.state()
            .dns
            .insert(hostname, vec!["10.0.0.5".parse().unwrap()]);
        let status = reconciler.ensure(&spec, &nodes).await.unwrap();
        assert_eq!(status.hostname, None);
        assert_eq!(status.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(status.ip_mode.as_deref(), Some("VIP"));
    }

    #[tokio::test]
    async fn test_public_ip_from_pool() {
        let (fake, reconciler) = setup();
        let pool_tags: TagMap = [("OscK8sIPPool".to_string(), "pool-a".to_string())]
            .into_iter()
            .collect();
        fake.state().public_ips = vec![
            PublicIp {
                id: "eipalloc-1".into(),
                address: "198.51.100.1".into(),
                link_id: Some("eipassoc-1".into()),
                tags: pool_tags.clone(),
            },
            PublicIp {
                id: "eipalloc-2".into(),
                address: "198.51.100.2".into(),
                link_id: None,
                tags: pool_tags,
            },
        ];
        let spec = http_spec(&[(annotations::IP_POOL, "pool-a")]);
        assert!(reconciler.ensure(&spec, &nodes(&["node-a"])).await.is_err());
        assert_eq!(
            fake.state().load_balancers[&spec.name].public_ip.as_deref(),
            Some("198.51.100.2")
        );

        let (_fake, reconciler) = setup();
        let empty_pool = http_spec(&[(annotations::IP_POOL, "pool-b")]);
        assert!(matches!(
            reconciler.ensure(&empty_pool, &nodes(&["node-a"])).await,
            Err(CcmError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_public_ip_rejected_before_any_change() {
        let (fake, reconciler) = setup();
        fake.state().public_ip_unsupported = true;
        let spec = http_spec(&[(annotations::IP_ID, "eipalloc-1")]);
        assert!(matches!(
            reconciler.ensure(&spec, &nodes(&["node-a"])).await,
            Err(CcmError::InvalidSpec(_))
        ));
        assert!(fake.mutating_calls().is_empty());
        assert!(fake.state().security_groups.iter().all(|g| g.id == "sg-worker"));
    }

    #[tokio::test]
    async fn test_attributes_applied_once() {
        let (fake, reconciler) = setup();
        let spec = http_spec(&[(annotations::CONNECTION_IDLE_TIMEOUT, "120")]);
        let nodes = nodes(&["node-a"]);
        assert!(reconciler.ensure(&spec, &nodes).await.is_err());
        assert_eq!(fake.state().attributes[&spec.name].idle_timeout, Some(120));

        fake.clear_calls();
        reconciler.ensure(&spec, &nodes).await.unwrap();
        assert!(fake.calls_to("ModifyAttributes").is_empty());
        assert_eq!(fake.calls_to("DescribeAttributes").len(), 1);
    }

    #[tokio::test]
    async fn test_extra_security_groups_are_attached() {
        let (fake, reconciler) = setup();
        let nodes = nodes(&["node-a"]);
        assert!(reconciler.ensure(&http_spec(&[]), &nodes).await.is_err());

        let spec = http_spec(&[(annotations::EXTRA_SECURITY_GROUPS, "sg-extra")]);
        fake.clear_calls();
        reconciler.ensure(&spec, &nodes).await.unwrap();
        assert_eq!(operations_on(&fake, &spec.name), vec!["ApplySecurityGroups"]);
        let attached = fake.state().load_balancers[&spec.name].security_groups.clone();
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[1], "sg-extra");
    }

    #[tokio::test]
    async fn test_outcomes_are_observed() {
        let (_fake, reconciler) = setup();
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let reconciler = reconciler.with_metrics(metrics.clone());
        let spec = http_spec(&[]);
        assert!(reconciler.ensure(&spec, &nodes(&["node-a"])).await.is_err());
        reconciler.ensure(&spec, &nodes(&["node-a"])).await.unwrap();

        let text = metrics.gather().unwrap();
        assert!(text.contains(r#"ccm_reconcile_total{operation="ensure",outcome="not_ready"} 1"#));
        assert!(text.contains(r#"ccm_reconcile_total{operation="ensure",outcome="success"} 1"#));
    }
}
