//! In-memory cloud for tests
//!
//! `FakeCloud` implements every capability interface against a plain data
//! model and records each call, so tests can assert on the exact sequence
//! of remote operations a reconciliation issued.

use crate::compute::{ComputeApi, Filter, IpPermission, PublicIp, RouteTable, SecurityGroup, Subnet, Vm};
use crate::error::codes;
use crate::load_balancer::{
    CreateLoadBalancerRequest, HealthCheck, Listener, LoadBalancerApi, LoadBalancerAttributes,
    LoadBalancerDescription, PolicyDescription,
};
use crate::{ApiError, ApiResult, DnsResolver, Route, RouteState, TagMap};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

/// One recorded API call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub operation: &'static str,
    /// Resource the call addressed (LB name, group id, table id...)
    pub target: String,
    pub detail: String,
}

impl Call {
    pub fn is_mutating(&self) -> bool {
        !self.operation.starts_with("Describe") && self.operation != "ResolveHostname"
    }
}

/// Backing data of the fake
#[derive(Default)]
pub struct FakeState {
    pub vms: Vec<Vm>,
    pub security_groups: Vec<SecurityGroup>,
    pub subnets: Vec<Subnet>,
    pub route_tables: Vec<RouteTable>,
    pub public_ips: Vec<PublicIp>,
    pub load_balancers: BTreeMap<String, LoadBalancerDescription>,
    pub policies: BTreeMap<String, Vec<PolicyDescription>>,
    pub attributes: BTreeMap<String, LoadBalancerAttributes>,
    pub dns: BTreeMap<String, Vec<IpAddr>>,
    /// Behave like a backend that cannot pick the public IP of a load balancer
    pub public_ip_unsupported: bool,
    failures: BTreeMap<&'static str, ApiError>,
    next_id: u32,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<FakeState>,
    calls: Mutex<Vec<Call>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to the backing data, for seeding and inspection
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    /// Make the next call to `operation` fail with `error`
    pub fn fail_next(&self, operation: &'static str, error: ApiError) {
        self.state().failures.insert(operation, error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("fake calls poisoned").clone()
    }

    pub fn calls_to(&self, operation: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.operation == operation).collect()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutating).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("fake calls poisoned").clear();
    }

    fn record(&self, operation: &'static str, target: &str, detail: String) -> ApiResult<()> {
        self.calls.lock().expect("fake calls poisoned").push(Call {
            operation,
            target: target.to_string(),
            detail,
        });
        match self.state().failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn error(operation: &str, code: &str, message: impl Into<String>) -> ApiError {
    ApiError::new(operation, Some(code), message)
}

/// Evaluates tag filters; `None` when the filter is not about tags
fn tag_filter(filter: &Filter, tags: &TagMap) -> Option<bool> {
    if filter.name == "tag-key" {
        return Some(filter.values.iter().any(|k| tags.contains_key(k)));
    }
    let key = filter.name.strip_prefix("tag:")?;
    Some(
        tags.get(key)
            .map(|v| filter.values.iter().any(|want| want == v))
            .unwrap_or(false),
    )
}

fn matches_all<F>(filters: &[Filter], tags: &TagMap, field: F) -> bool
where
    F: Fn(&str) -> Vec<String>,
{
    filters.iter().all(|filter| {
        if let Some(hit) = tag_filter(filter, tags) {
            return hit;
        }
        let have = field(filter.name.as_str());
        have.iter().any(|h| filter.values.contains(h))
    })
}

fn same_member(a: &IpPermission, b: &IpPermission) -> bool {
    a.protocol == b.protocol
        && a.from_port == b.from_port
        && a.to_port == b.to_port
        && a.ip_ranges == b.ip_ranges
        && a.peers.iter().map(|p| &p.group_id).eq(b.peers.iter().map(|p| &p.group_id))
}

/// Splits permissions into one-member permissions, the way the fake stores them
fn members(rules: &[IpPermission]) -> Vec<IpPermission> {
    let mut out = Vec::new();
    for rule in rules {
        let base = IpPermission {
            protocol: rule.protocol.clone(),
            from_port: rule.from_port,
            to_port: rule.to_port,
            ..Default::default()
        };
        for cidr in &rule.ip_ranges {
            out.push(base.clone().with_cidr(cidr.clone()));
        }
        for peer in &rule.peers {
            let mut member = base.clone();
            member.peers.push(peer.clone());
            out.push(member);
        }
    }
    out
}

#[async_trait::async_trait]
impl ComputeApi for FakeCloud {
    async fn describe_vms(&self, filters: &[Filter]) -> ApiResult<Vec<Vm>> {
        self.record("DescribeVms", "", format!("{:?}", filters))?;
        let state = self.state();
        Ok(state
            .vms
            .iter()
            .filter(|vm| {
                matches_all(filters, &vm.tags, |name| match name {
                    "private-dns-name" => vec![vm.private_dns.clone()],
                    "instance-id" => vec![vm.id.clone()],
                    "instance-state-name" => vec![vm.state.as_str().to_string()],
                    "vpc-id" => vec![vm.net_id.clone()],
                    _ => Vec::new(),
                })
            })
            .cloned()
            .collect())
    }

    async fn set_source_dest_check(&self, vm_id: &str, enabled: bool) -> ApiResult<()> {
        self.record("SetSourceDestCheck", vm_id, enabled.to_string())?;
        let mut state = self.state();
        let vm = state
            .vms
            .iter_mut()
            .find(|vm| vm.id == vm_id)
            .ok_or_else(|| error("SetSourceDestCheck", "InvalidInstanceID.NotFound", vm_id))?;
        vm.source_dest_check = enabled;
        Ok(())
    }

    async fn describe_security_groups(&self, filters: &[Filter]) -> ApiResult<Vec<SecurityGroup>> {
        self.record("DescribeSecurityGroups", "", format!("{:?}", filters))?;
        let state = self.state();
        Ok(state
            .security_groups
            .iter()
            .filter(|sg| {
                matches_all(filters, &sg.tags, |name| match name {
                    "group-id" => vec![sg.id.clone()],
                    "group-name" => vec![sg.name.clone()],
                    "vpc-id" => vec![sg.net_id.clone()],
                    _ => Vec::new(),
                })
            })
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        net_id: &str,
        tags: &TagMap,
    ) -> ApiResult<String> {
        self.record("CreateSecurityGroup", name, description.to_string())?;
        let mut state = self.state();
        if state
            .security_groups
            .iter()
            .any(|sg| sg.name == name && sg.net_id == net_id)
        {
            return Err(error("CreateSecurityGroup", codes::DUPLICATE_GROUP, name));
        }
        let id = state.next_id("sg");
        state.security_groups.push(SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            description: description.to_string(),
            net_id: net_id.to_string(),
            tags: tags.clone(),
            ..Default::default()
        });
        Ok(id)
    }

    async fn delete_security_group(&self, group_id: &str) -> ApiResult<()> {
        self.record("DeleteSecurityGroup", group_id, String::new())?;
        let mut state = self.state();
        if state
            .load_balancers
            .values()
            .any(|lb| lb.security_groups.iter().any(|g| g == group_id))
        {
            return Err(error("DeleteSecurityGroup", codes::DEPENDENCY_VIOLATION, group_id));
        }
        let before = state.security_groups.len();
        state.security_groups.retain(|sg| sg.id != group_id);
        if state.security_groups.len() == before {
            return Err(error("DeleteSecurityGroup", "InvalidGroup.NotFound", group_id));
        }
        Ok(())
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IpPermission]) -> ApiResult<()> {
        self.record("AuthorizeIngress", group_id, format!("{:?}", rules))?;
        let mut state = self.state();
        let sg = state
            .security_groups
            .iter_mut()
            .find(|sg| sg.id == group_id)
            .ok_or_else(|| error("AuthorizeIngress", "InvalidGroup.NotFound", group_id))?;
        for member in members(rules) {
            if sg.ingress.iter().any(|r| same_member(r, &member)) {
                return Err(error("AuthorizeIngress", codes::DUPLICATE_PERMISSION, group_id));
            }
            sg.ingress.push(member);
        }
        Ok(())
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[IpPermission]) -> ApiResult<()> {
        self.record("RevokeIngress", group_id, format!("{:?}", rules))?;
        let mut state = self.state();
        let sg = state
            .security_groups
            .iter_mut()
            .find(|sg| sg.id == group_id)
            .ok_or_else(|| error("RevokeIngress", "InvalidGroup.NotFound", group_id))?;
        for member in members(rules) {
            let before = sg.ingress.len();
            sg.ingress.retain(|r| !same_member(r, &member));
            if sg.ingress.len() == before {
                return Err(error("RevokeIngress", "InvalidPermission.NotFound", group_id));
            }
        }
        Ok(())
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> ApiResult<Vec<Subnet>> {
        self.record("DescribeSubnets", "", format!("{:?}", filters))?;
        let state = self.state();
        Ok(state
            .subnets
            .iter()
            .filter(|subnet| {
                matches_all(filters, &subnet.tags, |name| match name {
                    "subnet-id" => vec![subnet.id.clone()],
                    "vpc-id" => vec![subnet.net_id.clone()],
                    _ => Vec::new(),
                })
            })
            .cloned()
            .collect())
    }

    async fn describe_route_tables(&self, filters: &[Filter]) -> ApiResult<Vec<RouteTable>> {
        self.record("DescribeRouteTables", "", format!("{:?}", filters))?;
        let state = self.state();
        Ok(state
            .route_tables
            .iter()
            .filter(|table| {
                matches_all(filters, &table.tags, |name| match name {
                    "route-table-id" => vec![table.id.clone()],
                    "vpc-id" => vec![table.net_id.clone()],
                    _ => Vec::new(),
                })
            })
            .cloned()
            .collect())
    }

    async fn create_route(&self, table_id: &str, destination: &str, vm_id: &str) -> ApiResult<()> {
        self.record("CreateRoute", table_id, format!("{} -> {}", destination, vm_id))?;
        let mut state = self.state();
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == table_id)
            .ok_or_else(|| error("CreateRoute", "InvalidRouteTableID.NotFound", table_id))?;
        if table.routes.iter().any(|r| r.destination == destination) {
            return Err(error("CreateRoute", "RouteAlreadyExists", destination));
        }
        table.routes.push(Route {
            destination: destination.to_string(),
            target_vm_id: Some(vm_id.to_string()),
            gateway_id: None,
            state: RouteState::Active,
        });
        Ok(())
    }

    async fn delete_route(&self, table_id: &str, destination: &str) -> ApiResult<()> {
        self.record("DeleteRoute", table_id, destination.to_string())?;
        let mut state = self.state();
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| t.id == table_id)
            .ok_or_else(|| error("DeleteRoute", "InvalidRouteTableID.NotFound", table_id))?;
        let before = table.routes.len();
        table.routes.retain(|r| r.destination != destination);
        if table.routes.len() == before {
            return Err(error("DeleteRoute", "InvalidRoute.NotFound", destination));
        }
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &TagMap) -> ApiResult<()> {
        self.record("CreateTags", &resource_ids.join(","), format!("{:?}", tags))?;
        let mut state = self.state();
        for id in resource_ids {
            if let Some(sg) = state.security_groups.iter_mut().find(|sg| &sg.id == id) {
                sg.tags.extend(tags.clone());
            } else if let Some(vm) = state.vms.iter_mut().find(|vm| &vm.id == id) {
                vm.tags.extend(tags.clone());
            }
        }
        Ok(())
    }

    async fn describe_public_ips(&self, filters: &[Filter]) -> ApiResult<Vec<PublicIp>> {
        self.record("DescribePublicIps", "", format!("{:?}", filters))?;
        let state = self.state();
        Ok(state
            .public_ips
            .iter()
            .filter(|ip| {
                matches_all(filters, &ip.tags, |name| match name {
                    "public-ip" => vec![ip.address.clone()],
                    "allocation-id" => vec![ip.id.clone()],
                    _ => Vec::new(),
                })
            })
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl LoadBalancerApi for FakeCloud {
    fn supports_public_ip(&self) -> bool {
        !self.state().public_ip_unsupported
    }

    async fn describe_load_balancer(&self, name: &str) -> ApiResult<Option<LoadBalancerDescription>> {
        self.record("DescribeLoadBalancer", name, String::new())?;
        Ok(self.state().load_balancers.get(name).cloned())
    }

    async fn create_load_balancer(&self, request: &CreateLoadBalancerRequest) -> ApiResult<Option<String>> {
        self.record(
            "CreateLoadBalancer",
            &request.name,
            format!("{:?}", request.listeners),
        )?;
        let mut state = self.state();
        if state.load_balancers.contains_key(&request.name) {
            return Err(error("CreateLoadBalancer", "DuplicateLoadBalancerName", &request.name));
        }
        let dns_name = format!("{}.lbu.outscale.test", request.name);
        state.load_balancers.insert(
            request.name.clone(),
            LoadBalancerDescription {
                name: request.name.clone(),
                dns_name: Some(dns_name.clone()),
                public_ip: request.public_ip.clone(),
                internal: request.internal,
                subnets: request.subnets.clone(),
                security_groups: request.security_groups.clone(),
                listeners: request.listeners.clone(),
                tags: request.tags.clone(),
                ..Default::default()
            },
        );
        Ok(Some(dns_name))
    }

    async fn delete_load_balancer(&self, name: &str) -> ApiResult<()> {
        self.record("DeleteLoadBalancer", name, String::new())?;
        let mut state = self.state();
        state.load_balancers.remove(name);
        state.policies.remove(name);
        state.attributes.remove(name);
        Ok(())
    }

    async fn create_listeners(&self, name: &str, listeners: &[Listener]) -> ApiResult<()> {
        let ports: Vec<u16> = listeners.iter().map(|l| l.frontend_port).collect();
        self.record("CreateListeners", name, format!("{:?}", ports))?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "CreateListeners", name)?;
        for listener in listeners {
            if lb.listener(listener.frontend_port).is_some() {
                return Err(error("CreateListeners", "DuplicateListener", name));
            }
            lb.listeners.push(listener.clone());
        }
        Ok(())
    }

    async fn delete_listeners(&self, name: &str, frontend_ports: &[u16]) -> ApiResult<()> {
        self.record("DeleteListeners", name, format!("{:?}", frontend_ports))?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "DeleteListeners", name)?;
        lb.listeners.retain(|l| !frontend_ports.contains(&l.frontend_port));
        Ok(())
    }

    async fn set_listener_certificate(
        &self,
        name: &str,
        frontend_port: u16,
        certificate_id: &str,
    ) -> ApiResult<()> {
        self.record(
            "SetListenerCertificate",
            name,
            format!("{} {}", frontend_port, certificate_id),
        )?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "SetListenerCertificate", name)?;
        let listener = lb
            .listeners
            .iter_mut()
            .find(|l| l.frontend_port == frontend_port)
            .ok_or_else(|| error("SetListenerCertificate", "ListenerNotFound", name))?;
        listener.certificate_id = Some(certificate_id.to_string());
        Ok(())
    }

    async fn register_vms(&self, name: &str, vm_ids: &[String]) -> ApiResult<()> {
        self.record("RegisterVms", name, format!("{:?}", vm_ids))?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "RegisterVms", name)?;
        lb.backend_vm_ids.extend(vm_ids.iter().cloned());
        Ok(())
    }

    async fn deregister_vms(&self, name: &str, vm_ids: &[String]) -> ApiResult<()> {
        self.record("DeregisterVms", name, format!("{:?}", vm_ids))?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "DeregisterVms", name)?;
        for id in vm_ids {
            lb.backend_vm_ids.remove(id);
        }
        Ok(())
    }

    async fn configure_health_check(&self, name: &str, health_check: &HealthCheck) -> ApiResult<()> {
        self.record("ConfigureHealthCheck", name, health_check.target())?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "ConfigureHealthCheck", name)?;
        lb.health_check = Some(health_check.clone());
        Ok(())
    }

    async fn describe_policies(&self, name: &str) -> ApiResult<Vec<PolicyDescription>> {
        self.record("DescribePolicies", name, String::new())?;
        Ok(self.state().policies.get(name).cloned().unwrap_or_default())
    }

    async fn create_policy(&self, name: &str, policy: &PolicyDescription) -> ApiResult<()> {
        self.record("CreatePolicy", name, policy.name.clone())?;
        let mut state = self.state();
        let policies = state.policies.entry(name.to_string()).or_default();
        if policies.iter().any(|p| p.name == policy.name) {
            return Err(error("CreatePolicy", "DuplicatePolicyName", &policy.name));
        }
        policies.push(policy.clone());
        Ok(())
    }

    async fn set_backend_policies(
        &self,
        name: &str,
        backend_port: u16,
        policy_names: &[String],
    ) -> ApiResult<()> {
        self.record(
            "SetBackendPolicies",
            name,
            format!("{} {:?}", backend_port, policy_names),
        )?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "SetBackendPolicies", name)?;
        if policy_names.is_empty() {
            lb.backend_policies.remove(&backend_port);
        } else {
            lb.backend_policies.insert(backend_port, policy_names.to_vec());
        }
        Ok(())
    }

    async fn describe_attributes(&self, name: &str) -> ApiResult<LoadBalancerAttributes> {
        self.record("DescribeAttributes", name, String::new())?;
        Ok(self.state().attributes.get(name).cloned().unwrap_or_default())
    }

    async fn modify_attributes(&self, name: &str, attributes: &LoadBalancerAttributes) -> ApiResult<()> {
        self.record("ModifyAttributes", name, format!("{:?}", attributes))?;
        let mut state = self.state();
        let current = state.attributes.entry(name.to_string()).or_default();
        if attributes.access_log.is_some() {
            current.access_log = attributes.access_log.clone();
        }
        if attributes.connection_draining.is_some() {
            current.connection_draining = attributes.connection_draining.clone();
        }
        if attributes.idle_timeout.is_some() {
            current.idle_timeout = attributes.idle_timeout;
        }
        Ok(())
    }

    async fn apply_security_groups(&self, name: &str, group_ids: &[String]) -> ApiResult<()> {
        self.record("ApplySecurityGroups", name, format!("{:?}", group_ids))?;
        let mut state = self.state();
        let lb = lb_mut(&mut state, "ApplySecurityGroups", name)?;
        lb.security_groups = group_ids.to_vec();
        Ok(())
    }
}

#[async_trait::async_trait]
impl DnsResolver for FakeCloud {
    async fn resolve(&self, hostname: &str) -> ApiResult<Vec<IpAddr>> {
        self.record("ResolveHostname", hostname, String::new())?;
        self.state()
            .dns
            .get(hostname)
            .cloned()
            .ok_or_else(|| error("ResolveHostname", "HostNotFound", hostname))
    }
}

fn lb_mut<'a>(
    state: &'a mut FakeState,
    operation: &str,
    name: &str,
) -> ApiResult<&'a mut LoadBalancerDescription> {
    state
        .load_balancers
        .get_mut(name)
        .ok_or_else(|| error(operation, codes::LOAD_BALANCER_NOT_FOUND, name))
}
