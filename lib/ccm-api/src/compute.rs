//! Compute (FCU) resources: VMs, security groups, subnets, route tables

use crate::{ApiResult, TagMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Filter applied to a describe call, matching any of `values`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Resources carrying `key`, whatever its value
    pub fn tag_key(key: impl Into<String>) -> Self {
        Self::new("tag-key", [key.into()])
    }

    /// Resources carrying `key` with exactly `value`
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{}", key), [value.into()])
    }
}

/// Lifecycle state of a VM
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl VmState {
    pub const ALIVE: [VmState; 4] = [
        VmState::Pending,
        VmState::Running,
        VmState::Stopping,
        VmState::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Pending => "pending",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::ShuttingDown => "shutting-down",
            VmState::Terminated => "terminated",
        }
    }

    /// Whether the VM can still serve as a backend or route target
    pub fn is_alive(&self) -> bool {
        !matches!(self, VmState::ShuttingDown | VmState::Terminated)
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VmState::Pending),
            "running" => Ok(VmState::Running),
            "stopping" => Ok(VmState::Stopping),
            "stopped" => Ok(VmState::Stopped),
            "shutting-down" => Ok(VmState::ShuttingDown),
            "terminated" => Ok(VmState::Terminated),
            other => Err(format!("unknown VM state: {}", other)),
        }
    }
}

/// A compute instance, as read from the platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    /// Kubernetes node name (the private DNS name on this platform)
    pub node_name: String,
    pub private_ip: String,
    pub public_ip: Option<String>,
    pub private_dns: String,
    pub public_dns: Option<String>,
    pub subnet_id: String,
    /// Net (VPC) the VM lives in
    pub net_id: String,
    pub security_group_ids: BTreeSet<String>,
    pub state: VmState,
    pub zone: String,
    pub vm_type: String,
    pub source_dest_check: bool,
    #[serde(default)]
    pub tags: TagMap,
}

/// Peer security group referenced by a rule
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupPeer {
    pub group_id: String,
    pub account_id: Option<String>,
}

impl GroupPeer {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            account_id: None,
        }
    }
}

/// An ingress permission as grouped by the API: one port range, many members
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPermission {
    /// "tcp", "udp", "icmp" or "-1" for all
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    #[serde(default)]
    pub ip_ranges: Vec<String>,
    #[serde(default)]
    pub peers: Vec<GroupPeer>,
}

impl IpPermission {
    pub fn tcp_port(port: u16) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: i32::from(port),
            to_port: i32::from(port),
            ..Default::default()
        }
    }

    pub fn with_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.ip_ranges.push(cidr.into());
        self
    }

    pub fn with_peer(mut self, group_id: impl Into<String>) -> Self {
        self.peers.push(GroupPeer::new(group_id));
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub description: String,
    pub net_id: String,
    #[serde(default)]
    pub tags: TagMap,
    #[serde(default)]
    pub ingress: Vec<IpPermission>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub net_id: String,
    pub zone: String,
    pub cidr: String,
    #[serde(default)]
    pub tags: TagMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteState {
    Active,
    Blackhole,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    pub target_vm_id: Option<String>,
    pub gateway_id: Option<String>,
    pub state: RouteState,
}

impl Route {
    pub fn is_blackhole(&self) -> bool {
        self.state == RouteState::Blackhole
    }

    /// Route leading to an internet gateway
    pub fn is_internet_route(&self) -> bool {
        self.gateway_id
            .as_deref()
            .map(|gw| gw.starts_with("igw-"))
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub id: String,
    pub net_id: String,
    /// Main table of its net, used by subnets without an explicit association
    pub main: bool,
    /// Subnets explicitly associated with this table
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub tags: TagMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIp {
    pub id: String,
    pub address: String,
    /// Set when the IP is linked to a VM, NIC or load balancer
    pub link_id: Option<String>,
    #[serde(default)]
    pub tags: TagMap,
}

/// Compute API consumed by the controller
#[async_trait::async_trait]
pub trait ComputeApi: Send + Sync {
    async fn describe_vms(&self, filters: &[Filter]) -> ApiResult<Vec<Vm>>;

    async fn set_source_dest_check(&self, vm_id: &str, enabled: bool) -> ApiResult<()>;

    async fn describe_security_groups(&self, filters: &[Filter]) -> ApiResult<Vec<SecurityGroup>>;

    /// Returns the id of the new group, created with `tags` in the same call
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        net_id: &str,
        tags: &TagMap,
    ) -> ApiResult<String>;

    async fn delete_security_group(&self, group_id: &str) -> ApiResult<()>;

    async fn authorize_ingress(&self, group_id: &str, rules: &[IpPermission]) -> ApiResult<()>;

    async fn revoke_ingress(&self, group_id: &str, rules: &[IpPermission]) -> ApiResult<()>;

    async fn describe_subnets(&self, filters: &[Filter]) -> ApiResult<Vec<Subnet>>;

    async fn describe_route_tables(&self, filters: &[Filter]) -> ApiResult<Vec<RouteTable>>;

    async fn create_route(&self, table_id: &str, destination: &str, vm_id: &str) -> ApiResult<()>;

    async fn delete_route(&self, table_id: &str, destination: &str) -> ApiResult<()>;

    async fn create_tags(&self, resource_ids: &[String], tags: &TagMap) -> ApiResult<()>;

    async fn describe_public_ips(&self, filters: &[Filter]) -> ApiResult<Vec<PublicIp>>;
}
