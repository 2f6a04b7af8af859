//! Load balancer (LBU) resources

use crate::{ApiResult, TagMap};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A listener: frontend port/protocol forwarded to a backend port/protocol
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub frontend_port: u16,
    /// TCP, SSL, HTTP or HTTPS
    pub frontend_protocol: String,
    pub backend_port: u16,
    pub backend_protocol: String,
    /// Server certificate for SSL/HTTPS listeners
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
}

impl Listener {
    pub fn tcp(frontend_port: u16, backend_port: u16) -> Self {
        Self {
            frontend_port,
            frontend_protocol: "TCP".to_string(),
            backend_port,
            backend_protocol: "TCP".to_string(),
            certificate_id: None,
        }
    }

    /// Whether the frontend terminates TLS
    pub fn is_secure(&self) -> bool {
        matches!(self.frontend_protocol.as_str(), "SSL" | "HTTPS")
    }

    /// Same forwarding, ignoring the certificate
    pub fn same_forwarding(&self, other: &Listener) -> bool {
        self.frontend_port == other.frontend_port
            && self.frontend_protocol.eq_ignore_ascii_case(&other.frontend_protocol)
            && self.backend_port == other.backend_port
            && self.backend_protocol.eq_ignore_ascii_case(&other.backend_protocol)
    }
}

/// Health check of the backend VMs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// TCP, SSL, HTTP or HTTPS
    pub protocol: String,
    pub port: u16,
    /// Request path, HTTP(S) only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    /// Seconds between checks
    pub interval: u32,
    /// Seconds before a check fails
    pub timeout: u32,
}

impl HealthCheck {
    /// Target string in the API form, e.g. "TCP:8080" or "HTTP:10256/healthz"
    pub fn target(&self) -> String {
        match (&self.path, self.protocol.as_str()) {
            (Some(path), "HTTP" | "HTTPS") => format!("{}:{}{}", self.protocol, self.port, path),
            _ => format!("{}:{}", self.protocol, self.port),
        }
    }

    /// Parse a target string back into protocol, port and path
    pub fn parse_target(target: &str) -> Option<(String, u16, Option<String>)> {
        let (protocol, rest) = target.split_once(':')?;
        let (port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], Some(rest[idx..].to_string())),
            None => (rest, None),
        };
        Some((protocol.to_uppercase(), port.parse().ok()?, path))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLog {
    pub enabled: bool,
    /// Minutes between publications
    pub emit_interval: Option<u32>,
    pub bucket_name: Option<String>,
    pub bucket_prefix: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDraining {
    pub enabled: bool,
    pub timeout: Option<u32>,
}

/// Tunable attributes of a load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerAttributes {
    pub access_log: Option<AccessLog>,
    pub connection_draining: Option<ConnectionDraining>,
    /// Seconds
    pub idle_timeout: Option<u32>,
}

/// A load balancer policy (e.g. proxy protocol)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDescription {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Current state of a remote load balancer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerDescription {
    pub name: String,
    pub dns_name: Option<String>,
    pub public_ip: Option<String>,
    pub internal: bool,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub backend_vm_ids: BTreeSet<String>,
    /// Policy names attached per backend port
    #[serde(default)]
    pub backend_policies: BTreeMap<u16, Vec<String>>,
    #[serde(default)]
    pub tags: TagMap,
}

impl LoadBalancerDescription {
    pub fn listener(&self, frontend_port: u16) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.frontend_port == frontend_port)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub listeners: Vec<Listener>,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub internal: bool,
    pub public_ip: Option<String>,
    pub tags: TagMap,
}

/// Load balancer API consumed by the controller
#[async_trait::async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Whether `create_load_balancer` honors `public_ip`
    fn supports_public_ip(&self) -> bool {
        true
    }

    /// `None` when no load balancer has this name
    async fn describe_load_balancer(&self, name: &str) -> ApiResult<Option<LoadBalancerDescription>>;

    /// Returns the DNS name when the platform assigns it synchronously
    async fn create_load_balancer(&self, request: &CreateLoadBalancerRequest) -> ApiResult<Option<String>>;

    async fn delete_load_balancer(&self, name: &str) -> ApiResult<()>;

    async fn create_listeners(&self, name: &str, listeners: &[Listener]) -> ApiResult<()>;

    async fn delete_listeners(&self, name: &str, frontend_ports: &[u16]) -> ApiResult<()>;

    async fn set_listener_certificate(
        &self,
        name: &str,
        frontend_port: u16,
        certificate_id: &str,
    ) -> ApiResult<()>;

    async fn register_vms(&self, name: &str, vm_ids: &[String]) -> ApiResult<()>;

    async fn deregister_vms(&self, name: &str, vm_ids: &[String]) -> ApiResult<()>;

    async fn configure_health_check(&self, name: &str, health_check: &HealthCheck) -> ApiResult<()>;

    async fn describe_policies(&self, name: &str) -> ApiResult<Vec<PolicyDescription>>;

    async fn create_policy(&self, name: &str, policy: &PolicyDescription) -> ApiResult<()>;

    /// Replaces the policies attached to `backend_port`
    async fn set_backend_policies(
        &self,
        name: &str,
        backend_port: u16,
        policy_names: &[String],
    ) -> ApiResult<()>;

    async fn describe_attributes(&self, name: &str) -> ApiResult<LoadBalancerAttributes>;

    async fn modify_attributes(&self, name: &str, attributes: &LoadBalancerAttributes) -> ApiResult<()>;

    async fn apply_security_groups(&self, name: &str, group_ids: &[String]) -> ApiResult<()>;
}
