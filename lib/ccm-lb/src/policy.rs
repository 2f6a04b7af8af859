//! Backend policies and load balancer attributes

use ccm_api::{Listener, LoadBalancerAttributes, PolicyDescription};
use std::collections::{BTreeMap, BTreeSet};

pub const PROXY_PROTOCOL_POLICY_NAME: &str = "k8s-proxyprotocol-enabled";
pub const PROXY_PROTOCOL_POLICY_TYPE: &str = "ProxyProtocolPolicyType";

/// Backend ports receiving the PROXY protocol header
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ProxyProtocol {
    #[default]
    Disabled,
    /// Every backend port of the listeners
    All,
    Ports(BTreeSet<u16>),
}

impl ProxyProtocol {
    pub fn is_enabled(&self) -> bool {
        match self {
            ProxyProtocol::Disabled => false,
            ProxyProtocol::All => true,
            ProxyProtocol::Ports(ports) => !ports.is_empty(),
        }
    }

    pub fn applies_to(&self, backend_port: u16) -> bool {
        match self {
            ProxyProtocol::Disabled => false,
            ProxyProtocol::All => true,
            ProxyProtocol::Ports(ports) => ports.contains(&backend_port),
        }
    }
}

pub fn proxy_protocol_policy() -> PolicyDescription {
    PolicyDescription {
        name: PROXY_PROTOCOL_POLICY_NAME.to_string(),
        type_name: PROXY_PROTOCOL_POLICY_TYPE.to_string(),
        attributes: [("ProxyProtocol".to_string(), "true".to_string())]
            .into_iter()
            .collect(),
    }
}

/// One SetBackendPolicies call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendPolicyChange {
    pub backend_port: u16,
    pub policy_names: Vec<String>,
}

/// Per-port policy lists to set so that exactly the requested backend ports
/// carry the proxy protocol policy. Other policies attached to a port are
/// preserved.
pub fn plan_backend_policies(
    proxy: &ProxyProtocol,
    listeners: &[Listener],
    current: &BTreeMap<u16, Vec<String>>,
) -> Vec<BackendPolicyChange> {
    let mut ports: BTreeSet<u16> = listeners.iter().map(|l| l.backend_port).collect();
    ports.extend(
        current
            .iter()
            .filter(|(_, names)| names.iter().any(|n| n == PROXY_PROTOCOL_POLICY_NAME))
            .map(|(port, _)| *port),
    );

    let listener_ports: BTreeSet<u16> = listeners.iter().map(|l| l.backend_port).collect();
    let mut changes = Vec::new();
    for port in ports {
        let attached = current.get(&port).cloned().unwrap_or_default();
        let has = attached.iter().any(|n| n == PROXY_PROTOCOL_POLICY_NAME);
        let wants = listener_ports.contains(&port) && proxy.applies_to(port);
        if has == wants {
            continue;
        }
        let mut policy_names: Vec<String> = attached
            .into_iter()
            .filter(|n| n != PROXY_PROTOCOL_POLICY_NAME)
            .collect();
        if wants {
            policy_names.push(PROXY_PROTOCOL_POLICY_NAME.to_string());
        }
        changes.push(BackendPolicyChange {
            backend_port: port,
            policy_names,
        });
    }
    changes
}

pub fn has_attributes(attributes: &LoadBalancerAttributes) -> bool {
    attributes.access_log.is_some()
        || attributes.connection_draining.is_some()
        || attributes.idle_timeout.is_some()
}

/// The requested attributes that differ from `current`, `None` when all match
pub fn attributes_patch(
    desired: &LoadBalancerAttributes,
    current: &LoadBalancerAttributes,
) -> Option<LoadBalancerAttributes> {
    let mut patch = LoadBalancerAttributes::default();
    if desired.access_log.is_some() && desired.access_log != current.access_log {
        patch.access_log = desired.access_log.clone();
    }
    if desired.connection_draining.is_some() && desired.connection_draining != current.connection_draining {
        patch.connection_draining = desired.connection_draining.clone();
    }
    if desired.idle_timeout.is_some() && desired.idle_timeout != current.idle_timeout {
        patch.idle_timeout = desired.idle_timeout;
    }
    has_attributes(&patch).then_some(patch)
}
