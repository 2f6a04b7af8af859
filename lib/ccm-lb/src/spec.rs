//! Service to LoadBalancerSpec translation
//!
//! Everything the reconciler needs is read from the Service once, here, and
//! validated before any remote call is made.

use crate::health_check::{desired_health_check, HealthCheckOverrides, HealthCheckPort};
use crate::ingress::{IngressAddressMode, IngressIpMode};
use crate::policy::ProxyProtocol;
use ccm_api::{AccessLog, ConnectionDraining, HealthCheck, Listener, LoadBalancerAttributes, TagMap};
use ccm_core::{CcmError, CloudConfig, Result};
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{Node, Service, ServicePort};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

pub mod annotations {
    pub const INTERNAL: &str = "service.beta.kubernetes.io/osc-load-balancer-internal";
    pub const NAME: &str = "service.beta.kubernetes.io/osc-load-balancer-name";
    pub const PROXY_PROTOCOL: &str = "service.beta.kubernetes.io/osc-load-balancer-proxy-protocol";
    pub const SSL_CERT: &str = "service.beta.kubernetes.io/osc-load-balancer-ssl-cert";
    pub const SSL_PORTS: &str = "service.beta.kubernetes.io/osc-load-balancer-ssl-ports";
    pub const BACKEND_PROTOCOL: &str = "service.beta.kubernetes.io/osc-load-balancer-backend-protocol";
    pub const SECURITY_GROUPS: &str = "service.beta.kubernetes.io/osc-load-balancer-security-groups";
    pub const EXTRA_SECURITY_GROUPS: &str =
        "service.beta.kubernetes.io/osc-load-balancer-extra-security-groups";
    pub const SUBNET_ID: &str = "service.beta.kubernetes.io/osc-load-balancer-subnet-id";
    pub const IP_ID: &str = "service.beta.kubernetes.io/osc-load-balancer-ip-id";
    pub const IP_POOL: &str = "service.beta.kubernetes.io/osc-load-balancer-ip-pool";
    pub const ADDITIONAL_TAGS: &str =
        "service.beta.kubernetes.io/osc-load-balancer-additional-resource-tags";
    pub const TARGET_ROLE: &str = "service.beta.kubernetes.io/osc-load-balancer-target-role";
    pub const TARGET_NODE_LABELS: &str =
        "service.beta.kubernetes.io/osc-load-balancer-target-node-labels";
    pub const INGRESS_ADDRESS: &str = "service.beta.kubernetes.io/osc-load-balancer-ingress-address";
    pub const INGRESS_IP_MODE: &str = "service.beta.kubernetes.io/osc-load-balancer-ingress-ipmode";

    pub const HC_HEALTHY_THRESHOLD: &str =
        "service.beta.kubernetes.io/osc-load-balancer-healthcheck-healthy-threshold";
    pub const HC_UNHEALTHY_THRESHOLD: &str =
        "service.beta.kubernetes.io/osc-load-balancer-healthcheck-unhealthy-threshold";
    pub const HC_INTERVAL: &str = "service.beta.kubernetes.io/osc-load-balancer-healthcheck-interval";
    pub const HC_TIMEOUT: &str = "service.beta.kubernetes.io/osc-load-balancer-healthcheck-timeout";
    pub const HC_PORT: &str = "service.beta.kubernetes.io/osc-load-balancer-healthcheck-port";
    pub const HC_PROTOCOL: &str = "service.beta.kubernetes.io/osc-load-balancer-healthcheck-protocol";
    pub const HC_PATH: &str = "service.beta.kubernetes.io/osc-load-balancer-healthcheck-path";

    pub const ACCESS_LOG_ENABLED: &str =
        "service.beta.kubernetes.io/osc-load-balancer-access-log-enabled";
    pub const ACCESS_LOG_EMIT_INTERVAL: &str =
        "service.beta.kubernetes.io/osc-load-balancer-access-log-emit-interval";
    pub const ACCESS_LOG_BUCKET_NAME: &str =
        "service.beta.kubernetes.io/osc-load-balancer-access-log-s3-bucket-name";
    pub const ACCESS_LOG_BUCKET_PREFIX: &str =
        "service.beta.kubernetes.io/osc-load-balancer-access-log-s3-bucket-prefix";
    pub const CONNECTION_DRAINING_ENABLED: &str =
        "service.beta.kubernetes.io/osc-load-balancer-connection-draining-enabled";
    pub const CONNECTION_DRAINING_TIMEOUT: &str =
        "service.beta.kubernetes.io/osc-load-balancer-connection-draining-timeout";
    pub const CONNECTION_IDLE_TIMEOUT: &str =
        "service.beta.kubernetes.io/osc-load-balancer-connection-idle-timeout";

    /// Standard source range annotation, merged with `spec.loadBalancerSourceRanges`
    pub const SOURCE_RANGES: &str = "service.beta.kubernetes.io/load-balancer-source-ranges";
    /// Standard label excluding a node from every load balancer
    pub const EXCLUDE_NODE_LABEL: &str = "node.kubernetes.io/exclude-from-external-load-balancers";
}

/// Maximum length of a load balancer name
pub const MAX_NAME_LENGTH: usize = 32;
const BACKEND_PROTOCOLS: [&str; 4] = ["http", "https", "ssl", "tcp"];

/// Public IP to attach to an internet-facing load balancer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublicIpRequest {
    /// Allocation id of a specific public IP
    ById(String),
    /// Any free IP of the pool
    ByPool(String),
}

/// Identity of the load balancer of a Service
///
/// Deletion needs nothing more, so it keeps working for Services whose
/// ports or annotations no longer make a valid LoadBalancerSpec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerRef {
    pub name: String,
    /// `namespace/name` of the Service
    pub service_name: String,
}

impl LoadBalancerRef {
    pub fn from_service(service: &Service) -> Result<Self> {
        Ok(Self {
            name: load_balancer_name(service)?,
            service_name: service_name(service),
        })
    }
}

/// Desired state of a load balancer, built once per reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancerSpec {
    pub name: String,
    /// `namespace/name` of the Service
    pub service_name: String,
    pub internal: bool,
    pub listeners: Vec<Listener>,
    pub health_check: HealthCheck,
    pub source_ranges: BTreeSet<String>,
    pub target_role: String,
    pub security_group_override: Option<String>,
    pub extra_security_groups: Vec<String>,
    pub subnet_override: Option<String>,
    pub public_ip: Option<PublicIpRequest>,
    pub proxy_protocol: ProxyProtocol,
    pub additional_tags: TagMap,
    pub attributes: LoadBalancerAttributes,
    pub ingress_address: IngressAddressMode,
    pub ingress_ip_mode: IngressIpMode,
}

impl LoadBalancerSpec {
    pub fn reference(&self) -> LoadBalancerRef {
        LoadBalancerRef {
            name: self.name.clone(),
            service_name: self.service_name.clone(),
        }
    }

    pub fn frontend_ports(&self) -> BTreeSet<u16> {
        self.listeners.iter().map(|l| l.frontend_port).collect()
    }

    /// Ports the backends must accept from the load balancer
    pub fn backend_ports(&self) -> BTreeSet<u16> {
        let mut ports: BTreeSet<u16> = self.listeners.iter().map(|l| l.backend_port).collect();
        ports.insert(self.health_check.port);
        ports
    }

    /// Roles of the backend security groups, any of which may match
    pub fn target_roles(&self) -> Vec<&str> {
        self.target_role
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect()
    }
}

fn invalid(message: impl Into<String>) -> CcmError {
    CcmError::InvalidSpec(message.into())
}

/// Annotation accessor; blank values count as unset
struct Annotations<'a>(Option<&'a BTreeMap<String, String>>);

impl<'a> Annotations<'a> {
    fn get(&self, key: &str) -> Option<&'a str> {
        self.0
            .and_then(|a| a.get(key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|_| invalid(format!("{}: cannot parse {:?}", key, v)))
            })
            .transpose()
    }

    fn bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(invalid(format!("{}: expected true or false, got {:?}", key, v))),
            })
            .transpose()
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `k1=v1,k2=v2`; with `allow_bare_keys`, `k` alone maps to an empty value
fn parse_key_values(key: &str, value: &str, allow_bare_keys: bool) -> Result<TagMap> {
    let mut out = TagMap::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (k, v) = match item.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None if allow_bare_keys => (item, ""),
            None => return Err(invalid(format!("{}: {:?} is not key=value", key, item))),
        };
        if k.is_empty() {
            return Err(invalid(format!("{}: empty key in {:?}", key, item)));
        }
        out.insert(k.to_string(), v.to_string());
    }
    Ok(out)
}

/// Normalizes `cidr` to its network address
pub fn normalize_cidr(cidr: &str) -> Result<String> {
    let net: IpNetwork = cidr
        .trim()
        .parse()
        .map_err(|_| invalid(format!("invalid source range {:?}", cidr)))?;
    let net = IpNetwork::new(net.network(), net.prefix())
        .map_err(|_| invalid(format!("invalid source range {:?}", cidr)))?;
    Ok(net.to_string())
}

/// Deterministic name of the load balancer of a Service
pub fn load_balancer_name(service: &Service) -> Result<String> {
    let ann = Annotations(service.metadata.annotations.as_ref());
    if let Some(name) = ann.get(annotations::NAME) {
        let valid = name.len() <= MAX_NAME_LENGTH
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !name.starts_with('-')
            && !name.ends_with('-');
        if !valid {
            return Err(invalid(format!(
                "load balancer name {:?} must be at most {} alphanumeric or '-' characters",
                name, MAX_NAME_LENGTH
            )));
        }
        return Ok(name.to_string());
    }
    let uid = service
        .metadata
        .uid
        .as_deref()
        .filter(|u| !u.is_empty())
        .ok_or_else(|| invalid("service has no UID"))?;
    let mut name: String = std::iter::once('a')
        .chain(uid.chars().filter(|c| *c != '-'))
        .collect();
    name.truncate(MAX_NAME_LENGTH);
    Ok(name)
}

fn service_name(service: &Service) -> String {
    format!(
        "{}/{}",
        service.metadata.namespace.as_deref().unwrap_or("default"),
        service.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Ports of `list` resolved against the service ports, by name or number.
/// `*` selects every port; `None` means the list was `*`.
fn select_ports<'a>(
    key: &str,
    list: &[String],
    ports: &'a [ServicePort],
) -> Result<Option<Vec<&'a ServicePort>>> {
    if list.iter().any(|p| p == "*") {
        return Ok(None);
    }
    list.iter()
        .map(|wanted| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(wanted.as_str()) || p.port.to_string() == *wanted)
                .ok_or_else(|| invalid(format!("{}: unknown port {:?}", key, wanted)))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn port_u16(value: i32, what: &str) -> Result<u16> {
    u16::try_from(value)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid(format!("{} {} is out of range", what, value)))
}

fn backend_protocol(ann: &Annotations<'_>) -> Result<Option<String>> {
    let Some(raw) = ann.get(annotations::BACKEND_PROTOCOL) else {
        return Ok(None);
    };
    let value = raw.to_ascii_lowercase();
    if value.ends_with('=') || !BACKEND_PROTOCOLS.contains(&value.as_str()) {
        return Err(invalid(format!(
            "{}: {:?} is not one of http, https, ssl, tcp",
            annotations::BACKEND_PROTOCOL,
            raw
        )));
    }
    Ok(Some(value))
}

/// Listener for one service port
///
/// With a certificate, listed SSL ports (all ports when the list is empty
/// or `*`) terminate TLS: HTTPS in front of an HTTP(S) backend, SSL
/// otherwise. Other listeners forward the backend protocol as is.
pub fn build_listener(
    port: &ServicePort,
    backend_protocol: Option<&str>,
    certificate: Option<&str>,
    ssl_ports: Option<&[&ServicePort]>,
) -> Result<Listener> {
    let protocol = port.protocol.as_deref().unwrap_or("TCP");
    if !protocol.eq_ignore_ascii_case("TCP") {
        return Err(invalid(format!(
            "port {} uses {}, only TCP is supported",
            port.port, protocol
        )));
    }
    let frontend_port = port_u16(port.port, "port")?;
    let node_port = port
        .node_port
        .ok_or_else(|| invalid(format!("port {} has no node port", port.port)))?;
    let backend_port = port_u16(node_port, "node port")?;

    let backend = backend_protocol.unwrap_or("tcp").to_ascii_uppercase();
    let secure = certificate.is_some()
        && ssl_ports
            .map(|listed| listed.is_empty() || listed.iter().any(|p| p.port == port.port))
            .unwrap_or(true);

    let (frontend_protocol, certificate_id) = match certificate {
        Some(cert) if secure => {
            let frontend = if matches!(backend.as_str(), "HTTP" | "HTTPS") {
                "HTTPS"
            } else {
                "SSL"
            };
            (frontend.to_string(), Some(cert.to_string()))
        }
        _ => (backend.clone(), None),
    };

    Ok(Listener {
        frontend_port,
        frontend_protocol,
        backend_port,
        backend_protocol: backend,
        certificate_id,
    })
}

fn health_check_overrides(ann: &Annotations<'_>) -> Result<HealthCheckOverrides> {
    let port = match ann.get(annotations::HC_PORT) {
        None => None,
        Some(v) if v.eq_ignore_ascii_case("traffic-port") => Some(HealthCheckPort::TrafficPort),
        Some(_) => {
            let port: Option<u16> = ann.parse(annotations::HC_PORT)?;
            port.map(HealthCheckPort::Port)
        }
    };
    let protocol = ann
        .get(annotations::HC_PROTOCOL)
        .map(|p| p.to_ascii_uppercase());
    if let Some(p) = &protocol {
        if !matches!(p.as_str(), "TCP" | "SSL" | "HTTP" | "HTTPS") {
            return Err(invalid(format!("{}: unsupported protocol {:?}", annotations::HC_PROTOCOL, p)));
        }
    }
    let path = ann.get(annotations::HC_PATH).map(str::to_string);
    if let Some(p) = &path {
        if !p.starts_with('/') {
            return Err(invalid(format!("{}: path {:?} must start with '/'", annotations::HC_PATH, p)));
        }
    }
    Ok(HealthCheckOverrides {
        protocol,
        port,
        path,
        healthy_threshold: ann.parse(annotations::HC_HEALTHY_THRESHOLD)?,
        unhealthy_threshold: ann.parse(annotations::HC_UNHEALTHY_THRESHOLD)?,
        interval: ann.parse(annotations::HC_INTERVAL)?,
        timeout: ann.parse(annotations::HC_TIMEOUT)?,
    })
}

fn attributes(ann: &Annotations<'_>) -> Result<LoadBalancerAttributes> {
    let log_enabled = ann.bool(annotations::ACCESS_LOG_ENABLED)?;
    let emit_interval: Option<u32> = ann.parse(annotations::ACCESS_LOG_EMIT_INTERVAL)?;
    let bucket_name = ann.get(annotations::ACCESS_LOG_BUCKET_NAME).map(str::to_string);
    let bucket_prefix = ann.get(annotations::ACCESS_LOG_BUCKET_PREFIX).map(str::to_string);
    let access_log = (log_enabled.is_some()
        || emit_interval.is_some()
        || bucket_name.is_some()
        || bucket_prefix.is_some())
    .then(|| AccessLog {
        enabled: log_enabled.unwrap_or(false),
        emit_interval,
        bucket_name,
        bucket_prefix,
    });

    let draining_enabled = ann.bool(annotations::CONNECTION_DRAINING_ENABLED)?;
    let draining_timeout: Option<u32> = ann.parse(annotations::CONNECTION_DRAINING_TIMEOUT)?;
    let connection_draining = (draining_enabled.is_some() || draining_timeout.is_some()).then(|| {
        ConnectionDraining {
            enabled: draining_enabled.unwrap_or(false),
            timeout: draining_timeout,
        }
    });

    Ok(LoadBalancerAttributes {
        access_log,
        connection_draining,
        idle_timeout: ann.parse(annotations::CONNECTION_IDLE_TIMEOUT)?,
    })
}

fn source_ranges(service: &Service, ann: &Annotations<'_>) -> Result<BTreeSet<String>> {
    let mut raw: Vec<String> = service
        .spec
        .as_ref()
        .and_then(|s| s.load_balancer_source_ranges.clone())
        .unwrap_or_default();
    if raw.is_empty() {
        raw = ann.list(annotations::SOURCE_RANGES);
    }
    if raw.is_empty() {
        raw.push("0.0.0.0/0".to_string());
    }
    raw.iter().map(|c| normalize_cidr(c)).collect()
}

/// Builds the desired load balancer of a Service
pub fn parse_spec(service: &Service, config: &CloudConfig) -> Result<LoadBalancerSpec> {
    let ann = Annotations(service.metadata.annotations.as_ref());
    let svc_spec = service
        .spec
        .as_ref()
        .ok_or_else(|| invalid("service has no spec"))?;
    let ports: &[ServicePort] = svc_spec.ports.as_deref().unwrap_or_default();
    if ports.is_empty() {
        return Err(invalid("service has no ports"));
    }

    let certificate = ann.get(annotations::SSL_CERT);
    let backend = backend_protocol(&ann)?;
    let ssl_list = ann.list(annotations::SSL_PORTS);
    let ssl_ports = select_ports(annotations::SSL_PORTS, &ssl_list, ports)?;

    let mut listeners = Vec::with_capacity(ports.len());
    let mut seen = BTreeSet::new();
    for port in ports {
        let listener = build_listener(port, backend.as_deref(), certificate, ssl_ports.as_deref())?;
        if !seen.insert(listener.frontend_port) {
            return Err(invalid(format!("port {} is declared twice", listener.frontend_port)));
        }
        listeners.push(listener);
    }

    let proxy_list = ann.list(annotations::PROXY_PROTOCOL);
    let proxy_protocol = if proxy_list.is_empty() {
        ProxyProtocol::Disabled
    } else {
        match select_ports(annotations::PROXY_PROTOCOL, &proxy_list, ports)? {
            None => ProxyProtocol::All,
            Some(selected) => ProxyProtocol::Ports(
                selected
                    .iter()
                    .filter_map(|p| p.node_port)
                    .filter_map(|p| u16::try_from(p).ok())
                    .collect(),
            ),
        }
    };

    let local_health_node_port = match svc_spec.external_traffic_policy.as_deref() {
        Some("Local") => svc_spec
            .health_check_node_port
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p > 0),
        _ => None,
    };
    let health_check = desired_health_check(
        &health_check_overrides(&ann)?,
        listeners[0].backend_port,
        local_health_node_port,
    );

    let internal = ann.bool(annotations::INTERNAL)?.unwrap_or(false);
    let public_ip = match (ann.get(annotations::IP_ID), ann.get(annotations::IP_POOL)) {
        (Some(_), Some(_)) => {
            return Err(invalid("ip-id and ip-pool annotations are mutually exclusive"));
        }
        (Some(id), None) => Some(PublicIpRequest::ById(id.to_string())),
        (None, Some(pool)) => Some(PublicIpRequest::ByPool(pool.to_string())),
        (None, None) => None,
    };
    if internal && public_ip.is_some() {
        return Err(invalid("an internal load balancer cannot have a public IP"));
    }

    let additional_tags = match ann.get(annotations::ADDITIONAL_TAGS) {
        Some(v) => parse_key_values(annotations::ADDITIONAL_TAGS, v, false)?,
        None => TagMap::new(),
    };

    let ingress_address: IngressAddressMode = ann
        .get(annotations::INGRESS_ADDRESS)
        .map(str::parse::<IngressAddressMode>)
        .transpose()?
        .unwrap_or_default();
    let ingress_ip_mode: IngressIpMode = ann
        .get(annotations::INGRESS_IP_MODE)
        .map(str::parse::<IngressIpMode>)
        .transpose()?
        .unwrap_or_default();

    Ok(LoadBalancerSpec {
        name: load_balancer_name(service)?,
        service_name: service_name(service),
        internal,
        listeners,
        health_check,
        source_ranges: source_ranges(service, &ann)?,
        target_role: ann
            .get(annotations::TARGET_ROLE)
            .unwrap_or(config.default_target_role.as_str())
            .to_string(),
        security_group_override: ann.get(annotations::SECURITY_GROUPS).map(str::to_string),
        extra_security_groups: ann.list(annotations::EXTRA_SECURITY_GROUPS),
        subnet_override: ann.get(annotations::SUBNET_ID).map(str::to_string),
        public_ip,
        proxy_protocol,
        additional_tags,
        attributes: attributes(&ann)?,
        ingress_address,
        ingress_ip_mode,
    })
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Names of the nodes that should back the load balancer of `service`
///
/// Keeps Ready nodes that are not excluded from load balancers and, when
/// the Service lists target node labels, carry all of them.
pub fn filter_target_nodes(service: &Service, nodes: &[Node]) -> Result<Vec<String>> {
    let ann = Annotations(service.metadata.annotations.as_ref());
    let wanted = match ann.get(annotations::TARGET_NODE_LABELS) {
        Some(v) => parse_key_values(annotations::TARGET_NODE_LABELS, v, true)?,
        None => TagMap::new(),
    };

    Ok(nodes
        .iter()
        .filter(|node| node_is_ready(node))
        .filter(|node| {
            let labels = node.metadata.labels.as_ref();
            let has = |k: &str| labels.map(|l| l.contains_key(k)).unwrap_or(false);
            if has(annotations::EXCLUDE_NODE_LABEL) {
                return false;
            }
            wanted.iter().all(|(k, v)| {
                labels
                    .and_then(|l| l.get(k))
                    .map(|actual| v.is_empty() || actual == v)
                    .unwrap_or(false)
            })
        })
        .filter_map(|node| node.metadata.name.clone())
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub(crate) fn config() -> CloudConfig {
        CloudConfig {
            cluster_id: "foo".into(),
            region: "eu-west-2".into(),
            ..Default::default()
        }
    }

    pub(crate) fn port(name: &str, port: i32, node_port: i32) -> ServicePort {
        ServicePort {
            name: Some(name.to_string()),
            port,
            node_port: Some(node_port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn service(ports: Vec<ServicePort>, annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("default".into()),
                uid: Some("1234abcd-5678-90ef-1234-567890abcdef".into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(name: &str, ready: bool, labels: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_tcp_service() {
        let spec = parse_spec(&service(vec![port("http", 80, 8080)], &[]), &config()).unwrap();
        assert_eq!(spec.name, "a1234abcd567890ef1234567890abcde");
        assert_eq!(spec.name.len(), 32);
        assert_eq!(spec.service_name, "default/web");
        assert_eq!(spec.listeners, vec![Listener::tcp(80, 8080)]);
        assert_eq!(spec.health_check.target(), "TCP:8080");
        assert_eq!(spec.source_ranges, BTreeSet::from(["0.0.0.0/0".to_string()]));
        assert_eq!(spec.target_role, "worker");
        assert_eq!(spec.proxy_protocol, ProxyProtocol::Disabled);
        assert!(!spec.internal);
        assert_eq!(spec.backend_ports(), BTreeSet::from([8080]));
    }

    #[test]
    fn test_name_annotation() {
        let svc = service(vec![port("http", 80, 8080)], &[(annotations::NAME, "lb-foo")]);
        assert_eq!(parse_spec(&svc, &config()).unwrap().name, "lb-foo");

        let svc = service(vec![port("http", 80, 8080)], &[(annotations::NAME, "bad_name!")]);
        assert!(matches!(parse_spec(&svc, &config()), Err(CcmError::InvalidSpec(_))));
    }

    #[test]
    fn test_ssl_listeners() {
        let svc = service(
            vec![port("http", 80, 30080), port("https", 443, 30443)],
            &[
                (annotations::SSL_CERT, "arn:cert"),
                (annotations::SSL_PORTS, "https"),
                (annotations::BACKEND_PROTOCOL, "http"),
            ],
        );
        let spec = parse_spec(&svc, &config()).unwrap();
        assert_eq!(spec.listeners[0].frontend_protocol, "HTTP");
        assert_eq!(spec.listeners[0].certificate_id, None);
        assert_eq!(spec.listeners[1].frontend_protocol, "HTTPS");
        assert_eq!(spec.listeners[1].backend_protocol, "HTTP");
        assert_eq!(spec.listeners[1].certificate_id.as_deref(), Some("arn:cert"));

        // Without an SSL port list every port terminates TLS
        let svc = service(vec![port("tls", 443, 30443)], &[(annotations::SSL_CERT, "arn:cert")]);
        let spec = parse_spec(&svc, &config()).unwrap();
        assert_eq!(spec.listeners[0].frontend_protocol, "SSL");
        assert_eq!(spec.listeners[0].backend_protocol, "TCP");
    }

    #[test]
    fn test_invalid_backend_protocol() {
        for bad in ["http=", "udp"] {
            let svc = service(
                vec![port("https", 443, 30443)],
                &[(annotations::SSL_CERT, "arn:cert"), (annotations::BACKEND_PROTOCOL, bad)],
            );
            assert!(matches!(parse_spec(&svc, &config()), Err(CcmError::InvalidSpec(_))), "{}", bad);
        }
    }

    #[test]
    fn test_unknown_port_names() {
        let svc = service(vec![port("http", 80, 30080)], &[(annotations::PROXY_PROTOCOL, "grpc")]);
        assert!(matches!(parse_spec(&svc, &config()), Err(CcmError::InvalidSpec(_))));

        let svc = service(
            vec![port("http", 80, 30080)],
            &[(annotations::SSL_CERT, "arn:cert"), (annotations::SSL_PORTS, "8443")],
        );
        assert!(matches!(parse_spec(&svc, &config()), Err(CcmError::InvalidSpec(_))));
    }

    #[test]
    fn test_proxy_protocol() {
        let ports = vec![port("http", 80, 30080), port("https", 443, 30443)];
        let svc = service(ports.clone(), &[(annotations::PROXY_PROTOCOL, "*")]);
        assert_eq!(parse_spec(&svc, &config()).unwrap().proxy_protocol, ProxyProtocol::All);

        let svc = service(ports, &[(annotations::PROXY_PROTOCOL, "443")]);
        assert_eq!(
            parse_spec(&svc, &config()).unwrap().proxy_protocol,
            ProxyProtocol::Ports([30443].into_iter().collect())
        );
    }

    #[test]
    fn test_rejected_services() {
        let mut udp = port("dns", 53, 30053);
        udp.protocol = Some("UDP".into());
        assert!(parse_spec(&service(vec![udp], &[]), &config()).is_err());

        let mut no_node_port = port("http", 80, 0);
        no_node_port.node_port = None;
        assert!(parse_spec(&service(vec![no_node_port], &[]), &config()).is_err());

        let dup = vec![port("a", 80, 30080), port("b", 80, 30081)];
        assert!(parse_spec(&service(dup, &[]), &config()).is_err());

        assert!(parse_spec(&service(vec![], &[]), &config()).is_err());

        let both = service(
            vec![port("http", 80, 30080)],
            &[(annotations::INTERNAL, "true"), (annotations::IP_POOL, "pool-a")],
        );
        assert!(parse_spec(&both, &config()).is_err());

        let tags = service(vec![port("http", 80, 30080)], &[(annotations::ADDITIONAL_TAGS, "team")]);
        assert!(parse_spec(&tags, &config()).is_err());

        let interval = service(vec![port("http", 80, 30080)], &[(annotations::HC_INTERVAL, "often")]);
        assert!(parse_spec(&interval, &config()).is_err());
    }

    #[test]
    fn test_source_ranges() {
        let mut svc = service(vec![port("http", 80, 30080)], &[]);
        if let Some(spec) = svc.spec.as_mut() {
            spec.load_balancer_source_ranges =
                Some(vec!["203.0.113.7/24".into(), "198.51.100.0/24".into()]);
        }
        let spec = parse_spec(&svc, &config()).unwrap();
        assert_eq!(
            spec.source_ranges,
            BTreeSet::from(["198.51.100.0/24".to_string(), "203.0.113.0/24".to_string()])
        );

        if let Some(spec) = svc.spec.as_mut() {
            spec.load_balancer_source_ranges = Some(vec!["not-a-cidr".into()]);
        }
        assert!(matches!(parse_spec(&svc, &config()), Err(CcmError::InvalidSpec(_))));
    }

    #[test]
    fn test_local_traffic_health_check() {
        let mut svc = service(vec![port("http", 80, 30080)], &[]);
        if let Some(spec) = svc.spec.as_mut() {
            spec.external_traffic_policy = Some("Local".into());
            spec.health_check_node_port = Some(32000);
        }
        let spec = parse_spec(&svc, &config()).unwrap();
        assert_eq!(spec.health_check.target(), "HTTP:32000/healthz");
        assert_eq!(spec.backend_ports(), BTreeSet::from([30080, 32000]));
    }

    #[test]
    fn test_reference_without_valid_spec() {
        let mut svc = service(Vec::new(), &[(annotations::HC_INTERVAL, "often")]);
        if let Some(spec) = svc.spec.as_mut() {
            spec.type_ = Some("ClusterIP".into());
        }
        assert!(parse_spec(&svc, &config()).is_err());

        let target = LoadBalancerRef::from_service(&svc).unwrap();
        assert_eq!(target.name, "a1234abcd567890ef1234567890abcde");
        assert_eq!(target.service_name, "default/web");

        let spec = parse_spec(&service(vec![port("http", 80, 30080)], &[]), &config()).unwrap();
        assert_eq!(spec.reference(), target);
    }

    #[test]
    fn test_annotations_and_attributes() {
        let svc = service(
            vec![port("http", 80, 30080)],
            &[
                (annotations::ADDITIONAL_TAGS, "team=web, env=prod"),
                (annotations::IP_POOL, "pool-a"),
                (annotations::EXTRA_SECURITY_GROUPS, "sg-1, sg-2"),
                (annotations::CONNECTION_IDLE_TIMEOUT, "120"),
                (annotations::ACCESS_LOG_BUCKET_NAME, "logs"),
                (annotations::INGRESS_ADDRESS, "both"),
                (annotations::INGRESS_IP_MODE, "vip"),
                (annotations::TARGET_ROLE, "ingress"),
                (annotations::HC_PORT, "traffic-port"),
            ],
        );
        let spec = parse_spec(&svc, &config()).unwrap();
        assert_eq!(spec.additional_tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(spec.public_ip, Some(PublicIpRequest::ByPool("pool-a".into())));
        assert_eq!(spec.extra_security_groups, vec!["sg-1", "sg-2"]);
        assert_eq!(spec.attributes.idle_timeout, Some(120));
        let log = spec.attributes.access_log.as_ref().unwrap();
        assert!(!log.enabled);
        assert_eq!(log.bucket_name.as_deref(), Some("logs"));
        assert_eq!(spec.attributes.connection_draining, None);
        assert_eq!(spec.ingress_address, IngressAddressMode::Both);
        assert_eq!(spec.ingress_ip_mode, IngressIpMode::Vip);
        assert_eq!(spec.target_roles(), vec!["ingress"]);
        assert_eq!(spec.health_check.target(), "TCP:30080");
    }

    #[test]
    fn test_filter_target_nodes() {
        let nodes = vec![
            node("node-a", true, &[("pool", "web")]),
            node("node-b", false, &[("pool", "web")]),
            node("node-c", true, &[("pool", "web"), (annotations::EXCLUDE_NODE_LABEL, "")]),
            node("node-d", true, &[("pool", "db")]),
        ];
        let all = service(vec![port("http", 80, 30080)], &[]);
        assert_eq!(filter_target_nodes(&all, &nodes).unwrap(), vec!["node-a", "node-d"]);

        let web = service(vec![port("http", 80, 30080)], &[(annotations::TARGET_NODE_LABELS, "pool=web")]);
        assert_eq!(filter_target_nodes(&web, &nodes).unwrap(), vec!["node-a"]);

        let keyed = service(vec![port("http", 80, 30080)], &[(annotations::TARGET_NODE_LABELS, "pool")]);
        assert_eq!(filter_target_nodes(&keyed, &nodes).unwrap(), vec!["node-a", "node-d"]);
    }
}
