//! Ingress status published on the Service

use ccm_core::{CcmError, Result};
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus};
use std::fmt;
use std::str::FromStr;

/// Which addresses the Service status exposes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IngressAddressMode {
    #[default]
    Hostname,
    Ip,
    Both,
}

impl IngressAddressMode {
    pub fn wants_hostname(&self) -> bool {
        matches!(self, IngressAddressMode::Hostname | IngressAddressMode::Both)
    }

    pub fn wants_ip(&self) -> bool {
        matches!(self, IngressAddressMode::Ip | IngressAddressMode::Both)
    }
}

impl FromStr for IngressAddressMode {
    type Err = CcmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hostname" => Ok(IngressAddressMode::Hostname),
            "ip" => Ok(IngressAddressMode::Ip),
            "both" => Ok(IngressAddressMode::Both),
            other => Err(CcmError::InvalidSpec(format!(
                "ingress address must be hostname, ip or both, got {}",
                other
            ))),
        }
    }
}

/// How kube-proxy treats the load balancer IP
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IngressIpMode {
    Proxy,
    Vip,
    /// Proxy when proxy protocol is enabled on any port, VIP otherwise
    #[default]
    Auto,
}

impl IngressIpMode {
    /// Value of `ipMode` in the Service status
    pub fn resolve(&self, proxy_protocol_enabled: bool) -> &'static str {
        match self {
            IngressIpMode::Proxy => "Proxy",
            IngressIpMode::Vip => "VIP",
            IngressIpMode::Auto if proxy_protocol_enabled => "Proxy",
            IngressIpMode::Auto => "VIP",
        }
    }
}

impl FromStr for IngressIpMode {
    type Err = CcmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proxy" => Ok(IngressIpMode::Proxy),
            "vip" => Ok(IngressIpMode::Vip),
            "auto" => Ok(IngressIpMode::Auto),
            other => Err(CcmError::InvalidSpec(format!(
                "ingress IP mode must be proxy, vip or auto, got {}",
                other
            ))),
        }
    }
}

/// Addresses a load balancer is reachable at
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressStatus {
    pub hostname: Option<String>,
    pub ip: Option<String>,
    /// "Proxy" or "VIP", set along with `ip`
    pub ip_mode: Option<String>,
}

impl IngressStatus {
    pub fn is_empty(&self) -> bool {
        self.hostname.is_none() && self.ip.is_none()
    }

    pub fn to_load_balancer_status(&self) -> LoadBalancerStatus {
        if self.is_empty() {
            return LoadBalancerStatus::default();
        }
        LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                hostname: self.hostname.clone(),
                ip: self.ip.clone(),
                ip_mode: self.ip.as_ref().and(self.ip_mode.clone()),
                ..Default::default()
            }]),
        }
    }
}

impl fmt::Display for IngressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hostname = self.hostname.as_deref().unwrap_or("-");
        match (&self.ip, &self.ip_mode) {
            (Some(ip), Some(mode)) => write!(f, "{} {} ({})", hostname, ip, mode),
            (Some(ip), None) => write!(f, "{} {}", hostname, ip),
            _ => f.write_str(hostname),
        }
    }
}
