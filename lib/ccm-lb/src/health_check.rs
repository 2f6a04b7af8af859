//! Load balancer health check

use ccm_api::HealthCheck;

pub const DEFAULT_HEALTHY_THRESHOLD: u32 = 2;
pub const DEFAULT_UNHEALTHY_THRESHOLD: u32 = 6;
pub const DEFAULT_INTERVAL: u32 = 10;
pub const DEFAULT_TIMEOUT: u32 = 5;
/// Path served by kube-proxy on the health check node port
pub const KUBE_PROXY_HEALTH_PATH: &str = "/healthz";

/// Port of a health check annotation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthCheckPort {
    /// Backend port of the first listener
    TrafficPort,
    Port(u16),
}

/// Health check settings requested through annotations
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheckOverrides {
    pub protocol: Option<String>,
    pub port: Option<HealthCheckPort>,
    pub path: Option<String>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
    pub interval: Option<u32>,
    pub timeout: Option<u32>,
}

impl HealthCheckOverrides {
    /// Whether the target (protocol, port or path) is overridden
    pub fn overrides_target(&self) -> bool {
        self.protocol.is_some() || self.port.is_some() || self.path.is_some()
    }
}

/// Health check for a load balancer whose first listener forwards to
/// `traffic_port`
///
/// Without target overrides, a Service with `externalTrafficPolicy: Local`
/// is checked through kube-proxy on its health check node port; anything
/// else gets a TCP check of the traffic port.
pub fn desired_health_check(
    overrides: &HealthCheckOverrides,
    traffic_port: u16,
    local_health_node_port: Option<u16>,
) -> HealthCheck {
    let (protocol, port, path) = match (overrides.overrides_target(), local_health_node_port) {
        (false, Some(hc_port)) => (
            "HTTP".to_string(),
            hc_port,
            Some(KUBE_PROXY_HEALTH_PATH.to_string()),
        ),
        _ => {
            let protocol = overrides
                .protocol
                .as_deref()
                .unwrap_or("TCP")
                .to_ascii_uppercase();
            let port = match overrides.port {
                Some(HealthCheckPort::Port(p)) => p,
                Some(HealthCheckPort::TrafficPort) | None => traffic_port,
            };
            let path = match protocol.as_str() {
                "HTTP" | "HTTPS" => Some(overrides.path.clone().unwrap_or_else(|| "/".to_string())),
                _ => None,
            };
            (protocol, port, path)
        }
    };

    HealthCheck {
        protocol,
        port,
        path,
        healthy_threshold: overrides.healthy_threshold.unwrap_or(DEFAULT_HEALTHY_THRESHOLD),
        unhealthy_threshold: overrides.unhealthy_threshold.unwrap_or(DEFAULT_UNHEALTHY_THRESHOLD),
        interval: overrides.interval.unwrap_or(DEFAULT_INTERVAL),
        timeout: overrides.timeout.unwrap_or(DEFAULT_TIMEOUT),
    }
}

/// Full comparison of the configured check with the desired one
pub fn needs_update(current: Option<&HealthCheck>, desired: &HealthCheck) -> bool {
    let Some(current) = current else {
        return true;
    };
    !current.target().eq_ignore_ascii_case(&desired.target())
        || current.healthy_threshold != desired.healthy_threshold
        || current.unhealthy_threshold != desired.unhealthy_threshold
        || current.interval != desired.interval
        || current.timeout != desired.timeout
}
