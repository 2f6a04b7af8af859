//! Hostname resolution collaborator

use crate::ApiResult;
use std::net::IpAddr;

/// Resolves load balancer DNS names when the platform reports no address
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> ApiResult<Vec<IpAddr>>;
}
