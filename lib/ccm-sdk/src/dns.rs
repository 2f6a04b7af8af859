use async_trait::async_trait;
use ccm_api::{ApiError, ApiResult, DnsResolver};
use std::net::IpAddr;

/// Resolves hostnames through the system resolver
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> ApiResult<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| ApiError::new("ResolveHostname", Some("HostNotFound"), e.to_string()))?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.dedup();
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal() {
        let ips = SystemResolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
