//! Outscale API adapter
//!
//! FCU and LBU speak the EC2 and classic ELB protocols, so the AWS SDK
//! clients are pointed at the Outscale endpoints of the region. `OscClient`
//! implements the capability interfaces of `ccm-api` on top of them.

mod compute;
mod dns;
mod error;
mod load_balancer;

pub use dns::SystemResolver;

use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::Region;
use ccm_core::CloudConfig;
use tracing::info;

pub fn default_compute_endpoint(region: &str) -> String {
    format!("https://fcu.{}.outscale.com", region)
}

pub fn default_load_balancer_endpoint(region: &str) -> String {
    format!("https://lbu.{}.outscale.com", region)
}

/// OscClient talks to FCU (compute) and LBU (load balancers)
#[derive(Clone, Debug)]
pub struct OscClient {
    ec2: aws_sdk_ec2::Client,
    elb: aws_sdk_elasticloadbalancing::Client,
}

impl OscClient {
    /// Builds both clients from the environment credentials chain
    pub async fn new(config: &CloudConfig) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let compute_endpoint = config
            .endpoints
            .compute
            .clone()
            .unwrap_or_else(|| default_compute_endpoint(&config.region));
        let lb_endpoint = config
            .endpoints
            .load_balancer
            .clone()
            .unwrap_or_else(|| default_load_balancer_endpoint(&config.region));
        info!(compute = %compute_endpoint, load_balancer = %lb_endpoint, "Using Outscale endpoints");

        let ec2 = aws_sdk_ec2::config::Builder::from(&shared)
            .endpoint_url(compute_endpoint)
            .build();
        let elb = aws_sdk_elasticloadbalancing::config::Builder::from(&shared)
            .endpoint_url(lb_endpoint)
            .build();

        Self {
            ec2: aws_sdk_ec2::Client::from_conf(ec2),
            elb: aws_sdk_elasticloadbalancing::Client::from_conf(elb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        assert_eq!(default_compute_endpoint("eu-west-2"), "https://fcu.eu-west-2.outscale.com");
        assert_eq!(default_load_balancer_endpoint("us-east-2"), "https://lbu.us-east-2.outscale.com");
    }
}
