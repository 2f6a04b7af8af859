//! Outscale cloud API model and capability interfaces
//!
//! This library defines what the controller needs from the platform:
//! - ComputeApi: VMs, security groups, subnets, route tables, tags (FCU)
//! - LoadBalancerApi: load balancers, listeners, backends, policies (LBU)
//! - DnsResolver: hostname resolution for internal load balancers
//!
//! Wire formats belong to the adapters; everything here is plain data.

pub mod compute;
pub mod dns;
pub mod error;
pub mod load_balancer;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use compute::{
    ComputeApi, Filter, GroupPeer, IpPermission, PublicIp, Route, RouteState, RouteTable,
    SecurityGroup, Subnet, Vm, VmState,
};
pub use dns::DnsResolver;
pub use error::{ApiError, ApiResult};
pub use load_balancer::{
    AccessLog, ConnectionDraining, CreateLoadBalancerRequest, HealthCheck, Listener,
    LoadBalancerApi, LoadBalancerAttributes, LoadBalancerDescription, PolicyDescription,
};

/// Key/value tags as carried by every taggable resource
pub type TagMap = std::collections::BTreeMap<String, String>;
