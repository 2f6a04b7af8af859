//! Outscale resource directories
//!
//! Lookups and single-resource operations shared by the load balancer
//! reconciler and the host controllers:
//! - VmDirectory: node name / provider id to VM
//! - SubnetResolver: load balancer placement
//! - RouteManager: pod network routes
pub mod client;
pub mod directory;
pub mod routes;
pub mod subnets;

pub use client::Cloud;
pub use directory::{instance_id_from_provider_id, region_from_zone, VmDirectory};
pub use routes::{PodRoute, RouteManager};
pub use subnets::{lb_role, select_one_per_zone, SubnetResolver, ELB_ROLE, INTERNAL_ELB_ROLE};
