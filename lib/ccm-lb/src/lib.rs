//! Load balancer reconciliation
//!
//! Turns a LoadBalancer Service into a remote load balancer and keeps the
//! two converged:
//! - spec: Service and annotations to a normalized LoadBalancerSpec
//! - rules / security: security group rules and their diff
//! - load_balancer: the reconciler driving the remote API
//! - health_check, policy, ingress: per-concern helpers of the reconciler
//! - metrics: reconcile outcome and latency
pub mod health_check;
pub mod ingress;
pub mod load_balancer;
pub mod metrics;
pub mod policy;
pub mod rules;
pub mod security;
pub mod spec;

pub use ingress::{IngressAddressMode, IngressIpMode, IngressStatus};
pub use load_balancer::LoadBalancerReconciler;
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use policy::ProxyProtocol;
pub use rules::{NormalizedRule, RuleDiff, RuleSource};
pub use security::{SecurityPolicy, SweepReport};
pub use spec::{filter_target_nodes, parse_spec, LoadBalancerRef, LoadBalancerSpec, PublicIpRequest};
