//! Handles on the cloud APIs

use ccm_api::{ComputeApi, DnsResolver, LoadBalancerApi};
use ccm_core::{CloudConfig, ClusterTagger};
use std::sync::Arc;

/// Cloud wraps the capability interfaces with the cluster configuration
#[derive(Clone)]
pub struct Cloud {
    pub compute: Arc<dyn ComputeApi>,
    pub load_balancer: Arc<dyn LoadBalancerApi>,
    pub dns: Arc<dyn DnsResolver>,
    pub tagger: ClusterTagger,
    pub config: Arc<CloudConfig>,
}

impl Cloud {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        load_balancer: Arc<dyn LoadBalancerApi>,
        dns: Arc<dyn DnsResolver>,
        config: CloudConfig,
    ) -> Self {
        Self {
            compute,
            load_balancer,
            dns,
            tagger: ClusterTagger::new(config.cluster_id.clone()),
            config: Arc::new(config),
        }
    }

    /// Build from one value implementing every interface
    pub fn from_api<A>(api: Arc<A>, config: CloudConfig) -> Self
    where
        A: ComputeApi + LoadBalancerApi + DnsResolver + 'static,
    {
        Self::new(api.clone(), api.clone(), api, config)
    }

    pub fn cluster_id(&self) -> &str {
        self.tagger.cluster_id()
    }
}
