//! Cloud configuration

use crate::{CcmError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "OSC_CCM_CONFIG";
pub const CLUSTER_ID_ENV: &str = "OSC_CLUSTER_ID";
pub const REGION_ENV: &str = "OSC_REGION";
pub const ROUTE_TABLE_ID_ENV: &str = "OSC_ROUTE_TABLE_ID";
pub const FCU_ENDPOINT_ENV: &str = "OSC_FCU_ENDPOINT";
pub const LBU_ENDPOINT_ENV: &str = "OSC_LBU_ENDPOINT";

/// Custom API endpoints; the SDK defaults apply when unset
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    /// Compute (FCU) endpoint URL
    #[serde(default)]
    pub compute: Option<String>,
    /// Load balancer (LBU) endpoint URL
    #[serde(default)]
    pub load_balancer: Option<String>,
}

/// Configuration of the cloud controller
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    /// Value of the `OscK8sClusterID/<id>` tag on cluster resources
    #[serde(default)]
    pub cluster_id: String,

    #[serde(default)]
    pub region: String,

    /// Route table holding pod routes; discovered by cluster tag when unset
    #[serde(default)]
    pub route_table_id: Option<String>,

    /// Pod network; blackhole routes outside it are left alone
    #[serde(default)]
    pub cluster_cidr: Option<String>,

    #[serde(default)]
    pub endpoints: Endpoints,

    /// Maximum number of values per describe filter
    #[serde(default = "default_vm_batch_size")]
    pub vm_batch_size: usize,

    /// Seconds a bulk VM listing is reused
    #[serde(default = "default_instance_cache_ttl")]
    pub instance_cache_ttl: u64,

    /// Role of the backend VMs when the Service does not name one
    #[serde(default = "default_target_role")]
    pub default_target_role: String,

    /// Seconds before retrying a load balancer that is not ready
    #[serde(default = "default_not_ready_requeue")]
    pub not_ready_requeue: u64,

    /// Seconds before retrying after an error
    #[serde(default = "default_error_requeue")]
    pub error_requeue: u64,

    /// Seconds between two security group garbage collections
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Seconds between two route synchronizations
    #[serde(default = "default_route_sync_interval")]
    pub route_sync_interval: u64,
}

fn default_vm_batch_size() -> usize {
    200
}

fn default_instance_cache_ttl() -> u64 {
    30
}

fn default_target_role() -> String {
    "worker".to_string()
}

fn default_not_ready_requeue() -> u64 {
    10
}

fn default_error_requeue() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_route_sync_interval() -> u64 {
    60
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            region: String::new(),
            route_table_id: None,
            cluster_cidr: None,
            endpoints: Endpoints::default(),
            vm_batch_size: default_vm_batch_size(),
            instance_cache_ttl: default_instance_cache_ttl(),
            default_target_role: default_target_role(),
            not_ready_requeue: default_not_ready_requeue(),
            error_requeue: default_error_requeue(),
            sweep_interval: default_sweep_interval(),
            route_sync_interval: default_route_sync_interval(),
        }
    }
}

impl CloudConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Read a YAML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CcmError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Load from `OSC_CCM_CONFIG` when set, then apply the environment
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = config.apply_env(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment variables, looked up through `lookup`
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = non_empty(CLUSTER_ID_ENV) {
            self.cluster_id = v;
        }
        if let Some(v) = non_empty(REGION_ENV) {
            self.region = v;
        }
        if let Some(v) = non_empty(ROUTE_TABLE_ID_ENV) {
            self.route_table_id = Some(v);
        }
        if let Some(v) = non_empty(FCU_ENDPOINT_ENV) {
            self.endpoints.compute = Some(v);
        }
        if let Some(v) = non_empty(LBU_ENDPOINT_ENV) {
            self.endpoints.load_balancer = Some(v);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(CcmError::Config("clusterId is required".to_string()));
        }
        if self.cluster_id.contains('/') {
            return Err(CcmError::Config(format!(
                "clusterId {} must not contain '/'",
                self.cluster_id
            )));
        }
        if self.region.is_empty() {
            return Err(CcmError::Config("region is required".to_string()));
        }
        if self.vm_batch_size == 0 {
            return Err(CcmError::Config("vmBatchSize must be positive".to_string()));
        }
        if self.default_target_role.is_empty() {
            return Err(CcmError::Config("defaultTargetRole must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn instance_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.instance_cache_ttl)
    }

    pub fn not_ready_requeue(&self) -> Duration {
        Duration::from_secs(self.not_ready_requeue)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    pub fn route_sync_interval(&self) -> Duration {
        Duration::from_secs(self.route_sync_interval)
    }
}
