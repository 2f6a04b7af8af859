//! VM lookups by node name, provider id and cluster tag

use crate::Cloud;
use ccm_api::{Filter, Vm, VmState};
use ccm_core::{ApiResultExt, CcmError, Result, Snapshot, SnapshotCache};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Instance id from `aws:///<zone>/<id>`, `osc:///<zone>/<id>` or a bare id
pub fn instance_id_from_provider_id(provider_id: &str) -> Result<String> {
    let invalid = || CcmError::InvalidProviderId(provider_id.to_string());
    let id = match provider_id.split_once(":///") {
        Some(("aws" | "osc", rest)) => rest.rsplit('/').next().ok_or_else(invalid)?,
        Some(_) => return Err(invalid()),
        None if !provider_id.contains('/') => provider_id,
        None => return Err(invalid()),
    };
    if !id.starts_with("i-") || id.len() <= 2 {
        return Err(invalid());
    }
    Ok(id.to_string())
}

/// "eu-west-2a" -> "eu-west-2"
pub fn region_from_zone(zone: &str) -> &str {
    match zone.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => &zone[..zone.len() - 1],
        _ => zone,
    }
}

fn alive_filter() -> Filter {
    Filter::new("instance-state-name", VmState::ALIVE.iter().map(|s| s.as_str()))
}

/// "i-1 (sg-a,sg-b)", used to describe colliding matches
fn describe_candidate(vm: &Vm) -> String {
    let groups: Vec<&str> = vm.security_group_ids.iter().map(String::as_str).collect();
    format!("{} ({})", vm.id, groups.join(","))
}

/// VmDirectory resolves Kubernetes nodes to VMs
pub struct VmDirectory {
    cloud: Cloud,
    cache: SnapshotCache<Vm>,
}

impl VmDirectory {
    pub fn new(cloud: Cloud) -> Self {
        let ttl = cloud.config.instance_cache_ttl();
        Self {
            cloud,
            cache: SnapshotCache::new(ttl),
        }
    }

    /// Alive VMs keyed by node name, looked up in batches
    ///
    /// Names without a VM are absent from the result. When two VMs claim
    /// the same name, the one with the smallest id wins and a warning is
    /// logged.
    pub async fn get_vms_by_node_name(&self, names: &[String]) -> Result<BTreeMap<String, Vm>> {
        let names: BTreeSet<&String> = names.iter().collect();
        let names: Vec<&String> = names.into_iter().collect();
        let mut found: BTreeMap<String, Vm> = BTreeMap::new();

        for batch in names.chunks(self.cloud.config.vm_batch_size.max(1)) {
            let filters = [
                Filter::new("private-dns-name", batch.iter().map(|n| n.as_str())),
                alive_filter(),
            ];
            let vms = self
                .cloud
                .compute
                .describe_vms(&filters)
                .await
                .with_key("DescribeVms", &format!("{} node names", batch.len()))?;
            debug!(requested = batch.len(), found = vms.len(), "Resolved node batch");

            for vm in vms.into_iter().filter(|vm| vm.state.is_alive()) {
                let keep_new = match found.get(&vm.node_name) {
                    Some(existing) => {
                        let (kept, ignored) = if existing.id <= vm.id {
                            (&existing.id, &vm.id)
                        } else {
                            (&vm.id, &existing.id)
                        };
                        warn!(node = %vm.node_name, %kept, %ignored, "Several VMs share a node name");
                        kept == &vm.id
                    }
                    None => true,
                };
                if keep_new {
                    found.insert(vm.node_name.clone(), vm);
                }
            }
        }
        Ok(found)
    }

    /// The single alive VM backing `node_name`
    pub async fn find_instance_by_node_name(&self, node_name: &str) -> Result<Vm> {
        let filters = [Filter::new("private-dns-name", [node_name]), alive_filter()];
        let mut vms = self
            .cloud
            .compute
            .describe_vms(&filters)
            .await
            .with_key("DescribeVms", node_name)?;
        vms.retain(|vm| vm.state.is_alive());

        match vms.len() {
            0 => Err(CcmError::InstanceNotFound(node_name.to_string())),
            1 => Ok(vms.remove(0)),
            _ => {
                vms.sort_by(|a, b| a.id.cmp(&b.id));
                Err(CcmError::AmbiguousMatch {
                    kind: "node",
                    key: node_name.to_string(),
                    candidates: vms.iter().map(describe_candidate).collect(),
                })
            }
        }
    }

    /// Looks up a VM by provider id, whatever its state
    pub async fn find_instance_by_provider_id(&self, provider_id: &str) -> Result<Vm> {
        let id = instance_id_from_provider_id(provider_id)?;
        let vms = self
            .cloud
            .compute
            .describe_vms(&[Filter::new("instance-id", [id.as_str()])])
            .await
            .with_key("DescribeVms", &id)?;
        vms.into_iter()
            .find(|vm| vm.id == id)
            .ok_or(CcmError::InstanceNotFound(provider_id.to_string()))
    }

    /// Alive cluster VMs keyed by id, served from the snapshot cache
    ///
    /// The cached listing is reused while it is fresh and contains every id
    /// of `must_contain`.
    pub async fn list_cluster_vms(&self, must_contain: &[String]) -> Result<Arc<Snapshot<Vm>>> {
        let filters = [self.cloud.tagger.cluster_filter(), alive_filter()];
        let compute = self.cloud.compute.clone();
        let cluster_id = self.cloud.cluster_id().to_string();
        self.cache
            .get_or_refresh(must_contain, || async move {
                let vms = compute
                    .describe_vms(&filters)
                    .await
                    .with_key("DescribeVms", &cluster_id)?;
                Ok::<_, CcmError>(
                    vms.into_iter()
                        .filter(|vm| vm.state.is_alive())
                        .map(|vm| (vm.id.clone(), vm))
                        .collect(),
                )
            })
            .await
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccm_api::fake::FakeCloud;
    use ccm_core::CloudConfig;

    fn vm(id: &str, node: &str, state: VmState) -> Vm {
        Vm {
            id: id.to_string(),
            node_name: node.to_string(),
            private_ip: "10.0.1.10".to_string(),
            public_ip: None,
            private_dns: node.to_string(),
            public_dns: None,
            subnet_id: "subnet-1".to_string(),
            net_id: "vpc-1".to_string(),
            security_group_ids: ["sg-worker".to_string()].into_iter().collect(),
            state,
            zone: "eu-west-2a".to_string(),
            vm_type: "tinav5.c2r4p1".to_string(),
            source_dest_check: true,
            tags: [("OscK8sClusterID/foo".to_string(), "owned".to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn directory(fake: Arc<FakeCloud>, batch: usize) -> VmDirectory {
        let config = CloudConfig {
            cluster_id: "foo".into(),
            region: "eu-west-2".into(),
            vm_batch_size: batch,
            ..Default::default()
        };
        VmDirectory::new(Cloud::from_api(fake, config))
    }

    #[test]
    fn test_provider_id_forms() {
        assert_eq!(instance_id_from_provider_id("aws:///eu-west-2a/i-12345678").unwrap(), "i-12345678");
        assert_eq!(instance_id_from_provider_id("osc:///eu-west-2a/i-12345678").unwrap(), "i-12345678");
        assert_eq!(instance_id_from_provider_id("i-12345678").unwrap(), "i-12345678");
        assert!(instance_id_from_provider_id("gce:///zone/i-1").is_err());
        assert!(instance_id_from_provider_id("aws:///eu-west-2a/").is_err());
        assert!(instance_id_from_provider_id("vm-1").is_err());
    }

    #[test]
    fn test_region_from_zone() {
        assert_eq!(region_from_zone("eu-west-2a"), "eu-west-2");
        assert_eq!(region_from_zone("cloudgouv-eu-west-1c"), "cloudgouv-eu-west-1");
        assert_eq!(region_from_zone("eu-west-2"), "eu-west-2");
    }

    #[tokio::test]
    async fn test_lookup_is_batched() {
        let fake = Arc::new(FakeCloud::new());
        let names: Vec<String> = (0..5).map(|i| format!("node-{}", i)).collect();
        fake.state().vms = names
            .iter()
            .enumerate()
            .map(|(i, n)| vm(&format!("i-{}", i), n, VmState::Running))
            .collect();

        let found = directory(fake.clone(), 2).get_vms_by_node_name(&names).await.unwrap();
        assert_eq!(found.len(), 5);
        assert_eq!(fake.calls_to("DescribeVms").len(), 3);
    }

    #[tokio::test]
    async fn test_dead_vms_are_skipped() {
        let fake = Arc::new(FakeCloud::new());
        fake.state().vms = vec![
            vm("i-old", "node-a", VmState::Terminated),
            vm("i-new", "node-a", VmState::Running),
        ];
        let dir = directory(fake, 200);
        assert_eq!(dir.find_instance_by_node_name("node-a").await.unwrap().id, "i-new");
        assert!(matches!(
            dir.find_instance_by_node_name("node-b").await,
            Err(CcmError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_colliding_names_are_ambiguous() {
        let fake = Arc::new(FakeCloud::new());
        let mut second = vm("i-2", "node-a", VmState::Running);
        second.security_group_ids = ["sg-x".to_string(), "sg-y".to_string()].into_iter().collect();
        fake.state().vms = vec![vm("i-1", "node-a", VmState::Running), second];

        let err = directory(fake, 200)
            .find_instance_by_node_name("node-a")
            .await
            .unwrap_err();
        match err {
            CcmError::AmbiguousMatch { candidates, .. } => {
                assert_eq!(candidates, vec!["i-1 (sg-worker)", "i-2 (sg-x,sg-y)"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_find_by_provider_id() {
        let fake = Arc::new(FakeCloud::new());
        fake.state().vms = vec![vm("i-1", "node-a", VmState::Stopped)];
        let dir = directory(fake, 200);
        assert_eq!(
            dir.find_instance_by_provider_id("aws:///eu-west-2a/i-1").await.unwrap().node_name,
            "node-a"
        );
        assert!(matches!(
            dir.find_instance_by_provider_id("i-2").await,
            Err(CcmError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cluster_listing_is_cached() {
        let fake = Arc::new(FakeCloud::new());
        fake.state().vms = vec![vm("i-1", "node-a", VmState::Running)];
        let dir = directory(fake.clone(), 200);

        let first = dir.list_cluster_vms(&[]).await.unwrap();
        assert!(first.get("i-1").is_some());
        dir.list_cluster_vms(&["i-1".to_string()]).await.unwrap();
        assert_eq!(fake.calls_to("DescribeVms").len(), 1);

        fake.state().vms.push(vm("i-2", "node-b", VmState::Running));
        let refreshed = dir.list_cluster_vms(&["i-2".to_string()]).await.unwrap();
        assert!(refreshed.get("i-2").is_some());
        assert_eq!(fake.calls_to("DescribeVms").len(), 2);
    }
}
