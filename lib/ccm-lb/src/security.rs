//! Security groups of load balancers and their backends
//!
//! Two groups matter for a load balancer. The ingress group is attached
//! to the load balancer and admits the Service source ranges on the
//! listener ports. The worker groups are attached to the backend VMs and
//! admit the ingress group on the backend and health check ports. Only
//! rules falling in those shapes are ever modified.

use crate::rules::{diff_rules, regroup, ungroup, NormalizedRule, RuleDiff};
use crate::spec::LoadBalancerSpec;
use ccm_api::{Filter, SecurityGroup, TagMap, Vm};
use ccm_cloud::Cloud;
use ccm_core::tags::{Tags, TO_DELETE_TAG};
use ccm_core::{ApiResultExt, CcmError, Result};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Name of the ingress group created for a load balancer
pub fn ingress_group_name(lb_name: &str) -> String {
    format!("k8s-elb-{}", lb_name)
}

/// Outcome of a garbage collection pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// Groups still in use, retried on the next pass
    pub pending: Vec<String>,
}

/// SecurityPolicy reconciles the security groups of load balancers
pub struct SecurityPolicy {
    cloud: Cloud,
}

impl SecurityPolicy {
    pub fn new(cloud: Cloud) -> Self {
        Self { cloud }
    }

    async fn describe(&self, filters: &[Filter], key: &str) -> Result<Vec<SecurityGroup>> {
        self.cloud
            .compute
            .describe_security_groups(filters)
            .await
            .with_key("DescribeSecurityGroups", key)
    }

    async fn describe_ids(&self, ids: &[String]) -> Result<Vec<SecurityGroup>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.describe(
            &[Filter::new("group-id", ids.iter().map(String::as_str))],
            &ids.join(","),
        )
        .await
    }

    /// Existing ingress group of a load balancer, without creating it
    pub async fn find_ingress_security_group(
        &self,
        spec: &LoadBalancerSpec,
        net_id: &str,
    ) -> Result<Option<SecurityGroup>> {
        if let Some(id) = &spec.security_group_override {
            return Ok(self.describe_ids(&[id.clone()]).await?.into_iter().find(|g| &g.id == id));
        }
        let name = ingress_group_name(&spec.name);
        let found = self
            .describe(
                &[Filter::new("group-name", [name.as_str()]), Filter::new("vpc-id", [net_id])],
                &name,
            )
            .await?;
        match found.into_iter().find(|g| g.name == name) {
            // Untagged groups of that name are adopted and re-tagged by the caller
            Some(group) if Tags::new(&group.tags).cluster_id().is_none() => {
                warn!(group = %group.id, %name, "Adopting untagged ingress security group");
                Ok(Some(group))
            }
            Some(group) if !self.cloud.tagger.ownership(&group.tags, &spec.service_name).is_owned() => {
                Err(CcmError::OwnedByAnotherCluster(name))
            }
            other => Ok(other),
        }
    }

    fn ingress_group_tags(&self, spec: &LoadBalancerSpec) -> TagMap {
        let mut tags = self.cloud.tagger.owner_tags(Some(&spec.service_name));
        tags.extend(spec.additional_tags.clone());
        tags
    }

    async fn adopt(&self, spec: &LoadBalancerSpec, group: SecurityGroup) -> Result<String> {
        if spec.security_group_override.is_none() && !self.cloud.tagger.is_cluster_resource(&group.tags) {
            self.cloud
                .compute
                .create_tags(&[group.id.clone()], &self.ingress_group_tags(spec))
                .await
                .with_key("CreateTags", &group.id)?;
            info!(group = %group.id, lb = %spec.name, "Tagged ingress security group");
        }
        Ok(group.id)
    }

    /// Id of the group attached to the load balancer, created when missing
    ///
    /// The override group must exist. Otherwise the group is named after the
    /// load balancer and created with its tags; an untagged group of that
    /// name is adopted, one tagged for another cluster or Service is foreign.
    pub async fn resolve_ingress_security_group(&self, spec: &LoadBalancerSpec, net_id: &str) -> Result<String> {
        if let Some(group) = self.find_ingress_security_group(spec, net_id).await? {
            return self.adopt(spec, group).await;
        }
        if let Some(id) = &spec.security_group_override {
            return Err(CcmError::not_found("security group", id.as_str()));
        }

        let name = ingress_group_name(&spec.name);
        let description = format!("Security group for Kubernetes load balancer {} ({})", spec.name, spec.service_name);
        match self
            .cloud
            .compute
            .create_security_group(&name, &description, net_id, &self.ingress_group_tags(spec))
            .await
        {
            Ok(id) => {
                info!(group = %id, lb = %spec.name, "Created ingress security group");
                Ok(id)
            }
            Err(e) if e.is_duplicate() => {
                debug!(group = %name, "Ingress security group created concurrently");
                let group = self
                    .find_ingress_security_group(spec, net_id)
                    .await?
                    .ok_or_else(|| CcmError::not_found("security group", name.as_str()))?;
                self.adopt(spec, group).await
            }
            Err(e) => Err(e).with_key("CreateSecurityGroup", &name),
        }
    }

    /// Groups of the backend VMs carrying one of the target role tags
    pub async fn find_role_security_groups(&self, spec: &LoadBalancerSpec, backends: &[Vm]) -> Result<Vec<String>> {
        let attached: BTreeSet<String> = backends
            .iter()
            .flat_map(|vm| vm.security_group_ids.iter().cloned())
            .collect();
        let attached: Vec<String> = attached.into_iter().collect();
        let roles = spec.target_roles();

        let groups: Vec<String> = self
            .describe_ids(&attached)
            .await?
            .into_iter()
            .filter(|g| {
                let tags = Tags::new(&g.tags);
                roles.iter().any(|role| tags.has_role(role))
            })
            .map(|g| g.id)
            .collect();

        if groups.is_empty() {
            return Err(CcmError::NoSecurityGroupForRole {
                role: spec.target_role.clone(),
                key: spec.name.clone(),
            });
        }
        Ok(groups)
    }

    /// Source ranges admitted on every listener port
    pub fn ingress_rules(spec: &LoadBalancerSpec) -> BTreeSet<NormalizedRule> {
        spec.frontend_ports()
            .into_iter()
            .flat_map(|port| {
                spec.source_ranges
                    .iter()
                    .map(move |cidr| NormalizedRule::tcp_cidr(port, cidr))
            })
            .collect()
    }

    /// Ingress group admitted on every backend and health check port
    pub fn internal_rules(spec: &LoadBalancerSpec, ingress_group: &str) -> BTreeSet<NormalizedRule> {
        spec.backend_ports()
            .into_iter()
            .map(|port| NormalizedRule::tcp_group(port, ingress_group))
            .collect()
    }

    /// Applies a diff: revokes first, then authorizes
    pub async fn apply_rule_diff(&self, group_id: &str, diff: &RuleDiff) -> Result<()> {
        if !diff.to_delete.is_empty() {
            info!(group = group_id, rules = diff.to_delete.len(), "Revoking rules");
            match self
                .cloud
                .compute
                .revoke_ingress(group_id, &regroup(&diff.to_delete))
                .await
            {
                Err(e) if e.is_not_found() => debug!(group = group_id, "Rules already revoked"),
                res => res.with_key("RevokeIngress", group_id)?,
            }
        }
        if !diff.to_add.is_empty() {
            info!(group = group_id, rules = diff.to_add.len(), "Authorizing rules");
            match self
                .cloud
                .compute
                .authorize_ingress(group_id, &regroup(&diff.to_add))
                .await
            {
                Err(e) if e.is_duplicate() => debug!(group = group_id, "Rules already authorized"),
                res => res.with_key("AuthorizeIngress", group_id)?,
            }
        }
        Ok(())
    }

    /// Converges the managed rules of `group` to `desired`
    pub async fn reconcile_rules<F>(
        &self,
        group: &SecurityGroup,
        desired: &BTreeSet<NormalizedRule>,
        managed: F,
    ) -> Result<RuleDiff>
    where
        F: Fn(&NormalizedRule) -> bool,
    {
        let existing = ungroup(&group.ingress);
        let diff = diff_rules(desired, &existing, managed);
        if diff.is_empty() {
            debug!(group = %group.id, "Rules up to date");
        } else {
            self.apply_rule_diff(&group.id, &diff).await?;
        }
        Ok(diff)
    }

    /// Source range rules of the ingress group
    ///
    /// `previous_ports` are the frontend ports of the load balancer before
    /// this pass; rules on those ports are released when they go away.
    pub async fn reconcile_ingress_rules(
        &self,
        spec: &LoadBalancerSpec,
        ingress_group: &str,
        previous_ports: &BTreeSet<u16>,
    ) -> Result<RuleDiff> {
        let group = self
            .describe_ids(&[ingress_group.to_string()])
            .await?
            .into_iter()
            .find(|g| g.id == ingress_group)
            .ok_or_else(|| CcmError::not_found("security group", ingress_group))?;

        let mut ports = spec.frontend_ports();
        ports.extend(previous_ports.iter().copied());
        let desired = Self::ingress_rules(spec);
        self.reconcile_rules(&group, &desired, |rule| {
            rule.is_cidr() && rule.single_port().map(|p| ports.contains(&p)).unwrap_or(false)
        })
        .await
    }

    /// Rules admitting the ingress group on the worker groups
    pub async fn reconcile_internal_rules(
        &self,
        spec: &LoadBalancerSpec,
        ingress_group: &str,
        worker_groups: &[String],
    ) -> Result<()> {
        let desired = Self::internal_rules(spec, ingress_group);
        for group in self.describe_ids(worker_groups).await? {
            self.reconcile_rules(&group, &desired, |rule| rule.references_group(ingress_group))
                .await?;
        }
        Ok(())
    }

    /// Tags groups for the garbage collector
    pub async fn mark_for_deletion(&self, group_ids: &[String]) -> Result<()> {
        if group_ids.is_empty() {
            return Ok(());
        }
        info!(groups = ?group_ids, "Marking security groups for deletion");
        let tags: TagMap = [(TO_DELETE_TAG.to_string(), String::new())].into_iter().collect();
        self.cloud
            .compute
            .create_tags(group_ids, &tags)
            .await
            .with_key("CreateTags", &group_ids.join(","))
    }

    /// Deletes the cluster groups marked for deletion
    ///
    /// Rules of other cluster groups referencing a marked group are revoked
    /// first. A group still attached to a load balancer being deleted stays
    /// pending until a later pass.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let groups = self
            .describe(&[self.cloud.tagger.cluster_filter()], self.cloud.cluster_id())
            .await?;
        let marked: Vec<&SecurityGroup> = groups
            .iter()
            .filter(|g| Tags::new(&g.tags).marked_for_deletion())
            .collect();

        let mut report = SweepReport::default();
        for target in marked {
            for other in groups.iter().filter(|g| g.id != target.id) {
                let existing = ungroup(&other.ingress);
                let diff = RuleDiff {
                    to_add: BTreeSet::new(),
                    to_delete: existing
                        .into_iter()
                        .filter(|r| r.references_group(&target.id))
                        .collect(),
                };
                if !diff.is_empty() {
                    self.apply_rule_diff(&other.id, &diff).await?;
                }
            }

            match self.cloud.compute.delete_security_group(&target.id).await {
                Ok(()) => {
                    info!(group = %target.id, "Deleted security group");
                    report.deleted.push(target.id.clone());
                }
                Err(e) if e.is_not_found() => report.deleted.push(target.id.clone()),
                Err(e) if e.is_dependency_violation() => {
                    warn!(group = %target.id, error = %e, "Security group still in use, retrying later");
                    report.pending.push(target.id.clone());
                }
                Err(e) => return Err(e).with_key("DeleteSecurityGroup", &target.id),
            }
        }
        Ok(report)
    }
}
