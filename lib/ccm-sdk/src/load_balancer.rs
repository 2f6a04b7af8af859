//! LoadBalancerApi over the classic ELB protocol

use crate::error::{api_error, build_error, SdkResultExt};
use crate::OscClient;
use async_trait::async_trait;
use aws_sdk_elasticloadbalancing::error::ProvideErrorMetadata;
use aws_sdk_elasticloadbalancing::types as elb;
use ccm_api::error::codes;
use ccm_api::{
    AccessLog, ApiError, ApiResult, ConnectionDraining, CreateLoadBalancerRequest, HealthCheck,
    Listener, LoadBalancerApi, LoadBalancerAttributes, LoadBalancerDescription,
    PolicyDescription, TagMap,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

fn port(what: &str, value: i32) -> Option<u16> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Some(port),
        _ => {
            warn!(what, value, "Ignoring out of range port");
            None
        }
    }
}

fn listener_to(listener: &Listener) -> ApiResult<elb::Listener> {
    elb::Listener::builder()
        .protocol(&listener.frontend_protocol)
        .load_balancer_port(i32::from(listener.frontend_port))
        .instance_protocol(&listener.backend_protocol)
        .instance_port(i32::from(listener.backend_port))
        .set_ssl_certificate_id(listener.certificate_id.clone())
        .build()
        .map_err(|e| build_error("Listener", e))
}

fn listener_from(listener: &elb::Listener) -> Option<Listener> {
    let frontend_port = port("listener", listener.load_balancer_port())?;
    let backend_port = port("listener instance", listener.instance_port())?;
    let frontend_protocol = listener.protocol().to_ascii_uppercase();
    Some(Listener {
        backend_protocol: listener
            .instance_protocol()
            .map(str::to_ascii_uppercase)
            .unwrap_or_else(|| frontend_protocol.clone()),
        frontend_protocol,
        frontend_port,
        backend_port,
        certificate_id: listener.ssl_certificate_id().map(str::to_string),
    })
}

fn health_check_from(check: &elb::HealthCheck) -> Option<HealthCheck> {
    let (protocol, port, path) = HealthCheck::parse_target(check.target())?;
    Some(HealthCheck {
        protocol,
        port,
        path,
        healthy_threshold: u32::try_from(check.healthy_threshold()).unwrap_or_default(),
        unhealthy_threshold: u32::try_from(check.unhealthy_threshold()).unwrap_or_default(),
        interval: u32::try_from(check.interval()).unwrap_or_default(),
        timeout: u32::try_from(check.timeout()).unwrap_or_default(),
    })
}

pub(crate) fn description_from(desc: &elb::LoadBalancerDescription, tags: TagMap) -> LoadBalancerDescription {
    let mut backend_policies: BTreeMap<u16, Vec<String>> = BTreeMap::new();
    for backend in desc.backend_server_descriptions() {
        if let Some(instance_port) = backend.instance_port().and_then(|p| port("backend policy", p)) {
            backend_policies.insert(instance_port, backend.policy_names().to_vec());
        }
    }
    LoadBalancerDescription {
        name: desc.load_balancer_name().unwrap_or_default().to_string(),
        dns_name: desc.dns_name().map(str::to_string),
        public_ip: None,
        internal: desc.scheme() == Some("internal"),
        subnets: desc.subnets().to_vec(),
        security_groups: desc.security_groups().to_vec(),
        listeners: desc
            .listener_descriptions()
            .iter()
            .filter_map(|d| d.listener())
            .filter_map(listener_from)
            .collect(),
        health_check: desc.health_check().and_then(health_check_from),
        backend_vm_ids: desc
            .instances()
            .iter()
            .filter_map(|i| i.instance_id())
            .map(str::to_string)
            .collect(),
        backend_policies,
        tags,
    }
}

fn attributes_from(attributes: &elb::LoadBalancerAttributes) -> LoadBalancerAttributes {
    LoadBalancerAttributes {
        access_log: attributes.access_log().map(|log| AccessLog {
            enabled: log.enabled(),
            emit_interval: log.emit_interval().and_then(|v| u32::try_from(v).ok()),
            bucket_name: log.s3_bucket_name().map(str::to_string),
            bucket_prefix: log.s3_bucket_prefix().map(str::to_string),
        }),
        connection_draining: attributes.connection_draining().map(|d| ConnectionDraining {
            enabled: d.enabled(),
            timeout: d.timeout().and_then(|v| u32::try_from(v).ok()),
        }),
        idle_timeout: attributes
            .connection_settings()
            .and_then(|s| u32::try_from(s.idle_timeout()).ok()),
    }
}

fn attributes_to(attributes: &LoadBalancerAttributes) -> ApiResult<elb::LoadBalancerAttributes> {
    const OP: &str = "ModifyLoadBalancerAttributes";
    let mut builder = elb::LoadBalancerAttributes::builder();
    if let Some(log) = &attributes.access_log {
        builder = builder.access_log(
            elb::AccessLog::builder()
                .enabled(log.enabled)
                .set_emit_interval(log.emit_interval.and_then(|v| i32::try_from(v).ok()))
                .set_s3_bucket_name(log.bucket_name.clone())
                .set_s3_bucket_prefix(log.bucket_prefix.clone())
                .build()
                .map_err(|e| build_error(OP, e))?,
        );
    }
    if let Some(draining) = &attributes.connection_draining {
        builder = builder.connection_draining(
            elb::ConnectionDraining::builder()
                .enabled(draining.enabled)
                .set_timeout(draining.timeout.and_then(|v| i32::try_from(v).ok()))
                .build()
                .map_err(|e| build_error(OP, e))?,
        );
    }
    if let Some(idle) = attributes.idle_timeout {
        builder = builder.connection_settings(
            elb::ConnectionSettings::builder()
                .idle_timeout(i32::try_from(idle).unwrap_or(i32::MAX))
                .build()
                .map_err(|e| build_error(OP, e))?,
        );
    }
    Ok(builder.build())
}

fn instances(vm_ids: &[String]) -> Vec<elb::Instance> {
    vm_ids
        .iter()
        .map(|id| elb::Instance::builder().instance_id(id).build())
        .collect()
}

impl OscClient {
    async fn load_balancer_tags(&self, name: &str) -> ApiResult<TagMap> {
        let out = self
            .elb
            .describe_tags()
            .load_balancer_names(name)
            .send()
            .await
            .api("DescribeTags")?;
        Ok(out
            .tag_descriptions()
            .iter()
            .flat_map(|d| d.tags())
            .map(|t| (t.key().to_string(), t.value().unwrap_or_default().to_string()))
            .collect())
    }
}

#[async_trait]
impl LoadBalancerApi for OscClient {
    fn supports_public_ip(&self) -> bool {
        false
    }

    async fn describe_load_balancer(&self, name: &str) -> ApiResult<Option<LoadBalancerDescription>> {
        let out = match self
            .elb
            .describe_load_balancers()
            .load_balancer_names(name)
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) if e.code() == Some(codes::LOAD_BALANCER_NOT_FOUND) => {
                debug!(lb = %name, "Load balancer not found");
                return Ok(None);
            }
            Err(e) => return Err(api_error("DescribeLoadBalancers", &e)),
        };
        let Some(desc) = out.load_balancer_descriptions().first() else {
            return Ok(None);
        };
        let tags = self.load_balancer_tags(name).await?;
        Ok(Some(description_from(desc, tags)))
    }

    async fn create_load_balancer(&self, request: &CreateLoadBalancerRequest) -> ApiResult<Option<String>> {
        const OP: &str = "CreateLoadBalancer";
        if request.public_ip.is_some() {
            return Err(ApiError::unsupported(
                OP,
                "public IP selection is not available through the ELB protocol",
            ));
        }
        let listeners = request
            .listeners
            .iter()
            .map(listener_to)
            .collect::<ApiResult<Vec<_>>>()?;
        let tags = request
            .tags
            .iter()
            .map(|(k, v)| {
                elb::Tag::builder()
                    .key(k)
                    .value(v)
                    .build()
                    .map_err(|e| build_error(OP, e))
            })
            .collect::<ApiResult<Vec<_>>>()?;

        let out = self
            .elb
            .create_load_balancer()
            .load_balancer_name(&request.name)
            .set_listeners(Some(listeners))
            .set_subnets(Some(request.subnets.clone()))
            .set_security_groups(Some(request.security_groups.clone()))
            .set_scheme(request.internal.then(|| "internal".to_string()))
            .set_tags(Some(tags))
            .send()
            .await
            .api(OP)?;
        Ok(out.dns_name().map(str::to_string))
    }

    async fn delete_load_balancer(&self, name: &str) -> ApiResult<()> {
        self.elb
            .delete_load_balancer()
            .load_balancer_name(name)
            .send()
            .await
            .api("DeleteLoadBalancer")?;
        Ok(())
    }

    async fn create_listeners(&self, name: &str, listeners: &[Listener]) -> ApiResult<()> {
        let listeners = listeners
            .iter()
            .map(listener_to)
            .collect::<ApiResult<Vec<_>>>()?;
        self.elb
            .create_load_balancer_listeners()
            .load_balancer_name(name)
            .set_listeners(Some(listeners))
            .send()
            .await
            .api("CreateLoadBalancerListeners")?;
        Ok(())
    }

    async fn delete_listeners(&self, name: &str, frontend_ports: &[u16]) -> ApiResult<()> {
        self.elb
            .delete_load_balancer_listeners()
            .load_balancer_name(name)
            .set_load_balancer_ports(Some(frontend_ports.iter().map(|p| i32::from(*p)).collect()))
            .send()
            .await
            .api("DeleteLoadBalancerListeners")?;
        Ok(())
    }

    async fn set_listener_certificate(
        &self,
        name: &str,
        frontend_port: u16,
        certificate_id: &str,
    ) -> ApiResult<()> {
        self.elb
            .set_load_balancer_listener_ssl_certificate()
            .load_balancer_name(name)
            .load_balancer_port(i32::from(frontend_port))
            .ssl_certificate_id(certificate_id)
            .send()
            .await
            .api("SetLoadBalancerListenerSSLCertificate")?;
        Ok(())
    }

    async fn register_vms(&self, name: &str, vm_ids: &[String]) -> ApiResult<()> {
        self.elb
            .register_instances_with_load_balancer()
            .load_balancer_name(name)
            .set_instances(Some(instances(vm_ids)))
            .send()
            .await
            .api("RegisterInstancesWithLoadBalancer")?;
        Ok(())
    }

    async fn deregister_vms(&self, name: &str, vm_ids: &[String]) -> ApiResult<()> {
        self.elb
            .deregister_instances_from_load_balancer()
            .load_balancer_name(name)
            .set_instances(Some(instances(vm_ids)))
            .send()
            .await
            .api("DeregisterInstancesFromLoadBalancer")?;
        Ok(())
    }

    async fn configure_health_check(&self, name: &str, health_check: &HealthCheck) -> ApiResult<()> {
        const OP: &str = "ConfigureHealthCheck";
        let to_i32 = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        let check = elb::HealthCheck::builder()
            .target(health_check.target())
            .interval(to_i32(health_check.interval))
            .timeout(to_i32(health_check.timeout))
            .healthy_threshold(to_i32(health_check.healthy_threshold))
            .unhealthy_threshold(to_i32(health_check.unhealthy_threshold))
            .build()
            .map_err(|e| build_error(OP, e))?;
        self.elb
            .configure_health_check()
            .load_balancer_name(name)
            .health_check(check)
            .send()
            .await
            .api(OP)?;
        Ok(())
    }

    async fn describe_policies(&self, name: &str) -> ApiResult<Vec<PolicyDescription>> {
        let out = self
            .elb
            .describe_load_balancer_policies()
            .load_balancer_name(name)
            .send()
            .await
            .api("DescribeLoadBalancerPolicies")?;
        Ok(out
            .policy_descriptions()
            .iter()
            .map(|p| PolicyDescription {
                name: p.policy_name().unwrap_or_default().to_string(),
                type_name: p.policy_type_name().unwrap_or_default().to_string(),
                attributes: p
                    .policy_attribute_descriptions()
                    .iter()
                    .filter_map(|a| {
                        Some((
                            a.attribute_name()?.to_string(),
                            a.attribute_value().unwrap_or_default().to_string(),
                        ))
                    })
                    .collect(),
            })
            .collect())
    }

    async fn create_policy(&self, name: &str, policy: &PolicyDescription) -> ApiResult<()> {
        let attributes = policy
            .attributes
            .iter()
            .map(|(k, v)| {
                elb::PolicyAttribute::builder()
                    .attribute_name(k)
                    .attribute_value(v)
                    .build()
            })
            .collect();
        self.elb
            .create_load_balancer_policy()
            .load_balancer_name(name)
            .policy_name(&policy.name)
            .policy_type_name(&policy.type_name)
            .set_policy_attributes(Some(attributes))
            .send()
            .await
            .api("CreateLoadBalancerPolicy")?;
        Ok(())
    }

    async fn set_backend_policies(
        &self,
        name: &str,
        backend_port: u16,
        policy_names: &[String],
    ) -> ApiResult<()> {
        self.elb
            .set_load_balancer_policies_for_backend_server()
            .load_balancer_name(name)
            .instance_port(i32::from(backend_port))
            .set_policy_names(Some(policy_names.to_vec()))
            .send()
            .await
            .api("SetLoadBalancerPoliciesForBackendServer")?;
        Ok(())
    }

    async fn describe_attributes(&self, name: &str) -> ApiResult<LoadBalancerAttributes> {
        let out = self
            .elb
            .describe_load_balancer_attributes()
            .load_balancer_name(name)
            .send()
            .await
            .api("DescribeLoadBalancerAttributes")?;
        Ok(out
            .load_balancer_attributes()
            .map(attributes_from)
            .unwrap_or_default())
    }

    async fn modify_attributes(&self, name: &str, attributes: &LoadBalancerAttributes) -> ApiResult<()> {
        self.elb
            .modify_load_balancer_attributes()
            .load_balancer_name(name)
            .load_balancer_attributes(attributes_to(attributes)?)
            .send()
            .await
            .api("ModifyLoadBalancerAttributes")?;
        Ok(())
    }

    async fn apply_security_groups(&self, name: &str, group_ids: &[String]) -> ApiResult<()> {
        self.elb
            .apply_security_groups_to_load_balancer()
            .load_balancer_name(name)
            .set_security_groups(Some(group_ids.to_vec()))
            .send()
            .await
            .api("ApplySecurityGroupsToLoadBalancer")?;
        Ok(())
    }
}
