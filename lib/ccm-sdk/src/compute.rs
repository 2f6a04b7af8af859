//! ComputeApi over the EC2 protocol

use crate::error::SdkResultExt;
use crate::OscClient;
use async_trait::async_trait;
use aws_sdk_ec2::types as ec2;
use ccm_api::{
    ApiResult, ComputeApi, Filter, GroupPeer, IpPermission, PublicIp, Route, RouteState,
    RouteTable, SecurityGroup, Subnet, TagMap, Vm, VmState,
};
use tracing::{debug, warn};

fn filters(filters: &[Filter]) -> Option<Vec<ec2::Filter>> {
    if filters.is_empty() {
        return None;
    }
    Some(
        filters
            .iter()
            .map(|f| {
                ec2::Filter::builder()
                    .name(&f.name)
                    .set_values(Some(f.values.clone()))
                    .build()
            })
            .collect(),
    )
}

fn tag_map(tags: &[ec2::Tag]) -> TagMap {
    tags.iter()
        .filter_map(|t| {
            Some((
                t.key()?.to_string(),
                t.value().unwrap_or_default().to_string(),
            ))
        })
        .collect()
}

fn ec2_tags(tags: &TagMap) -> Vec<ec2::Tag> {
    tags.iter()
        .map(|(k, v)| ec2::Tag::builder().key(k).value(v).build())
        .collect()
}

fn owned(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

pub(crate) fn vm_from_instance(instance: &ec2::Instance) -> Option<Vm> {
    let id = instance.instance_id()?.to_string();
    let state = instance
        .state()
        .and_then(|s| s.name())
        .and_then(|n| n.as_str().parse::<VmState>().ok())?;
    let private_dns = owned(instance.private_dns_name());
    Some(Vm {
        id,
        node_name: private_dns.clone(),
        private_ip: owned(instance.private_ip_address()),
        public_ip: instance.public_ip_address().map(str::to_string),
        private_dns,
        public_dns: instance
            .public_dns_name()
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        subnet_id: owned(instance.subnet_id()),
        net_id: owned(instance.vpc_id()),
        security_group_ids: instance
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id())
            .map(str::to_string)
            .collect(),
        state,
        zone: owned(instance.placement().and_then(|p| p.availability_zone())),
        vm_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        source_dest_check: instance.source_dest_check().unwrap_or(true),
        tags: tag_map(instance.tags()),
    })
}

fn permission_from(perm: &ec2::IpPermission) -> IpPermission {
    IpPermission {
        protocol: owned(perm.ip_protocol()),
        from_port: perm.from_port().unwrap_or(-1),
        to_port: perm.to_port().unwrap_or(-1),
        ip_ranges: perm
            .ip_ranges()
            .iter()
            .filter_map(|r| r.cidr_ip())
            .map(str::to_string)
            .collect(),
        peers: perm
            .user_id_group_pairs()
            .iter()
            .filter_map(|p| {
                Some(GroupPeer {
                    group_id: p.group_id()?.to_string(),
                    account_id: p.user_id().map(str::to_string),
                })
            })
            .collect(),
    }
}

fn permission_to(perm: &IpPermission) -> ec2::IpPermission {
    ec2::IpPermission::builder()
        .ip_protocol(&perm.protocol)
        .from_port(perm.from_port)
        .to_port(perm.to_port)
        .set_ip_ranges(Some(
            perm.ip_ranges
                .iter()
                .map(|cidr| ec2::IpRange::builder().cidr_ip(cidr).build())
                .collect(),
        ))
        .set_user_id_group_pairs(Some(
            perm.peers
                .iter()
                .map(|peer| {
                    ec2::UserIdGroupPair::builder()
                        .group_id(&peer.group_id)
                        .set_user_id(peer.account_id.clone())
                        .build()
                })
                .collect(),
        ))
        .build()
}

fn group_from(group: &ec2::SecurityGroup) -> Option<SecurityGroup> {
    Some(SecurityGroup {
        id: group.group_id()?.to_string(),
        name: owned(group.group_name()),
        description: owned(group.description()),
        net_id: owned(group.vpc_id()),
        tags: tag_map(group.tags()),
        ingress: group.ip_permissions().iter().map(permission_from).collect(),
    })
}

fn route_from(route: &ec2::Route) -> Option<Route> {
    let state = match route.state().map(|s| s.as_str()) {
        Some("blackhole") => RouteState::Blackhole,
        _ => RouteState::Active,
    };
    Some(Route {
        destination: route.destination_cidr_block()?.to_string(),
        target_vm_id: route.instance_id().map(str::to_string),
        gateway_id: route.gateway_id().map(str::to_string),
        state,
    })
}

pub(crate) fn route_table_from(table: &ec2::RouteTable) -> Option<RouteTable> {
    let associations = table.associations();
    Some(RouteTable {
        id: table.route_table_id()?.to_string(),
        net_id: owned(table.vpc_id()),
        main: associations.iter().any(|a| a.main() == Some(true)),
        subnet_ids: associations
            .iter()
            .filter_map(|a| a.subnet_id())
            .map(str::to_string)
            .collect(),
        routes: table.routes().iter().filter_map(route_from).collect(),
        tags: tag_map(table.tags()),
    })
}

#[async_trait]
impl ComputeApi for OscClient {
    async fn describe_vms(&self, filters_in: &[Filter]) -> ApiResult<Vec<Vm>> {
        let mut vms = Vec::new();
        let mut pages = self
            .ec2
            .describe_instances()
            .set_filters(filters(filters_in))
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.api("DescribeInstances")?;
            for instance in page.reservations().iter().flat_map(|r| r.instances()) {
                match vm_from_instance(instance) {
                    Some(vm) => vms.push(vm),
                    None => warn!(instance = ?instance.instance_id(), "Skipping instance without id or state"),
                }
            }
        }
        debug!(count = vms.len(), "Described VMs");
        Ok(vms)
    }

    async fn set_source_dest_check(&self, vm_id: &str, enabled: bool) -> ApiResult<()> {
        self.ec2
            .modify_instance_attribute()
            .instance_id(vm_id)
            .source_dest_check(ec2::AttributeBooleanValue::builder().value(enabled).build())
            .send()
            .await
            .api("ModifyInstanceAttribute")?;
        Ok(())
    }

    async fn describe_security_groups(&self, filters_in: &[Filter]) -> ApiResult<Vec<SecurityGroup>> {
        let out = self
            .ec2
            .describe_security_groups()
            .set_filters(filters(filters_in))
            .send()
            .await
            .api("DescribeSecurityGroups")?;
        Ok(out.security_groups().iter().filter_map(group_from).collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        net_id: &str,
        tags: &TagMap,
    ) -> ApiResult<String> {
        let mut request = self
            .ec2
            .create_security_group()
            .group_name(name)
            .description(description)
            .vpc_id(net_id);
        if !tags.is_empty() {
            request = request.tag_specifications(
                ec2::TagSpecification::builder()
                    .resource_type(ec2::ResourceType::SecurityGroup)
                    .set_tags(Some(ec2_tags(tags)))
                    .build(),
            );
        }
        let out = request
            .send()
            .await
            .api("CreateSecurityGroup")?;
        Ok(owned(out.group_id()))
    }

    async fn delete_security_group(&self, group_id: &str) -> ApiResult<()> {
        self.ec2
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .api("DeleteSecurityGroup")?;
        Ok(())
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IpPermission]) -> ApiResult<()> {
        self.ec2
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(rules.iter().map(permission_to).collect()))
            .send()
            .await
            .api("AuthorizeSecurityGroupIngress")?;
        Ok(())
    }

    async fn revoke_ingress(&self, group_id: &str, rules: &[IpPermission]) -> ApiResult<()> {
        self.ec2
            .revoke_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(rules.iter().map(permission_to).collect()))
            .send()
            .await
            .api("RevokeSecurityGroupIngress")?;
        Ok(())
    }

    async fn describe_subnets(&self, filters_in: &[Filter]) -> ApiResult<Vec<Subnet>> {
        let out = self
            .ec2
            .describe_subnets()
            .set_filters(filters(filters_in))
            .send()
            .await
            .api("DescribeSubnets")?;
        Ok(out
            .subnets()
            .iter()
            .filter_map(|s| {
                Some(Subnet {
                    id: s.subnet_id()?.to_string(),
                    net_id: owned(s.vpc_id()),
                    zone: owned(s.availability_zone()),
                    cidr: owned(s.cidr_block()),
                    tags: tag_map(s.tags()),
                })
            })
            .collect())
    }

    async fn describe_route_tables(&self, filters_in: &[Filter]) -> ApiResult<Vec<RouteTable>> {
        let out = self
            .ec2
            .describe_route_tables()
            .set_filters(filters(filters_in))
            .send()
            .await
            .api("DescribeRouteTables")?;
        Ok(out.route_tables().iter().filter_map(route_table_from).collect())
    }

    async fn create_route(&self, table_id: &str, destination: &str, vm_id: &str) -> ApiResult<()> {
        self.ec2
            .create_route()
            .route_table_id(table_id)
            .destination_cidr_block(destination)
            .instance_id(vm_id)
            .send()
            .await
            .api("CreateRoute")?;
        Ok(())
    }

    async fn delete_route(&self, table_id: &str, destination: &str) -> ApiResult<()> {
        self.ec2
            .delete_route()
            .route_table_id(table_id)
            .destination_cidr_block(destination)
            .send()
            .await
            .api("DeleteRoute")?;
        Ok(())
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &TagMap) -> ApiResult<()> {
        self.ec2
            .create_tags()
            .set_resources(Some(resource_ids.to_vec()))
            .set_tags(Some(ec2_tags(tags)))
            .send()
            .await
            .api("CreateTags")?;
        Ok(())
    }

    async fn describe_public_ips(&self, filters_in: &[Filter]) -> ApiResult<Vec<PublicIp>> {
        let out = self
            .ec2
            .describe_addresses()
            .set_filters(filters(filters_in))
            .send()
            .await
            .api("DescribeAddresses")?;
        Ok(out
            .addresses()
            .iter()
            .filter_map(|a| {
                Some(PublicIp {
                    id: a.allocation_id()?.to_string(),
                    address: owned(a.public_ip()),
                    link_id: a.association_id().map(str::to_string),
                    tags: tag_map(a.tags()),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(key: &str, value: &str) -> ec2::Tag {
        ec2::Tag::builder().key(key).value(value).build()
    }

    #[test]
    fn test_instance_conversion() {
        let instance = ec2::Instance::builder()
            .instance_id("i-12345678")
            .private_dns_name("ip-10-0-1-10.eu-west-2.compute.internal")
            .private_ip_address("10.0.1.10")
            .public_dns_name("")
            .vpc_id("vpc-1")
            .subnet_id("subnet-1")
            .instance_type(ec2::InstanceType::from("tinav5.c2r4p1"))
            .state(
                ec2::InstanceState::builder()
                    .name(ec2::InstanceStateName::Stopped)
                    .build(),
            )
            .placement(ec2::Placement::builder().availability_zone("eu-west-2a").build())
            .security_groups(ec2::GroupIdentifier::builder().group_id("sg-1").build())
            .tags(tag("OscK8sClusterID/foo", "owned"))
            .build();

        let vm = vm_from_instance(&instance).unwrap();
        assert_eq!(vm.id, "i-12345678");
        assert_eq!(vm.node_name, "ip-10-0-1-10.eu-west-2.compute.internal");
        assert_eq!(vm.state, VmState::Stopped);
        assert_eq!(vm.public_dns, None);
        assert_eq!(vm.zone, "eu-west-2a");
        assert_eq!(vm.vm_type, "tinav5.c2r4p1");
        assert!(vm.source_dest_check);
        assert!(vm.security_group_ids.contains("sg-1"));
        assert_eq!(vm.tags.get("OscK8sClusterID/foo").map(String::as_str), Some("owned"));

        assert!(vm_from_instance(&ec2::Instance::builder().instance_id("i-1").build()).is_none());
    }

    #[test]
    fn test_permission_conversion() {
        let rule = IpPermission::tcp_port(443)
            .with_cidr("10.0.0.0/8")
            .with_peer("sg-lb");
        assert_eq!(permission_from(&permission_to(&rule)), rule);
    }

    #[test]
    fn test_route_table_conversion() {
        let table = ec2::RouteTable::builder()
            .route_table_id("rtb-1")
            .vpc_id("vpc-1")
            .associations(ec2::RouteTableAssociation::builder().main(true).build())
            .associations(ec2::RouteTableAssociation::builder().subnet_id("subnet-1").build())
            .routes(
                ec2::Route::builder()
                    .destination_cidr_block("10.244.1.0/24")
                    .instance_id("i-1")
                    .state(ec2::RouteState::Blackhole)
                    .build(),
            )
            .routes(ec2::Route::builder().destination_ipv6_cidr_block("::/0").build())
            .build();

        let converted = route_table_from(&table).unwrap();
        assert!(converted.main);
        assert_eq!(converted.subnet_ids, vec!["subnet-1"]);
        assert_eq!(converted.routes.len(), 1);
        assert!(converted.routes[0].is_blackhole());
        assert_eq!(converted.routes[0].target_vm_id.as_deref(), Some("i-1"));
    }
}
