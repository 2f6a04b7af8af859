//! Tag-encoded ownership of remote resources
//!
//! The controller keeps no local state: which cluster owns a load
//! balancer, which role a subnet or security group plays, and which groups
//! wait for garbage collection are all tags on the resources themselves.

use ccm_api::{Filter, TagMap};

/// `<prefix><cluster id>` marks resources of a cluster
pub const CLUSTER_ID_TAG_PREFIX: &str = "OscK8sClusterID/";
/// `<prefix><role>` marks the role of a subnet or security group
pub const ROLE_TAG_PREFIX: &str = "OscK8sRole/";
/// `namespace/name` of the Service a load balancer was created for
pub const SERVICE_NAME_TAG: &str = "OscK8sService";
/// Security groups waiting for the garbage collector
pub const TO_DELETE_TAG: &str = "OscK8sToDelete";
/// Public IP pool membership
pub const IP_POOL_TAG: &str = "OscK8sIPPool";
pub const OWNED: &str = "owned";

pub fn cluster_tag_key(cluster_id: &str) -> String {
    format!("{}{}", CLUSTER_ID_TAG_PREFIX, cluster_id)
}

pub fn role_tag_key(role: &str) -> String {
    format!("{}{}", ROLE_TAG_PREFIX, role)
}

/// Typed view over the tags of a resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tags<'a>(&'a TagMap);

impl<'a> Tags<'a> {
    pub fn new(tags: &'a TagMap) -> Self {
        Self(tags)
    }

    /// Every cluster id the resource is tagged with
    pub fn cluster_ids(&self) -> impl Iterator<Item = &'a str> {
        self.0
            .keys()
            .filter_map(|k| k.strip_prefix(CLUSTER_ID_TAG_PREFIX))
    }

    pub fn cluster_id(&self) -> Option<&'a str> {
        self.cluster_ids().next()
    }

    pub fn has_cluster(&self, cluster_id: &str) -> bool {
        self.0.contains_key(&cluster_tag_key(cluster_id))
    }

    pub fn service_name(&self) -> Option<&'a str> {
        self.0.get(SERVICE_NAME_TAG).map(String::as_str)
    }

    /// Roles carried by the resource; a resource may play several
    pub fn roles(&self) -> impl Iterator<Item = &'a str> {
        self.0.keys().filter_map(|k| k.strip_prefix(ROLE_TAG_PREFIX))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles().any(|r| r == role)
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.0.contains_key(TO_DELETE_TAG)
    }

    pub fn ip_pool(&self) -> Option<&'a str> {
        self.0.get(IP_POOL_TAG).map(String::as_str)
    }
}

/// Who a remote resource belongs to, from this cluster's point of view
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// Cluster and service tags both match
    Owned,
    /// Cluster tag matches, no service tag (resources created before it existed)
    Legacy,
    /// Missing cluster tag, or tagged for another service
    Foreign,
}

impl Ownership {
    pub fn is_owned(&self) -> bool {
        !matches!(self, Ownership::Foreign)
    }
}

/// Decides ownership of a resource from its tags alone
pub fn ownership(tags: &TagMap, cluster_id: &str, service_name: &str) -> Ownership {
    let tags = Tags::new(tags);
    if !tags.has_cluster(cluster_id) {
        return Ownership::Foreign;
    }
    match tags.service_name() {
        None => Ownership::Legacy,
        Some(svc) if svc == service_name => Ownership::Owned,
        Some(_) => Ownership::Foreign,
    }
}

/// Builds tags and filters for one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterTagger {
    cluster_id: String,
}

impl ClusterTagger {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn cluster_tag_key(&self) -> String {
        cluster_tag_key(&self.cluster_id)
    }

    /// Tags stamped on resources created for `service`
    pub fn owner_tags(&self, service_name: Option<&str>) -> TagMap {
        let mut tags = TagMap::new();
        tags.insert(self.cluster_tag_key(), OWNED.to_string());
        if let Some(svc) = service_name {
            tags.insert(SERVICE_NAME_TAG.to_string(), svc.to_string());
        }
        tags
    }

    /// Describe filter selecting resources of this cluster
    pub fn cluster_filter(&self) -> Filter {
        Filter::tag_key(self.cluster_tag_key())
    }

    pub fn role_filter(role: &str) -> Filter {
        Filter::tag_key(role_tag_key(role))
    }

    pub fn ownership(&self, tags: &TagMap, service_name: &str) -> Ownership {
        ownership(tags, &self.cluster_id, service_name)
    }

    pub fn is_cluster_resource(&self, tags: &TagMap) -> bool {
        Tags::new(tags).has_cluster(&self.cluster_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_ownership() {
        let owned = tags(&[("OscK8sClusterID/foo", "owned"), ("OscK8sService", "default/web")]);
        assert_eq!(ownership(&owned, "foo", "default/web"), Ownership::Owned);
        assert_eq!(ownership(&owned, "bar", "default/web"), Ownership::Foreign);
        assert_eq!(ownership(&owned, "foo", "default/api"), Ownership::Foreign);

        let legacy = tags(&[("OscK8sClusterID/foo", "owned")]);
        assert_eq!(ownership(&legacy, "foo", "default/web"), Ownership::Legacy);
        assert!(Ownership::Legacy.is_owned());

        assert_eq!(ownership(&TagMap::new(), "foo", "default/web"), Ownership::Foreign);
    }

    #[test]
    fn test_typed_accessors() {
        let map = tags(&[
            ("OscK8sClusterID/foo", "owned"),
            ("OscK8sRole/worker", ""),
            ("OscK8sRole/master", ""),
            ("OscK8sToDelete", ""),
        ]);
        let t = Tags::new(&map);
        assert_eq!(t.cluster_id(), Some("foo"));
        assert!(t.has_role("worker"));
        assert!(t.has_role("master"));
        assert!(!t.has_role("elb"));
        assert!(t.marked_for_deletion());
        assert_eq!(t.service_name(), None);
    }

    #[test]
    fn test_owner_tags() {
        let tagger = ClusterTagger::new("foo");
        let owner = tagger.owner_tags(Some("default/web"));
        assert_eq!(owner.get("OscK8sClusterID/foo").map(String::as_str), Some("owned"));
        assert_eq!(owner.get(SERVICE_NAME_TAG).map(String::as_str), Some("default/web"));
        assert_eq!(tagger.ownership(&owner, "default/web"), Ownership::Owned);
        assert_eq!(tagger.owner_tags(None).len(), 1);
    }
}
