use ccm_api::ApiError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CcmError>;

#[derive(Error, Debug)]
pub enum CcmError {
    /// The Service definition cannot be turned into a load balancer
    #[error("Invalid service configuration: {0}")]
    InvalidSpec(String),

    #[error("Load balancer {0} belongs to another cluster or service")]
    OwnedByAnotherCluster(String),

    /// Expected right after creation; the caller retries later
    #[error("Load balancer {0} is not ready yet")]
    LoadBalancerNotReady(String),

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("No instance found for node {0}")]
    InstanceNotFound(String),

    #[error("Invalid provider id: {0}")]
    InvalidProviderId(String),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("No backend VM resolved for load balancer {0}")]
    NoBackends(String),

    #[error("No subnet found for role {0}")]
    NoSubnetForRole(String),

    #[error("No security group with role {role} attached to the backends of {key}")]
    NoSecurityGroupForRole { role: String, key: String },

    #[error("{kind} {key} matches several resources: {}", candidates.join(", "))]
    AmbiguousMatch {
        kind: &'static str,
        key: String,
        candidates: Vec<String>,
    },

    #[error("{operation} on {key}: {source}")]
    Remote {
        operation: &'static str,
        key: String,
        #[source]
        source: ApiError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),
}

impl CcmError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        CcmError::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Worth another pass of the control loop without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CcmError::LoadBalancerNotReady(_) | CcmError::Remote { .. }
        )
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, CcmError::LoadBalancerNotReady(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CcmError::InvalidSpec(_)
            | CcmError::InvalidProviderId(_)
            | CcmError::InvalidCidr(_) => "invalid_spec",
            CcmError::OwnedByAnotherCluster(_) => "not_owned",
            CcmError::LoadBalancerNotReady(_) => "not_ready",
            CcmError::NotFound { .. } | CcmError::InstanceNotFound(_) => "not_found",
            CcmError::NoBackends(_)
            | CcmError::NoSubnetForRole(_)
            | CcmError::NoSecurityGroupForRole { .. } => "not_found",
            CcmError::AmbiguousMatch { .. } => "ambiguous",
            CcmError::Remote { .. } => "remote",
            CcmError::Config(_) | CcmError::ConfigParse(_) => "config",
        }
    }
}

/// Attaches the operation and the identifying key to remote failures
pub trait ApiResultExt<T> {
    fn with_key(self, operation: &'static str, key: &str) -> Result<T>;
}

impl<T> ApiResultExt<T> for std::result::Result<T, ApiError> {
    fn with_key(self, operation: &'static str, key: &str) -> Result<T> {
        self.map_err(|source| CcmError::Remote {
            operation,
            key: key.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_carries_context() {
        let res: std::result::Result<(), ApiError> =
            Err(ApiError::new("CreateListeners", Some("Throttling"), "slow down"));
        let err = res.with_key("CreateListeners", "lb-foo").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "CreateListeners on lb-foo: CreateListeners failed [Throttling]: slow down"
        );
    }

    #[test]
    fn test_not_ready_is_retryable_but_spec_errors_are_not() {
        assert!(CcmError::LoadBalancerNotReady("lb".into()).is_not_ready());
        assert!(!CcmError::InvalidSpec("bad".into()).is_retryable());
        assert_eq!(CcmError::not_found("route table", "rtb-1").kind(), "not_found");
    }

    #[test]
    fn test_ambiguous_lists_candidates() {
        let err = CcmError::AmbiguousMatch {
            kind: "node",
            key: "ip-10-0-0-1".into(),
            candidates: vec!["i-1 (sg-a)".into(), "i-2 (sg-b)".into()],
        };
        assert_eq!(
            err.to_string(),
            "node ip-10-0-0-1 matches several resources: i-1 (sg-a), i-2 (sg-b)"
        );
    }
}
