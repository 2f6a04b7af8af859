use thiserror::Error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error codes the controller reacts to
pub mod codes {
    pub const DUPLICATE_GROUP: &str = "InvalidGroup.Duplicate";
    pub const DUPLICATE_PERMISSION: &str = "InvalidPermission.Duplicate";
    pub const LOAD_BALANCER_NOT_FOUND: &str = "LoadBalancerNotFound";
    pub const DEPENDENCY_VIOLATION: &str = "DependencyViolation";
    pub const UNSUPPORTED: &str = "Unsupported";
    pub const INVALID_REQUEST: &str = "InvalidRequest";
}

/// Failure reported by a remote API call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed [{code}]: {message}")]
pub struct ApiError {
    /// Remote operation name (e.g. "CreateLoadBalancer")
    pub operation: String,
    /// Platform error code, "Unknown" when the response carried none
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(
        operation: impl Into<String>,
        code: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            code: code.unwrap_or("Unknown").to_string(),
            message: message.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, Some(codes::UNSUPPORTED), message)
    }

    pub fn invalid_request(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, Some(codes::INVALID_REQUEST), message)
    }

    /// The resource being created already exists
    pub fn is_duplicate(&self) -> bool {
        self.code.ends_with(".Duplicate") || self.code == "AlreadyExists"
    }

    pub fn is_not_found(&self) -> bool {
        self.code.contains("NotFound")
    }

    pub fn is_dependency_violation(&self) -> bool {
        self.code == codes::DEPENDENCY_VIOLATION
    }
}
