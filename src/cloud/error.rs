//! Error type returned by the cloud API boundary

use thiserror::Error;

/// Provider error codes the convergence engine reacts to
pub mod codes {
    pub const REQUEST_LIMIT_EXCEEDED: &str = "RequestLimitExceeded";
    pub const THROTTLING: &str = "Throttling";
    pub const THROTTLING_EXCEPTION: &str = "ThrottlingException";
    pub const LOAD_BALANCER_NOT_FOUND: &str = "LoadBalancerNotFound";
    pub const POLICY_NOT_FOUND: &str = "PolicyNotFound";
    pub const GROUP_NOT_FOUND: &str = "InvalidGroup.NotFound";
    pub const GROUP_DUPLICATE: &str = "InvalidGroup.Duplicate";
    pub const PERMISSION_DUPLICATE: &str = "InvalidPermission.Duplicate";
    pub const PERMISSION_NOT_FOUND: &str = "InvalidPermission.NotFound";
    pub const DEPENDENCY_VIOLATION: &str = "DependencyViolation";
    pub const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";
}

/// An error reported by the cloud provider (or its transport)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} failed: {code}: {message}")]
pub struct CloudError {
    /// API operation that failed, e.g. "DescribeSecurityGroups"
    pub operation: String,
    /// Provider error code, e.g. "InvalidGroup.NotFound"
    pub code: String,
    /// Human readable message
    pub message: String,
}

impl CloudError {
    pub fn new(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// True when the provider rejected the call because of request rate limits
    pub fn is_throttling(&self) -> bool {
        matches!(
            self.code.as_str(),
            codes::REQUEST_LIMIT_EXCEEDED | codes::THROTTLING | codes::THROTTLING_EXCEPTION
        )
    }

    /// True for any "resource does not exist" code
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.code.as_str(),
            codes::LOAD_BALANCER_NOT_FOUND
                | codes::POLICY_NOT_FOUND
                | codes::GROUP_NOT_FOUND
                | codes::PERMISSION_NOT_FOUND
                | codes::INSTANCE_NOT_FOUND
        )
    }

    pub fn is_group_not_found(&self) -> bool {
        self.code == codes::GROUP_NOT_FOUND
    }

    pub fn is_duplicate_group(&self) -> bool {
        self.code == codes::GROUP_DUPLICATE
    }

    pub fn is_duplicate_permission(&self) -> bool {
        self.code == codes::PERMISSION_DUPLICATE
    }

    pub fn is_dependency_violation(&self) -> bool {
        self.code == codes::DEPENDENCY_VIOLATION
    }
}
