//! Error types for the load balancer controller

use thiserror::Error;

use crate::cloud::CloudError;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Cloud provider API error that was not absorbed by the engine
    #[error("Cloud API error: {0}")]
    CloudError(#[from] CloudError),

    /// The Service (or its annotations) cannot be realised as a load balancer
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Instance metadata service request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Failed to parse cloud config: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The node informer has not completed its initial list yet
    #[error("Node informer has not synced yet")]
    InformerNotSynced,

    /// A resource we expected to own carries another cluster's tag
    #[error("Resource {resource} has foreign cluster tag {key}={actual} (expected {expected})")]
    ForeignClusterTag {
        resource: String,
        key: String,
        actual: String,
        expected: String,
    },

    /// Security groups still had dependents when the deletion deadline expired
    #[error("Timed out deleting security groups {groups:?} of load balancer {load_balancer}")]
    SecurityGroupDeletionTimeout {
        load_balancer: String,
        groups: Vec<String>,
    },

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a reconcile failing with this error is worth retrying soon
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::ValidationError(_)
            | Error::ConfigError(_)
            | Error::TomlError(_)
            | Error::ForeignClusterTag { .. } => false,
            Error::CloudError(e) => !e.is_group_not_found(),
            _ => true,
        }
    }

    /// Short label used for the reconcile error metric
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::CloudError(e) if e.is_throttling() => "cloud_throttled",
            Error::CloudError(_) => "cloud",
            Error::ValidationError(_) => "validation",
            Error::ConfigError(_) | Error::TomlError(_) => "config",
            Error::HttpError(_) => "metadata",
            Error::IoError(_) => "io",
            Error::InformerNotSynced => "informer_not_synced",
            Error::ForeignClusterTag { .. } => "foreign_cluster_tag",
            Error::SecurityGroupDeletionTimeout { .. } => "security_group_deletion_timeout",
            Error::FinalizerError(_) => "finalizer",
        }
    }
}
