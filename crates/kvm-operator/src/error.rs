//! Error types for the KVM operator

use crate::framework::{Phase, ResourceKind};
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A handler received an object of a kind it does not manage
    #[error("unknown resource type: expected {expected}, got {actual}")]
    UnknownResourceType {
        expected: ResourceKind,
        actual: String,
    },

    /// No resource set is registered for the declared version bundle
    #[error("invalid version bundle version '{0}': no resources registered")]
    InvalidVersionBundle(String),

    /// A resource phase failed; wraps the underlying cause
    #[error("resource {resource} failed in phase {phase}: {source}")]
    Resource {
        resource: &'static str,
        phase: Phase,
        #[source]
        source: Box<OperatorError>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Three-way merge could not be computed
    #[error("merge patch error: {0}")]
    MergePatch(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Resource { source, .. } => source.is_retryable(),
            OperatorError::KubeError(kube::Error::Api(resp)) => {
                (resp.code == 409 && resp.reason != "AlreadyExists")
                    || resp.code == 429
                    || resp.code >= 500
            }
            OperatorError::KubeError(_) => true,
            OperatorError::ReconcileFailed(_) => true,
            _ => false,
        }
    }

    /// Whether the API server answered 404
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::Resource { source, .. } => source.is_not_found(),
            OperatorError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Whether a create was rejected because the object exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            OperatorError::Resource { source, .. } => source.is_already_exists(),
            OperatorError::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Whether an update was rejected because of a stale resource version
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Resource { source, .. } => source.is_conflict(),
            OperatorError::KubeError(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "Conflict"
            }
            _ => false,
        }
    }
}

/// Builds the error the API server returns for a given status code and reason.
pub(crate) fn api_error(code: u16, reason: &str, message: impl Into<String>) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}
