//! Error types for the RelayMQ Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// TLS secret referenced by the cluster does not exist yet
    #[error("TLS secret {secret} not found in namespace {namespace}")]
    TlsSecretMissing { secret: String, namespace: String },

    /// TLS secret exists but is missing required key material
    #[error("TLS secret {secret} is invalid: {reason}")]
    TlsSecretInvalid { secret: String, reason: String },

    /// A command executed inside a cluster member failed
    #[error("command {command:?} failed on pod {pod}: {stderr}")]
    CommandFailed {
        pod: String,
        command: Vec<String>,
        stdout: String,
        stderr: String,
    },

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Check whether a raw kube error is an optimistic-concurrency conflict (409)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// Check whether a raw kube error is a not-found (404)
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

impl OperatorError {
    /// Whether this error is a version-conflict on a write.
    ///
    /// Conflicts are always retried with bounded attempts before being
    /// surfaced; see [`crate::retry::with_conflict_retry`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::KubeError(e) if is_conflict(e))
    }

    /// Whether this error means the target object vanished
    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::KubeError(e) => is_not_found(e),
            OperatorError::NotFound { .. } => true,
            _ => false,
        }
    }

    /// Get a suggested requeue delay for errors that are expected to resolve
    /// through external remediation soon. Everything else falls through to
    /// the controller's exponential backoff.
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        match self {
            OperatorError::TlsSecretMissing { .. } => Some(std::time::Duration::from_secs(15)),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn conflict_error() -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}
