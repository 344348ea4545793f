//! Error types for the rightsizer control plane

use thiserror::Error;

/// Main error type for rightsizer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for autoscaler specs or resource quantities
    #[error("validation error: {0}")]
    Validation(String),

    /// Metrics source error (metrics.k8s.io or Prometheus)
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Checkpoint serialization or rehydration error
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Target reference could not be resolved to a selector
    #[error("target resolution error: {0}")]
    Target(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a metrics error with the given message
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }

    /// Create a checkpoint error with the given message
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create a target resolution error with the given message
    pub fn target(msg: impl Into<String>) -> Self {
        Self::Target(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
