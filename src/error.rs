//! Error types for the claim controller

use thiserror::Error;

/// Main error type for claim-controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency loss on a store update
    #[error("conflict: {0}")]
    Conflict(String),

    /// Claim or resource not found
    #[error("claim not found")]
    NotFound,

    /// Object exists but does not carry the managed-by marker
    #[error("claim not managed by controller")]
    NotManaged,

    /// Renewal would extend past the absolute TTL cap
    #[error("max ttl already reached")]
    MaxTtlReached,

    /// Template rendering failure
    #[error("render error: {0}")]
    Render(String),

    /// Invalid input (bad duration, malformed body, bad configuration)
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deadline exceeded while talking to the orchestrator
    #[error("upstream timeout")]
    Timeout,
}

impl Error {
    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a render error with the given message
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Whether this error is an optimistic-concurrency conflict (409)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}
