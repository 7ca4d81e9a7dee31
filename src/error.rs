//! Error types for the control-plane operator

use thiserror::Error;

/// Main error type for reconciliation and API operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Resource missing from the cache or the API
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Certificate derivation or issuance error
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Missing or malformed input data on an otherwise readable object
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a not-found error for the given key
    pub fn not_found(key: impl std::fmt::Display) -> Self {
        Self::NotFound(key.to_string())
    }

    /// Create a certificate error with the given message
    pub fn certificate(msg: impl Into<String>) -> Self {
        Self::Certificate(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error means the object does not exist.
    ///
    /// Reconcilers use this to distinguish "nothing to converge yet" from
    /// failures that must be retried.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}
