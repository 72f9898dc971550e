use std::collections::BTreeMap;

use thiserror::Error;

/// Annotation changes applied as a JSON merge patch; `None` removes the key.
pub type AnnotationPatch = BTreeMap<String, Option<String>>;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Resource not found: {message}")]
    NotFound { message: String },
    #[error("Failed to read resource: {message}")]
    GetFailed { message: String },
    #[error("Failed to list resources: {message}")]
    ListFailed { message: String },
    #[error("Failed to update resource: {message}")]
    UpdateFailed { message: String },
    #[error("Failed to bind pod: {message}")]
    BindFailed { message: String },
    #[error("Failed to parse annotations: {message}")]
    AnnotationParseError { message: String },
    #[error("Failed to parse quantity: {message}")]
    QuantityParseError { message: String },
}

impl KubernetesError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
