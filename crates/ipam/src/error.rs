//! IPAM error types

use thiserror::Error;

/// Errors raised by the IPAM engine and its clients
#[derive(Debug, Error)]
pub enum IpamError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency failure; refresh and retry
    #[error("Conflict updating {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Every candidate block is full
    #[error("No available address for handle {0}")]
    NoAvailableAddress(String),

    #[error("Invalid CIDR {0}")]
    InvalidCidr(String),

    /// IPPool or ConfigMap content rejected
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A CAS loop gave up
    #[error("Gave up on {0} after {1} attempts")]
    RetriesExhausted(String, usize),
}

impl IpamError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, IpamError::Conflict(_))
    }
}
