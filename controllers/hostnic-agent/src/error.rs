//! Agent error types.
//!
//! Every failure surfaces as an `AgentError`; the gRPC layer maps it to a
//! `tonic::Status` so the CNI executable can tell retryable failures apart.

use hostnic_network::NetworkError;
use ipam::IpamError;
use qingcloud_client::QingCloudError;
use thiserror::Error;

/// Errors that can occur in the node agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The allocator cannot satisfy the request under MaxNic and the pool
    #[error("No available NIC: {0}")]
    NoAvailableNic(String),

    /// IaaS API error
    #[error("Cloud error: {0}")]
    Cloud(#[from] QingCloudError),

    /// Host networking error
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// IPAM error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Local state store error
    #[error("Store error: {0}")]
    Store(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Pod not found: {0}")]
    PodNotFound(String),

    /// An invariant was violated; the process must restart
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task panicked or ended unexpectedly
    #[error("Task error: {0}")]
    Task(String),

    /// gRPC server failure
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

impl From<AgentError> for tonic::Status {
    fn from(err: AgentError) -> Self {
        let message = err.to_string();
        match err {
            AgentError::NoAvailableNic(_) => tonic::Status::resource_exhausted(message),
            AgentError::PodNotFound(_) => tonic::Status::not_found(message),
            AgentError::Ipam(IpamError::NoAvailableAddress(_)) => tonic::Status::resource_exhausted(message),
            AgentError::Ipam(IpamError::NotFound(_)) => tonic::Status::not_found(message),
            AgentError::Cloud(ref e) if e.is_transient() => tonic::Status::unavailable(message),
            AgentError::Kube(_) | AgentError::Ipam(IpamError::Conflict(_) | IpamError::RetriesExhausted(..)) => {
                tonic::Status::unavailable(message)
            }
            AgentError::InvalidConfig(_) => tonic::Status::invalid_argument(message),
            _ => tonic::Status::internal(message),
        }
    }
}
