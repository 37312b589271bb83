//! Controller-specific error types.
//!
//! Upstream errors convert with `?`; everything else names the step that
//! failed so the error policy log says which reconcile broke.

use ipam::IpamError;
use kube::Error as KubeError;
use qingcloud_client::QingCloudError;
use thiserror::Error;

/// Errors that can occur in the hostnic controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// IaaS API error
    #[error("Cloud error: {0}")]
    Cloud(#[from] QingCloudError),

    /// IPAM engine error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// A resource failed validation; retried only after it changes
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Adding or removing a finalizer failed
    #[error("Finalizer error: {0}")]
    Finalizer(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
