//! gRPC API of the hostnic node agent
//!
//! Generated from `proto/hostnic.proto`. The agent serves [`CniBackendServer`]
//! on a Unix socket; the CNI executable and operator tools use
//! [`CniBackendClient`] through [`connect_unix`].

pub mod v1 {
    tonic::include_proto!("hostnic.rpc.v1");
}

pub use v1::cni_backend_client::CniBackendClient;
pub use v1::cni_backend_server::{CniBackend, CniBackendServer};
pub use v1::*;

use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Default socket path of the agent
pub const DEFAULT_SOCKET: &str = "/var/run/hostnic.sock";

/// Open a channel to the agent listening on `path`
pub async fn connect_unix(path: impl Into<PathBuf>) -> Result<CniBackendClient<Channel>, tonic::transport::Error> {
    let path = path.into();
    // the URI is required by the builder but never dialled
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await?;
    Ok(CniBackendClient::new(channel))
}

impl AddNetworkRequest {
    /// `pod_ip`, or `None` when empty
    pub fn requested_ip(&self) -> Option<&str> {
        non_empty(&self.pod_ip)
    }

    pub fn requested_vxnet(&self) -> Option<&str> {
        non_empty(&self.vxnet)
    }

    pub fn requested_nic_type(&self) -> Option<&str> {
        non_empty(&self.nic_type)
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields() {
        let req = AddNetworkRequest {
            namespace: "default".to_string(),
            name: "web".to_string(),
            container_id: "c1".to_string(),
            vxnet: " vxnet-abc ".to_string(),
            ..AddNetworkRequest::default()
        };
        assert_eq!(req.requested_vxnet(), Some("vxnet-abc"));
        assert_eq!(req.requested_ip(), None);
        assert_eq!(req.requested_nic_type(), None);
    }
}
