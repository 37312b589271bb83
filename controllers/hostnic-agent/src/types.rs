//! Records shared by the allocator, the store and the RPC server

use crate::error::AgentError;
use qingcloud_client::HostNic;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a pod gets its address
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// One vNIC per pod, the pod takes the NIC's primary address
    #[default]
    Dedicated,
    /// Address from IPAM, traffic through the VxNet's shared NIC
    Shared,
}

impl FromStr for NetworkMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dedicated" => Ok(NetworkMode::Dedicated),
            "shared" => Ok(NetworkMode::Shared),
            other => Err(AgentError::InvalidConfig(format!(
                "network mode must be dedicated or shared, got {:?}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NetworkMode::Dedicated => "dedicated",
            NetworkMode::Shared => "shared",
        })
    }
}

/// A pod as seen by one CNI invocation. The container id is the reuse key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub container_id: String,
    #[serde(default)]
    pub netns: String,
    #[serde(default)]
    pub ifname: String,

    /// Requested VxNet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxnet: Option<String>,
    /// Requested address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nic_type: Option<String>,

    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_veth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
}

impl PodInfo {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Value of every store record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpamMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodInfo>,
    pub nic: HostNic,
}
