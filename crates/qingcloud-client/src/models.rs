//! QingCloud API data models
//!
//! Domain types shared by the agent and the controller, plus the wire shapes
//! of the IaaS responses they are decoded from.

use serde::{Deserialize, Serialize};

/// An IaaS L2 segment. Immutable once observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VxNet {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub cidr: String,
    pub gateway: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_end: Option<String>,
    #[serde(default)]
    pub router_id: String,
}

/// Local lifecycle status of a NIC, orthogonal to its phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NicStatus {
    Using,
    #[default]
    Free,
    Deleting,
    Deleted,
}

/// How far the host side of a NIC has been brought up
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NicPhase {
    #[default]
    Init,
    LinkReady,
    NetReady,
}

impl std::fmt::Display for NicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NicStatus::Using => "USING",
            NicStatus::Free => "FREE",
            NicStatus::Deleting => "DELETING",
            NicStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

impl std::fmt::Display for NicPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NicPhase::Init => "INIT",
            NicPhase::LinkReady => "LINK_READY",
            NicPhase::NetReady => "NET_READY",
        };
        f.write_str(s)
    }
}

/// A vNIC attached (or being attached) to the local node.
///
/// On QingCloud the NIC id is its MAC address, so `id` and `hardware_addr`
/// are normally equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HostNic {
    pub id: String,
    pub hardware_addr: String,
    pub vxnet: VxNet,
    pub primary_address: String,
    #[serde(default)]
    pub route_table_num: i32,
    #[serde(default)]
    pub is_primary: bool,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default)]
    pub status: NicStatus,
    #[serde(default)]
    pub phase: NicPhase,
    /// Instance the IaaS reports the NIC attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl HostNic {
    /// Whether the IaaS reports the NIC attached to `instance`
    pub fn is_attached_to(&self, instance: &str) -> bool {
        self.instance_id.as_deref() == Some(instance)
    }
}

/// A preallocated address range the IaaS holds on a VxNet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Vip {
    pub id: String,
    pub name: String,
    pub addr: String,
    pub vxnet_id: String,
}

/// A node of an IaaS-managed cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterNode {
    pub node_id: String,
    pub instance_id: String,
    pub private_ip: String,
    pub status: String,
}

/// Terminal or pending state of an IaaS job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Successful,
    Failed,
}

impl JobState {
    /// Map the IaaS `status` string
    pub fn from_status(status: &str) -> Self {
        match status {
            "successful" => JobState::Successful,
            "failed" | "done with failure" => JobState::Failed,
            _ => JobState::Pending,
        }
    }
}

/// Envelope fields present on every API response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseEnvelope {
    #[serde(default)]
    pub ret_code: i64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NicItem {
    pub nic_id: String,
    #[serde(default)]
    pub vxnet_id: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub role: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DescribeNicsResponse {
    #[serde(default)]
    pub nic_set: Vec<NicItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreateNicsResponse {
    #[serde(default)]
    pub nics: Vec<CreatedNic>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreatedNic {
    pub nic_id: String,
    #[serde(default)]
    pub private_ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobResponse {
    pub job_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct JobItem {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub resource_ids: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DescribeJobsResponse {
    #[serde(default)]
    pub job_set: Vec<JobItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VxnetRouter {
    #[serde(default)]
    pub ip_network: String,
    #[serde(default)]
    pub manager_ip: String,
    #[serde(default)]
    pub dyn_ip_start: Option<String>,
    #[serde(default)]
    pub dyn_ip_end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VxnetItem {
    pub vxnet_id: String,
    #[serde(default)]
    pub vxnet_name: String,
    #[serde(default)]
    pub vpc_router_id: String,
    pub router: Option<VxnetRouter>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DescribeVxnetsResponse {
    #[serde(default)]
    pub vxnet_set: Vec<VxnetItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct VipItem {
    pub vip_id: String,
    #[serde(default)]
    pub vip_name: String,
    #[serde(default)]
    pub vip_addr: String,
    #[serde(default)]
    pub vxnet_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DescribeVipsResponse {
    #[serde(default)]
    pub vip_set: Vec<VipItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClusterNodeItem {
    pub node_id: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub private_ip: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DescribeClusterNodesResponse {
    #[serde(default)]
    pub node_set: Vec<ClusterNodeItem>,
}

impl From<VipItem> for Vip {
    fn from(item: VipItem) -> Self {
        Vip {
            id: item.vip_id,
            name: item.vip_name,
            addr: item.vip_addr,
            vxnet_id: item.vxnet_id,
        }
    }
}

impl From<ClusterNodeItem> for ClusterNode {
    fn from(item: ClusterNodeItem) -> Self {
        ClusterNode {
            node_id: item.node_id,
            instance_id: item.instance_id,
            private_ip: item.private_ip,
            status: item.status,
        }
    }
}

impl VxnetItem {
    pub(crate) fn into_vxnet(self) -> Option<VxNet> {
        let router = self.router?;
        Some(VxNet {
            id: self.vxnet_id,
            name: self.vxnet_name,
            cidr: router.ip_network,
            gateway: router.manager_ip,
            ip_start: router.dyn_ip_start.filter(|s| !s.is_empty()),
            ip_end: router.dyn_ip_end.filter(|s| !s.is_empty()),
            router_id: self.vpc_router_id,
        })
    }
}
