//! IPPool CRD
//!
//! Cluster-scoped allocation domain over a CIDR. Blocks are generated from
//! the pool by the controller and carry back-pointer labels to it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default IPv4 block size (prefix length) for generated blocks.
pub const DEFAULT_BLOCK_SIZE: u8 = 26;

pub(crate) fn default_block_size() -> u8 {
    DEFAULT_BLOCK_SIZE
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "network.qingcloud.com",
    version = "v1alpha1",
    kind = "IPPool",
    shortname = "ipp",
    status = "IPPoolStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Pool CIDR (e.g. "192.168.0.0/24")
    pub cidr: String,

    /// Prefix length of the blocks generated from this pool
    #[serde(default = "default_block_size")]
    pub block_size: u8,

    /// First usable address; addresses below it are reserved in every block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,

    /// Last usable address; addresses above it are reserved in every block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,

    /// Gateway of the backing VxNet, never handed out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,

    /// Pool type
    #[serde(rename = "type", default)]
    pub pool_type: PoolType,

    /// A disabled pool is never chosen for new allocations
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    /// Pool managed purely inside the cluster
    #[default]
    Local,

    /// Pool mirrored from an IaaS VxNet
    Vxnet,
}

impl PoolType {
    /// Label value for the `ippool-type` label
    pub fn as_str(self) -> &'static str {
        match self {
            PoolType::Local => "local",
            PoolType::Vxnet => "vxnet",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolStatus {
    /// Addresses covered by the generated blocks
    #[serde(default)]
    pub capacity: u32,

    /// Addresses currently allocated to a handle
    #[serde(default)]
    pub allocations: u32,

    /// Free addresses
    #[serde(default)]
    pub unallocated: u32,

    /// Addresses excluded by range or gateway
    #[serde(default)]
    pub reserved: u32,

    /// Names of the blocks generated from the pool
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<String>,

    /// Last reconciliation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: IPPoolSpec = serde_json::from_value(serde_json::json!({
            "cidr": "192.168.0.0/24"
        }))
        .unwrap();

        assert_eq!(spec.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(spec.pool_type, PoolType::Local);
        assert!(!spec.disabled);
        assert!(spec.range_start.is_none());
    }

    #[test]
    fn test_type_is_serialized_as_type() {
        let spec = IPPoolSpec {
            cidr: "10.0.0.0/24".to_string(),
            block_size: 26,
            range_start: None,
            range_end: None,
            gateway: Some("10.0.0.1".to_string()),
            pool_type: PoolType::Vxnet,
            disabled: false,
        };
        let value = serde_json::to_value(&spec).unwrap();

        assert_eq!(value["type"], "vxnet");
        assert_eq!(value["blockSize"], 26);
        assert_eq!(value["gateway"], "10.0.0.1");
    }
}
