//! VxNetPool CRD
//!
//! Lists the VxNets that back shared-subnet mode. The controller turns each
//! VxNet into an IPPool with its blocks and reports the mapping in status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "vxnet.qingcloud.com",
    version = "v1alpha1",
    kind = "VxNetPool",
    shortname = "vxp",
    status = "VxNetPoolStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VxNetPoolSpec {
    /// VxNet ids
    pub vxnets: Vec<VxNetRef>,

    /// Prefix length of the blocks generated for each VxNet
    #[serde(default = "crate::ip_pool::default_block_size")]
    pub block_size: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VxNetRef {
    /// VxNet id (e.g. "vxnet-abc123")
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VxNetPoolStatus {
    /// True once every VxNet has an IPPool and blocks
    #[serde(default)]
    pub ready: bool,

    /// Resolved VxNet to IPPool/subnet mapping
    #[serde(default)]
    pub pools: Vec<VxNetPoolInfo>,

    /// Why the pool is not ready yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VxNetPoolInfo {
    /// VxNet id
    pub name: String,

    /// IPPool created for the VxNet
    pub ippool: String,

    /// IPAMBlock names generated for the pool
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_defaults() {
        let spec: VxNetPoolSpec = serde_json::from_value(serde_json::json!({
            "vxnets": [{"name": "vxnet-a"}, {"name": "vxnet-b"}]
        }))
        .unwrap();

        assert_eq!(spec.vxnets.len(), 2);
        assert_eq!(spec.block_size, crate::DEFAULT_BLOCK_SIZE);
    }
}
