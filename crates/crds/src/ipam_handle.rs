//! IPAMHandle CRD
//!
//! Reverse index from a handle id to the number of addresses it holds in
//! each block, so release does not scan every block.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "network.qingcloud.com",
    version = "v1alpha1",
    kind = "IPAMHandle",
    shortname = "iph"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAMHandleSpec {
    /// Handle id, `<namespace>.<pod>` for pods
    #[serde(rename = "handleID")]
    pub handle_id: String,

    /// Block name to address count
    #[serde(default)]
    pub block: BTreeMap<String, u32>,

    /// Set while a release is in progress
    #[serde(default)]
    pub deleted: bool,
}
