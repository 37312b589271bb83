//! IPAMBlock CRD
//!
//! A contiguous sub-CIDR of an IPPool. `allocations` has one cell per address
//! in the block; a cell is either free (`None`) or an index into `attributes`.
//! `unallocated` is the free-list of ordinals and always has as many entries
//! as there are free cells.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "network.qingcloud.com",
    version = "v1alpha1",
    kind = "IPAMBlock",
    shortname = "ipb"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAMBlockSpec {
    /// Block CIDR (e.g. "192.168.0.0/26")
    pub cidr: String,

    /// One cell per address in the block
    #[serde(default)]
    pub allocations: Vec<Option<usize>>,

    /// Free ordinals; the next allocation pops from the front
    #[serde(default)]
    pub unallocated: Vec<usize>,

    /// Attributes referenced by `allocations`
    #[serde(default)]
    pub attributes: Vec<AllocationAttribute>,

    /// A deleted block takes no new allocations
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocationAttribute {
    /// Handle that owns the allocations pointing at this attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<String>,

    /// Free-form metadata (namespace, pod, node)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secondary: BTreeMap<String, String>,
}
