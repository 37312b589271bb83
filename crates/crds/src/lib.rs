//! hostnic CRD Definitions
//!
//! Kubernetes Custom Resource Definitions shared by the node agent and the
//! cluster controller:
//! - IPPool: cluster-scoped allocation domain over a CIDR
//! - IPAMBlock: one sub-CIDR of an IPPool with its allocation table
//! - IPAMHandle: reverse index from a handle id to the blocks it holds
//! - VxNetPool: the set of VxNets backing shared-subnet mode

pub mod ip_pool;
pub mod ipam_block;
pub mod ipam_handle;
pub mod labels;
pub mod vxnet_pool;

pub use ip_pool::*;
pub use ipam_block::*;
pub use ipam_handle::*;
pub use vxnet_pool::*;
