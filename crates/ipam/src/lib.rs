//! Block-based IPAM over Kubernetes resources
//!
//! An IPPool is split into IPAMBlocks of `blockSize`; each block holds its own
//! allocation table and is updated with compare-and-set on its
//! resourceVersion. IPAMHandles map a handle id (`<namespace>.<pod>`) back to
//! the blocks holding its addresses.
//!
//! Storage goes through [`IpamClient`]: [`KubeIpamClient`] talks to the API
//! server, `MemoryIpamClient` (feature `test-util`) keeps everything in
//! memory with the same conflict semantics.

pub mod block;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
#[cfg(feature = "test-util")]
pub mod mock;

pub use block::{BlockCounts, BlockExt, PoolRange, RESERVED_HANDLE, block_name, new_block, parse_cidr};
pub use client::{IpamClient, KubeIpamClient};
pub use config::{IpamConfig, handle_id, validate_ipam_config};
pub use engine::{
    ATTR_NAMESPACE, ATTR_NODE, ATTR_POD, AutoAssignArgs, BlockUtilization, BrokenAllocation, BrokenBlocks,
    IpAssignment, IpamEngine, LivePod, MAX_RETRIES, PoolUtilization,
};
pub use error::IpamError;
pub use pool::{generate_blocks, pool_id, validate_pool};
#[cfg(feature = "test-util")]
pub use mock::MemoryIpamClient;
