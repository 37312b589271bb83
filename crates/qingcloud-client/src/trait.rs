//! QingCloudClient trait for mocking
//!
//! This trait abstracts the IaaS so the allocator and controllers can be
//! unit tested against an in-memory mock.

use crate::error::QingCloudError;
use crate::models::*;
use std::collections::HashMap;

/// Trait for QingCloud IaaS operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait QingCloudClientTrait: Send + Sync {
    /// Instance id of the node this client acts for
    fn instance_id(&self) -> &str;

    /// Create `count` NICs on `vxnet` and attach them to this instance.
    ///
    /// `ips` optionally pins the primary address of each NIC. Partial success
    /// is reported as an error; the caller polls the returned job id.
    async fn create_nics_and_attach(
        &self,
        vxnet: &str,
        count: usize,
        ips: &[String],
    ) -> Result<(Vec<HostNic>, String), QingCloudError>;

    /// Attach existing NICs to this instance
    async fn attach_nics(&self, ids: &[String]) -> Result<String, QingCloudError>;

    /// Detach NICs; with `sync` the call waits for the job to finish
    async fn detach_nics(&self, ids: &[String], sync: bool) -> Result<String, QingCloudError>;

    /// Delete detached NICs
    async fn delete_nics(&self, ids: &[String]) -> Result<(), QingCloudError>;

    /// Authoritative NIC state keyed by NIC id; absent ids do not exist
    async fn get_nics(&self, ids: &[String]) -> Result<HashMap<String, HostNic>, QingCloudError>;

    /// NICs created by hostnic for this instance, found by name
    async fn get_created_nics_by_name(&self, name: &str) -> Result<Vec<HostNic>, QingCloudError>;

    /// Poll jobs: returns the still pending job ids and, for finished jobs,
    /// NIC id to whether the job succeeded
    async fn describe_nic_jobs(
        &self,
        ids: &[String],
    ) -> Result<(Vec<String>, HashMap<String, bool>), QingCloudError>;

    async fn get_vxnets(&self, ids: &[String]) -> Result<HashMap<String, VxNet>, QingCloudError>;
    async fn create_vips(&self, vxnet: &str, name: &str, range: &str) -> Result<String, QingCloudError>;
    async fn describe_vips(&self, vxnet: &str) -> Result<Vec<Vip>, QingCloudError>;
    async fn delete_vips(&self, ids: &[String]) -> Result<String, QingCloudError>;
    async fn create_security_group_rule_for_vxnet(
        &self,
        security_group: &str,
        vxnet: &VxNet,
    ) -> Result<(), QingCloudError>;
    async fn describe_cluster_nodes(&self, cluster: &str) -> Result<Vec<ClusterNode>, QingCloudError>;
}
