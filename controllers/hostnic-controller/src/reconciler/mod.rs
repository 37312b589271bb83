//! Reconciliation logic for hostnic resources.
//!
//! - `ippool`: IPPool finalizer, validation, blocks and status
//! - `namespace`: namespace to subnet auto-assignment in the IPAM ConfigMap
//! - `vxnet_pool`: VxNetPool to VxNets, VIPs, IPPools and blocks

pub mod ippool;
pub mod namespace;
pub mod vxnet_pool;

#[cfg(test)]
mod ippool_test;
#[cfg(test)]
mod vxnet_pool_test;

use crate::backoff::BackoffMap;
use crds::{IPPool, VxNetPool};
use ipam::IpamEngine;
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use std::time::Duration;
use vxnet_pool::VxNetSync;

/// Reconciles hostnic resources.
pub struct Reconciler {
    pub(crate) ippool_api: Api<IPPool>,
    pub(crate) vxnetpool_api: Api<VxNetPool>,
    pub(crate) namespace_api: Api<Namespace>,
    pub(crate) ipam: IpamEngine,
    pub(crate) vxnets: VxNetSync,
    pub(crate) sync_period: Duration,
    backoff: BackoffMap,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("sync_period", &self.sync_period)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        ippool_api: Api<IPPool>,
        vxnetpool_api: Api<VxNetPool>,
        namespace_api: Api<Namespace>,
        ipam: IpamEngine,
        vxnets: VxNetSync,
        sync_period: Duration,
    ) -> Self {
        Self {
            ippool_api,
            vxnetpool_api,
            namespace_api,
            ipam,
            vxnets,
            sync_period,
            // 5s min, 5m max
            backoff: BackoffMap::new(5, 300),
        }
    }

    /// Requeue delay after a failed reconcile of `key`
    pub fn backoff(&self, key: &str) -> Duration {
        self.backoff.next(key)
    }

    pub fn reset_backoff(&self, key: &str) {
        self.backoff.reset(key);
    }
}
