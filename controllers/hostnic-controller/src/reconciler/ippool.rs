use super::Reconciler;
use crate::error::ControllerError;
use crds::labels::{IPPOOL_APPLIED_SPEC_ANNOTATION, IPPOOL_DEFAULT_LABEL, IPPOOL_FINALIZER};
use crds::{IPPool, IPPoolSpec, IPPoolStatus};
use ipam::{IpamError, PoolUtilization, validate_pool};
use kube::ResourceExt;
use kube::api::{ListParams, Patch, PatchParams};
use kube_runtime::controller::Action;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll interval while a deleted pool drains
const DRAIN_REQUEUE: Duration = Duration::from_secs(10);
/// Status refresh; allocations change without touching the pool
const STATUS_REQUEUE: Duration = Duration::from_secs(60);

pub fn is_default(pool: &IPPool) -> bool {
    pool.labels().contains_key(IPPOOL_DEFAULT_LABEL)
}

/// True when deleting `pool` would leave no default pool
pub fn is_last_default(pool: &IPPool, all: &[IPPool]) -> bool {
    let name = pool.name_any();
    is_default(pool)
        && !all
            .iter()
            .any(|p| p.name_any() != name && is_default(p) && p.metadata.deletion_timestamp.is_none())
}

/// The spec accepted on a previous reconcile, as a pool of the same name
pub fn applied_pool(pool: &IPPool) -> Option<IPPool> {
    let raw = pool.annotations().get(IPPOOL_APPLIED_SPEC_ANNOTATION)?;
    match serde_json::from_str::<IPPoolSpec>(raw) {
        Ok(spec) => Some(IPPool::new(&pool.name_any(), spec)),
        Err(e) => {
            warn!("IPPool {} has an unreadable {} annotation: {}", pool.name_any(), IPPOOL_APPLIED_SPEC_ANNOTATION, e);
            None
        }
    }
}

/// Pools `pool` has to be validated against
///
/// An accepted pool keeps its place and is only held to the spec it was
/// accepted with. A pool that is not accepted yet yields to every accepted
/// pool and to pending pools created before it.
pub fn validation_set(pool: &IPPool, others: Vec<IPPool>) -> Vec<IPPool> {
    if let Some(applied) = applied_pool(pool) {
        return vec![applied];
    }
    let name = pool.name_any();
    others
        .into_iter()
        .filter(|p| p.name_any() != name)
        .filter(|p| p.annotations().contains_key(IPPOOL_APPLIED_SPEC_ANNOTATION) || created_before(p, pool))
        .collect()
}

/// Creation order, ties broken by name
fn created_before(a: &IPPool, b: &IPPool) -> bool {
    (a.creation_timestamp(), a.name_any()) < (b.creation_timestamp(), b.name_any())
}

/// Status from the pool's block counts
pub fn pool_status(util: &PoolUtilization) -> IPPoolStatus {
    let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
    IPPoolStatus {
        capacity: count(util.counts.capacity),
        allocations: count(util.counts.allocated),
        unallocated: count(util.counts.unallocated),
        reserved: count(util.counts.reserved),
        blocks: util.blocks.iter().map(|b| b.name.clone()).collect(),
        last_reconciled: None,
    }
}

impl Reconciler {
    pub async fn reconcile_ippool(&self, pool: &IPPool) -> Result<Action, ControllerError> {
        if pool.metadata.deletion_timestamp.is_some() {
            return self.finalize_ippool(pool).await;
        }
        let name = pool.name_any();
        debug!("Reconciling IPPool {}", name);

        let others = self.ippool_api.list(&ListParams::default()).await?.items;
        validate_pool(pool, &validation_set(pool, others)).map_err(|e| match e {
            IpamError::Validation(msg) => ControllerError::Validation(msg),
            other => other.into(),
        })?;

        self.ensure_accepted(pool).await?;

        let blocks = self.ipam.auto_generate_blocks_from_pool(&name).await?;
        debug!("IPPool {} has {} blocks", name, blocks.len());

        let status = match self.ipam.get_utilization(std::slice::from_ref(&name)).await?.first() {
            Some(util) => pool_status(util),
            None => IPPoolStatus::default(),
        };
        if pool.status.as_ref() != Some(&status) {
            self.ippool_api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&json!({ "status": status })))
                .await?;
            info!(
                "Updated IPPool {} status: {} capacity, {} allocated, {} free, {} reserved",
                name, status.capacity, status.allocations, status.unallocated, status.reserved
            );
        }
        Ok(Action::requeue(STATUS_REQUEUE))
    }

    /// Hold the finalizer and record the accepted spec in one patch
    async fn ensure_accepted(&self, pool: &IPPool) -> Result<(), ControllerError> {
        let name = pool.name_any();
        let mut accepted = pool.spec.clone();
        accepted.disabled = false;
        let accepted = serde_json::to_string(&accepted)?;

        let has_finalizer = pool.finalizers().iter().any(|f| f == IPPOOL_FINALIZER);
        let current = pool.annotations().get(IPPOOL_APPLIED_SPEC_ANNOTATION);
        if has_finalizer && current == Some(&accepted) {
            return Ok(());
        }

        let mut finalizers = pool.finalizers().to_vec();
        if !has_finalizer {
            finalizers.push(IPPOOL_FINALIZER.to_string());
        }
        let patch = json!({
            "metadata": {
                "finalizers": finalizers,
                "annotations": { IPPOOL_APPLIED_SPEC_ANNOTATION: accepted },
            }
        });
        self.ippool_api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ControllerError::Finalizer(format!("IPPool {}: {}", name, e)))?;
        info!("Accepted IPPool {} ({})", name, pool.spec.cidr);
        Ok(())
    }

    /// Disable, wait for the last allocation to go, delete blocks, release
    async fn finalize_ippool(&self, pool: &IPPool) -> Result<Action, ControllerError> {
        let name = pool.name_any();
        if !pool.finalizers().iter().any(|f| f == IPPOOL_FINALIZER) {
            return Ok(Action::await_change());
        }

        let all = self.ippool_api.list(&ListParams::default()).await?.items;
        if is_last_default(pool, &all) {
            return Err(ControllerError::Validation(format!(
                "IPPool {} is the last default pool and cannot be deleted",
                name
            )));
        }

        if !pool.spec.disabled {
            self.ippool_api
                .patch(&name, &PatchParams::default(), &Patch::Merge(&json!({ "spec": { "disabled": true } })))
                .await?;
            info!("Disabled IPPool {} for deletion", name);
        }

        if !self.ipam.release_pool_blocks(&name).await? {
            debug!("IPPool {} still draining", name);
            return Ok(Action::requeue(DRAIN_REQUEUE));
        }

        let finalizers: Vec<String> = pool
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != IPPOOL_FINALIZER)
            .cloned()
            .collect();
        self.ippool_api
            .patch(
                &name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "metadata": { "finalizers": finalizers } })),
            )
            .await
            .map_err(|e| ControllerError::Finalizer(format!("IPPool {}: {}", name, e)))?;
        info!("Released IPPool {}", name);
        Ok(Action::await_change())
    }
}
