//! Namespace to subnet auto-assignment
//!
//! Level driven: every trigger recomputes the whole map from the live
//! namespaces, the VxNetPool subnets and the exhausted blocks, then writes
//! the ConfigMap with a resourceVersion check.

use super::Reconciler;
use crate::error::ControllerError;
use crds::labels::IPAM_DEFAULT_NAMESPACE;
use crds::VxNetPool;
use ipam::{BlockExt, IpamClient, IpamConfig, IpamError, MAX_RETRIES};
use kube::ResourceExt;
use kube::api::ListParams;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Namespaces that keep using the `Default` subnets
pub fn is_system_namespace(name: &str) -> bool {
    name == "default" || name.starts_with("kube-")
}

/// Desired namespace map
///
/// - entries of namespaces no longer in `namespaces` are dropped
/// - a namespace without subnets gets one free subnet
/// - a namespace with an exhausted subnet gets one more, unless a subnet
///   was already appended after it
///
/// A free subnet is one of `subnets`, in order, not used by any entry.
/// The `Default` entry and the `auto_assign` flag are kept as they are.
pub fn plan_namespace_subnets(
    config: &IpamConfig,
    namespaces: &BTreeSet<String>,
    subnets: &[String],
    exhausted: &BTreeSet<String>,
) -> IpamConfig {
    let mut plan = config.clone();
    plan.namespaces
        .retain(|ns, _| ns == IPAM_DEFAULT_NAMESPACE || namespaces.contains(ns));

    let mut used: BTreeSet<String> = plan.namespaces.values().flatten().cloned().collect();
    let mut free = subnets.iter();

    for ns in namespaces.iter().filter(|ns| !is_system_namespace(ns)) {
        let current = plan.namespaces.get(ns).map(Vec::as_slice).unwrap_or(&[]);
        // any exhausted subnet asks for one more; only the newest can be
        // exhausted without a successor, so checking it keeps the plan stable
        let needs_more = current.last().is_none_or(|s| exhausted.contains(s));
        if !needs_more {
            continue;
        }
        let Some(subnet) = free.find(|s| !used.contains(*s)).cloned() else {
            warn!("No free subnet left for namespace {}", ns);
            break;
        };
        used.insert(subnet.clone());
        plan.namespaces.entry(ns.clone()).or_default().push(subnet);
    }
    plan
}

/// Read-modify-write of the IPAM ConfigMap, retried on resourceVersion
/// conflicts. `plan` returns `None` when nothing should change. Returns
/// whether a write happened.
pub async fn update_ipam_config<F>(client: &dyn IpamClient, plan: F) -> Result<bool, ControllerError>
where
    F: Fn(&IpamConfig) -> Option<IpamConfig>,
{
    for attempt in 1..=MAX_RETRIES {
        let Some((config, resource_version)) = client.get_config().await? else {
            debug!("No IPAM config, nothing to update");
            return Ok(false);
        };
        let Some(next) = plan(&config).filter(|next| *next != config) else {
            return Ok(false);
        };
        match client.put_config(&next, resource_version.as_deref()).await {
            Ok(()) => {
                info!("Updated namespace subnets: {:?}", next.namespaces);
                return Ok(true);
            }
            Err(IpamError::Conflict(_)) => {
                debug!("IPAM config changed underneath, retry {}/{}", attempt, MAX_RETRIES);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(IpamError::RetriesExhausted("ipam config".to_string(), MAX_RETRIES).into())
}

impl Reconciler {
    /// Recompute and write the namespace map when auto-assign is on
    pub async fn reconcile_namespaces(&self, vxnetpool: &str) -> Result<(), ControllerError> {
        let client = self.ipam.client();
        match client.get_config().await? {
            Some((config, _)) if config.auto_assign => {}
            _ => return Ok(()),
        }

        let namespaces: BTreeSet<String> = self
            .namespace_api
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        let subnets = match self.vxnetpool_api.get_opt(vxnetpool).await? {
            Some(pool) => pool_subnets(&pool),
            None => Vec::new(),
        };
        let exhausted: BTreeSet<String> = client
            .list_blocks(None)
            .await?
            .iter()
            .filter(|b| b.spec.counts().unallocated == 0)
            .map(ResourceExt::name_any)
            .collect();

        update_ipam_config(client.as_ref(), |config| {
            config
                .auto_assign
                .then(|| plan_namespace_subnets(config, &namespaces, &subnets, &exhausted))
        })
        .await?;
        Ok(())
    }
}

/// Subnets of a VxNetPool in status order
pub fn pool_subnets(pool: &VxNetPool) -> Vec<String> {
    pool.status
        .as_ref()
        .filter(|s| s.ready)
        .map(|s| s.pools.iter().flat_map(|p| p.subnets.iter().cloned()).collect())
        .unwrap_or_default()
}
