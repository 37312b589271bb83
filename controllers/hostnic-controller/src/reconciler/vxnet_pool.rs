//! VxNetPool reconciler
//!
//! IaaS side first: VxNet info, then VIPs reserving the pod range (created
//! asynchronously and picked up on a later tick), then the security group
//! rule. Once every VxNet is ready, one IPPool per VxNet and its blocks are
//! created and the mapping is written to status.

use super::Reconciler;
use crate::error::ControllerError;
use crds::{IPPool, IPPoolSpec, PoolType, VxNetPool, VxNetPoolInfo, VxNetPoolStatus};
use ipnet::Ipv4Net;
use kube::ResourceExt;
use kube::api::{Patch, PatchParams, PostParams};
use kube_runtime::controller::Action;
use qingcloud_client::{QingCloudClientTrait, Vip, VxNet};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const VIP_NAME_PREFIX: &str = "hostnic-vip-";

/// Address range reserved with VIPs: the VxNet's own range when it has
/// one, else every host address after the gateway
pub fn vip_range(vxnet: &VxNet) -> Result<(Ipv4Addr, Ipv4Addr), ControllerError> {
    let invalid = |what: &str| ControllerError::Validation(format!("vxnet {}: invalid {}", vxnet.id, what));
    let net: Ipv4Net = vxnet.cidr.parse().map_err(|_| invalid("cidr"))?;
    if let (Some(start), Some(end)) = (&vxnet.ip_start, &vxnet.ip_end) {
        let start = start.parse().map_err(|_| invalid("ip_start"))?;
        let end = end.parse().map_err(|_| invalid("ip_end"))?;
        return Ok((start, end));
    }
    let gateway: Ipv4Addr = vxnet.gateway.parse().map_err(|_| invalid("gateway"))?;
    let first = u32::from(gateway).max(u32::from(net.network())) + 1;
    let last = u32::from(net.broadcast()).saturating_sub(1);
    if first > last {
        return Err(invalid("cidr: no host addresses"));
    }
    Ok((Ipv4Addr::from(first), Ipv4Addr::from(last)))
}

/// Lowest and highest address held by `vips`; an address may be a range
pub fn vip_bounds(vips: &[Vip]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    vips.iter()
        .flat_map(|v| v.addr.split('-'))
        .filter_map(|a| a.trim().parse::<Ipv4Addr>().ok())
        .fold(None, |acc, ip| match acc {
            None => Some((ip, ip)),
            Some((lo, hi)) => Some((lo.min(ip), hi.max(ip))),
        })
}

/// IPPool mirroring a ready VxNet, named after it
pub fn desired_ippool(vxnet: &VxNet, vips: &[Vip], block_size: u8) -> IPPool {
    let bounds = vip_bounds(vips);
    IPPool::new(
        &vxnet.id,
        IPPoolSpec {
            cidr: vxnet.cidr.clone(),
            block_size,
            range_start: bounds.map(|(lo, _)| lo.to_string()),
            range_end: bounds.map(|(_, hi)| hi.to_string()),
            gateway: Some(vxnet.gateway.clone()).filter(|g| !g.is_empty()),
            pool_type: PoolType::Vxnet,
            disabled: false,
        },
    )
}

#[derive(Debug, Default)]
struct IaasCache {
    vxnets: BTreeMap<String, VxNet>,
    vips: BTreeMap<String, Vec<Vip>>,
    /// VxNet id to pending CreateVips job
    vip_jobs: BTreeMap<String, String>,
    sg_rules: BTreeSet<String>,
}

/// Outcome of one IaaS pass
#[derive(Debug, Default)]
pub struct VxNetProgress {
    pub ready: Vec<(VxNet, Vec<Vip>)>,
    /// Why the VxNets that are not ready yet are waiting
    pub waiting: Vec<String>,
}

impl VxNetProgress {
    pub fn is_ready(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// IaaS half of the VxNetPool reconcile, cached between ticks
pub struct VxNetSync {
    cloud: Arc<dyn QingCloudClientTrait>,
    cluster_sg: Option<String>,
    cache: Mutex<IaasCache>,
}

impl std::fmt::Debug for VxNetSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VxNetSync").field("cluster_sg", &self.cluster_sg).finish_non_exhaustive()
    }
}

impl VxNetSync {
    pub fn new(cloud: Arc<dyn QingCloudClientTrait>, cluster_sg: Option<String>) -> Self {
        Self {
            cloud,
            cluster_sg,
            cache: Mutex::new(IaasCache::default()),
        }
    }

    pub async fn sync(&self, ids: &[String]) -> Result<VxNetProgress, ControllerError> {
        let mut cache = self.cache.lock().await;
        let mut progress = VxNetProgress::default();

        let missing: Vec<String> = ids.iter().filter(|id| !cache.vxnets.contains_key(*id)).cloned().collect();
        if !missing.is_empty() {
            for (id, vxnet) in self.cloud.get_vxnets(&missing).await? {
                info!("Cached vxnet {} ({})", id, vxnet.cidr);
                cache.vxnets.insert(id, vxnet);
            }
        }

        for id in ids {
            let Some(vxnet) = cache.vxnets.get(id).cloned() else {
                progress.waiting.push(format!("vxnet {} not found", id));
                continue;
            };
            if !cache.vips.contains_key(id) && !self.ensure_vips(&mut cache, &vxnet).await? {
                progress.waiting.push(format!("vxnet {}: waiting for VIPs", id));
                continue;
            }
            if let Some(sg) = &self.cluster_sg {
                if !cache.sg_rules.contains(id) {
                    match self.cloud.create_security_group_rule_for_vxnet(sg, &vxnet).await {
                        Ok(()) => {
                            info!("Added security group {} rule for vxnet {}", sg, id);
                            cache.sg_rules.insert(id.clone());
                        }
                        Err(e) => warn!("Security group {} rule for vxnet {} failed: {}", sg, id, e),
                    }
                }
            }
            let vips = cache.vips.get(id).cloned().unwrap_or_default();
            progress.ready.push((vxnet, vips));
        }
        Ok(progress)
    }

    /// Cache the VxNet's VIPs, creating them when there are none. Returns
    /// whether they are cached.
    async fn ensure_vips(&self, cache: &mut IaasCache, vxnet: &VxNet) -> Result<bool, ControllerError> {
        let vips = self.cloud.describe_vips(&vxnet.id).await?;
        if !vips.is_empty() {
            debug!("vxnet {} has {} VIPs", vxnet.id, vips.len());
            cache.vip_jobs.remove(&vxnet.id);
            cache.vips.insert(vxnet.id.clone(), vips);
            return Ok(true);
        }

        if let Some(job) = cache.vip_jobs.get(&vxnet.id).cloned() {
            let (pending, _) = self.cloud.describe_nic_jobs(std::slice::from_ref(&job)).await?;
            if pending.contains(&job) {
                debug!("VIP job {} for vxnet {} still running", job, vxnet.id);
                return Ok(false);
            }
            warn!("VIP job {} for vxnet {} finished without VIPs, recreating", job, vxnet.id);
            cache.vip_jobs.remove(&vxnet.id);
        }

        let (start, end) = vip_range(vxnet)?;
        let range = format!("{}-{}", start, end);
        let job = self
            .cloud
            .create_vips(&vxnet.id, &format!("{}{}", VIP_NAME_PREFIX, vxnet.id), &range)
            .await?;
        info!("Creating VIPs {} on vxnet {} (job {})", range, vxnet.id, job);
        cache.vip_jobs.insert(vxnet.id.clone(), job);
        Ok(false)
    }
}

impl Reconciler {
    pub async fn reconcile_vxnet_pool(&self, pool: &VxNetPool) -> Result<Action, ControllerError> {
        let name = pool.name_any();
        let ids: Vec<String> = pool.spec.vxnets.iter().map(|v| v.name.clone()).collect();
        let progress = self.vxnets.sync(&ids).await?;

        let status = if progress.is_ready() {
            let mut pools = Vec::with_capacity(progress.ready.len());
            for (vxnet, vips) in &progress.ready {
                let ippool = self.ensure_ippool(vxnet, vips, pool.spec.block_size).await?;
                let subnets = self.ipam.auto_generate_blocks_from_pool(&ippool).await?;
                pools.push(VxNetPoolInfo {
                    name: vxnet.id.clone(),
                    ippool,
                    subnets,
                });
            }
            VxNetPoolStatus {
                ready: true,
                pools,
                message: None,
            }
        } else {
            VxNetPoolStatus {
                ready: false,
                pools: Vec::new(),
                message: Some(progress.waiting.join("; ")),
            }
        };

        if pool.status.as_ref() != Some(&status) {
            self.vxnetpool_api
                .patch_status(&name, &PatchParams::default(), &Patch::Merge(&json!({ "status": status })))
                .await?;
            info!("VxNetPool {} ready={} ({} pools)", name, status.ready, status.pools.len());
        }
        Ok(Action::requeue(self.sync_period))
    }

    /// Create the VxNet's IPPool unless it exists; returns its name
    async fn ensure_ippool(&self, vxnet: &VxNet, vips: &[Vip], block_size: u8) -> Result<String, ControllerError> {
        let desired = desired_ippool(vxnet, vips, block_size);
        let name = desired.name_any();
        if self.ippool_api.get_opt(&name).await?.is_none() {
            match self.ippool_api.create(&PostParams::default(), &desired).await {
                Ok(_) => info!("Created IPPool {} for vxnet {}", name, vxnet.id),
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(name)
    }
}
