//! IPAM engine
//!
//! Every block write is a compare-and-set against the API server, which is
//! the only coordination between agents on different nodes. Handles are
//! written after their block and are the reverse index used by release.

use crate::block::{BlockCounts, BlockExt, RESERVED_HANDLE, parse_cidr};
use crate::client::IpamClient;
use crate::error::IpamError;
use crate::pool::generate_blocks;
use crds::labels::{IPPOOL_DEFAULT_LABEL, IPPOOL_NAME_LABEL};
use crds::{IPAMBlock, IPAMHandle, IPAMHandleSpec, IPPool};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Attempts per compare-and-set loop
pub const MAX_RETRIES: usize = 10;

/// Attribute keys written with each allocation
pub const ATTR_NAMESPACE: &str = "namespace";
pub const ATTR_POD: &str = "pod";
pub const ATTR_NODE: &str = "node";

/// Request for one address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoAssignArgs {
    pub handle_id: String,
    pub attrs: BTreeMap<String, String>,
    /// Namespace used to look up the IPAM ConfigMap
    pub namespace: Option<String>,
    /// Restrict to these pools
    pub pools: Vec<String>,
    /// Restrict to these blocks; wins over `pools`
    pub blocks: Vec<String>,
}

/// An address handed out by `auto_assign`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpAssignment {
    pub ip: Ipv4Addr,
    /// Prefix length of the owning pool
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub block: String,
    pub pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockUtilization {
    pub name: String,
    pub cidr: String,
    pub counts: BlockCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUtilization {
    pub name: String,
    pub cidr: String,
    pub counts: BlockCounts,
    pub blocks: Vec<BlockUtilization>,
}

/// A pod that exists and has not terminated, the authority for repair
///
/// Existence alone keeps a pod's allocations alive. `ip` is only known once
/// the kubelet has reported it and is used to find duplicate and unrecorded
/// addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePod {
    pub namespace: String,
    pub name: String,
    pub ip: Option<Ipv4Addr>,
}

impl LivePod {
    pub fn handle_id(&self) -> String {
        crate::config::handle_id(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenAllocation {
    pub block: String,
    pub ip: Ipv4Addr,
    pub handle_id: String,
}

/// Leaks found by `get_and_fix_broken_blocks`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokenBlocks {
    /// Recorded for a handle whose pod no longer exists
    pub stale: Vec<BrokenAllocation>,
    /// Recorded for a live pod that is using a different address
    pub duplicate: Vec<BrokenAllocation>,
    /// Used by a live pod but not recorded
    pub silent: Vec<BrokenAllocation>,
    /// Used by a live pod while recorded for someone else; reported only
    pub conflicts: Vec<BrokenAllocation>,
}

impl BrokenBlocks {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.duplicate.is_empty() && self.silent.is_empty() && self.conflicts.is_empty()
    }
}

fn pool_of(block: &IPAMBlock) -> Option<String> {
    block.labels().get(IPPOOL_NAME_LABEL).cloned()
}

fn sort_by_network(blocks: &mut [IPAMBlock]) {
    blocks.sort_by_key(|b| parse_cidr(&b.spec.cidr).map(|n| u32::from(n.network())).unwrap_or(u32::MAX));
}

/// Allocates pod addresses out of IPAMBlocks
#[derive(Clone)]
pub struct IpamEngine {
    client: Arc<dyn IpamClient>,
}

impl std::fmt::Debug for IpamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamEngine").finish_non_exhaustive()
    }
}

impl IpamEngine {
    pub fn new(client: Arc<dyn IpamClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn IpamClient> {
        &self.client
    }

    /// Assign one address to `args.handle_id`; returns the existing one if the handle already holds it
    pub async fn auto_assign(&self, args: &AutoAssignArgs) -> Result<Vec<IpAssignment>, IpamError> {
        let pools: BTreeMap<String, IPPool> = self
            .client
            .list_pools()
            .await?
            .into_iter()
            .map(|p| (p.name_any(), p))
            .collect();

        let existing = self.existing_assignments(&args.handle_id, &pools).await?;
        if !existing.is_empty() {
            debug!("Handle {} already holds {:?}", args.handle_id, existing);
            return Ok(existing);
        }

        for block in self.candidate_blocks(args, &pools).await? {
            let Some(assignment) = self.assign_in_block(&block, args, &pools).await? else {
                continue;
            };
            if let Err(e) = self.adjust_handle(&args.handle_id, &assignment.block, 1).await {
                warn!(
                    "Recording handle {} failed, returning {}: {}",
                    args.handle_id, assignment.ip, e
                );
                self.release_ip_in_block(&assignment.block, assignment.ip).await?;
                return Err(e);
            }
            info!(
                "Assigned {} from block {} to handle {}",
                assignment.ip, assignment.block, args.handle_id
            );
            return Ok(vec![assignment]);
        }
        Err(IpamError::NoAvailableAddress(args.handle_id.clone()))
    }

    async fn existing_assignments(
        &self,
        handle_id: &str,
        pools: &BTreeMap<String, IPPool>,
    ) -> Result<Vec<IpAssignment>, IpamError> {
        let Some(handle) = self.client.get_handle(handle_id).await? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for name in handle.spec.block.keys() {
            let Some(block) = self.client.get_block(name).await? else {
                continue;
            };
            for ip in block.spec.handle_ips(handle_id)? {
                out.push(assignment(&block, ip, pools)?);
            }
        }
        Ok(out)
    }

    /// Block names to try, in order
    async fn candidate_blocks(
        &self,
        args: &AutoAssignArgs,
        pools: &BTreeMap<String, IPPool>,
    ) -> Result<Vec<String>, IpamError> {
        let mut all = self.client.list_blocks(None).await?;
        sort_by_network(&mut all);

        let wanted: Vec<String> = if !args.blocks.is_empty() {
            args.blocks.clone()
        } else if !args.pools.is_empty() {
            args.pools.clone()
        } else {
            let configured = match self.client.get_config().await? {
                Some((config, _)) => config.subnets_for(args.namespace.as_deref()).to_vec(),
                None => Vec::new(),
            };
            if configured.is_empty() {
                let defaults: Vec<String> = pools
                    .values()
                    .filter(|p| p.labels().contains_key(IPPOOL_DEFAULT_LABEL))
                    .map(|p| p.name_any())
                    .collect();
                if defaults.is_empty() { pools.keys().cloned().collect() } else { defaults }
            } else {
                configured
            }
        };

        // each name is a block, or else a pool standing for its blocks
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for name in &wanted {
            let matching: Vec<&IPAMBlock> = match all.iter().find(|b| &b.name_any() == name) {
                Some(block) => vec![block],
                None => all.iter().filter(|b| pool_of(b).as_ref() == Some(name)).collect(),
            };
            for block in matching {
                if block.spec.deleted {
                    continue;
                }
                let disabled = pool_of(block)
                    .and_then(|p| pools.get(&p))
                    .is_some_and(|p| p.spec.disabled);
                if disabled {
                    continue;
                }
                if seen.insert(block.name_any()) {
                    out.push(block.name_any());
                }
            }
        }
        Ok(out)
    }

    async fn assign_in_block(
        &self,
        name: &str,
        args: &AutoAssignArgs,
        pools: &BTreeMap<String, IPPool>,
    ) -> Result<Option<IpAssignment>, IpamError> {
        for attempt in 0..MAX_RETRIES {
            let Some(mut block) = self.client.get_block(name).await? else {
                return Ok(None);
            };
            if block.spec.deleted {
                return Ok(None);
            }
            let Some(ip) = block.spec.assign(&args.handle_id, &args.attrs)? else {
                return Ok(None);
            };
            match self.client.update_block(&block).await {
                Ok(_) => return assignment(&block, ip, pools).map(Some),
                Err(e) if e.is_conflict() => {
                    debug!("Conflict on block {} (attempt {}), retrying", name, attempt + 1);
                }
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::RetriesExhausted(format!("block {}", name), MAX_RETRIES))
    }

    /// Add `delta` to the handle's count for `block`, creating or deleting the handle as needed
    async fn adjust_handle(&self, handle_id: &str, block: &str, delta: i64) -> Result<(), IpamError> {
        for _ in 0..MAX_RETRIES {
            let result = match self.client.get_handle(handle_id).await? {
                None if delta <= 0 => return Ok(()),
                None => {
                    let handle = IPAMHandle::new(
                        handle_id,
                        IPAMHandleSpec {
                            handle_id: handle_id.to_string(),
                            block: BTreeMap::from([(block.to_string(), delta as u32)]),
                            deleted: false,
                        },
                    );
                    self.client.create_handle(&handle).await.map(|_| ())
                }
                Some(mut handle) => {
                    let count = i64::from(handle.spec.block.get(block).copied().unwrap_or(0)) + delta;
                    if count > 0 {
                        handle.spec.block.insert(block.to_string(), count as u32);
                    } else {
                        handle.spec.block.remove(block);
                    }
                    if handle.spec.block.is_empty() {
                        self.client.delete_handle(handle_id).await
                    } else {
                        self.client.update_handle(&handle).await.map(|_| ())
                    }
                }
            };
            match result {
                Ok(()) => return Ok(()),
                Err(IpamError::Conflict(_) | IpamError::AlreadyExists(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::RetriesExhausted(format!("handle {}", handle_id), MAX_RETRIES))
    }

    /// Release every address held by `handle_id`; returns how many were freed
    pub async fn release_by_handle(&self, handle_id: &str) -> Result<usize, IpamError> {
        let Some(handle) = self.client.get_handle(handle_id).await? else {
            debug!("Handle {} not found, nothing to release", handle_id);
            return Ok(0);
        };

        let mut released = 0;
        for name in handle.spec.block.keys() {
            released += self.release_handle_in_block(name, handle_id).await?;
        }
        self.client.delete_handle(handle_id).await?;
        info!("Released {} addresses of handle {}", released, handle_id);
        Ok(released)
    }

    async fn release_handle_in_block(&self, name: &str, handle_id: &str) -> Result<usize, IpamError> {
        for _ in 0..MAX_RETRIES {
            let Some(mut block) = self.client.get_block(name).await? else {
                return Ok(0);
            };
            let n = block.spec.release_handle(handle_id);
            if n == 0 {
                return Ok(0);
            }
            match self.client.update_block(&block).await {
                Ok(_) => return Ok(n),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::RetriesExhausted(format!("block {}", name), MAX_RETRIES))
    }

    /// Release a single address; returns the handle that held it
    pub async fn release_by_ip(&self, ip: Ipv4Addr) -> Result<Option<String>, IpamError> {
        let blocks = self.client.list_blocks(None).await?;
        let Some(block) = blocks
            .iter()
            .find(|b| b.spec.ordinal_of(ip).ok().flatten().is_some())
        else {
            return Err(IpamError::NotFound(format!("block for {}", ip)));
        };
        let name = block.name_any();
        let owner = self.release_ip_in_block(&name, ip).await?;
        if let Some(handle) = &owner {
            self.adjust_handle(handle, &name, -1).await?;
            info!("Released {} of handle {}", ip, handle);
        }
        Ok(owner)
    }

    async fn release_ip_in_block(&self, name: &str, ip: Ipv4Addr) -> Result<Option<String>, IpamError> {
        for _ in 0..MAX_RETRIES {
            let Some(mut block) = self.client.get_block(name).await? else {
                return Ok(None);
            };
            let Some(ordinal) = block.spec.ordinal_of(ip)? else {
                return Ok(None);
            };
            let Some(owner) = block.spec.release_ordinal(ordinal) else {
                return Ok(None);
            };
            match self.client.update_block(&block).await {
                Ok(_) => return Ok(Some(owner)),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(IpamError::RetriesExhausted(format!("block {}", name), MAX_RETRIES))
    }

    /// Per-pool and per-block counts; an empty filter means every pool
    pub async fn get_utilization(&self, pool_names: &[String]) -> Result<Vec<PoolUtilization>, IpamError> {
        let mut out = Vec::new();
        for pool in self.client.list_pools().await? {
            let name = pool.name_any();
            if !pool_names.is_empty() && !pool_names.contains(&name) {
                continue;
            }
            let mut blocks = self.client.list_blocks(Some(&name)).await?;
            sort_by_network(&mut blocks);

            let mut total = BlockCounts::default();
            let mut per_block = Vec::with_capacity(blocks.len());
            for block in &blocks {
                let counts = block.spec.counts();
                total.capacity += counts.capacity;
                total.allocated += counts.allocated;
                total.reserved += counts.reserved;
                total.unallocated += counts.unallocated;
                per_block.push(BlockUtilization {
                    name: block.name_any(),
                    cidr: block.spec.cidr.clone(),
                    counts,
                });
            }
            out.push(PoolUtilization {
                name,
                cidr: pool.spec.cidr.clone(),
                counts: total,
                blocks: per_block,
            });
        }
        Ok(out)
    }

    /// Reconcile block contents against the pods known to be running
    ///
    /// With `node` set only allocations tagged with that node can be stale,
    /// since `live_pods` only covers that node. With `fix` the stale and
    /// duplicate cells are freed and the silent ones recorded, one
    /// compare-and-set write per block.
    pub async fn get_and_fix_broken_blocks(
        &self,
        pool_names: &[String],
        live_pods: &[LivePod],
        node: Option<&str>,
        fix: bool,
    ) -> Result<BrokenBlocks, IpamError> {
        let blocks = if pool_names.is_empty() {
            self.client.list_blocks(None).await?
        } else {
            let mut all = Vec::new();
            for pool in pool_names {
                all.extend(self.client.list_blocks(Some(pool)).await?);
            }
            all
        };

        let by_handle: BTreeMap<String, &LivePod> = live_pods.iter().map(|p| (p.handle_id(), p)).collect();
        let mut report = BrokenBlocks::default();

        for block in &blocks {
            let found = inspect_block(block, &by_handle, live_pods, node)?;
            if fix && !(found.stale.is_empty() && found.duplicate.is_empty() && found.silent.is_empty()) {
                self.repair_block(&block.name_any(), &found, node).await?;
            }
            report.stale.extend(found.stale);
            report.duplicate.extend(found.duplicate);
            report.silent.extend(found.silent);
            report.conflicts.extend(found.conflicts);
        }

        if !report.is_empty() {
            warn!(
                "Broken blocks: {} stale, {} duplicate, {} silent, {} conflicting{}",
                report.stale.len(),
                report.duplicate.len(),
                report.silent.len(),
                report.conflicts.len(),
                if fix { " (fixed)" } else { "" }
            );
        }
        Ok(report)
    }

    async fn repair_block(&self, name: &str, found: &BrokenBlocks, node: Option<&str>) -> Result<(), IpamError> {
        let mut applied = None;
        for _ in 0..MAX_RETRIES {
            let Some(mut block) = self.client.get_block(name).await? else {
                return Ok(());
            };
            let mut released = Vec::new();
            let mut inserted = Vec::new();
            for entry in found.stale.iter().chain(&found.duplicate) {
                if let Some(ordinal) = block.spec.ordinal_of(entry.ip)? {
                    if block.spec.owner_at(ordinal) == Some(entry.handle_id.as_str()) {
                        block.spec.release_ordinal(ordinal);
                        released.push(entry.handle_id.clone());
                    }
                }
            }
            for entry in &found.silent {
                if let Some(ordinal) = block.spec.ordinal_of(entry.ip)? {
                    let attrs = silent_attrs(&entry.handle_id, node);
                    if block.spec.assign_ordinal(ordinal, &entry.handle_id, &attrs) {
                        inserted.push(entry.handle_id.clone());
                    }
                }
            }
            match self.client.update_block(&block).await {
                Ok(_) => {
                    applied = Some((released, inserted));
                    break;
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        let Some((released, inserted)) = applied else {
            return Err(IpamError::RetriesExhausted(format!("block {}", name), MAX_RETRIES));
        };

        for handle in released {
            self.adjust_handle(&handle, name, -1).await?;
        }
        for handle in inserted {
            self.adjust_handle(&handle, name, 1).await?;
        }
        info!("Repaired block {}", name);
        Ok(())
    }

    /// Create the blocks of a pool; existing ones are left alone
    pub async fn auto_generate_blocks_from_pool(&self, pool_name: &str) -> Result<Vec<String>, IpamError> {
        let pool = self
            .client
            .get_pool(pool_name)
            .await?
            .ok_or_else(|| IpamError::NotFound(format!("ippool {}", pool_name)))?;

        let mut names = Vec::new();
        let mut created = 0;
        for block in generate_blocks(&pool)? {
            let name = block.name_any();
            match self.client.create_block(&block).await {
                Ok(_) => created += 1,
                Err(IpamError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            names.push(name);
        }
        if created > 0 {
            info!("Created {} of {} blocks for pool {}", created, names.len(), pool_name);
        }
        Ok(names)
    }

    /// Delete a pool's blocks once nothing but reservations remain
    ///
    /// Returns `false`, deleting nothing, while any address is still allocated.
    pub async fn release_pool_blocks(&self, pool_name: &str) -> Result<bool, IpamError> {
        let blocks = self.client.list_blocks(Some(pool_name)).await?;
        let in_use: usize = blocks.iter().map(|b| b.spec.counts().allocated).sum();
        if in_use > 0 {
            debug!("Pool {} still has {} allocations", pool_name, in_use);
            return Ok(false);
        }
        for block in &blocks {
            self.client.delete_block(&block.name_any()).await?;
        }
        info!("Deleted {} blocks of pool {}", blocks.len(), pool_name);
        Ok(true)
    }
}

fn assignment(block: &IPAMBlock, ip: Ipv4Addr, pools: &BTreeMap<String, IPPool>) -> Result<IpAssignment, IpamError> {
    let pool_name = pool_of(block);
    let pool = pool_name.as_ref().and_then(|p| pools.get(p));
    let prefix_len = match pool {
        Some(p) => parse_cidr(&p.spec.cidr)?.prefix_len(),
        None => block.spec.network()?.prefix_len(),
    };
    let gateway = pool
        .and_then(|p| p.spec.gateway.as_deref())
        .and_then(|g| g.parse().ok());
    Ok(IpAssignment {
        ip,
        prefix_len,
        gateway,
        block: block.name_any(),
        pool: pool_name,
    })
}

fn silent_attrs(handle_id: &str, node: Option<&str>) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    if let Some((ns, pod)) = handle_id.split_once('.') {
        attrs.insert(ATTR_NAMESPACE.to_string(), ns.to_string());
        attrs.insert(ATTR_POD.to_string(), pod.to_string());
    }
    if let Some(node) = node {
        attrs.insert(ATTR_NODE.to_string(), node.to_string());
    }
    attrs
}

fn inspect_block(
    block: &IPAMBlock,
    by_handle: &BTreeMap<String, &LivePod>,
    live_pods: &[LivePod],
    node: Option<&str>,
) -> Result<BrokenBlocks, IpamError> {
    let name = block.name_any();
    let spec = &block.spec;
    let mut found = BrokenBlocks::default();
    let entry = |ip, handle_id: &str| BrokenAllocation {
        block: name.clone(),
        ip,
        handle_id: handle_id.to_string(),
    };

    for (ordinal, handle) in spec.allocations_by_ordinal() {
        let ip = spec.ip_at(ordinal)?;
        let tagged_node = spec.allocations[ordinal]
            .and_then(|idx| spec.attributes.get(idx))
            .and_then(|a| a.secondary.get(ATTR_NODE))
            .map(String::as_str);
        let in_scope = node.is_none() || tagged_node == node;
        match by_handle.get(&handle) {
            None if in_scope => found.stale.push(entry(ip, &handle)),
            Some(pod) if pod.ip.is_some_and(|reported| reported != ip) => found.duplicate.push(entry(ip, &handle)),
            _ => {}
        }
    }

    let mut seen_ips = BTreeSet::new();
    for pod in live_pods {
        let Some(pod_ip) = pod.ip else {
            continue;
        };
        let Some(ordinal) = spec.ordinal_of(pod_ip)? else {
            continue;
        };
        let handle = pod.handle_id();
        if !seen_ips.insert(pod_ip) {
            found.conflicts.push(entry(pod_ip, &handle));
            continue;
        }
        match spec.owner_at(ordinal) {
            None => found.silent.push(entry(pod_ip, &handle)),
            Some(owner) if owner == handle => {}
            Some(owner) if owner == RESERVED_HANDLE => found.conflicts.push(entry(pod_ip, &handle)),
            // stale owner is freed first, then the pod can be recorded
            Some(owner) if !by_handle.contains_key(owner) && found.stale.iter().any(|s| s.ip == pod_ip) => {
                found.silent.push(entry(pod_ip, &handle))
            }
            Some(_) => found.conflicts.push(entry(pod_ip, &handle)),
        }
    }
    Ok(found)
}
