//! vNIC allocator
//!
//! Owns every secondary NIC the node holds. Each NIC is a [`NicEntry`]
//! moving through `FREE -> USING -> FREE` (pool NICs) or
//! `USING -> DELETING -> DELETED` (reserved and foreign NICs), and through
//! the phases `INIT -> LINK_READY -> NET_READY` as its attach job completes
//! and its routing table is programmed.
//!
//! All state sits behind one async mutex. Every change is written to the
//! [`Store`] before the in-memory map is updated, so a crash never leaves
//! memory ahead of disk. The lock is never held while waiting for an attach
//! job: an allocation records its claim on the NIC first, polls with the
//! lock released, and checks the claim again on every poll.

mod route_table;

pub use route_table::RouteTables;

use crate::error::AgentError;
use crate::store::{Store, binding_key};
use crate::types::{IpamMessage, PodInfo};
use hostnic_network::NetworkProgrammer;
use qingcloud_client::{HostNic, NicPhase, NicStatus, QingCloudClientTrait};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Refill when fewer FREE NICs remain on the cached VxNet
    pub pool_low: usize,
    /// Release FREE NICs above this count
    pub pool_high: usize,
    /// Hard cap on secondary NICs
    pub max_nic: usize,
    /// First routing table number handed to a NIC
    pub route_table_base: i32,
    /// VxNet the warm pool draws from; no pool without it
    pub cached_vxnet: Option<String>,
    /// Name given to created NICs
    pub nic_name: String,
    pub poll_interval: Duration,
    /// How long an allocation waits for a NIC to attach
    pub attach_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            pool_low: 3,
            pool_high: 5,
            max_nic: 60,
            route_table_base: 260,
            cached_vxnet: None,
            nic_name: "hostnic".to_string(),
            poll_interval: Duration::from_secs(1),
            attach_timeout: Duration::from_secs(180),
        }
    }
}

impl AllocatorConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.pool_low >= self.pool_high {
            return Err(AgentError::InvalidConfig(format!(
                "pool low watermark {} must be below high watermark {}",
                self.pool_low, self.pool_high
            )));
        }
        if self.pool_high > self.max_nic {
            return Err(AgentError::InvalidConfig(format!(
                "pool high watermark {} exceeds max nic {}",
                self.pool_high, self.max_nic
            )));
        }
        // tables 0-255 are reserved by the kernel
        if self.route_table_base <= 255 {
            return Err(AgentError::InvalidConfig(format!(
                "route table base {} must be above 255",
                self.route_table_base
            )));
        }
        if i64::from(self.route_table_base) + self.max_nic as i64 > i64::from(i32::MAX) {
            return Err(AgentError::InvalidConfig(format!(
                "route table base {} plus max nic {} overflows",
                self.route_table_base, self.max_nic
            )));
        }
        Ok(())
    }
}

/// One NIC and whatever is bound to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicEntry {
    pub nic: HostNic,
    /// Dedicated-mode owner
    pub pod: Option<PodInfo>,
    /// Shared-mode pods keyed by container id
    pub shared_pods: BTreeMap<String, PodInfo>,
}

impl NicEntry {
    fn new(nic: HostNic) -> Self {
        Self {
            nic,
            pod: None,
            shared_pods: BTreeMap::new(),
        }
    }

    fn message(&self) -> IpamMessage {
        IpamMessage {
            pod: self.pod.clone(),
            nic: self.nic.clone(),
        }
    }

    /// `namespace/name` of every pod on the NIC
    pub fn pods(&self) -> Vec<String> {
        self.pod
            .iter()
            .chain(self.shared_pods.values())
            .map(PodInfo::key)
            .collect()
    }

    fn owned_by(&self, container_id: &str) -> bool {
        self.pod.as_ref().is_some_and(|p| p.container_id == container_id)
    }
}

struct State {
    nics: BTreeMap<String, NicEntry>,
    /// Outstanding IaaS jobs and the NICs they act on
    jobs: BTreeMap<String, Vec<String>>,
    tables: RouteTables,
}

impl State {
    fn has_pending_job(&self, nic_id: &str) -> bool {
        self.jobs.values().any(|ids| ids.iter().any(|id| id == nic_id))
    }
}

/// What a sync pass does with one NIC
enum SyncAction {
    Evict,
    Attach,
    Prepare,
    Detach,
    Delete,
    Nothing,
}

/// Owner of the node's secondary NICs
pub struct NicAllocator {
    cloud: Arc<dyn QingCloudClientTrait>,
    network: Arc<NetworkProgrammer>,
    store: Arc<Store>,
    config: AllocatorConfig,
    state: Mutex<State>,
}

impl std::fmt::Debug for NicAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NicAllocator").field("config", &self.config).finish()
    }
}

impl NicAllocator {
    pub fn new(
        cloud: Arc<dyn QingCloudClientTrait>,
        network: Arc<NetworkProgrammer>,
        store: Arc<Store>,
        config: AllocatorConfig,
    ) -> Self {
        let tables = RouteTables::new(config.route_table_base);
        Self {
            cloud,
            network,
            store,
            config,
            state: Mutex::new(State {
                nics: BTreeMap::new(),
                jobs: BTreeMap::new(),
                tables,
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<NetworkProgrammer> {
        &self.network
    }

    /// Rebuild state from the store and the IaaS, then warm the pool
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut entries: BTreeMap<String, NicEntry> = BTreeMap::new();
        let mut bindings = Vec::new();
        for (key, msg) in self.store.load_messages()? {
            match key.split_once('/') {
                Some((nic_id, container_id)) => match msg.pod {
                    Some(pod) => bindings.push((nic_id.to_string(), container_id.to_string(), pod)),
                    None => {
                        warn!("Dropping shared binding {} without a pod", key);
                        self.store.delete(&key)?;
                    }
                },
                None => {
                    entries.insert(
                        key,
                        NicEntry {
                            nic: msg.nic,
                            pod: msg.pod,
                            shared_pods: BTreeMap::new(),
                        },
                    );
                }
            }
        }
        for (nic_id, container_id, pod) in bindings {
            match entries.get_mut(&nic_id) {
                Some(entry) => {
                    entry.shared_pods.insert(container_id, pod);
                }
                None => {
                    warn!("Dropping shared binding of unknown NIC {}", nic_id);
                    self.store.delete(&binding_key(&nic_id, &container_id))?;
                }
            }
        }

        if !entries.is_empty() {
            let ids: Vec<String> = entries.keys().cloned().collect();
            let live = self.cloud.get_nics(&ids).await?;
            for (id, nic) in live {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.nic.instance_id = nic.instance_id;
                }
            }
        }

        let instance = self.cloud.instance_id().to_string();
        for mut nic in self.cloud.get_created_nics_by_name(&self.config.nic_name).await? {
            if nic.is_primary || !nic.is_attached_to(&instance) || entries.contains_key(&nic.id) {
                continue;
            }
            let pooled = self.config.cached_vxnet.as_deref() == Some(nic.vxnet.id.as_str());
            nic.status = if pooled { NicStatus::Free } else { NicStatus::Deleting };
            nic.phase = NicPhase::Init;
            info!("Adopting NIC {} ({}) found attached as {}", nic.id, nic.vxnet.id, nic.status);
            entries.insert(nic.id.clone(), NicEntry::new(nic));
        }

        let mut macs = HashSet::new();
        for entry in entries.values() {
            if !macs.insert(entry.nic.hardware_addr.to_lowercase()) {
                return Err(AgentError::InvalidState(format!(
                    "two NICs share hardware address {}",
                    entry.nic.hardware_addr
                )));
            }
        }

        // link aliases win over stored numbers, the kernel is what routes
        let aliases = self.network.route_tables_from_links().await?;
        let mut tables = RouteTables::new(self.config.route_table_base);
        let mut unnumbered = Vec::new();
        for (id, entry) in entries.iter_mut() {
            match aliases.get(&entry.nic.hardware_addr.to_lowercase()) {
                Some(&n) if tables.claim(n) => entry.nic.route_table_num = n,
                _ => unnumbered.push(id.clone()),
            }
        }
        for id in unnumbered {
            if let Some(entry) = entries.get_mut(&id) {
                if !tables.claim(entry.nic.route_table_num) {
                    entry.nic.route_table_num = tables.take();
                }
            }
        }

        for entry in entries.values() {
            self.store.put_message(&entry.nic.id, &entry.message())?;
        }

        let mut state = self.state.lock().await;
        info!(
            "Allocator started with {} NICs, {} route tables in use",
            entries.len(),
            tables.in_use()
        );
        state.nics = entries;
        state.tables = tables;
        self.cache_host_nic_locked(&mut state).await
    }

    /// Bring the warm pool back between the watermarks
    pub async fn cache_host_nic(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        self.cache_host_nic_locked(&mut state).await
    }

    async fn cache_host_nic_locked(&self, state: &mut State) -> Result<(), AgentError> {
        let Some(vxnet) = self.config.cached_vxnet.clone() else {
            return Ok(());
        };
        let free: Vec<String> = state
            .nics
            .values()
            .filter(|e| e.nic.vxnet.id == vxnet && e.nic.status == NicStatus::Free)
            .filter(|e| !e.nic.shared && !e.nic.reserved)
            .map(|e| e.nic.id.clone())
            .collect();

        if free.len() > self.config.pool_high {
            let excess = free[self.config.pool_high..].to_vec();
            info!("Releasing {} FREE NICs above the high watermark", excess.len());
            self.retire(state, &excess).await?;
        } else if free.len() < self.config.pool_low && state.nics.len() < self.config.max_nic {
            let count = (self.config.pool_low - free.len()).min(self.config.max_nic - state.nics.len());
            info!("Warming {} NICs on {}", count, vxnet);
            self.create_nics(state, &vxnet, count, &[]).await?;
        }
        Ok(())
    }

    /// Create and attach `count` NICs, numbered and recorded FREE/INIT
    async fn create_nics(
        &self,
        state: &mut State,
        vxnet: &str,
        count: usize,
        ips: &[String],
    ) -> Result<Vec<String>, AgentError> {
        let (nics, job) = self.cloud.create_nics_and_attach(vxnet, count, ips).await?;
        let mut ids = Vec::with_capacity(nics.len());
        for mut nic in nics {
            nic.route_table_num = state.tables.take();
            nic.status = NicStatus::Free;
            nic.phase = NicPhase::Init;
            let entry = NicEntry::new(nic);
            if let Err(e) = self.persist(&entry) {
                state.tables.release(entry.nic.route_table_num);
                return Err(e);
            }
            ids.push(entry.nic.id.clone());
            state.nics.insert(entry.nic.id.clone(), entry);
        }
        debug!("Attach job {} for NICs {:?}", job, ids);
        state.jobs.insert(job, ids.clone());
        Ok(ids)
    }

    fn persist(&self, entry: &NicEntry) -> Result<(), AgentError> {
        self.store.put_message(&entry.nic.id, &entry.message())
    }

    /// Apply `change` to a copy of the entry, persist it, then swap it in
    fn update<F>(&self, state: &mut State, id: &str, change: F) -> Result<NicEntry, AgentError>
    where
        F: FnOnce(&mut NicEntry),
    {
        let entry = state
            .nics
            .get_mut(id)
            .ok_or_else(|| AgentError::InvalidState(format!("NIC {} is not tracked", id)))?;
        let mut updated = entry.clone();
        change(&mut updated);
        self.persist(&updated)?;
        *entry = updated;
        Ok(entry.clone())
    }

    /// Forget a NIC entirely
    fn evict(&self, state: &mut State, id: &str) {
        let Some(entry) = state.nics.remove(id) else {
            return;
        };
        for container_id in entry.shared_pods.keys() {
            if let Err(e) = self.store.delete(&binding_key(id, container_id)) {
                warn!("Failed to delete binding {}/{}: {}", id, container_id, e);
            }
        }
        if let Err(e) = self.store.delete(id) {
            warn!("Failed to delete store record of NIC {}: {}", id, e);
        }
        state.tables.release(entry.nic.route_table_num);
        info!("Evicted NIC {}", id);
    }

    /// Mark NICs DELETING, tear down their tables and start detaching them
    async fn retire(&self, state: &mut State, ids: &[String]) -> Result<(), AgentError> {
        for id in ids {
            let entry = self.update(state, id, |e| {
                e.nic.status = NicStatus::Deleting;
                e.pod = None;
            })?;
            for container_id in entry.shared_pods.keys() {
                self.store.delete(&binding_key(id, container_id))?;
            }
            if let Some(entry) = state.nics.get_mut(id) {
                entry.shared_pods.clear();
            }
            if entry.nic.phase != NicPhase::Init {
                if let Err(e) = self.network.cleanup_nic_network(&entry.nic).await {
                    warn!("Failed to clean up network of NIC {}: {}", id, e);
                }
            }
        }
        match self.cloud.detach_nics(ids, false).await {
            Ok(job) => {
                debug!("Detach job {} for NICs {:?}", job, ids);
                state.jobs.insert(job, ids.to_vec());
            }
            // the next sync retries the detach
            Err(e) => warn!("Failed to detach NICs {:?}: {}", ids, e),
        }
        Ok(())
    }

    /// Drop finished jobs
    async fn drain_jobs(&self, state: &mut State) -> Result<(), AgentError> {
        if state.jobs.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = state.jobs.keys().cloned().collect();
        let (pending, results) = self.cloud.describe_nic_jobs(&ids).await?;
        let pending: BTreeSet<String> = pending.into_iter().collect();
        for job in pending.iter().filter(|j| !state.jobs.contains_key(*j)) {
            warn!("IaaS reported unexpected job {}", job);
        }
        state.jobs.retain(|id, _| pending.contains(id));
        for (nic_id, ok) in results {
            if !state.nics.contains_key(&nic_id) {
                warn!("Job result for unknown NIC {}", nic_id);
            } else if !ok {
                warn!("Job for NIC {} failed, sync will retry", nic_id);
            }
        }
        Ok(())
    }

    /// Program the NIC once its link shows up. Returns whether it is NET_READY.
    async fn prepare(&self, state: &mut State, id: &str) -> Result<bool, AgentError> {
        let Some(entry) = state.nics.get(id) else {
            return Ok(false);
        };
        if entry.nic.phase == NicPhase::NetReady {
            return Ok(true);
        }
        if !self.network.link_present(&entry.nic.hardware_addr).await? {
            debug!("Link of NIC {} not present yet", id);
            return Ok(false);
        }
        let mut nic = entry.nic.clone();
        nic.phase = NicPhase::LinkReady;
        self.network.setup_nic_network(&nic).await?;
        let entry = self.update(state, id, |e| e.nic.phase = NicPhase::NetReady)?;
        info!("NIC {} ready on route table {}", id, entry.nic.route_table_num);
        Ok(true)
    }

    /// Prepare every live NIC whose attach has completed
    async fn prepare_all(&self, state: &mut State) {
        let ids: Vec<String> = state
            .nics
            .values()
            .filter(|e| matches!(e.nic.status, NicStatus::Free | NicStatus::Using))
            .filter(|e| e.nic.phase != NicPhase::NetReady)
            .map(|e| e.nic.id.clone())
            .collect();
        for id in ids {
            if state.has_pending_job(&id) {
                continue;
            }
            if let Err(e) = self.prepare(state, &id).await {
                warn!("Failed to prepare NIC {}: {}", id, e);
            }
        }
    }

    /// Wait for one NIC to attach and be programmed
    ///
    /// Locks once per poll. `claimed` must hold on every poll, otherwise the
    /// NIC was released underneath the waiting allocation.
    async fn wait_ready<F>(&self, id: &str, claimed: F) -> Result<HostNic, AgentError>
    where
        F: Fn(&NicEntry) -> bool,
    {
        let deadline = Instant::now() + self.config.attach_timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.nics.get(id).is_some_and(&claimed) {
                    return Err(AgentError::NoAvailableNic(format!("NIC {} was released while attaching", id)));
                }
                self.drain_jobs(&mut state).await?;
                if !state.has_pending_job(id) && self.prepare(&mut state, id).await? {
                    return state
                        .nics
                        .get(id)
                        .map(|e| e.nic.clone())
                        .ok_or_else(|| AgentError::InvalidState(format!("NIC {} vanished", id)));
                }
            }
            if Instant::now() >= deadline {
                return Err(AgentError::NoAvailableNic(format!(
                    "NIC {} not ready after {:?}",
                    id, self.config.attach_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    fn pick_free(&self, state: &State) -> Option<String> {
        let free: Vec<&NicEntry> = state
            .nics
            .values()
            .filter(|e| e.nic.status == NicStatus::Free && e.nic.phase == NicPhase::NetReady)
            .filter(|e| !e.nic.shared && !e.nic.reserved)
            .collect();
        let cached = self.config.cached_vxnet.as_deref();
        free.iter()
            .find(|e| Some(e.nic.vxnet.id.as_str()) == cached)
            .or_else(|| free.first())
            .map(|e| e.nic.id.clone())
    }

    fn bind(&self, state: &mut State, id: &str, pod: &PodInfo) -> Result<HostNic, AgentError> {
        let entry = self.update(state, id, |e| {
            e.nic.status = NicStatus::Using;
            e.pod = Some(pod.clone());
        })?;
        info!(container_id = %pod.container_id, "Bound NIC {} to pod {}", id, pod.key());
        Ok(entry.nic)
    }

    /// Give the pod a dedicated NIC. Repeated calls for one container id
    /// return the same NIC.
    pub async fn alloc_host_nic(&self, pod: &PodInfo) -> Result<HostNic, AgentError> {
        let existing = self
            .state
            .lock()
            .await
            .nics
            .values()
            .find(|e| e.nic.status == NicStatus::Using && e.owned_by(&pod.container_id))
            .map(|e| e.nic.id.clone());
        if let Some(id) = existing {
            debug!(container_id = %pod.container_id, "Reusing NIC {}", id);
            return self.wait_ready(&id, |e| e.owned_by(&pod.container_id)).await;
        }

        match pod.vxnet.clone() {
            Some(vxnet) => self.alloc_reserved(&vxnet, pod).await,
            None => self.alloc_from_pool(pod).await,
        }
    }

    /// FREE pool NICs still waiting for their link
    fn warming(&self, state: &State) -> bool {
        state
            .nics
            .values()
            .filter(|e| e.nic.status == NicStatus::Free && !e.nic.shared && !e.nic.reserved)
            .any(|e| e.nic.phase != NicPhase::NetReady)
    }

    async fn alloc_from_pool(&self, pod: &PodInfo) -> Result<HostNic, AgentError> {
        let deadline = Instant::now() + self.config.attach_timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                self.drain_jobs(&mut state).await?;
                self.prepare_all(&mut state).await;
                if let Some(id) = self.pick_free(&state) {
                    return self.bind(&mut state, &id, pod);
                }
                if !self.warming(&state) {
                    self.cache_host_nic_locked(&mut state).await?;
                    if !self.warming(&state) {
                        break;
                    }
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Err(AgentError::NoAvailableNic(format!("no free NIC for pod {}", pod.key())))
    }

    /// A NIC created for this pod alone on the requested VxNet
    async fn alloc_reserved(&self, vxnet: &str, pod: &PodInfo) -> Result<HostNic, AgentError> {
        let id = {
            let mut state = self.state.lock().await;
            if state.nics.len() >= self.config.max_nic {
                return Err(AgentError::NoAvailableNic(format!(
                    "node already holds {} NICs",
                    self.config.max_nic
                )));
            }
            let ips: Vec<String> = pod.pod_ip.iter().cloned().collect();
            let id = self
                .create_nics(&mut state, vxnet, 1, &ips)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::InvalidState(format!("IaaS created no NIC on {}", vxnet)))?;
            self.update(&mut state, &id, |e| {
                e.nic.reserved = true;
                e.nic.status = NicStatus::Using;
                e.pod = Some(pod.clone());
            })?;
            id
        };
        info!(container_id = %pod.container_id, "Created NIC {} on {} for pod {}", id, vxnet, pod.key());
        self.wait_ready(&id, |e| e.owned_by(&pod.container_id)).await
    }

    /// Bind the pod to the shared NIC of `vxnet`, creating or converting one
    ///
    /// The binding is recorded before the NIC is ready so the NIC is not
    /// released while other pods leave it. A failed wait drops the binding.
    pub async fn alloc_shared_nic(&self, vxnet: &str, pod: &PodInfo) -> Result<HostNic, AgentError> {
        let id = {
            let mut state = self.state.lock().await;
            let bound = state
                .nics
                .values()
                .find(|e| e.shared_pods.contains_key(&pod.container_id))
                .map(|e| e.nic.id.clone());
            match bound {
                Some(id) => id,
                None => {
                    let id = self.pick_shared(&mut state, vxnet).await?;
                    self.bind_shared(&mut state, &id, pod)?;
                    id
                }
            }
        };

        let ready = self
            .wait_ready(&id, |e| e.nic.shared && e.shared_pods.contains_key(&pod.container_id))
            .await;
        if ready.is_err() {
            if let Err(e) = self.free_shared_nic(&pod.container_id, false).await {
                warn!(container_id = %pod.container_id, "Failed to drop binding to NIC {}: {}", id, e);
            }
        }
        ready
    }

    /// The shared NIC of `vxnet`, converting a FREE NIC or creating one
    async fn pick_shared(&self, state: &mut State, vxnet: &str) -> Result<String, AgentError> {
        let shared = state
            .nics
            .values()
            .find(|e| e.nic.shared && e.nic.status == NicStatus::Using && e.nic.vxnet.id == vxnet)
            .map(|e| e.nic.id.clone());
        if let Some(id) = shared {
            return Ok(id);
        }

        let convertible = state
            .nics
            .values()
            .filter(|e| !e.nic.shared && !e.nic.reserved && e.nic.vxnet.id == vxnet)
            .find(|e| e.nic.status == NicStatus::Free && e.nic.phase == NicPhase::NetReady)
            .map(|e| e.nic.clone());
        if let Some(nic) = convertible {
            self.network.cleanup_nic_network(&nic).await?;
            self.update(state, &nic.id, |e| {
                e.nic.shared = true;
                e.nic.status = NicStatus::Using;
                e.nic.phase = NicPhase::LinkReady;
            })?;
            info!("Converted FREE NIC {} into the shared NIC of {}", nic.id, vxnet);
            return Ok(nic.id);
        }

        if state.nics.len() >= self.config.max_nic {
            return Err(AgentError::NoAvailableNic(format!(
                "node already holds {} NICs",
                self.config.max_nic
            )));
        }
        let id = self
            .create_nics(state, vxnet, 1, &[])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::InvalidState(format!("IaaS created no NIC on {}", vxnet)))?;
        self.update(state, &id, |e| {
            e.nic.shared = true;
            e.nic.status = NicStatus::Using;
        })?;
        info!("Created shared NIC {} on {}", id, vxnet);
        Ok(id)
    }

    fn bind_shared(&self, state: &mut State, id: &str, pod: &PodInfo) -> Result<(), AgentError> {
        let entry = state
            .nics
            .get_mut(id)
            .ok_or_else(|| AgentError::InvalidState(format!("NIC {} vanished", id)))?;
        self.store.put_message(
            &binding_key(id, &pod.container_id),
            &IpamMessage {
                pod: Some(pod.clone()),
                nic: entry.nic.clone(),
            },
        )?;
        entry.shared_pods.insert(pod.container_id.clone(), pod.clone());
        info!(container_id = %pod.container_id, "Bound pod {} to shared NIC {}", pod.key(), id);
        Ok(())
    }

    /// Release the dedicated NIC of `container_id`. With `peek` only the
    /// binding is returned. `None` when nothing is bound.
    pub async fn free_host_nic(&self, container_id: &str, peek: bool) -> Result<Option<IpamMessage>, AgentError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.nics.values().find(|e| e.owned_by(container_id)).cloned() else {
            return Ok(None);
        };
        let msg = entry.message();
        if peek {
            return Ok(Some(msg));
        }

        let id = entry.nic.id.clone();
        let pooled = self.config.cached_vxnet.as_deref() == Some(entry.nic.vxnet.id.as_str());
        if entry.nic.reserved || !pooled {
            info!(container_id = %container_id, "Releasing NIC {} back to the IaaS", id);
            self.retire(&mut state, &[id]).await?;
        } else {
            self.update(&mut state, &id, |e| {
                e.nic.status = NicStatus::Free;
                e.pod = None;
            })?;
            info!(container_id = %container_id, "Returned NIC {} to the pool", id);
            if let Err(e) = self.cache_host_nic_locked(&mut state).await {
                warn!("Failed to rebalance the pool: {}", e);
            }
        }
        Ok(Some(msg))
    }

    /// Unbind `container_id` from its shared NIC; the last pod out detaches it
    pub async fn free_shared_nic(&self, container_id: &str, peek: bool) -> Result<Option<IpamMessage>, AgentError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state
            .nics
            .values_mut()
            .find(|e| e.shared_pods.contains_key(container_id))
        else {
            return Ok(None);
        };
        let msg = IpamMessage {
            pod: entry.shared_pods.get(container_id).cloned(),
            nic: entry.nic.clone(),
        };
        if peek {
            return Ok(Some(msg));
        }

        let id = entry.nic.id.clone();
        self.store.delete(&binding_key(&id, container_id))?;
        entry.shared_pods.remove(container_id);
        if entry.shared_pods.is_empty() {
            info!("Last pod left shared NIC {}, releasing it", id);
            self.retire(&mut state, &[id]).await?;
        }
        Ok(Some(msg))
    }

    /// Reconcile every NIC with what the IaaS reports. A periodic sync also
    /// rebalances the pool.
    pub async fn sync_host_nic(&self, periodic: bool) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state.nics.keys().cloned().collect();
        if !ids.is_empty() {
            let live = self.cloud.get_nics(&ids).await?;
            self.drain_jobs(&mut state).await?;
            let instance = self.cloud.instance_id().to_string();

            let mut attach = Vec::new();
            let mut detach = Vec::new();
            let mut delete = Vec::new();
            for id in &ids {
                let Some(entry) = state.nics.get(id) else {
                    continue;
                };
                let pending = state.has_pending_job(id);
                let action = match (entry.nic.status, live.get(id)) {
                    (_, None) => SyncAction::Evict,
                    (NicStatus::Using | NicStatus::Free, Some(nic)) if !nic.is_attached_to(&instance) => {
                        if pending { SyncAction::Nothing } else { SyncAction::Attach }
                    }
                    (NicStatus::Using | NicStatus::Free, Some(_)) => {
                        if pending || entry.nic.phase == NicPhase::NetReady {
                            SyncAction::Nothing
                        } else {
                            SyncAction::Prepare
                        }
                    }
                    (NicStatus::Deleting, Some(nic)) if nic.instance_id.is_some() => {
                        if pending { SyncAction::Nothing } else { SyncAction::Detach }
                    }
                    (NicStatus::Deleting | NicStatus::Deleted, Some(_)) => SyncAction::Delete,
                };
                match action {
                    SyncAction::Evict => {
                        info!("NIC {} no longer exists in the IaaS", id);
                        self.evict(&mut state, id);
                    }
                    SyncAction::Attach => attach.push(id.clone()),
                    SyncAction::Prepare => {
                        if let Err(e) = self.prepare(&mut state, id).await {
                            warn!("Failed to prepare NIC {}: {}", id, e);
                        }
                    }
                    SyncAction::Detach => detach.push(id.clone()),
                    SyncAction::Delete => delete.push(id.clone()),
                    SyncAction::Nothing => {}
                }
                if let Some(nic) = live.get(id) {
                    if let Some(entry) = state.nics.get_mut(id) {
                        entry.nic.instance_id = nic.instance_id.clone();
                    }
                }
            }

            if !attach.is_empty() {
                match self.cloud.attach_nics(&attach).await {
                    Ok(job) => {
                        info!("Reattaching NICs {:?}", attach);
                        state.jobs.insert(job, attach);
                    }
                    Err(e) => warn!("Failed to attach NICs {:?}: {}", attach, e),
                }
            }
            if !detach.is_empty() {
                match self.cloud.detach_nics(&detach, false).await {
                    Ok(job) => {
                        info!("Detaching NICs {:?}", detach);
                        state.jobs.insert(job, detach);
                    }
                    Err(e) => warn!("Failed to detach NICs {:?}: {}", detach, e),
                }
            }
            if !delete.is_empty() {
                match self.cloud.delete_nics(&delete).await {
                    Ok(()) => {
                        for id in &delete {
                            self.update(&mut state, id, |e| e.nic.status = NicStatus::Deleted)?;
                        }
                        info!("Deleted NICs {:?}", delete);
                    }
                    Err(e) => error!("Failed to delete NICs {:?}: {}", delete, e),
                }
            }
        }

        if periodic {
            if let Err(e) = self.cache_host_nic_locked(&mut state).await {
                warn!("Failed to rebalance the pool: {}", e);
            }
        }
        Ok(())
    }

    /// Snapshot of every NIC
    pub async fn show_nics(&self) -> Vec<NicEntry> {
        self.state.lock().await.nics.values().cloned().collect()
    }

    /// Detach every FREE NIC, returning their ids
    pub async fn clear_nics(&self) -> Result<Vec<String>, AgentError> {
        let mut state = self.state.lock().await;
        let free: Vec<String> = state
            .nics
            .values()
            .filter(|e| e.nic.status == NicStatus::Free && e.shared_pods.is_empty())
            .map(|e| e.nic.id.clone())
            .collect();
        if !free.is_empty() {
            info!("Clearing {} FREE NICs", free.len());
            self.retire(&mut state, &free).await?;
        }
        Ok(free)
    }

    /// Whether a NIC with this MAC is tracked
    pub async fn owns_mac(&self, mac: &str) -> bool {
        let mac = mac.to_lowercase();
        self.state
            .lock()
            .await
            .nics
            .values()
            .any(|e| e.nic.hardware_addr.to_lowercase() == mac)
    }
}
