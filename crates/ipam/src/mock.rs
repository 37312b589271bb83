//! In-memory `IpamClient` for tests
//!
//! Keeps every object with a resourceVersion and enforces compare-and-set
//! on update the way the API server does. `inject_conflicts(n)` makes the
//! next `n` block updates fail with `Conflict`.

use crate::client::IpamClient;
use crate::config::IpamConfig;
use crate::error::IpamError;
use async_trait::async_trait;
use crds::labels::IPPOOL_NAME_LABEL;
use crds::{IPAMBlock, IPAMHandle, IPPool};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    pools: BTreeMap<String, IPPool>,
    blocks: BTreeMap<String, IPAMBlock>,
    handles: BTreeMap<String, IPAMHandle>,
    config: Option<(IpamConfig, String)>,
    version: u64,
    block_conflicts: usize,
    config_conflicts: usize,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Mock IPAM storage
#[derive(Debug, Clone, Default)]
pub struct MemoryIpamClient {
    state: Arc<Mutex<State>>,
}

impl MemoryIpamClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a pool as-is
    pub fn add_pool(&self, mut pool: IPPool) {
        let mut state = self.state.lock().unwrap();
        pool.metadata.resource_version = Some(state.next_version());
        state.pools.insert(pool.name_any(), pool);
    }

    pub fn remove_pool(&self, name: &str) {
        self.state.lock().unwrap().pools.remove(name);
    }

    /// Store a block bypassing compare-and-set
    pub fn put_block(&self, mut block: IPAMBlock) {
        let mut state = self.state.lock().unwrap();
        block.metadata.resource_version = Some(state.next_version());
        state.blocks.insert(block.name_any(), block);
    }

    pub fn blocks(&self) -> Vec<IPAMBlock> {
        self.state.lock().unwrap().blocks.values().cloned().collect()
    }

    pub fn handles(&self) -> Vec<IPAMHandle> {
        self.state.lock().unwrap().handles.values().cloned().collect()
    }

    pub fn config(&self) -> Option<IpamConfig> {
        self.state.lock().unwrap().config.as_ref().map(|(c, _)| c.clone())
    }

    /// Seed the ConfigMap
    pub fn set_config(&self, config: IpamConfig) {
        let mut state = self.state.lock().unwrap();
        let rv = state.next_version();
        state.config = Some((config, rv));
    }

    /// Fail the next `n` block updates with `Conflict`
    pub fn inject_conflicts(&self, n: usize) {
        self.state.lock().unwrap().block_conflicts = n;
    }

    /// Fail the next `n` ConfigMap writes with `Conflict`
    pub fn inject_config_conflicts(&self, n: usize) {
        self.state.lock().unwrap().config_conflicts = n;
    }
}

fn check_version(stored: Option<&String>, given: Option<&String>, what: &str) -> Result<(), IpamError> {
    match (stored, given) {
        (Some(s), Some(g)) if s == g => Ok(()),
        _ => Err(IpamError::Conflict(what.to_string())),
    }
}

#[async_trait]
impl IpamClient for MemoryIpamClient {
    async fn list_pools(&self) -> Result<Vec<IPPool>, IpamError> {
        Ok(self.state.lock().unwrap().pools.values().cloned().collect())
    }

    async fn get_pool(&self, name: &str) -> Result<Option<IPPool>, IpamError> {
        Ok(self.state.lock().unwrap().pools.get(name).cloned())
    }

    async fn list_blocks(&self, pool: Option<&str>) -> Result<Vec<IPAMBlock>, IpamError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blocks
            .values()
            .filter(|b| pool.is_none_or(|p| b.labels().get(IPPOOL_NAME_LABEL).map(String::as_str) == Some(p)))
            .cloned()
            .collect())
    }

    async fn get_block(&self, name: &str) -> Result<Option<IPAMBlock>, IpamError> {
        Ok(self.state.lock().unwrap().blocks.get(name).cloned())
    }

    async fn create_block(&self, block: &IPAMBlock) -> Result<IPAMBlock, IpamError> {
        let mut state = self.state.lock().unwrap();
        let name = block.name_any();
        if state.blocks.contains_key(&name) {
            return Err(IpamError::AlreadyExists(name));
        }
        let mut stored = block.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.blocks.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_block(&self, block: &IPAMBlock) -> Result<IPAMBlock, IpamError> {
        let mut state = self.state.lock().unwrap();
        let name = block.name_any();
        if state.block_conflicts > 0 {
            state.block_conflicts -= 1;
            // someone else won the race
            let rv = state.next_version();
            if let Some(b) = state.blocks.get_mut(&name) {
                b.metadata.resource_version = Some(rv);
            }
            return Err(IpamError::Conflict(name));
        }
        let stored_rv = state
            .blocks
            .get(&name)
            .ok_or_else(|| IpamError::NotFound(name.clone()))?
            .metadata
            .resource_version
            .clone();
        check_version(stored_rv.as_ref(), block.metadata.resource_version.as_ref(), &name)?;
        let mut stored = block.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.blocks.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_block(&self, name: &str) -> Result<(), IpamError> {
        self.state.lock().unwrap().blocks.remove(name);
        Ok(())
    }

    async fn get_handle(&self, handle_id: &str) -> Result<Option<IPAMHandle>, IpamError> {
        Ok(self.state.lock().unwrap().handles.get(handle_id).cloned())
    }

    async fn create_handle(&self, handle: &IPAMHandle) -> Result<IPAMHandle, IpamError> {
        let mut state = self.state.lock().unwrap();
        let name = handle.name_any();
        if state.handles.contains_key(&name) {
            return Err(IpamError::AlreadyExists(name));
        }
        let mut stored = handle.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.handles.insert(name, stored.clone());
        Ok(stored)
    }

    async fn update_handle(&self, handle: &IPAMHandle) -> Result<IPAMHandle, IpamError> {
        let mut state = self.state.lock().unwrap();
        let name = handle.name_any();
        let stored_rv = state
            .handles
            .get(&name)
            .ok_or_else(|| IpamError::NotFound(name.clone()))?
            .metadata
            .resource_version
            .clone();
        check_version(stored_rv.as_ref(), handle.metadata.resource_version.as_ref(), &name)?;
        let mut stored = handle.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.handles.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete_handle(&self, handle_id: &str) -> Result<(), IpamError> {
        self.state.lock().unwrap().handles.remove(handle_id);
        Ok(())
    }

    async fn get_config(&self) -> Result<Option<(IpamConfig, Option<String>)>, IpamError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .config
            .as_ref()
            .map(|(c, rv)| (c.clone(), Some(rv.clone()))))
    }

    async fn put_config(&self, config: &IpamConfig, resource_version: Option<&str>) -> Result<(), IpamError> {
        let mut state = self.state.lock().unwrap();
        if state.config_conflicts > 0 {
            state.config_conflicts -= 1;
            return Err(IpamError::Conflict("config".to_string()));
        }
        let stored = state.config.as_ref().map(|(_, rv)| rv.clone());
        match (stored.as_deref(), resource_version) {
            (None, None) => {}
            (Some(s), Some(g)) if s == g => {}
            _ => return Err(IpamError::Conflict("config".to_string())),
        }
        let rv = state.next_version();
        state.config = Some((config.clone(), rv));
        Ok(())
    }
}
