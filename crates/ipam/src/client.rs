//! Storage seam of the IPAM engine
//!
//! Updates are compare-and-set on `metadata.resourceVersion`: a stale
//! object fails with [`IpamError::Conflict`] and the caller refreshes.

use crate::config::IpamConfig;
use crate::error::IpamError;
use async_trait::async_trait;
use crds::labels::{IPAM_CONFIG_NAME, IPAM_CONFIG_NAMESPACE, IPPOOL_NAME_LABEL};
use crds::{IPAMBlock, IPAMHandle, IPPool};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Api, Client};
use tracing::debug;

/// Trait for reading and writing IPAM objects
#[async_trait]
pub trait IpamClient: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<IPPool>, IpamError>;
    async fn get_pool(&self, name: &str) -> Result<Option<IPPool>, IpamError>;

    /// Blocks of one pool (by the `ippool-name` label), or all blocks
    async fn list_blocks(&self, pool: Option<&str>) -> Result<Vec<IPAMBlock>, IpamError>;
    async fn get_block(&self, name: &str) -> Result<Option<IPAMBlock>, IpamError>;
    async fn create_block(&self, block: &IPAMBlock) -> Result<IPAMBlock, IpamError>;
    async fn update_block(&self, block: &IPAMBlock) -> Result<IPAMBlock, IpamError>;
    async fn delete_block(&self, name: &str) -> Result<(), IpamError>;

    async fn get_handle(&self, handle_id: &str) -> Result<Option<IPAMHandle>, IpamError>;
    async fn create_handle(&self, handle: &IPAMHandle) -> Result<IPAMHandle, IpamError>;
    async fn update_handle(&self, handle: &IPAMHandle) -> Result<IPAMHandle, IpamError>;
    async fn delete_handle(&self, handle_id: &str) -> Result<(), IpamError>;

    /// The IPAM ConfigMap and its resourceVersion
    async fn get_config(&self) -> Result<Option<(IpamConfig, Option<String>)>, IpamError>;
    /// Write the ConfigMap; `None` creates it
    async fn put_config(&self, config: &IpamConfig, resource_version: Option<&str>) -> Result<(), IpamError>;
}

/// `IpamClient` over the Kubernetes API
#[derive(Clone)]
pub struct KubeIpamClient {
    pools: Api<IPPool>,
    blocks: Api<IPAMBlock>,
    handles: Api<IPAMHandle>,
    config_maps: Api<ConfigMap>,
}

impl std::fmt::Debug for KubeIpamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeIpamClient").finish_non_exhaustive()
    }
}

impl KubeIpamClient {
    pub fn new(client: Client) -> Self {
        Self {
            pools: Api::all(client.clone()),
            blocks: Api::all(client.clone()),
            handles: Api::all(client.clone()),
            config_maps: Api::namespaced(client, IPAM_CONFIG_NAMESPACE),
        }
    }
}

fn object_name(meta: &ObjectMeta) -> Result<&str, IpamError> {
    meta.name
        .as_deref()
        .ok_or_else(|| IpamError::Validation("object has no name".to_string()))
}

/// Map 409 on create to `AlreadyExists`
fn create_err(e: kube::Error, what: &str) -> IpamError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => IpamError::AlreadyExists(what.to_string()),
        other => IpamError::Kube(other),
    }
}

/// Map 409 on replace to `Conflict` and 404 to `NotFound`
fn replace_err(e: kube::Error, what: &str) -> IpamError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => IpamError::Conflict(what.to_string()),
        kube::Error::Api(ae) if ae.code == 404 => IpamError::NotFound(what.to_string()),
        other => IpamError::Kube(other),
    }
}

async fn delete_tolerant<K>(api: &Api<K>, name: &str) -> Result<(), IpamError>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("{} already deleted", name);
            Ok(())
        }
        Err(e) => Err(IpamError::Kube(e)),
    }
}

#[async_trait]
impl IpamClient for KubeIpamClient {
    async fn list_pools(&self) -> Result<Vec<IPPool>, IpamError> {
        Ok(self.pools.list(&ListParams::default()).await?.items)
    }

    async fn get_pool(&self, name: &str) -> Result<Option<IPPool>, IpamError> {
        Ok(self.pools.get_opt(name).await?)
    }

    async fn list_blocks(&self, pool: Option<&str>) -> Result<Vec<IPAMBlock>, IpamError> {
        let lp = match pool {
            Some(pool) => ListParams::default().labels(&format!("{}={}", IPPOOL_NAME_LABEL, pool)),
            None => ListParams::default(),
        };
        Ok(self.blocks.list(&lp).await?.items)
    }

    async fn get_block(&self, name: &str) -> Result<Option<IPAMBlock>, IpamError> {
        Ok(self.blocks.get_opt(name).await?)
    }

    async fn create_block(&self, block: &IPAMBlock) -> Result<IPAMBlock, IpamError> {
        let name = object_name(&block.metadata)?;
        self.blocks
            .create(&PostParams::default(), block)
            .await
            .map_err(|e| create_err(e, name))
    }

    async fn update_block(&self, block: &IPAMBlock) -> Result<IPAMBlock, IpamError> {
        let name = object_name(&block.metadata)?;
        self.blocks
            .replace(name, &PostParams::default(), block)
            .await
            .map_err(|e| replace_err(e, name))
    }

    async fn delete_block(&self, name: &str) -> Result<(), IpamError> {
        delete_tolerant(&self.blocks, name).await
    }

    async fn get_handle(&self, handle_id: &str) -> Result<Option<IPAMHandle>, IpamError> {
        Ok(self.handles.get_opt(handle_id).await?)
    }

    async fn create_handle(&self, handle: &IPAMHandle) -> Result<IPAMHandle, IpamError> {
        let name = object_name(&handle.metadata)?;
        self.handles
            .create(&PostParams::default(), handle)
            .await
            .map_err(|e| create_err(e, name))
    }

    async fn update_handle(&self, handle: &IPAMHandle) -> Result<IPAMHandle, IpamError> {
        let name = object_name(&handle.metadata)?;
        self.handles
            .replace(name, &PostParams::default(), handle)
            .await
            .map_err(|e| replace_err(e, name))
    }

    async fn delete_handle(&self, handle_id: &str) -> Result<(), IpamError> {
        delete_tolerant(&self.handles, handle_id).await
    }

    async fn get_config(&self) -> Result<Option<(IpamConfig, Option<String>)>, IpamError> {
        let Some(cm) = self.config_maps.get_opt(IPAM_CONFIG_NAME).await? else {
            return Ok(None);
        };
        let config = IpamConfig::from_data(&cm.data.unwrap_or_default())?;
        Ok(Some((config, cm.metadata.resource_version)))
    }

    async fn put_config(&self, config: &IpamConfig, resource_version: Option<&str>) -> Result<(), IpamError> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(IPAM_CONFIG_NAME.to_string()),
                namespace: Some(IPAM_CONFIG_NAMESPACE.to_string()),
                resource_version: resource_version.map(str::to_string),
                ..ObjectMeta::default()
            },
            data: Some(config.to_data()?),
            ..ConfigMap::default()
        };
        match resource_version {
            Some(_) => self
                .config_maps
                .replace(IPAM_CONFIG_NAME, &PostParams::default(), &cm)
                .await
                .map(|_| ())
                .map_err(|e| replace_err(e, IPAM_CONFIG_NAME)),
            // someone else creating it first is a conflict for our caller
            None => match self.config_maps.create(&PostParams::default(), &cm).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Err(IpamError::Conflict(IPAM_CONFIG_NAME.to_string())),
                Err(e) => Err(IpamError::Kube(e)),
            },
        }
    }
}
