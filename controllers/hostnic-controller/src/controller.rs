//! Main controller implementation.
//!
//! Builds the Kubernetes and IaaS clients, then runs the IPPool and
//! VxNetPool controllers, the namespace assignment worker and the IPAM
//! config webhook until one of them stops.

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::reconciler::vxnet_pool::VxNetSync;
use crate::watcher::Watcher;
use crate::webhook;
use crds::{IPAMBlock, IPPool, VxNetPool};
use ipam::{IpamEngine, KubeIpamClient};
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use qingcloud_client::{QingCloudClient, QingCloudConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Cluster controller for hostnic resources.
#[derive(Debug)]
pub struct Controller {
    ippool_watcher: JoinHandle<Result<(), ControllerError>>,
    vxnetpool_watcher: JoinHandle<Result<(), ControllerError>>,
    namespace_watcher: JoinHandle<Result<(), ControllerError>>,
    webhook: JoinHandle<Result<(), ControllerError>>,
    shutdown: watch::Sender<bool>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing hostnic controller");

        let kube_client = Client::try_default().await?;

        let cloud_config = QingCloudConfig::load(&config.qingcloud_config)?;
        info!("QingCloud zone {}", cloud_config.zone);
        // not bound to an instance: only VxNet, VIP and security group calls
        let cloud = QingCloudClient::new(cloud_config, String::new(), String::new())?;

        let ippool_api: Api<IPPool> = Api::all(kube_client.clone());
        let vxnetpool_api: Api<VxNetPool> = Api::all(kube_client.clone());
        let namespace_api: Api<Namespace> = Api::all(kube_client.clone());
        let block_api: Api<IPAMBlock> = Api::all(kube_client.clone());

        let reconciler = Arc::new(Reconciler::new(
            ippool_api.clone(),
            vxnetpool_api.clone(),
            namespace_api.clone(),
            IpamEngine::new(Arc::new(KubeIpamClient::new(kube_client))),
            VxNetSync::new(Arc::new(cloud), config.cluster_sg.clone()),
            config.sync_period,
        ));

        let watcher_instance = Arc::new(Watcher::new(
            reconciler,
            ippool_api,
            vxnetpool_api,
            namespace_api,
            block_api,
            config.vxnetpool_name.clone(),
            config.sync_period,
        ));

        let ippool_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_ippools().await })
        };

        let vxnetpool_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_vxnet_pools().await })
        };

        let namespace_watcher = {
            let watcher = watcher_instance;
            tokio::spawn(async move { watcher.watch_namespaces().await })
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let webhook = tokio::spawn(webhook::serve(config.webhook_addr, shutdown_rx));

        Ok(Self {
            ippool_watcher,
            vxnetpool_watcher,
            namespace_watcher,
            webhook,
            shutdown,
        })
    }

    /// Runs the controller until a task stops or Ctrl-C.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("hostnic controller running");

        let result = tokio::select! {
            result = &mut self.ippool_watcher => joined("IPPool watcher", result),
            result = &mut self.vxnetpool_watcher => joined("VxNetPool watcher", result),
            result = &mut self.namespace_watcher => joined("Namespace watcher", result),
            result = &mut self.webhook => joined("Webhook", result),
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                Ok(())
            }
        };

        let _ = self.shutdown.send(true);
        self.ippool_watcher.abort();
        self.vxnetpool_watcher.abort();
        self.namespace_watcher.abort();
        if !self.webhook.is_finished() {
            let _ = (&mut self.webhook).await;
        }
        result
    }
}

fn joined(
    what: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{} panicked: {}", what, e)))?
        .map_err(|e| ControllerError::Watch(format!("{} error: {}", what, e)))
}
