//! hostnic controller
//!
//! Cluster-wide companion of the node agents:
//! - IPPool: validation, blocks, utilization status and drain-on-delete
//! - VxNetPool: VxNets, VIPs and security group rules in the IaaS, one
//!   IPPool per VxNet
//! - Namespaces: subnet auto-assignment in the IPAM ConfigMap
//! - Webhook: validates writes to the IPAM ConfigMap

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod watcher;
mod webhook;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting hostnic controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  VxNetPool: {}", config.vxnetpool_name);
    info!("  Webhook: {}", config.webhook_addr);
    info!("  Security group: {}", config.cluster_sg.as_deref().unwrap_or("none"));
    info!("  QingCloud config: {}", config.qingcloud_config.display());

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
