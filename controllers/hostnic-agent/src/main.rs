//! hostnic node agent
//!
//! Runs on every node and gives pods their own QingCloud vNIC:
//! - keeps a warm pool of attached vNICs and converges it with the IaaS
//! - programs routing tables, rules, SNAT and veth pairs for each pod
//! - serves ADD/DEL/show/clear on a local gRPC socket for the CNI executable
//! - repairs IPAM blocks for the node's pods in shared mode

mod agent;
mod allocator;
mod cni_conf;
mod config;
mod daemon;
mod error;
mod k8s;
mod keyed_mutex;
mod server;
mod store;
mod types;

#[cfg(test)]
mod test_utils;

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::error::AgentError;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube picks the rustls provider at runtime
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting hostnic agent");

    let config = AgentConfig::from_env()?;
    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Default mode: {}", config.default_mode);
    info!(
        "  Pool: low {} high {} max {}",
        config.allocator.pool_low, config.allocator.pool_high, config.allocator.max_nic
    );
    info!("  VxNet: {}", config.allocator.cached_vxnet.as_deref().unwrap_or("none"));
    info!("  Socket: {}", config.socket_path.display());

    let agent = Agent::new(config).await?;
    agent.run().await?;

    Ok(())
}
