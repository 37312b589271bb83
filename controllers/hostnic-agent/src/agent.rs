//! Agent wiring.
//!
//! Builds the IaaS client, host networking, the NIC allocator, the pod
//! reflector and the IPAM engine, then spawns the background loops and the
//! CNI socket server. `run` returns when any of them ends or on Ctrl-C.

use crate::allocator::NicAllocator;
use crate::cni_conf;
use crate::config::{AgentConfig, read_instance_id};
use crate::daemon;
use crate::error::AgentError;
use crate::k8s::PodDirectory;
use crate::server::{self, CniServer};
use crate::store::Store;
use hostnic_network::{CommandFirewall, LinkMonitor, NetworkProgrammer, RtNetlink, discover_primary};
use ipam::{IpamEngine, KubeIpamClient};
use kube::Client;
use qingcloud_client::{QingCloudClient, QingCloudConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Node agent with all of its tasks running.
pub struct Agent {
    allocator_loop: JoinHandle<Result<(), AgentError>>,
    link_loop: JoinHandle<Result<(), AgentError>>,
    repair_loop: JoinHandle<Result<(), AgentError>>,
    ipset_loop: JoinHandle<Result<(), AgentError>>,
    server: JoinHandle<Result<(), AgentError>>,
    pod_reflector: JoinHandle<()>,
    link_monitor: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl Agent {
    /// Prepares the node and starts every task.
    pub async fn new(mut config: AgentConfig) -> Result<Self, AgentError> {
        info!("Initializing hostnic agent on node {}", config.node_name);

        let instance_id = read_instance_id(&config.instance_id_file)?;
        let cloud_config = QingCloudConfig::load(&config.qingcloud_config)?;
        info!("Instance {} in zone {}", instance_id, cloud_config.zone);
        let cloud = QingCloudClient::new(cloud_config, instance_id, config.nic_name.clone())?;

        let netlink = Arc::new(RtNetlink::new());
        let (primary_nic, primary_ip) = discover_primary(netlink.as_ref()).await?;
        info!("Primary NIC {} with address {}", primary_nic, primary_ip);
        config.network.primary_nic = primary_nic;
        config.network.primary_ip = primary_ip;

        let network = Arc::new(NetworkProgrammer::new(
            netlink,
            Arc::new(CommandFirewall::new()),
            config.network.clone(),
        ));
        network.setup_node_network().await?;

        // subscribe before the allocator starts so no attach is missed
        let (link_events, link_monitor) = LinkMonitor::new().spawn();

        let store = Arc::new(Store::open(&config.data_dir)?);
        let allocator = Arc::new(NicAllocator::new(
            Arc::new(cloud),
            network.clone(),
            store,
            config.allocator.clone(),
        ));
        allocator.start().await?;

        let kube_client = Client::try_default().await?;
        let (pods, pod_reflector) = PodDirectory::spawn(kube_client.clone(), &config.node_name);
        let pods = Arc::new(pods);
        let ipam = IpamEngine::new(Arc::new(KubeIpamClient::new(kube_client.clone())));

        cni_conf::write_if_absent(&config.cni_conf, &config.network.veth_prefix, &config.socket_path)?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        let allocator_loop = tokio::spawn(daemon::allocator_loop(allocator.clone(), shutdown_rx.clone()));
        let link_loop = tokio::spawn(daemon::link_loop(allocator.clone(), link_events, shutdown_rx.clone()));
        let repair_pods = pods.clone();
        let repair = daemon::repair_loop(
            ipam.clone(),
            move || repair_pods.live_pods(),
            config.node_name.clone(),
            shutdown_rx.clone(),
        );
        let synced = pods.clone();
        let repair_loop = tokio::spawn(async move {
            synced.wait_synced().await;
            repair.await
        });
        let ipset_loop = tokio::spawn(daemon::ipset_loop(kube_client, network, shutdown_rx.clone()));

        let cni = CniServer::new(allocator, ipam, pods, config.default_mode, config.node_name.clone());
        let socket = config.socket_path.clone();
        let server = tokio::spawn(async move { server::serve(cni, &socket, shutdown_rx).await });

        Ok(Self {
            allocator_loop,
            link_loop,
            repair_loop,
            ipset_loop,
            server,
            pod_reflector,
            link_monitor,
            shutdown,
        })
    }

    /// Runs until a task ends or Ctrl-C, then stops the rest.
    pub async fn run(mut self) -> Result<(), AgentError> {
        info!("hostnic agent running");

        let result = tokio::select! {
            result = &mut self.allocator_loop => joined("allocator loop", result),
            result = &mut self.link_loop => joined("link loop", result),
            result = &mut self.repair_loop => joined("repair loop", result),
            result = &mut self.ipset_loop => joined("ipset loop", result),
            result = &mut self.server => joined("CNI server", result),
            _ = &mut self.pod_reflector => Err(AgentError::Task("pod reflector stopped".to_string())),
            signal = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                signal.map_err(AgentError::from)
            }
        };

        let _ = self.shutdown.send(true);
        if !self.server.is_finished() {
            // let in-flight CNI calls finish
            if let Ok(Err(e)) = (&mut self.server).await {
                error!("CNI server failed during shutdown: {}", e);
            }
        }
        self.pod_reflector.abort();
        self.link_monitor.abort();
        result
    }
}

fn joined(
    task: &str,
    result: Result<Result<(), AgentError>, tokio::task::JoinError>,
) -> Result<(), AgentError> {
    match result {
        Ok(Ok(())) => Err(AgentError::Task(format!("{} stopped", task))),
        Ok(Err(e)) => {
            error!("{} failed: {}", task, e);
            Err(e)
        }
        Err(e) => Err(AgentError::Task(format!("{} panicked: {}", task, e))),
    }
}
