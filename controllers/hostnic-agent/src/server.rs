//! CniBackend gRPC service
//!
//! Turns CNI ADD/DEL calls into allocator, IPAM and programmer operations.
//! Calls for one container id are serialized; everything else runs in
//! parallel.

use crate::allocator::NicAllocator;
use crate::error::AgentError;
use crate::k8s::{PodSource, pod_request};
use crate::keyed_mutex::KeyedMutex;
use crate::types::{IpamMessage, NetworkMode, PodInfo};
use crds::labels::{ANNOTATION_IP, ANNOTATION_NIC, ANNOTATION_NIC_TYPE, ANNOTATION_VXNET};
use hostnic_network::{Netlink, NetworkError, PodNetwork};
use hostnic_rpc::{
    AddNetworkReply, AddNetworkRequest, ClearNicsReply, ClearNicsRequest, CniBackend, CniBackendServer,
    DelNetworkReply, DelNetworkRequest, NicItem, ShowNicsReply, ShowNicsRequest,
};
use ipam::{ATTR_NAMESPACE, ATTR_NODE, ATTR_POD, AutoAssignArgs, IpamEngine, handle_id};
use ipnet::Ipv4Net;
use qingcloud_client::HostNic;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

#[cfg(test)]
mod server_test;

/// Address, NIC and gateway handed to one pod
struct Placement {
    nic: HostNic,
    ip: Ipv4Addr,
    prefix_len: u8,
    gateway: String,
}

pub struct CniServer {
    allocator: Arc<NicAllocator>,
    ipam: IpamEngine,
    pods: Arc<dyn PodSource>,
    locks: KeyedMutex,
    default_mode: NetworkMode,
    node_name: String,
}

impl std::fmt::Debug for CniServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CniServer")
            .field("node_name", &self.node_name)
            .field("default_mode", &self.default_mode)
            .finish_non_exhaustive()
    }
}

fn parse_ip(raw: &str, what: &str) -> Result<Ipv4Addr, AgentError> {
    raw.parse()
        .map_err(|_| AgentError::InvalidState(format!("{} {:?} is not an IPv4 address", what, raw)))
}

fn vxnet_prefix(nic: &HostNic) -> Result<u8, AgentError> {
    nic.vxnet
        .cidr
        .parse::<Ipv4Net>()
        .map(|n| n.prefix_len())
        .map_err(|_| AgentError::InvalidState(format!("vxnet {} has invalid cidr {:?}", nic.vxnet.id, nic.vxnet.cidr)))
}

impl CniServer {
    pub fn new(
        allocator: Arc<NicAllocator>,
        ipam: IpamEngine,
        pods: Arc<dyn PodSource>,
        default_mode: NetworkMode,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            allocator,
            ipam,
            pods,
            locks: KeyedMutex::new(),
            default_mode,
            node_name: node_name.into(),
        }
    }

    pub async fn add(&self, req: AddNetworkRequest) -> Result<AddNetworkReply, AgentError> {
        if req.container_id.is_empty() || req.namespace.is_empty() || req.name.is_empty() {
            return Err(AgentError::InvalidConfig(
                "namespace, name and container id are required".to_string(),
            ));
        }
        let _guard = self.locks.lock(&req.container_id).await;

        let base = PodInfo {
            namespace: req.namespace.clone(),
            name: req.name.clone(),
            container_id: req.container_id.clone(),
            netns: req.netns.clone(),
            ifname: req.ifname.clone(),
            vxnet: req.requested_vxnet().map(str::to_string),
            pod_ip: req.requested_ip().map(str::to_string),
            nic_type: req.requested_nic_type().map(str::to_string),
            host_veth: Some(self.allocator.network().host_veth_name(&req.container_id)),
            ..PodInfo::default()
        };
        let pod = self.pods.get_pod(&req.namespace, &req.name).await?;
        let request = pod_request(&pod, base, self.default_mode)?;
        debug!(container_id = %req.container_id, "Pod {} uses {} mode", request.info.key(), request.info.mode);

        let placement = match request.info.mode {
            NetworkMode::Dedicated => self.place_dedicated(&request.info).await?,
            NetworkMode::Shared => self.place_shared(request.info.clone(), request.pools, request.blocks).await?,
        };

        let network = PodNetwork {
            container_id: req.container_id.clone(),
            netns: PathBuf::from(&req.netns),
            ifname: req.ifname.clone(),
            ip: placement.ip,
        };
        let wired = match self
            .allocator
            .network()
            .setup_pod_network(&placement.nic, &network)
            .await
        {
            Ok(wired) => wired,
            Err(e) if request.info.mode == NetworkMode::Shared => {
                // the address is only ours once the pod is wired
                self.unbind_shared(&req.container_id).await;
                self.release_handle(&handle_id(&req.namespace, &req.name)).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let annotations = BTreeMap::from([
            (ANNOTATION_NIC.to_string(), placement.nic.id.clone()),
            (ANNOTATION_IP.to_string(), placement.ip.to_string()),
            (ANNOTATION_VXNET.to_string(), placement.nic.vxnet.id.clone()),
            (ANNOTATION_NIC_TYPE.to_string(), request.info.mode.to_string()),
        ]);
        if let Err(e) = self.pods.annotate_pod(&req.namespace, &req.name, annotations).await {
            warn!("Failed to annotate pod {}/{}: {}", req.namespace, req.name, e);
        }

        info!(
            container_id = %req.container_id,
            "Pod {}/{} got {} on NIC {} (table {})",
            req.namespace, req.name, placement.ip, placement.nic.id, placement.nic.route_table_num
        );
        Ok(AddNetworkReply {
            ok: true,
            ipv4: placement.ip.to_string(),
            prefix_len: u32::from(placement.prefix_len),
            gateway: placement.gateway,
            route_table_num: placement.nic.route_table_num,
            mac: placement.nic.hardware_addr.clone(),
            host_veth: wired.host_veth,
        })
    }

    async fn place_dedicated(&self, info: &PodInfo) -> Result<Placement, AgentError> {
        let nic = self.allocator.alloc_host_nic(info).await?;
        Ok(Placement {
            ip: parse_ip(&nic.primary_address, "NIC address")?,
            prefix_len: vxnet_prefix(&nic)?,
            gateway: nic.vxnet.gateway.clone(),
            nic,
        })
    }

    async fn place_shared(
        &self,
        mut info: PodInfo,
        pools: Vec<String>,
        blocks: Vec<String>,
    ) -> Result<Placement, AgentError> {
        let handle = handle_id(&info.namespace, &info.name);
        let args = AutoAssignArgs {
            handle_id: handle.clone(),
            attrs: BTreeMap::from([
                (ATTR_NAMESPACE.to_string(), info.namespace.clone()),
                (ATTR_POD.to_string(), info.name.clone()),
                (ATTR_NODE.to_string(), self.node_name.clone()),
            ]),
            namespace: Some(info.namespace.clone()),
            pools,
            blocks,
        };
        let assignment = self
            .ipam
            .auto_assign(&args)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::InvalidState(format!("IPAM returned nothing for {}", handle)))?;
        let Some(vxnet) = assignment.pool.clone() else {
            self.release_handle(&handle).await;
            return Err(AgentError::InvalidConfig(format!(
                "block {} belongs to no pool, cannot pick a VxNet",
                assignment.block
            )));
        };

        info.pod_ip = Some(assignment.ip.to_string());
        info.handle_id = Some(handle.clone());
        info.block = Some(assignment.block.clone());
        let nic = match self.allocator.alloc_shared_nic(&vxnet, &info).await {
            Ok(nic) => nic,
            Err(e) => {
                self.release_handle(&handle).await;
                return Err(e);
            }
        };
        Ok(Placement {
            ip: assignment.ip,
            prefix_len: assignment.prefix_len,
            gateway: assignment
                .gateway
                .map(|g| g.to_string())
                .unwrap_or_else(|| nic.vxnet.gateway.clone()),
            nic,
        })
    }

    async fn unbind_shared(&self, container_id: &str) {
        if let Err(e) = self.allocator.free_shared_nic(container_id, false).await {
            warn!(container_id = %container_id, "Failed to unbind shared NIC: {}", e);
        }
    }

    async fn release_handle(&self, handle: &str) {
        if let Err(e) = self.ipam.release_by_handle(handle).await {
            warn!("Failed to release IPAM handle {}: {}", handle, e);
        }
    }

    /// Tear down a pod. Unknown containers succeed.
    pub async fn del(&self, req: DelNetworkRequest) -> Result<DelNetworkReply, AgentError> {
        if req.container_id.is_empty() {
            return Err(AgentError::InvalidConfig("container id is required".to_string()));
        }
        let container_id = req.container_id.as_str();
        let _guard = self.locks.lock(container_id).await;
        let network = |ip: Ipv4Addr| PodNetwork {
            container_id: container_id.to_string(),
            netns: PathBuf::from(&req.netns),
            ifname: req.ifname.clone(),
            ip,
        };

        if let Some(msg) = self.allocator.free_host_nic(container_id, true).await? {
            let ip = pod_address(&msg).unwrap_or(Ipv4Addr::UNSPECIFIED);
            self.allocator
                .network()
                .cleanup_pod_network(Some(&msg.nic), &network(ip))
                .await?;
            self.allocator.free_host_nic(container_id, false).await?;
        } else if let Some(msg) = self.allocator.free_shared_nic(container_id, true).await? {
            let ip = pod_address(&msg).unwrap_or(Ipv4Addr::UNSPECIFIED);
            self.allocator
                .network()
                .cleanup_pod_network(Some(&msg.nic), &network(ip))
                .await?;
            self.allocator.free_shared_nic(container_id, false).await?;
            if let Some(handle) = msg.pod.and_then(|p| p.handle_id) {
                self.ipam.release_by_handle(&handle).await?;
            }
        } else {
            debug!(container_id = %container_id, "No binding, removing any leftover veth");
            let veth = self.allocator.network().host_veth_name(container_id);
            match self.allocator.network().netlink().link_del(&veth).await {
                Ok(()) | Err(NetworkError::LinkNotFound(_)) | Err(NetworkError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(container_id = %container_id, "Released pod {}/{}", req.namespace, req.name);
        Ok(DelNetworkReply { ok: true })
    }

    pub async fn show(&self) -> ShowNicsReply {
        let items = self
            .allocator
            .show_nics()
            .await
            .into_iter()
            .map(|entry| NicItem {
                pods: entry.pods(),
                id: entry.nic.id,
                vxnet: entry.nic.vxnet.id,
                phase: entry.nic.phase.to_string(),
                status: entry.nic.status.to_string(),
                route_table_num: entry.nic.route_table_num,
                reserved: entry.nic.reserved,
                shared: entry.nic.shared,
            })
            .collect();
        ShowNicsReply { items }
    }
}

/// The pod's address as recorded in its binding
fn pod_address(msg: &IpamMessage) -> Option<Ipv4Addr> {
    msg.pod
        .as_ref()
        .and_then(|p| p.pod_ip.as_deref())
        .filter(|_| msg.nic.shared)
        .unwrap_or(msg.nic.primary_address.as_str())
        .parse()
        .ok()
}

fn to_status(err: AgentError) -> Status {
    error!("Request failed: {}", err);
    err.into()
}

#[tonic::async_trait]
impl CniBackend for CniServer {
    async fn add_network(&self, request: Request<AddNetworkRequest>) -> Result<Response<AddNetworkReply>, Status> {
        self.add(request.into_inner()).await.map(Response::new).map_err(to_status)
    }

    async fn del_network(&self, request: Request<DelNetworkRequest>) -> Result<Response<DelNetworkReply>, Status> {
        self.del(request.into_inner()).await.map(Response::new).map_err(to_status)
    }

    async fn show_nics(&self, _request: Request<ShowNicsRequest>) -> Result<Response<ShowNicsReply>, Status> {
        Ok(Response::new(self.show().await))
    }

    async fn clear_nics(&self, _request: Request<ClearNicsRequest>) -> Result<Response<ClearNicsReply>, Status> {
        let detached = self.allocator.clear_nics().await.map_err(to_status)?;
        Ok(Response::new(ClearNicsReply { detached }))
    }
}

/// Serve on the Unix socket at `path` until `shutdown` flips to true
pub async fn serve(server: CniServer, path: &Path, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("CNI backend listening on {}", path.display());

    tonic::transport::Server::builder()
        .add_service(CniBackendServer::new(server))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    info!("CNI backend stopped");
    Ok(())
}
