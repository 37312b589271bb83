//! Kubernetes side of the agent
//!
//! A reflector keeps the pods scheduled to this node in memory; lookups
//! fall back to a direct GET for pods the watch has not delivered yet.
//! The annotations read here decide how a pod is networked.

use crate::error::AgentError;
use crate::types::{NetworkMode, PodInfo};
use async_trait::async_trait;
use crds::IPPool;
use crds::labels::{ANNOTATION_BLOCKS, ANNOTATION_IP, ANNOTATION_IPPOOL, ANNOTATION_NIC_TYPE, ANNOTATION_VXNET};
use futures::StreamExt;
use ipam::LivePod;
use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::{WatchStreamExt, watcher};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the server looks up pods and records their NIC
#[async_trait]
pub trait PodSource: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, AgentError>;
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), AgentError>;
}

/// A pod request after its annotations are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRequest {
    pub info: PodInfo,
    /// IPPools to draw from in shared mode
    pub pools: Vec<String>,
    /// Blocks to draw from in shared mode
    pub blocks: Vec<String>,
}

fn list_annotation(annotations: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    annotations
        .get(key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn non_empty(annotations: &BTreeMap<String, String>, key: &str) -> Option<String> {
    annotations
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The type annotation wins, then an explicit VxNet means dedicated, then
/// the node default
pub fn resolve_mode(annotations: &BTreeMap<String, String>, default: NetworkMode) -> Result<NetworkMode, AgentError> {
    if let Some(kind) = non_empty(annotations, ANNOTATION_NIC_TYPE) {
        return kind.parse();
    }
    if non_empty(annotations, ANNOTATION_VXNET).is_some() {
        return Ok(NetworkMode::Dedicated);
    }
    Ok(default)
}

/// Merge the pod's annotations into `base`. Values sent with the CNI
/// request take precedence.
pub fn pod_request(pod: &Pod, mut base: PodInfo, default: NetworkMode) -> Result<PodRequest, AgentError> {
    let mut annotations = pod.annotations().clone();
    if let Some(kind) = base.nic_type.clone() {
        annotations.insert(ANNOTATION_NIC_TYPE.to_string(), kind);
    }
    if let Some(vxnet) = base.vxnet.clone() {
        annotations.insert(ANNOTATION_VXNET.to_string(), vxnet);
    }

    base.mode = resolve_mode(&annotations, default)?;
    base.vxnet = non_empty(&annotations, ANNOTATION_VXNET);
    base.nic_type = non_empty(&annotations, ANNOTATION_NIC_TYPE);
    if base.pod_ip.is_none() {
        base.pod_ip = non_empty(&annotations, ANNOTATION_IP);
    }

    let mut pools = list_annotation(&annotations, ANNOTATION_IPPOOL);
    // a shared-mode VxNet is the pool named after it
    if pools.is_empty() && base.mode == NetworkMode::Shared {
        pools.extend(base.vxnet.clone());
    }
    Ok(PodRequest {
        pools,
        blocks: list_annotation(&annotations, ANNOTATION_BLOCKS),
        info: base,
    })
}

/// A pod that still holds its addresses, as the IPAM repair sees it
///
/// Pending pods count even before the kubelet reports an address: their CNI
/// ADD may already have allocated one.
pub fn live_pod(pod: &Pod) -> Option<LivePod> {
    if pod.spec.as_ref().and_then(|s| s.host_network) == Some(true) {
        return None;
    }
    let status = pod.status.as_ref();
    if matches!(
        status.and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    ) {
        return None;
    }
    let ip = status
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse::<Ipv4Addr>().ok());
    Some(LivePod {
        namespace: pod.namespace()?,
        name: pod.name_any(),
        ip,
    })
}

/// Pods of one node, backed by a reflector
#[derive(Clone)]
pub struct PodDirectory {
    client: Client,
    store: Store<Pod>,
    node_name: String,
}

impl std::fmt::Debug for PodDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodDirectory").field("node_name", &self.node_name).finish()
    }
}

impl PodDirectory {
    /// Start watching the pods scheduled to `node_name`
    pub fn spawn(client: Client, node_name: &str) -> (Self, JoinHandle<()>) {
        let api: Api<Pod> = Api::all(client.clone());
        let config = watcher::Config::default().fields(&format!("spec.nodeName={}", node_name));
        let (store, writer) = reflector::store();
        let stream = reflector::reflector(writer, watcher(api, config))
            .default_backoff()
            .touched_objects();
        let node = node_name.to_string();
        let handle = tokio::spawn(async move {
            info!("Starting pod reflector for node {}", node);
            stream
                .for_each(|event| async move {
                    if let Err(e) = event {
                        warn!("Pod watch error: {}", e);
                    }
                })
                .await;
        });
        (
            Self {
                client,
                store,
                node_name: node_name.to_string(),
            },
            handle,
        )
    }

    /// Non-terminated pods of this node
    pub fn live_pods(&self) -> Vec<LivePod> {
        self.store.state().iter().filter_map(|p| live_pod(p)).collect()
    }

    /// Resolves once the reflector has listed the node's pods; until then
    /// an empty store says nothing about which pods exist
    pub async fn wait_synced(&self) {
        if self.store.wait_until_ready().await.is_err() {
            warn!("Pod reflector stopped before its first list");
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl PodSource for PodDirectory {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, AgentError> {
        if let Some(pod) = self.store.get(&ObjectRef::new(name).within(namespace)) {
            return Ok((*pod).clone());
        }
        debug!("Pod {}/{} not in the reflector yet, fetching", namespace, name);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| AgentError::PodNotFound(format!("{}/{}", namespace, name)))
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

/// CIDRs of every IPPool, the sources exempt from SNAT
pub async fn ippool_cidrs(client: &Client) -> Result<Vec<Ipv4Net>, AgentError> {
    let api: Api<IPPool> = Api::all(client.clone());
    let mut cidrs = Vec::new();
    for pool in api.list(&ListParams::default()).await? {
        match pool.spec.cidr.parse::<Ipv4Net>() {
            Ok(cidr) => cidrs.push(cidr.trunc()),
            Err(e) => warn!("IPPool {} has invalid cidr {:?}: {}", pool.name_any(), pool.spec.cidr, e),
        }
    }
    Ok(cidrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.0.0.7".to_string()),
                ..PodStatus::default()
            }),
        }
    }

    fn base() -> PodInfo {
        PodInfo {
            namespace: "default".to_string(),
            name: "web".to_string(),
            container_id: "c1".to_string(),
            ..PodInfo::default()
        }
    }

    #[test]
    fn test_resolve_mode_precedence() {
        let annotations = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        assert_eq!(
            resolve_mode(&annotations(&[]), NetworkMode::Shared).unwrap(),
            NetworkMode::Shared
        );
        assert_eq!(
            resolve_mode(&annotations(&[(ANNOTATION_VXNET, "vxnet-a")]), NetworkMode::Shared).unwrap(),
            NetworkMode::Dedicated
        );
        assert_eq!(
            resolve_mode(
                &annotations(&[(ANNOTATION_VXNET, "vxnet-a"), (ANNOTATION_NIC_TYPE, "shared")]),
                NetworkMode::Dedicated
            )
            .unwrap(),
            NetworkMode::Shared
        );
        assert!(resolve_mode(&annotations(&[(ANNOTATION_NIC_TYPE, "bogus")]), NetworkMode::Dedicated).is_err());
    }

    #[test]
    fn test_pod_request_reads_annotations() {
        let pod = pod(&[(ANNOTATION_VXNET, "vxnet-b"), (ANNOTATION_IP, "10.0.1.9")]);
        let req = pod_request(&pod, base(), NetworkMode::Shared).unwrap();
        assert_eq!(req.info.mode, NetworkMode::Dedicated);
        assert_eq!(req.info.vxnet.as_deref(), Some("vxnet-b"));
        assert_eq!(req.info.pod_ip.as_deref(), Some("10.0.1.9"));
    }

    #[test]
    fn test_pod_request_shared_selectors() {
        let pod = pod(&[
            (ANNOTATION_NIC_TYPE, "shared"),
            (ANNOTATION_IPPOOL, "pool-a, pool-b"),
            (ANNOTATION_BLOCKS, "blk-1"),
        ]);
        let req = pod_request(&pod, base(), NetworkMode::Dedicated).unwrap();
        assert_eq!(req.info.mode, NetworkMode::Shared);
        assert_eq!(req.pools, vec!["pool-a".to_string(), "pool-b".to_string()]);
        assert_eq!(req.blocks, vec!["blk-1".to_string()]);

        let pod = self::pod(&[(ANNOTATION_NIC_TYPE, "shared"), (ANNOTATION_VXNET, "vxnet-c")]);
        let req = pod_request(&pod, base(), NetworkMode::Dedicated).unwrap();
        assert_eq!(req.pools, vec!["vxnet-c".to_string()]);
    }

    #[test]
    fn test_request_overrides_annotations() {
        let pod = pod(&[(ANNOTATION_NIC_TYPE, "shared")]);
        let mut info = base();
        info.nic_type = Some("dedicated".to_string());
        let req = pod_request(&pod, info, NetworkMode::Shared).unwrap();
        assert_eq!(req.info.mode, NetworkMode::Dedicated);
    }

    #[test]
    fn test_live_pod_filters() {
        let running = pod(&[]);
        assert_eq!(
            live_pod(&running),
            Some(LivePod {
                namespace: "default".to_string(),
                name: "web".to_string(),
                ip: Some("10.0.0.7".parse().unwrap()),
            })
        );

        // admitted but not yet reported by the kubelet
        let mut pending = pod(&[]);
        let status = pending.status.as_mut().unwrap();
        status.phase = Some("Pending".to_string());
        status.pod_ip = None;
        assert_eq!(
            live_pod(&pending),
            Some(LivePod {
                namespace: "default".to_string(),
                name: "web".to_string(),
                ip: None,
            })
        );

        let mut unscheduled = pod(&[]);
        unscheduled.status = None;
        assert!(live_pod(&unscheduled).is_some_and(|p| p.ip.is_none()));

        let mut failed = pod(&[]);
        failed.status.as_mut().unwrap().phase = Some("Failed".to_string());
        assert_eq!(live_pod(&failed), None);

        let mut finished = pod(&[]);
        finished.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        assert_eq!(live_pod(&finished), None);

        let mut host = pod(&[]);
        host.spec.as_mut().unwrap().host_network = Some(true);
        assert_eq!(live_pod(&host), None);
    }
}
