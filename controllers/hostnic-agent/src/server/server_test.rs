#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::allocator::NicAllocator;
    use crate::test_utils::{TestNode, allocator_config};
    use async_trait::async_trait;
    use crds::labels::{ANNOTATION_NIC_TYPE, ANNOTATION_VXNET};
    use crds::{IPPool, IPPoolSpec, PoolType};
    use ipam::{BlockExt, MemoryIpamClient};
    use k8s_openapi::api::core::v1::Pod;
    use kube::api::ObjectMeta;
    use qingcloud_client::NicStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePods {
        pods: Mutex<BTreeMap<(String, String), Pod>>,
    }

    impl FakePods {
        fn add(&self, namespace: &str, name: &str, annotations: &[(&str, &str)]) {
            let pod = Pod {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                    ..ObjectMeta::default()
                },
                ..Pod::default()
            };
            self.pods
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name.to_string()), pod);
        }

        fn annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
            self.pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .and_then(|p| p.metadata.annotations.as_ref())
                .and_then(|a| a.get(key).cloned())
        }
    }

    #[async_trait]
    impl PodSource for FakePods {
        async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, AgentError> {
            self.pods
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| AgentError::PodNotFound(format!("{}/{}", namespace, name)))
        }

        async fn annotate_pod(
            &self,
            namespace: &str,
            name: &str,
            annotations: BTreeMap<String, String>,
        ) -> Result<(), AgentError> {
            let mut pods = self.pods.lock().unwrap();
            let pod = pods
                .get_mut(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| AgentError::PodNotFound(format!("{}/{}", namespace, name)))?;
            pod.metadata.annotations.get_or_insert_with(BTreeMap::new).extend(annotations);
            Ok(())
        }
    }

    struct Setup {
        server: CniServer,
        allocator: Arc<NicAllocator>,
        ipam: MemoryIpamClient,
        pods: Arc<FakePods>,
    }

    async fn setup(node: &TestNode) -> Setup {
        let allocator = Arc::new(node.allocator(allocator_config()));
        allocator.start().await.unwrap();

        let ipam = MemoryIpamClient::new();
        let engine = IpamEngine::new(Arc::new(ipam.clone()));
        ipam.add_pool(IPPool::new(
            "vx-A",
            IPPoolSpec {
                cidr: "10.0.0.0/24".to_string(),
                block_size: 26,
                range_start: Some("10.0.0.100".to_string()),
                range_end: None,
                gateway: Some("10.0.0.1".to_string()),
                pool_type: PoolType::Vxnet,
                disabled: false,
            },
        ));
        engine.auto_generate_blocks_from_pool("vx-A").await.unwrap();

        let pods = Arc::new(FakePods::default());
        let server = CniServer::new(
            allocator.clone(),
            engine,
            pods.clone(),
            NetworkMode::Dedicated,
            "node-1",
        );
        Setup {
            server,
            allocator,
            ipam,
            pods,
        }
    }

    fn add_request(node: &TestNode, name: &str, container_id: &str) -> AddNetworkRequest {
        let netns = format!("/var/run/netns/{}", container_id);
        node.kernel.add_netns(&netns);
        AddNetworkRequest {
            namespace: "default".to_string(),
            name: name.to_string(),
            container_id: container_id.to_string(),
            ifname: "eth0".to_string(),
            netns,
            ..AddNetworkRequest::default()
        }
    }

    fn del_request(name: &str, container_id: &str) -> DelNetworkRequest {
        DelNetworkRequest {
            namespace: "default".to_string(),
            name: name.to_string(),
            container_id: container_id.to_string(),
            netns: format!("/var/run/netns/{}", container_id),
            ifname: "eth0".to_string(),
        }
    }

    fn host_links(node: &TestNode) -> Vec<String> {
        node.kernel.snapshot().netns[""].links.keys().cloned().collect()
    }

    #[tokio::test]
    async fn test_dedicated_add_and_delete() {
        let node = TestNode::new();
        let s = setup(&node).await;
        s.pods.add("default", "web", &[]);

        let reply = s.server.add(add_request(&node, "web", "c1")).await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.prefix_len, 24);
        assert_eq!(reply.gateway, "10.0.0.1");
        assert!(reply.route_table_num >= 260);
        assert!(host_links(&node).contains(&reply.host_veth));
        assert_eq!(s.pods.annotation("default", "web", ANNOTATION_NIC), Some(reply.mac.clone()));
        assert_eq!(s.pods.annotation("default", "web", ANNOTATION_IP), Some(reply.ipv4.clone()));
        assert_eq!(s.pods.annotation("default", "web", ANNOTATION_VXNET), Some("vx-A".to_string()));
        assert_eq!(s.pods.annotation("default", "web", ANNOTATION_NIC_TYPE), Some("dedicated".to_string()));

        let again = s.server.add(add_request(&node, "web", "c1")).await.unwrap();
        assert_eq!(again, reply);

        s.server.del(del_request("web", "c1")).await.unwrap();
        assert!(!host_links(&node).contains(&reply.host_veth));
        let nic = s
            .allocator
            .show_nics()
            .await
            .into_iter()
            .find(|e| e.nic.hardware_addr == reply.mac)
            .unwrap();
        assert_eq!(nic.nic.status, NicStatus::Free);

        // a second DEL for the same container is a no-op
        assert!(s.server.del(del_request("web", "c1")).await.unwrap().ok);
    }

    #[tokio::test]
    async fn test_reserved_address_from_annotations() {
        let node = TestNode::new();
        let s = setup(&node).await;
        s.pods.add(
            "default",
            "db",
            &[(ANNOTATION_VXNET, "vx-B"), (ANNOTATION_IP, "10.0.1.37")],
        );

        let reply = s.server.add(add_request(&node, "db", "c2")).await.unwrap();
        assert_eq!(reply.ipv4, "10.0.1.37");
        assert_eq!(reply.gateway, "10.0.1.1");

        s.server.del(del_request("db", "c2")).await.unwrap();
        let entry = s
            .allocator
            .show_nics()
            .await
            .into_iter()
            .find(|e| e.nic.hardware_addr == reply.mac)
            .unwrap();
        assert_eq!(entry.nic.status, NicStatus::Deleting);
    }

    #[tokio::test]
    async fn test_shared_add_and_delete() {
        let node = TestNode::new();
        let s = setup(&node).await;
        s.pods.add("default", "a", &[(ANNOTATION_NIC_TYPE, "shared")]);
        s.pods.add("default", "b", &[(ANNOTATION_NIC_TYPE, "shared")]);

        let first = s.server.add(add_request(&node, "a", "c3")).await.unwrap();
        let second = s.server.add(add_request(&node, "b", "c4")).await.unwrap();
        assert_eq!(first.mac, second.mac);
        assert_ne!(first.ipv4, second.ipv4);
        assert_eq!(first.ipv4, "10.0.0.100");
        assert_eq!(first.gateway, "10.0.0.1");
        assert_eq!(s.ipam.handles().len(), 2);

        let show = s.server.show().await;
        let shared = show.items.iter().find(|i| i.shared).unwrap();
        assert_eq!(shared.pods.len(), 2);

        s.server.del(del_request("a", "c3")).await.unwrap();
        assert_eq!(s.ipam.handles().len(), 1);
        s.server.del(del_request("b", "c4")).await.unwrap();
        assert!(s.ipam.handles().is_empty());
    }

    #[tokio::test]
    async fn test_shared_add_annotates_type() {
        let node = TestNode::new();
        let s = setup(&node).await;
        s.pods.add("default", "a", &[(ANNOTATION_NIC_TYPE, "shared")]);

        let reply = s.server.add(add_request(&node, "a", "c3")).await.unwrap();
        assert_eq!(s.pods.annotation("default", "a", ANNOTATION_IP), Some(reply.ipv4.clone()));
        assert_eq!(s.pods.annotation("default", "a", ANNOTATION_VXNET), Some("vx-A".to_string()));
        assert_eq!(s.pods.annotation("default", "a", ANNOTATION_NIC_TYPE), Some("shared".to_string()));
    }

    #[tokio::test]
    async fn test_failed_shared_setup_releases_address() {
        let node = TestNode::new();
        let s = setup(&node).await;
        s.pods.add("default", "a", &[(ANNOTATION_NIC_TYPE, "shared")]);

        // the sandbox netns is gone before the pod can be wired
        let mut req = add_request(&node, "a", "c3");
        req.netns = "/var/run/netns/missing".to_string();
        assert!(s.server.add(req).await.is_err());

        assert!(s.ipam.handles().is_empty());
        assert_eq!(s.ipam.blocks().iter().map(|b| b.spec.counts().allocated).sum::<usize>(), 0);
        let shared = s.server.show().await;
        assert!(shared.items.iter().all(|i| i.pods.is_empty()));

        // a retry gets the same first address
        let reply = s.server.add(add_request(&node, "a", "c3")).await.unwrap();
        assert_eq!(reply.ipv4, "10.0.0.100");
    }

    #[tokio::test]
    async fn test_unknown_pod_is_not_found() {
        let node = TestNode::new();
        let s = setup(&node).await;

        let err = s
            .server
            .add_network(Request::new(add_request(&node, "ghost", "c9")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);

        let err = s
            .server
            .add_network(Request::new(AddNetworkRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_clear_nics_reports_detached() {
        let node = TestNode::new();
        let s = setup(&node).await;
        s.pods.add("default", "web", &[]);
        s.server.add(add_request(&node, "web", "c1")).await.unwrap();

        let reply = s
            .server
            .clear_nics(Request::new(ClearNicsRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reply.detached.len(), 1);

        let show = s.server.show().await;
        assert!(show.items.iter().any(|i| i.status == "USING" && i.pods == vec!["default/web".to_string()]));
    }
}
