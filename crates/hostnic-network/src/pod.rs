//! Pod veth wiring
//!
//! Inside the pod every packet goes to 169.254.1.1, which is answered by a
//! permanent neighbour entry pointing at the host end of the veth. On the
//! host, `to <ip> lookup main` delivers inbound traffic to the veth and
//! `from <ip> lookup N` sends outbound traffic through the pod's NIC.

use crate::error::{NetworkError, NetworkResultExt};
use crate::programmer::{NetworkProgrammer, PodNetwork, PodNetworkResult};
use crate::types::*;
use ipnet::Ipv4Net;
use qingcloud_client::HostNic;
use tracing::{debug, info};

const EB_TABLE: &str = "nat";
const EB_CHAIN: &str = "PREROUTING";

fn arp_reply_rule(nic: &HostNic, pod: &PodNetwork, host_mac: &str) -> Vec<String> {
    crate::command::args([
        "-p".to_string(),
        "ARP".to_string(),
        "--logical-in".to_string(),
        bridge_name(nic.route_table_num),
        "--arp-op".to_string(),
        "Request".to_string(),
        "--arp-ip-dst".to_string(),
        pod.ip.to_string(),
        "-j".to_string(),
        "arpreply".to_string(),
        "--arpreply-mac".to_string(),
        host_mac.to_lowercase(),
    ])
}

fn host_route(pod: &PodNetwork, host_veth: &str) -> Route {
    Route {
        dst: Some(host_net(pod.ip)),
        gateway: None,
        dev: host_veth.to_string(),
        table: MAIN_TABLE,
        scope: RouteScope::Link,
    }
}

impl NetworkProgrammer {
    /// Wire a pod's namespace to the host and route it through `nic`
    pub async fn setup_pod_network(&self, nic: &HostNic, pod: &PodNetwork) -> Result<PodNetworkResult, NetworkError> {
        let table = u32::try_from(nic.route_table_num)
            .map_err(|_| NetworkError::Parse(format!("nic {} has invalid route table {}", nic.id, nic.route_table_num)))?;
        let host_veth = self.host_veth_name(&pod.container_id);

        if self.netlink.link_by_name(&host_veth).await?.is_none() {
            self.netlink
                .veth_add(&host_veth, &pod.ifname, &pod.netns)
                .await
                .ignore_exists()?;
        }
        let host_link = self
            .netlink
            .link_by_name(&host_veth)
            .await?
            .ok_or_else(|| NetworkError::LinkNotFound(host_veth.clone()))?;
        if !host_link.up {
            self.netlink.link_set_up(&host_veth).await?;
        }

        // container side
        let ns = self.netlink.in_netns(&pod.netns);
        let peer = ns
            .link_by_name(&pod.ifname)
            .await?
            .ok_or_else(|| NetworkError::LinkNotFound(pod.ifname.clone()))?;
        if !peer.up {
            ns.link_set_up(&pod.ifname).await?;
        }
        let pod_addr = host_net(pod.ip);
        if !ns.addr_list(&pod.ifname).await?.contains(&pod_addr) {
            ns.addr_add(&pod.ifname, pod_addr).await.ignore_exists()?;
        }
        let ns_routes = [
            Route {
                dst: Some(host_net(DUMMY_GATEWAY)),
                gateway: None,
                dev: pod.ifname.clone(),
                table: MAIN_TABLE,
                scope: RouteScope::Link,
            },
            Route {
                dst: None,
                gateway: Some(DUMMY_GATEWAY),
                dev: pod.ifname.clone(),
                table: MAIN_TABLE,
                scope: RouteScope::Universe,
            },
        ];
        let existing = ns.route_list(MAIN_TABLE).await?;
        for route in &ns_routes {
            if !existing.contains(route) {
                ns.route_replace(route).await?;
            }
        }
        ns.neigh_replace(&Neigh {
            ip: DUMMY_GATEWAY,
            mac: host_link.mac.clone(),
            dev: pod.ifname.clone(),
        })
        .await?;

        // host side
        let route = host_route(pod, &host_veth);
        if !self.netlink.route_list(MAIN_TABLE).await?.contains(&route) {
            self.netlink.route_replace(&route).await?;
        }
        self.ensure_rule(&Rule::to_dst(pod_addr, MAIN_TABLE, TO_POD_RULE_PRIORITY))
            .await?;
        self.ensure_rule(&Rule::from_src(pod_addr, table, FROM_POD_RULE_PRIORITY))
            .await?;

        if nic.shared {
            let rule = arp_reply_rule(nic, pod, &host_link.mac);
            if !self.firewall.eb_rule_exists(EB_TABLE, EB_CHAIN, &rule).await? {
                self.firewall.eb_append(EB_TABLE, EB_CHAIN, &rule).await?;
            }
        }

        info!(
            "Set up pod network for container {} ip {} via {} table {}",
            pod.container_id, pod.ip, host_veth, table
        );
        Ok(PodNetworkResult {
            host_veth,
            host_mac: host_link.mac,
        })
    }

    /// Remove what `setup_pod_network` installed; missing pieces are skipped
    pub async fn cleanup_pod_network(&self, nic: Option<&HostNic>, pod: &PodNetwork) -> Result<(), NetworkError> {
        let host_veth = self.host_veth_name(&pod.container_id);
        let pod_addr: Ipv4Net = host_net(pod.ip);

        for rule in self.netlink.rule_list().await? {
            let from_pod = rule.src == Some(pod_addr) && rule.priority == FROM_POD_RULE_PRIORITY;
            let to_pod = rule.dst == Some(pod_addr) && rule.priority == TO_POD_RULE_PRIORITY;
            if from_pod || to_pod {
                self.remove_rule(&rule).await?;
            }
        }

        self.netlink
            .route_del(&host_route(pod, &host_veth))
            .await
            .ignore_not_found()?;

        if let Some(nic) = nic.filter(|n| n.shared) {
            match self.netlink.link_by_name(&host_veth).await? {
                Some(link) => {
                    let rule = arp_reply_rule(nic, pod, &link.mac);
                    if self.firewall.eb_rule_exists(EB_TABLE, EB_CHAIN, &rule).await? {
                        self.firewall.eb_delete(EB_TABLE, EB_CHAIN, &rule).await.ignore_not_found()?;
                    }
                }
                None => debug!("veth {} gone, skipping arp reply cleanup", host_veth),
            }
        }

        match self.netlink.link_del(&host_veth).await {
            Ok(()) => {}
            Err(NetworkError::LinkNotFound(_)) | Err(NetworkError::NotFound(_)) => {
                debug!("veth {} already gone", host_veth);
            }
            Err(e) => return Err(e),
        }

        info!("Cleaned up pod network for container {} ip {}", pod.container_id, pod.ip);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NetworkConfig;
    use crate::fake::FakeKernel;
    use crate::netlink::Netlink;
    use crate::programmer::{NetworkProgrammer, PodNetwork};
    use crate::types::*;
    use qingcloud_client::{HostNic, VxNet};
    use std::path::PathBuf;
    use std::sync::Arc;

    const NETNS: &str = "/var/run/netns/cni-1234";

    fn nic(shared: bool) -> HostNic {
        HostNic {
            id: "52:54:00:00:00:02".to_string(),
            hardware_addr: "52:54:00:00:00:02".to_string(),
            vxnet: VxNet {
                id: "vxnet-a".to_string(),
                cidr: "10.0.0.0/24".to_string(),
                gateway: "10.0.0.1".to_string(),
                ..VxNet::default()
            },
            primary_address: "10.0.0.5".to_string(),
            route_table_num: 260,
            shared,
            ..HostNic::default()
        }
    }

    fn pod() -> PodNetwork {
        PodNetwork {
            container_id: "c0ffee".to_string(),
            netns: PathBuf::from(NETNS),
            ifname: "eth0".to_string(),
            ip: "10.0.0.5".parse().unwrap(),
        }
    }

    async fn ready(shared: bool) -> (FakeKernel, NetworkProgrammer) {
        let kernel = FakeKernel::new();
        kernel.add_link("eth1", "52:54:00:00:00:02");
        kernel.add_netns(NETNS);
        let p = NetworkProgrammer::new(Arc::new(kernel.clone()), Arc::new(kernel.clone()), NetworkConfig::default());
        p.setup_nic_network(&nic(shared)).await.unwrap();
        (kernel, p)
    }

    #[tokio::test]
    async fn test_setup_pod_network() {
        let (kernel, p) = ready(false).await;
        let result = p.setup_pod_network(&nic(false), &pod()).await.unwrap();
        assert_eq!(result.host_veth, p.host_veth_name("c0ffee"));

        let rules = kernel.rule_list().await.unwrap();
        let addr = host_net("10.0.0.5".parse().unwrap());
        assert!(rules.contains(&Rule::from_src(addr, 260, FROM_POD_RULE_PRIORITY)));
        assert!(rules.contains(&Rule::to_dst(addr, MAIN_TABLE, TO_POD_RULE_PRIORITY)));

        let ns = kernel.in_netns(&PathBuf::from(NETNS));
        assert_eq!(ns.addr_list("eth0").await.unwrap(), vec![addr]);
        let routes = ns.route_list(MAIN_TABLE).await.unwrap();
        assert!(routes.iter().any(|r| r.dst.is_none() && r.gateway == Some(DUMMY_GATEWAY)));

        let state = kernel.snapshot();
        let neighs = &state.netns[NETNS].neighs;
        assert!(neighs.iter().any(|n| n.ip == DUMMY_GATEWAY && n.mac == result.host_mac));
        assert!(state.ebtables.is_empty());
    }

    #[tokio::test]
    async fn test_setup_pod_network_is_idempotent() {
        let (kernel, p) = ready(true).await;
        p.setup_pod_network(&nic(true), &pod()).await.unwrap();
        let once = kernel.snapshot();
        p.setup_pod_network(&nic(true), &pod()).await.unwrap();
        assert_eq!(once, kernel.snapshot());
        assert_eq!(once.ebtables.values().map(Vec::len).sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_pod_network_restores_state() {
        for shared in [false, true] {
            let (kernel, p) = ready(shared).await;
            let before = kernel.snapshot();

            p.setup_pod_network(&nic(shared), &pod()).await.unwrap();
            p.cleanup_pod_network(Some(&nic(shared)), &pod()).await.unwrap();

            assert_eq!(before, kernel.snapshot(), "shared={shared}");
        }
    }

    #[tokio::test]
    async fn test_cleanup_twice_is_harmless() {
        let (kernel, p) = ready(false).await;
        p.setup_pod_network(&nic(false), &pod()).await.unwrap();
        p.cleanup_pod_network(Some(&nic(false)), &pod()).await.unwrap();
        let after = kernel.snapshot();
        p.cleanup_pod_network(None, &pod()).await.unwrap();
        assert_eq!(after, kernel.snapshot());
    }
}
