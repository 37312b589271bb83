//! Per-NIC routing table
//!
//! Table N holds the VxNet subnet route and the default route through the
//! VxNet gateway. The link alias records N so it survives agent restarts.
//! Shared NICs are enslaved to `br_<N>` and the routes point at the bridge.

use crate::error::{NetworkError, NetworkResultExt};
use crate::programmer::NetworkProgrammer;
use crate::types::*;
use ipnet::Ipv4Net;
use qingcloud_client::HostNic;
use std::net::Ipv4Addr;
use tracing::{debug, info};

fn parse_vxnet(nic: &HostNic) -> Result<(Ipv4Net, Ipv4Addr), NetworkError> {
    let cidr: Ipv4Net = nic
        .vxnet
        .cidr
        .parse()
        .map_err(|e| NetworkError::Parse(format!("vxnet {} cidr {:?}: {}", nic.vxnet.id, nic.vxnet.cidr, e)))?;
    let gateway: Ipv4Addr = nic
        .vxnet
        .gateway
        .parse()
        .map_err(|e| NetworkError::Parse(format!("vxnet {} gateway {:?}: {}", nic.vxnet.id, nic.vxnet.gateway, e)))?;
    Ok((cidr.trunc(), gateway))
}

fn table_of(nic: &HostNic) -> Result<u32, NetworkError> {
    u32::try_from(nic.route_table_num)
        .map_err(|_| NetworkError::Parse(format!("nic {} has invalid route table {}", nic.id, nic.route_table_num)))
}

impl NetworkProgrammer {
    /// Program table N for an attached NIC. Safe to call repeatedly.
    pub async fn setup_nic_network(&self, nic: &HostNic) -> Result<(), NetworkError> {
        let link = self
            .netlink
            .link_by_mac(&nic.hardware_addr)
            .await?
            .ok_or_else(|| NetworkError::LinkNotFound(nic.hardware_addr.clone()))?;
        let table = table_of(nic)?;
        let (cidr, gateway) = parse_vxnet(nic)?;

        let alias = nic_alias(nic.route_table_num);
        if link.alias.as_deref() != Some(alias.as_str()) {
            self.netlink.link_set_alias(&link.name, Some(&alias)).await?;
        }

        let dev = if nic.shared {
            let bridge = bridge_name(nic.route_table_num);
            if self.netlink.link_by_name(&bridge).await?.is_none() {
                self.netlink.bridge_add(&bridge).await.ignore_exists()?;
            }
            if link.master.as_deref() != Some(bridge.as_str()) {
                self.netlink.link_set_master(&link.name, Some(&bridge)).await?;
            }
            self.netlink
                .sysctl_set(&format!("net.ipv4.conf.{}.rp_filter", bridge), "0")
                .await?;
            self.netlink.link_set_up(&bridge).await?;
            bridge
        } else {
            link.name.clone()
        };

        if !link.up {
            self.netlink.link_set_up(&link.name).await?;
        }
        self.netlink
            .sysctl_set(&format!("net.ipv4.conf.{}.rp_filter", link.name), "0")
            .await?;

        let routes = [
            Route {
                dst: Some(cidr),
                gateway: None,
                dev: dev.clone(),
                table,
                scope: RouteScope::Link,
            },
            Route {
                dst: None,
                gateway: Some(gateway),
                dev: dev.clone(),
                table,
                scope: RouteScope::Universe,
            },
        ];
        let existing = self.netlink.route_list(table).await?;
        for route in &routes {
            if !existing.contains(route) {
                self.netlink.route_replace(route).await?;
            }
        }

        info!("Set up nic {} ({}) on {} table {}", nic.id, nic.vxnet.id, dev, table);
        Ok(())
    }

    /// Inverse of `setup_nic_network`. Tolerates a link that is already gone.
    pub async fn cleanup_nic_network(&self, nic: &HostNic) -> Result<(), NetworkError> {
        let table = table_of(nic)?;

        for route in self.netlink.route_list(table).await? {
            self.netlink.route_del(&route).await.ignore_not_found()?;
        }
        for rule in self.netlink.rule_list().await? {
            if rule.table == table {
                self.remove_rule(&rule).await?;
            }
        }

        let link = self.netlink.link_by_mac(&nic.hardware_addr).await?;
        if nic.shared {
            if let Some(link) = &link {
                if link.master.is_some() {
                    self.netlink.link_set_master(&link.name, None).await.ignore_not_found()?;
                }
            }
            self.netlink
                .link_del(&bridge_name(nic.route_table_num))
                .await
                .ignore_not_found()?;
        }

        if let Some(link) = link {
            let default = self
                .netlink
                .sysctl_get("net.ipv4.conf.default.rp_filter")
                .await
                .unwrap_or_else(|_| "1".to_string());
            self.netlink
                .sysctl_set(&format!("net.ipv4.conf.{}.rp_filter", link.name), &default)
                .await?;
            self.netlink.link_set_down(&link.name).await.ignore_not_found()?;
            self.netlink.link_set_alias(&link.name, None).await.ignore_not_found()?;
        } else {
            debug!("Link for nic {} already gone", nic.id);
        }

        info!("Cleaned up nic {} table {}", nic.id, table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::NetworkConfig;
    use crate::fake::FakeKernel;
    use crate::netlink::Netlink;
    use crate::programmer::NetworkProgrammer;
    use crate::types::*;
    use qingcloud_client::{HostNic, VxNet};
    use std::sync::Arc;

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

    fn setup() -> (FakeKernel, NetworkProgrammer) {
        let kernel = FakeKernel::new();
        kernel.add_link("eth1", "52:54:00:00:00:02");
        let p = NetworkProgrammer::new(Arc::new(kernel.clone()), Arc::new(kernel.clone()), NetworkConfig::default());
        (kernel, p)
    }

    #[tokio::test]
    async fn test_setup_installs_table_routes() {
        let (kernel, p) = setup();
        p.setup_nic_network(&nic(false)).await.unwrap();

        let routes = kernel.route_list(260).await.unwrap();
        assert_eq!(routes.len(), 2);
        assert!(routes.iter().any(|r| r.dst == Some("10.0.0.0/24".parse().unwrap()) && r.scope == RouteScope::Link));
        assert!(routes.iter().any(|r| r.dst.is_none() && r.gateway == Some("10.0.0.1".parse().unwrap())));

        let link = kernel.link_by_name("eth1").await.unwrap().unwrap();
        assert!(link.up);
        assert_eq!(link.route_table_from_alias(), Some(260));
        assert_eq!(kernel.sysctl_get("net.ipv4.conf.eth1.rp_filter").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let (kernel, p) = setup();
        p.setup_nic_network(&nic(false)).await.unwrap();
        let once = kernel.snapshot();
        p.setup_nic_network(&nic(false)).await.unwrap();
        assert_eq!(once, kernel.snapshot());
    }

    #[tokio::test]
    async fn test_cleanup_restores_state() {
        for shared in [false, true] {
            let (kernel, p) = setup();
            let before = kernel.snapshot();

            p.setup_nic_network(&nic(shared)).await.unwrap();
            assert_ne!(before, kernel.snapshot());
            p.cleanup_nic_network(&nic(shared)).await.unwrap();

            assert_eq!(before, kernel.snapshot(), "shared={shared}");
        }
    }

    #[tokio::test]
    async fn test_shared_nic_uses_bridge() {
        let (kernel, p) = setup();
        p.setup_nic_network(&nic(true)).await.unwrap();

        let link = kernel.link_by_name("eth1").await.unwrap().unwrap();
        assert_eq!(link.master.as_deref(), Some("br_260"));
        let routes = kernel.route_list(260).await.unwrap();
        assert!(routes.iter().all(|r| r.dev == "br_260"));
    }

    #[tokio::test]
    async fn test_missing_link() {
        let (kernel, p) = setup();
        kernel.remove_link("eth1");

        let err = p.setup_nic_network(&nic(false)).await.unwrap_err();
        assert!(matches!(err, crate::NetworkError::LinkNotFound(_)));
        // cleanup of a detached nic still succeeds
        p.cleanup_nic_network(&nic(false)).await.unwrap();
    }
}
