//! Entry point tying the kernel traits to hostnic's networking model

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::firewall::Firewall;
use crate::netlink::Netlink;
use crate::types::*;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

/// Pod side of a CNI invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNetwork {
    pub container_id: String,
    pub netns: PathBuf,
    pub ifname: String,
    pub ip: Ipv4Addr,
}

/// What the pod wiring produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodNetworkResult {
    pub host_veth: String,
    pub host_mac: String,
}

/// Programs routes, rules and packet filters for NICs and pods
pub struct NetworkProgrammer {
    pub(crate) netlink: Arc<dyn Netlink>,
    pub(crate) firewall: Arc<dyn Firewall>,
    pub(crate) config: NetworkConfig,
}

impl std::fmt::Debug for NetworkProgrammer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProgrammer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NetworkProgrammer {
    pub fn new(netlink: Arc<dyn Netlink>, firewall: Arc<dyn Firewall>, config: NetworkConfig) -> Self {
        Self {
            netlink,
            firewall,
            config,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn netlink(&self) -> &Arc<dyn Netlink> {
        &self.netlink
    }

    /// Host-side veth name for a container: prefix plus 11 hex chars of its hash
    pub fn host_veth_name(&self, container_id: &str) -> String {
        let digest = format!("{:x}", Sha256::digest(container_id.as_bytes()));
        let budget = 15usize.saturating_sub(self.config.veth_prefix.len()).min(11);
        format!("{}{}", self.config.veth_prefix, &digest[..budget])
    }

    /// Route table numbers recorded in link aliases, keyed by MAC
    pub async fn route_tables_from_links(&self) -> Result<HashMap<String, i32>, NetworkError> {
        Ok(self
            .netlink
            .link_list()
            .await?
            .into_iter()
            .filter_map(|l| l.route_table_from_alias().map(|n| (l.mac, n)))
            .collect())
    }

    /// Whether a link with this MAC is present on the host
    pub async fn link_present(&self, mac: &str) -> Result<bool, NetworkError> {
        Ok(self.netlink.link_by_mac(mac).await?.is_some())
    }

    pub(crate) async fn ensure_rule(&self, rule: &Rule) -> Result<(), NetworkError> {
        if !self.netlink.rule_list().await?.contains(rule) {
            self.netlink.rule_add(rule).await?;
        }
        Ok(())
    }

    /// Remove every copy of `rule`
    pub(crate) async fn remove_rule(&self, rule: &Rule) -> Result<(), NetworkError> {
        let copies = self
            .netlink
            .rule_list()
            .await?
            .into_iter()
            .filter(|r| r == rule)
            .count();
        for _ in 0..copies {
            match self.netlink.rule_del(rule).await {
                Ok(()) | Err(NetworkError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Find the primary NIC: the device of the main table's default route and its address
pub async fn discover_primary(netlink: &dyn Netlink) -> Result<(String, Ipv4Addr), NetworkError> {
    let default = netlink
        .route_list(MAIN_TABLE)
        .await?
        .into_iter()
        .find(|r| r.dst.is_none())
        .ok_or_else(|| NetworkError::NotFound("default route".to_string()))?;
    let addr = netlink
        .addr_list(&default.dev)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| NetworkError::NotFound(format!("address on {}", default.dev)))?;
    Ok((default.dev, addr.addr()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeKernel;

    fn programmer(kernel: &FakeKernel) -> NetworkProgrammer {
        NetworkProgrammer::new(
            Arc::new(kernel.clone()),
            Arc::new(kernel.clone()),
            NetworkConfig::default(),
        )
    }

    #[test]
    fn test_host_veth_name_is_stable_and_short() {
        let kernel = FakeKernel::new();
        let p = programmer(&kernel);

        let a = p.host_veth_name("0123456789abcdef");
        assert_eq!(a, p.host_veth_name("0123456789abcdef"));
        assert_ne!(a, p.host_veth_name("fedcba9876543210"));
        assert!(a.starts_with("nic"));
        assert_eq!(a.len(), 14);
    }

    #[tokio::test]
    async fn test_discover_primary() {
        let kernel = FakeKernel::new();
        kernel.add_link("eth0", "52:54:00:00:00:01");
        kernel.add_addr("eth0", "172.16.0.10/24".parse().unwrap());
        kernel.add_route(Route {
            dst: None,
            gateway: Some(Ipv4Addr::new(172, 16, 0, 1)),
            dev: "eth0".to_string(),
            table: MAIN_TABLE,
            scope: RouteScope::Universe,
        });

        let (name, ip) = discover_primary(&kernel).await.unwrap();
        assert_eq!(name, "eth0");
        assert_eq!(ip, Ipv4Addr::new(172, 16, 0, 10));
    }

    #[tokio::test]
    async fn test_route_tables_from_links() {
        let kernel = FakeKernel::new();
        kernel.add_link("eth1", "52:54:00:00:00:02");
        kernel.add_link("eth2", "52:54:00:00:00:03");
        kernel.link_set_alias("eth1", Some("hostnic_262")).await.unwrap();

        let tables = programmer(&kernel).route_tables_from_links().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables.get("52:54:00:00:00:02"), Some(&262));
    }
}
