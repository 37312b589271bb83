//! Agent configuration loaded from the environment

use crate::allocator::AllocatorConfig;
use crate::error::AgentError;
use crate::types::NetworkMode;
use hostnic_network::config::parse_mark;
use hostnic_network::{NetworkConfig, SnatMode};
use std::path::PathBuf;
use std::str::FromStr;

/// Everything the agent reads at startup
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub node_name: String,
    pub cluster_name: Option<String>,
    /// Name given to every NIC the agent creates
    pub nic_name: String,
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
    pub cni_conf: PathBuf,
    pub qingcloud_config: PathBuf,
    pub instance_id_file: PathBuf,
    /// Mode for pods without a type or vxnet annotation
    pub default_mode: NetworkMode,
    pub allocator: AllocatorConfig,
    /// Primary NIC name and address are filled in at startup
    pub network: NetworkConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from a variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let node_name = get("MY_NODE_NAME")
            .ok_or_else(|| AgentError::InvalidConfig("MY_NODE_NAME environment variable is required".to_string()))?;
        let cluster_name = get("HOSTNIC_CLUSTER_NAME");
        let nic_name = match &cluster_name {
            Some(cluster) => format!("hostnic_{}", cluster),
            None => "hostnic".to_string(),
        };

        let allocator = AllocatorConfig {
            pool_low: parse_num(get("HOSTNIC_POOL_LOW"), "HOSTNIC_POOL_LOW", 3)?,
            pool_high: parse_num(get("HOSTNIC_POOL_HIGH"), "HOSTNIC_POOL_HIGH", 5)?,
            max_nic: parse_num(get("HOSTNIC_MAX_NIC"), "HOSTNIC_MAX_NIC", 60)?,
            route_table_base: parse_num(get("HOSTNIC_ROUTE_TABLE_BASE"), "HOSTNIC_ROUTE_TABLE_BASE", 260)?,
            cached_vxnet: get("HOSTNIC_VXNET"),
            nic_name: nic_name.clone(),
            ..AllocatorConfig::default()
        };
        allocator.validate()?;

        let snat_mode = match get("QINGCLOUD_VPC_K8S_CNI_RANDOMIZESNAT") {
            Some(v) => SnatMode::from_str(&v.to_ascii_lowercase()).map_err(|e| AgentError::InvalidConfig(e.to_string()))?,
            None => SnatMode::default(),
        };
        let connmark = match get("QINGCLOUD_VPC_K8S_CNI_CONNMARK") {
            Some(v) => parse_mark(&v).map_err(|e| AgentError::InvalidConfig(e.to_string()))?,
            None => NetworkConfig::default().connmark,
        };
        let network = NetworkConfig {
            veth_prefix: get("HOSTNIC_VETH_PREFIX").unwrap_or_else(|| "nic".to_string()),
            external_snat: parse_bool(get("QINGCLOUD_VPC_K8S_CNI_EXTERNALSNAT"), "QINGCLOUD_VPC_K8S_CNI_EXTERNALSNAT", false)?,
            snat_mode,
            node_port_support: parse_bool(
                get("QINGCLOUD_VPC_CNI_NODE_PORT_SUPPORT"),
                "QINGCLOUD_VPC_CNI_NODE_PORT_SUPPORT",
                true,
            )?,
            connmark,
            ..NetworkConfig::default()
        };
        if network.veth_prefix.len() > 4 {
            return Err(AgentError::InvalidConfig(format!(
                "HOSTNIC_VETH_PREFIX {:?} is longer than 4 characters",
                network.veth_prefix
            )));
        }

        let default_mode = match get("HOSTNIC_IPAM_MODE") {
            Some(v) => v.parse()?,
            None => NetworkMode::Dedicated,
        };

        Ok(Self {
            node_name,
            cluster_name,
            nic_name,
            socket_path: get("HOSTNIC_SOCKET")
                .unwrap_or_else(|| hostnic_rpc::DEFAULT_SOCKET.to_string())
                .into(),
            data_dir: get("HOSTNIC_DATA_DIR").unwrap_or_else(|| "/var/lib/hostnic".to_string()).into(),
            cni_conf: get("HOSTNIC_CNI_CONF")
                .unwrap_or_else(|| "/etc/cni/net.d/10-hostnic.conflist".to_string())
                .into(),
            qingcloud_config: get("QINGCLOUD_CONFIG")
                .unwrap_or_else(|| "/etc/qingcloud/config.yaml".to_string())
                .into(),
            instance_id_file: get("INSTANCE_ID_FILE")
                .unwrap_or_else(|| "/etc/qingcloud/instance-id".to_string())
                .into(),
            default_mode,
            allocator,
            network,
        })
    }
}

fn parse_num<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, AgentError> {
    match raw {
        Some(v) => v
            .parse()
            .map_err(|_| AgentError::InvalidConfig(format!("{} must be a number, got {:?}", key, v))),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<String>, key: &str, default: bool) -> Result<bool, AgentError> {
    match raw.map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
        Some(v) => Err(AgentError::InvalidConfig(format!("{} must be a boolean, got {:?}", key, v))),
    }
}

/// Read the instance id, trimming whitespace
pub fn read_instance_id(path: &std::path::Path) -> Result<String, AgentError> {
    let id = std::fs::read_to_string(path)?.trim().to_string();
    if id.is_empty() {
        return Err(AgentError::InvalidConfig(format!("{} is empty", path.display())));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AgentConfig, AgentError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AgentConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("MY_NODE_NAME", "node-1")]).unwrap();
        assert_eq!(cfg.node_name, "node-1");
        assert_eq!(cfg.allocator.pool_low, 3);
        assert_eq!(cfg.allocator.pool_high, 5);
        assert_eq!(cfg.allocator.max_nic, 60);
        assert_eq!(cfg.allocator.route_table_base, 260);
        assert_eq!(cfg.network.veth_prefix, "nic");
        assert_eq!(cfg.network.connmark, 0x80);
        assert!(cfg.network.node_port_support);
        assert_eq!(cfg.default_mode, NetworkMode::Dedicated);
        assert_eq!(cfg.socket_path, PathBuf::from("/var/run/hostnic.sock"));
        assert_eq!(cfg.nic_name, "hostnic");
    }

    #[test]
    fn test_node_name_required() {
        assert!(matches!(config(&[]), Err(AgentError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("MY_NODE_NAME", "node-1"),
            ("HOSTNIC_CLUSTER_NAME", "prod"),
            ("QINGCLOUD_VPC_K8S_CNI_RANDOMIZESNAT", "prng"),
            ("QINGCLOUD_VPC_K8S_CNI_EXTERNALSNAT", "true"),
            ("QINGCLOUD_VPC_K8S_CNI_CONNMARK", "0x40"),
            ("HOSTNIC_IPAM_MODE", "shared"),
            ("HOSTNIC_VXNET", "vxnet-a"),
        ])
        .unwrap();
        assert_eq!(cfg.network.snat_mode, SnatMode::Prng);
        assert!(cfg.network.external_snat);
        assert_eq!(cfg.network.connmark, 0x40);
        assert_eq!(cfg.default_mode, NetworkMode::Shared);
        assert_eq!(cfg.allocator.cached_vxnet.as_deref(), Some("vxnet-a"));
        assert_eq!(cfg.nic_name, "hostnic_prod");
    }

    #[test]
    fn test_pool_bounds_validated() {
        assert!(config(&[("MY_NODE_NAME", "n"), ("HOSTNIC_POOL_LOW", "5"), ("HOSTNIC_POOL_HIGH", "3")]).is_err());
        assert!(config(&[("MY_NODE_NAME", "n"), ("HOSTNIC_POOL_HIGH", "8"), ("HOSTNIC_MAX_NIC", "4")]).is_err());
        assert!(config(&[("MY_NODE_NAME", "n"), ("HOSTNIC_ROUTE_TABLE_BASE", "200")]).is_err());
        assert!(config(&[("MY_NODE_NAME", "n"), ("HOSTNIC_ROUTE_TABLE_BASE", "2147483640")]).is_err());
        assert!(config(&[("MY_NODE_NAME", "n"), ("QINGCLOUD_VPC_CNI_NODE_PORT_SUPPORT", "maybe")]).is_err());
    }

    #[test]
    fn test_read_instance_id_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance-id");
        std::fs::write(&path, "  i-abcdef12\n").unwrap();
        assert_eq!(read_instance_id(&path).unwrap(), "i-abcdef12");
    }
}
