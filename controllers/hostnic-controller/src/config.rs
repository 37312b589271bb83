//! Controller configuration loaded from the environment

use crate::error::ControllerError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// The one VxNetPool this controller reconciles
    pub vxnetpool_name: String,
    pub webhook_addr: SocketAddr,
    /// Security group that gets a rule per VxNet
    pub cluster_sg: Option<String>,
    pub qingcloud_config: PathBuf,
    /// IaaS resync period of the VxNetPool
    pub sync_period: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ControllerError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let webhook_addr = get("WEBHOOK_ADDR").unwrap_or_else(|| "0.0.0.0:9443".to_string());
        let webhook_addr = webhook_addr.parse().map_err(|_| {
            ControllerError::InvalidConfig(format!("WEBHOOK_ADDR {:?} is not a socket address", webhook_addr))
        })?;

        Ok(Self {
            vxnetpool_name: get("VXNETPOOL_NAME").unwrap_or_else(|| "v-pool".to_string()),
            webhook_addr,
            cluster_sg: get("HOSTNIC_CLUSTER_SG"),
            qingcloud_config: get("QINGCLOUD_CONFIG")
                .unwrap_or_else(|| "/etc/qingcloud/config.yaml".to_string())
                .into(),
            sync_period: Duration::from_secs(10),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ControllerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.vxnetpool_name, "v-pool");
        assert_eq!(cfg.webhook_addr, "0.0.0.0:9443".parse().unwrap());
        assert!(cfg.cluster_sg.is_none());
        assert_eq!(cfg.sync_period, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("VXNETPOOL_NAME", "prod-pool"),
            ("WEBHOOK_ADDR", "127.0.0.1:8443"),
            ("HOSTNIC_CLUSTER_SG", "sg-1234"),
        ])
        .unwrap();
        assert_eq!(cfg.vxnetpool_name, "prod-pool");
        assert_eq!(cfg.webhook_addr.port(), 8443);
        assert_eq!(cfg.cluster_sg.as_deref(), Some("sg-1234"));
    }

    #[test]
    fn test_bad_webhook_addr() {
        assert!(matches!(
            config(&[("WEBHOOK_ADDR", "nowhere")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
