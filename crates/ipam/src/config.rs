//! Namespace to subnet mapping kept in the `hostnic-ipam-config` ConfigMap

use crate::error::IpamError;
use crds::labels::{IPAM_AUTO_ASSIGN_KEY, IPAM_CONFIG_KEY, IPAM_DEFAULT_NAMESPACE};
use std::collections::{BTreeMap, BTreeSet};

/// Parsed ConfigMap content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpamConfig {
    /// Namespace to subnet (block or pool) names
    pub namespaces: BTreeMap<String, Vec<String>>,
    /// `autoAssign: on`
    pub auto_assign: bool,
}

impl IpamConfig {
    /// Parse ConfigMap data; a missing `ipam` key is an empty map
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self, IpamError> {
        let namespaces = match data.get(IPAM_CONFIG_KEY).map(|s| s.trim()) {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => BTreeMap::new(),
        };
        let auto_assign = match data.get(IPAM_AUTO_ASSIGN_KEY).map(|s| s.trim().to_ascii_lowercase()) {
            None => false,
            Some(v) if v.is_empty() || v == "off" || v == "false" => false,
            Some(v) if v == "on" || v == "true" => true,
            Some(v) => {
                return Err(IpamError::Validation(format!("{} must be on or off, got {:?}", IPAM_AUTO_ASSIGN_KEY, v)));
            }
        };
        Ok(Self {
            namespaces,
            auto_assign,
        })
    }

    /// ConfigMap data for this config
    pub fn to_data(&self) -> Result<BTreeMap<String, String>, IpamError> {
        Ok(BTreeMap::from([
            (IPAM_CONFIG_KEY.to_string(), serde_json::to_string(&self.namespaces)?),
            (
                IPAM_AUTO_ASSIGN_KEY.to_string(),
                if self.auto_assign { "on" } else { "off" }.to_string(),
            ),
        ]))
    }

    /// Subnets for `namespace`, falling back to the `Default` entry
    pub fn subnets_for(&self, namespace: Option<&str>) -> &[String] {
        namespace
            .and_then(|ns| self.namespaces.get(ns))
            .filter(|s| !s.is_empty())
            .or_else(|| self.namespaces.get(IPAM_DEFAULT_NAMESPACE))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Subnets assigned to any namespace
    pub fn used_subnets(&self) -> BTreeSet<&str> {
        self.namespaces.values().flatten().map(String::as_str).collect()
    }
}

/// Admission check: parseable and no subnet assigned to two namespaces
pub fn validate_ipam_config(data: &BTreeMap<String, String>) -> Result<IpamConfig, IpamError> {
    let config = IpamConfig::from_data(data)?;
    let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
    for (ns, subnets) in &config.namespaces {
        for subnet in subnets {
            if let Some(prev) = owner.insert(subnet.as_str(), ns.as_str()) {
                if prev != ns {
                    return Err(IpamError::Validation(format!(
                        "subnet {} is assigned to both {} and {}",
                        subnet, prev, ns
                    )));
                }
            }
        }
    }
    Ok(config)
}

/// Handle id of a pod
pub fn handle_id(namespace: &str, pod: &str) -> String {
    format!("{}.{}", namespace, pod)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(ipam: &str, auto: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (IPAM_CONFIG_KEY.to_string(), ipam.to_string()),
            (IPAM_AUTO_ASSIGN_KEY.to_string(), auto.to_string()),
        ])
    }

    #[test]
    fn test_parse_and_fallback() {
        let cfg = IpamConfig::from_data(&data(r#"{"Default":["pool-a"],"foo":["10-0-0-0-26"]}"#, "on")).unwrap();
        assert!(cfg.auto_assign);
        assert_eq!(cfg.subnets_for(Some("foo")), ["10-0-0-0-26".to_string()]);
        assert_eq!(cfg.subnets_for(Some("bar")), ["pool-a".to_string()]);
        assert_eq!(cfg.subnets_for(None), ["pool-a".to_string()]);
        assert_eq!(IpamConfig::from_data(&cfg.to_data().unwrap()).unwrap(), cfg);
    }

    #[test]
    fn test_missing_keys() {
        let cfg = IpamConfig::from_data(&BTreeMap::new()).unwrap();
        assert!(!cfg.auto_assign);
        assert!(cfg.subnets_for(Some("any")).is_empty());
    }

    #[test]
    fn test_validate_rejects_shared_subnet() {
        let err = validate_ipam_config(&data(r#"{"foo":["b1"],"bar":["b1"]}"#, "off")).unwrap_err();
        assert!(matches!(err, IpamError::Validation(_)));
        assert!(validate_ipam_config(&data(r#"{"foo":["b1"],"bar":["b2"]}"#, "off")).is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(matches!(
            validate_ipam_config(&data("{not json", "on")),
            Err(IpamError::Serialization(_))
        ));
        assert!(validate_ipam_config(&data("{}", "maybe")).is_err());
    }

    #[test]
    fn test_handle_id() {
        assert_eq!(handle_id("kube-system", "coredns-1"), "kube-system.coredns-1");
    }
}
