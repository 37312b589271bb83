//! QingCloud credentials file
//!
//! Loaded from `/etc/qingcloud/config.yaml` (or `QINGCLOUD_CONFIG`).

use crate::error::QingCloudError;
use serde::Deserialize;
use std::path::Path;

fn default_host() -> String {
    "api.qingcloud.com".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_uri() -> String {
    "/iaas/".to_string()
}

/// API endpoint and credentials
#[derive(Debug, Clone, Deserialize)]
pub struct QingCloudConfig {
    pub qy_access_key_id: String,
    pub qy_secret_access_key: String,
    pub zone: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_uri")]
    pub uri: String,
}

impl QingCloudConfig {
    /// Read and parse the YAML credentials file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QingCloudError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| QingCloudError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    /// Parse the YAML credentials document
    pub fn from_yaml(raw: &str) -> Result<Self, QingCloudError> {
        let config: QingCloudConfig =
            serde_yaml::from_str(raw).map_err(|e| QingCloudError::Config(e.to_string()))?;
        if config.qy_access_key_id.is_empty() || config.qy_secret_access_key.is_empty() {
            return Err(QingCloudError::Config("access key is empty".to_string()));
        }
        Ok(config)
    }

    /// Endpoint URL without query string
    pub fn endpoint(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_applied() {
        let config = QingCloudConfig::from_yaml(
            "qy_access_key_id: AK\nqy_secret_access_key: SK\nzone: pek3\n",
        )
        .unwrap();

        assert_eq!(config.endpoint(), "https://api.qingcloud.com:443/iaas/");
        assert_eq!(config.zone, "pek3");
    }

    #[test]
    fn test_empty_key_rejected() {
        let err = QingCloudConfig::from_yaml(
            "qy_access_key_id: ''\nqy_secret_access_key: SK\nzone: pek3\n",
        )
        .unwrap_err();
        assert!(matches!(err, QingCloudError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "qy_access_key_id: AK\nqy_secret_access_key: SK\nzone: sh1a\nhost: api.internal\nport: 80\nprotocol: http"
        )
        .unwrap();

        let config = QingCloudConfig::load(file.path()).unwrap();
        assert_eq!(config.endpoint(), "http://api.internal:80/iaas/");
    }
}
