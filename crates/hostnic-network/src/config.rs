//! Host networking configuration

use crate::error::NetworkError;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// How SNAT picks source ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnatMode {
    /// `--random`
    #[default]
    HashRandom,
    /// `--random-fully`
    Prng,
    /// No port randomization
    None,
}

impl FromStr for SnatMode {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "hashrandom" => Ok(SnatMode::HashRandom),
            "prng" => Ok(SnatMode::Prng),
            "none" => Ok(SnatMode::None),
            other => Err(NetworkError::Parse(format!("unknown SNAT randomization {:?}", other))),
        }
    }
}

impl SnatMode {
    /// Extra iptables flag, if any
    pub fn flag(self) -> Option<&'static str> {
        match self {
            SnatMode::HashRandom => Some("--random"),
            SnatMode::Prng => Some("--random-fully"),
            SnatMode::None => None,
        }
    }
}

/// Node-level settings for the programmer
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Host-side veth prefix (`nic` by default)
    pub veth_prefix: String,
    /// Name of the primary (boot) NIC
    pub primary_nic: String,
    /// Address of the primary NIC, the SNAT source
    pub primary_ip: Ipv4Addr,
    /// SNAT is done outside the node
    pub external_snat: bool,
    pub snat_mode: SnatMode,
    pub node_port_support: bool,
    /// Connmark bit for node-port replies
    pub connmark: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            veth_prefix: "nic".to_string(),
            primary_nic: "eth0".to_string(),
            primary_ip: Ipv4Addr::UNSPECIFIED,
            external_snat: false,
            snat_mode: SnatMode::HashRandom,
            node_port_support: true,
            connmark: 0x80,
        }
    }
}

/// Parse `0x80` or `128`
pub fn parse_mark(raw: &str) -> Result<u32, NetworkError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| NetworkError::Parse(format!("invalid mark {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snat_mode() {
        assert_eq!("prng".parse::<SnatMode>().unwrap(), SnatMode::Prng);
        assert_eq!("".parse::<SnatMode>().unwrap(), SnatMode::HashRandom);
        assert_eq!(SnatMode::None.flag(), None);
        assert!("random".parse::<SnatMode>().is_err());
    }

    #[test]
    fn test_parse_mark() {
        assert_eq!(parse_mark("0x80").unwrap(), 128);
        assert_eq!(parse_mark("256").unwrap(), 256);
        assert!(parse_mark("0xzz").is_err());
    }
}
