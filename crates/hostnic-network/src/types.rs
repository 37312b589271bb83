//! Kernel object models shared by the trait implementations

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// Main routing table id
pub const MAIN_TABLE: u32 = 254;
/// Local routing table id
pub const LOCAL_TABLE: u32 = 255;
/// Link-local next hop every pod routes through
pub const DUMMY_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);
/// `from <pod_ip> lookup N`
pub const FROM_POD_RULE_PRIORITY: u32 = 1536;
/// `to <pod_ip> lookup main`
pub const TO_POD_RULE_PRIORITY: u32 = 512;
/// `fwmark <mark> lookup main`
pub const CONNMARK_RULE_PRIORITY: u32 = 1024;
/// Alias prefix that records the route table number on a NIC link
pub const NIC_ALIAS_PREFIX: &str = "hostnic_";
/// Bridge prefix used in shared mode
pub const BRIDGE_PREFIX: &str = "br_";

/// A network interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Link {
    pub name: String,
    pub mac: String,
    pub alias: Option<String>,
    pub up: bool,
    pub master: Option<String>,
    pub kind: Option<String>,
}

impl Link {
    /// Route table number recorded in the alias, if any
    pub fn route_table_from_alias(&self) -> Option<i32> {
        self.alias
            .as_deref()
            .and_then(|a| a.strip_prefix(NIC_ALIAS_PREFIX))
            .and_then(|n| n.parse().ok())
    }
}

/// Alias recording `table` on a NIC link
pub fn nic_alias(table: i32) -> String {
    format!("{}{}", NIC_ALIAS_PREFIX, table)
}

/// Bridge name used for `table` in shared mode
pub fn bridge_name(table: i32) -> String {
    format!("{}{}", BRIDGE_PREFIX, table)
}

/// Route scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
    Host,
}

/// A route; `dst == None` is the default route
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Route {
    pub dst: Option<Ipv4Net>,
    pub gateway: Option<Ipv4Addr>,
    pub dev: String,
    pub table: u32,
    pub scope: RouteScope,
}

impl Route {
    /// Whether two routes occupy the same slot (same table and destination)
    pub fn same_key(&self, other: &Route) -> bool {
        self.table == other.table && self.dst == other.dst
    }
}

/// A policy routing rule
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rule {
    pub priority: u32,
    pub src: Option<Ipv4Net>,
    pub dst: Option<Ipv4Net>,
    pub fwmark: Option<(u32, u32)>,
    pub table: u32,
}

impl Rule {
    /// `from <src> lookup <table> priority <priority>`
    pub fn from_src(src: Ipv4Net, table: u32, priority: u32) -> Self {
        Self { priority, src: Some(src), dst: None, fwmark: None, table }
    }

    /// `to <dst> lookup <table> priority <priority>`
    pub fn to_dst(dst: Ipv4Net, table: u32, priority: u32) -> Self {
        Self { priority, src: None, dst: Some(dst), fwmark: None, table }
    }
}

/// A permanent neighbour entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Neigh {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub dev: String,
}

/// `/32` network for a single address
pub fn host_net(ip: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(ip)
}

/// Lowercase a MAC and strip leading zeros per octet, the way ebtables prints it
pub fn normalize_mac(mac: &str) -> String {
    mac.split(':')
        .map(|o| match u8::from_str_radix(o, 16) {
            Ok(v) => format!("{:x}", v),
            Err(_) => o.to_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_round_trip_and_foreign_alias() {
        let link = Link {
            alias: Some(nic_alias(261)),
            ..Link::default()
        };
        assert_eq!(link.route_table_from_alias(), Some(261));

        let other = Link {
            alias: Some("uplink".to_string()),
            ..Link::default()
        };
        assert_eq!(other.route_table_from_alias(), None);
    }

    #[test]
    fn test_normalize_mac() {
        assert_eq!(normalize_mac("52:54:00:0A:bb:01"), "52:54:0:a:bb:1");
    }

    #[test]
    fn test_host_net() {
        assert_eq!(host_net(Ipv4Addr::new(10, 0, 0, 5)).to_string(), "10.0.0.5/32");
    }
}
