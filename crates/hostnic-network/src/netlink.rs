//! Links, addresses, routes, rules and neighbours
//!
//! [`RtNetlink`] speaks rtnetlink directly. A handle scoped to a pod network
//! namespace opens its socket while the calling thread is switched into that
//! namespace; the socket keeps operating there afterwards.

use crate::error::NetworkError;
use crate::netns::{NetnsGuard, open_netns};
use crate::types::*;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoData, InfoKind, InfoVeth, LinkAttribute, LinkFlag, LinkInfo, LinkMessage};
use netlink_packet_route::neighbour::NeighbourState;
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope as KernelScope, RouteType,
};
use netlink_packet_route::rule::{RuleAction, RuleAttribute, RuleMessage};
use nix::errno::Errno;
use rtnetlink::{Handle, IpVersion};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Trait for link/route/rule programming
#[async_trait::async_trait]
pub trait Netlink: Send + Sync {
    async fn link_list(&self) -> Result<Vec<Link>, NetworkError>;
    async fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetworkError>;
    async fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetworkError>;
    async fn link_set_up(&self, name: &str) -> Result<(), NetworkError>;
    async fn link_set_down(&self, name: &str) -> Result<(), NetworkError>;
    /// Set (or with `None` clear) the link alias
    async fn link_set_alias(&self, name: &str, alias: Option<&str>) -> Result<(), NetworkError>;
    /// Enslave to `master`, or release with `None`
    async fn link_set_master(&self, name: &str, master: Option<&str>) -> Result<(), NetworkError>;
    async fn bridge_add(&self, name: &str) -> Result<(), NetworkError>;
    /// Create a veth pair with `peer` placed directly in the namespace at `netns`
    async fn veth_add(&self, host: &str, peer: &str, netns: &Path) -> Result<(), NetworkError>;
    /// Delete a link; deleting one end of a veth removes both
    async fn link_del(&self, name: &str) -> Result<(), NetworkError>;

    async fn addr_list(&self, dev: &str) -> Result<Vec<Ipv4Net>, NetworkError>;
    async fn addr_add(&self, dev: &str, addr: Ipv4Net) -> Result<(), NetworkError>;

    async fn route_list(&self, table: u32) -> Result<Vec<Route>, NetworkError>;
    /// Add or overwrite the route with the same table and destination
    async fn route_replace(&self, route: &Route) -> Result<(), NetworkError>;
    async fn route_del(&self, route: &Route) -> Result<(), NetworkError>;

    async fn rule_list(&self) -> Result<Vec<Rule>, NetworkError>;
    /// Append a rule; the kernel does not deduplicate, callers check first
    async fn rule_add(&self, rule: &Rule) -> Result<(), NetworkError>;
    async fn rule_del(&self, rule: &Rule) -> Result<(), NetworkError>;

    async fn neigh_replace(&self, neigh: &Neigh) -> Result<(), NetworkError>;

    async fn sysctl_get(&self, key: &str) -> Result<String, NetworkError>;
    async fn sysctl_set(&self, key: &str, value: &str) -> Result<(), NetworkError>;

    /// Handle operating inside the network namespace at `netns`
    fn in_netns(&self, netns: &Path) -> Arc<dyn Netlink>;
}

/// rtnetlink-backed `Netlink`
///
/// The connection is opened on first use, so a handle can be built outside
/// the runtime and namespaces that never get touched cost nothing.
#[derive(Debug, Default)]
pub struct RtNetlink {
    netns: Option<PathBuf>,
    handle: OnceCell<Handle>,
}

/// `RT_TABLE_COMPAT`: the header value when the real id lives in an attribute
const COMPAT_TABLE: u8 = 252;

impl RtNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handle(&self) -> Result<&Handle, NetworkError> {
        self.handle
            .get_or_try_init(|| async { connect(self.netns.as_deref()) })
            .await
    }

    async fn link_index(&self, name: &str) -> Result<u32, NetworkError> {
        let handle = self.handle().await?;
        let found = handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await;
        match found {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::LinkNotFound(name.to_string())),
            Err(e) => match classify(&format!("link {}", name), e) {
                NetworkError::NotFound(_) => Err(NetworkError::LinkNotFound(name.to_string())),
                other => Err(other),
            },
        }
    }

    /// Interface index to name, for resolving masters and route devices
    async fn link_names(&self) -> Result<HashMap<u32, String>, NetworkError> {
        let msgs = self.link_messages().await?;
        Ok(msgs
            .iter()
            .filter_map(|m| Some((m.header.index, link_name(m)?)))
            .collect())
    }

    async fn link_messages(&self) -> Result<Vec<LinkMessage>, NetworkError> {
        self.handle()
            .await?
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| classify("links", e))
    }

    /// Run blocking file work on a thread switched into this handle's namespace
    async fn in_own_netns<T, F>(&self, work: F) -> Result<T, NetworkError>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        let netns = self.netns.clone();
        tokio::task::spawn_blocking(move || -> Result<T, NetworkError> {
            let _guard = netns.as_deref().map(NetnsGuard::enter).transpose()?;
            Ok(work()?)
        })
        .await
        .map_err(|e| NetworkError::Io(std::io::Error::other(e)))?
    }
}

/// Open a connection whose socket lives in `netns` (or the current namespace)
fn connect(netns: Option<&Path>) -> Result<Handle, NetworkError> {
    let guard = netns.map(NetnsGuard::enter).transpose()?;
    let (connection, handle, _) = rtnetlink::new_connection()?;
    drop(guard);
    tokio::spawn(connection);
    Ok(handle)
}

/// Map kernel errnos onto the idempotence errors callers ignore
fn classify(what: &str, err: rtnetlink::Error) -> NetworkError {
    if let rtnetlink::Error::NetlinkError(msg) = &err {
        match msg.code.map(|c| Errno::from_raw(-c.get())) {
            Some(Errno::EEXIST) => return NetworkError::Exists(what.to_string()),
            Some(Errno::ENOENT | Errno::ESRCH | Errno::ENODEV | Errno::EADDRNOTAVAIL) => {
                return NetworkError::NotFound(what.to_string());
            }
            _ => {}
        }
    }
    NetworkError::Netlink {
        what: what.to_string(),
        message: err.to_string(),
    }
}

fn sysctl_path(key: &str) -> PathBuf {
    Path::new("/proc/sys").join(key.replace('.', "/"))
}

fn format_mac(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(":")
}

fn parse_mac(mac: &str) -> Result<Vec<u8>, NetworkError> {
    let bytes = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|e| NetworkError::Parse(format!("mac {}: {}", mac, e)))?;
    if bytes.len() != 6 {
        return Err(NetworkError::Parse(format!("mac {} is not 6 bytes", mac)));
    }
    Ok(bytes)
}

pub(crate) fn link_name(msg: &LinkMessage) -> Option<String> {
    msg.attributes.iter().find_map(|a| match a {
        LinkAttribute::IfName(name) => Some(name.clone()),
        _ => None,
    })
}

/// Hardware address; `None` for links that are not ethernet-like
pub(crate) fn link_mac(msg: &LinkMessage) -> Option<String> {
    msg.attributes.iter().find_map(|a| match a {
        LinkAttribute::Address(bytes) if bytes.len() == 6 => Some(format_mac(bytes)),
        _ => None,
    })
}

fn kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Other(name) => name.clone(),
        known => format!("{:?}", known).to_lowercase(),
    }
}

pub(crate) fn link_from_message(msg: &LinkMessage, names: &HashMap<u32, String>) -> Option<Link> {
    let mut link = Link {
        name: link_name(msg)?,
        mac: link_mac(msg).unwrap_or_default(),
        alias: None,
        up: msg.header.flags.contains(&LinkFlag::Up),
        master: None,
        kind: None,
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfAlias(alias) if !alias.is_empty() => link.alias = Some(alias.clone()),
            LinkAttribute::Controller(index) => link.master = names.get(index).cloned(),
            LinkAttribute::LinkInfo(infos) => {
                link.kind = infos.iter().find_map(|i| match i {
                    LinkInfo::Kind(kind) => Some(kind_name(kind)),
                    _ => None,
                });
            }
            _ => {}
        }
    }
    Some(link)
}

pub(crate) fn addr_from_message(msg: &AddressMessage) -> Option<Ipv4Net> {
    let local = msg.attributes.iter().find_map(|a| match a {
        AddressAttribute::Local(IpAddr::V4(ip)) => Some(*ip),
        _ => None,
    });
    let address = || {
        msg.attributes.iter().find_map(|a| match a {
            AddressAttribute::Address(IpAddr::V4(ip)) => Some(*ip),
            _ => None,
        })
    };
    Ipv4Net::new(local.or_else(address)?, msg.header.prefix_len).ok()
}

pub(crate) fn route_from_message(msg: &RouteMessage, names: &HashMap<u32, String>) -> Option<Route> {
    if msg.header.address_family != AddressFamily::Inet {
        return None;
    }
    let mut route = Route {
        dst: None,
        gateway: None,
        dev: String::new(),
        table: u32::from(msg.header.table),
        scope: match msg.header.scope {
            KernelScope::Link => RouteScope::Link,
            KernelScope::Host => RouteScope::Host,
            _ => RouteScope::Universe,
        },
    };
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(ip)) => {
                route.dst = Ipv4Net::new(*ip, msg.header.destination_prefix_length).ok();
            }
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => route.gateway = Some(*ip),
            RouteAttribute::Oif(index) => route.dev = names.get(index).cloned().unwrap_or_default(),
            RouteAttribute::Table(table) => route.table = *table,
            _ => {}
        }
    }
    Some(route)
}

/// Kernel message for `route`; deletes leave the protocol unset so routes
/// installed by anyone match
pub(crate) fn route_message(route: &Route, oif: Option<u32>, protocol: RouteProtocol) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header.address_family = AddressFamily::Inet;
    msg.header.table = u8::try_from(route.table).unwrap_or(COMPAT_TABLE);
    msg.header.protocol = protocol;
    msg.header.kind = RouteType::Unicast;
    msg.header.scope = match route.scope {
        RouteScope::Link => KernelScope::Link,
        RouteScope::Host => KernelScope::Host,
        RouteScope::Universe => KernelScope::Universe,
    };
    msg.attributes.push(RouteAttribute::Table(route.table));
    if let Some(dst) = route.dst {
        msg.header.destination_prefix_length = dst.prefix_len();
        msg.attributes.push(RouteAttribute::Destination(RouteAddress::Inet(dst.addr())));
    }
    if let Some(gw) = route.gateway {
        msg.attributes.push(RouteAttribute::Gateway(RouteAddress::Inet(gw)));
    }
    if let Some(index) = oif {
        msg.attributes.push(RouteAttribute::Oif(index));
    }
    msg
}

/// Only `lookup` rules are modelled; goto and blackhole rules are skipped
pub(crate) fn rule_from_message(msg: &RuleMessage) -> Option<Rule> {
    if msg.header.family != AddressFamily::Inet || msg.header.action != RuleAction::ToTable {
        return None;
    }
    let mut rule = Rule {
        priority: 0,
        src: None,
        dst: None,
        fwmark: None,
        table: u32::from(msg.header.table),
    };
    let mut mark = None;
    let mut mask = u32::MAX;
    for attr in &msg.attributes {
        match attr {
            RuleAttribute::Priority(priority) => rule.priority = *priority,
            RuleAttribute::Source(IpAddr::V4(ip)) => rule.src = Ipv4Net::new(*ip, msg.header.src_len).ok(),
            RuleAttribute::Destination(IpAddr::V4(ip)) => rule.dst = Ipv4Net::new(*ip, msg.header.dst_len).ok(),
            RuleAttribute::FwMark(m) => mark = Some(*m),
            RuleAttribute::FwMask(m) => mask = *m,
            RuleAttribute::Table(table) => rule.table = *table,
            _ => {}
        }
    }
    rule.fwmark = mark.map(|m| (m, mask));
    Some(rule)
}

pub(crate) fn rule_message(rule: &Rule) -> RuleMessage {
    let mut msg = RuleMessage::default();
    msg.header.family = AddressFamily::Inet;
    msg.header.table = u8::try_from(rule.table).unwrap_or(COMPAT_TABLE);
    msg.header.action = RuleAction::ToTable;
    msg.attributes.push(RuleAttribute::Table(rule.table));
    msg.attributes.push(RuleAttribute::Priority(rule.priority));
    if let Some(src) = rule.src {
        msg.header.src_len = src.prefix_len();
        msg.attributes.push(RuleAttribute::Source(IpAddr::V4(src.addr())));
    }
    if let Some(dst) = rule.dst {
        msg.header.dst_len = dst.prefix_len();
        msg.attributes.push(RuleAttribute::Destination(IpAddr::V4(dst.addr())));
    }
    if let Some((mark, mask)) = rule.fwmark {
        msg.attributes.push(RuleAttribute::FwMark(mark));
        msg.attributes.push(RuleAttribute::FwMask(mask));
    }
    msg
}

#[async_trait::async_trait]
impl Netlink for RtNetlink {
    async fn link_list(&self) -> Result<Vec<Link>, NetworkError> {
        let msgs = self.link_messages().await?;
        let names: HashMap<u32, String> = msgs
            .iter()
            .filter_map(|m| Some((m.header.index, link_name(m)?)))
            .collect();
        Ok(msgs.iter().filter_map(|m| link_from_message(m, &names)).collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetworkError> {
        Ok(self.link_list().await?.into_iter().find(|l| l.name == name))
    }

    async fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetworkError> {
        let mac = mac.to_lowercase();
        Ok(self.link_list().await?.into_iter().find(|l| l.mac == mac))
    }

    async fn link_set_up(&self, name: &str) -> Result<(), NetworkError> {
        let index = self.link_index(name).await?;
        self.handle()
            .await?
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| classify(&format!("link {}", name), e))
    }

    async fn link_set_down(&self, name: &str) -> Result<(), NetworkError> {
        let index = self.link_index(name).await?;
        self.handle()
            .await?
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| classify(&format!("link {}", name), e))
    }

    async fn link_set_alias(&self, name: &str, alias: Option<&str>) -> Result<(), NetworkError> {
        let index = self.link_index(name).await?;
        let mut request = self.handle().await?.link().set(index);
        // an empty alias clears it
        request
            .message_mut()
            .attributes
            .push(LinkAttribute::IfAlias(alias.unwrap_or_default().to_string()));
        request
            .execute()
            .await
            .map_err(|e| classify(&format!("link {}", name), e))
    }

    async fn link_set_master(&self, name: &str, master: Option<&str>) -> Result<(), NetworkError> {
        let index = self.link_index(name).await?;
        let controller = match master {
            Some(m) => self.link_index(m).await?,
            None => 0,
        };
        let mut request = self.handle().await?.link().set(index);
        request.message_mut().attributes.push(LinkAttribute::Controller(controller));
        request
            .execute()
            .await
            .map_err(|e| classify(&format!("link {}", name), e))
    }

    async fn bridge_add(&self, name: &str) -> Result<(), NetworkError> {
        self.handle()
            .await?
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(|e| classify(&format!("bridge {}", name), e))
    }

    async fn veth_add(&self, host: &str, peer: &str, netns: &Path) -> Result<(), NetworkError> {
        let ns_file = open_netns(netns)?;

        let mut peer_msg = LinkMessage::default();
        peer_msg.attributes.push(LinkAttribute::IfName(peer.to_string()));
        peer_msg.attributes.push(LinkAttribute::NetNsFd(ns_file.as_raw_fd()));

        let mut request = self.handle().await?.link().add();
        let attributes = &mut request.message_mut().attributes;
        attributes.push(LinkAttribute::IfName(host.to_string()));
        attributes.push(LinkAttribute::LinkInfo(vec![
            LinkInfo::Kind(InfoKind::Veth),
            LinkInfo::Data(InfoData::Veth(InfoVeth::Peer(peer_msg))),
        ]));
        let result = request.execute().await;
        // the peer fd must stay open until the kernel has the request
        drop(ns_file);
        result.map_err(|e| classify(&format!("veth {}", host), e))
    }

    async fn link_del(&self, name: &str) -> Result<(), NetworkError> {
        let index = self.link_index(name).await?;
        self.handle()
            .await?
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| classify(&format!("link {}", name), e))
    }

    async fn addr_list(&self, dev: &str) -> Result<Vec<Ipv4Net>, NetworkError> {
        let index = self.link_index(dev).await?;
        let msgs: Vec<AddressMessage> = self
            .handle()
            .await?
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| classify(&format!("addresses of {}", dev), e))?;
        Ok(msgs.iter().filter_map(addr_from_message).collect())
    }

    async fn addr_add(&self, dev: &str, addr: Ipv4Net) -> Result<(), NetworkError> {
        let index = self.link_index(dev).await?;
        self.handle()
            .await?
            .address()
            .add(index, IpAddr::V4(addr.addr()), addr.prefix_len())
            .execute()
            .await
            .map_err(|e| classify(&format!("address {} on {}", addr, dev), e))
    }

    async fn route_list(&self, table: u32) -> Result<Vec<Route>, NetworkError> {
        let names = self.link_names().await?;
        let msgs: Vec<RouteMessage> = self
            .handle()
            .await?
            .route()
            .get(IpVersion::V4)
            .execute()
            .try_collect()
            .await
            .map_err(|e| classify(&format!("routes of table {}", table), e))?;
        Ok(msgs
            .iter()
            .filter_map(|m| route_from_message(m, &names))
            .filter(|r| r.table == table)
            .collect())
    }

    async fn route_replace(&self, route: &Route) -> Result<(), NetworkError> {
        let index = self.link_index(&route.dev).await?;
        let mut request = self.handle().await?.route().add().v4().replace();
        *request.message_mut() = route_message(route, Some(index), RouteProtocol::Static);
        request
            .execute()
            .await
            .map_err(|e| classify(&format!("route {:?} table {}", route.dst, route.table), e))
    }

    async fn route_del(&self, route: &Route) -> Result<(), NetworkError> {
        let index = if route.dev.is_empty() {
            None
        } else {
            Some(self.link_index(&route.dev).await?)
        };
        let msg = route_message(route, index, RouteProtocol::Unspec);
        self.handle()
            .await?
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|e| classify(&format!("route {:?} table {}", route.dst, route.table), e))
    }

    async fn rule_list(&self) -> Result<Vec<Rule>, NetworkError> {
        let msgs: Vec<RuleMessage> = self
            .handle()
            .await?
            .rule()
            .get(IpVersion::V4)
            .execute()
            .try_collect()
            .await
            .map_err(|e| classify("rules", e))?;
        Ok(msgs.iter().filter_map(rule_from_message).collect())
    }

    async fn rule_add(&self, rule: &Rule) -> Result<(), NetworkError> {
        let mut request = self.handle().await?.rule().add().v4();
        *request.message_mut() = rule_message(rule);
        request
            .execute()
            .await
            .map_err(|e| classify(&format!("rule priority {}", rule.priority), e))
    }

    async fn rule_del(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.handle()
            .await?
            .rule()
            .del(rule_message(rule))
            .execute()
            .await
            .map_err(|e| classify(&format!("rule priority {}", rule.priority), e))
    }

    async fn neigh_replace(&self, neigh: &Neigh) -> Result<(), NetworkError> {
        let index = self.link_index(&neigh.dev).await?;
        let mac = parse_mac(&neigh.mac)?;
        self.handle()
            .await?
            .neighbours()
            .add(index, IpAddr::V4(neigh.ip))
            .link_local_address(&mac)
            .state(NeighbourState::Permanent)
            .replace()
            .execute()
            .await
            .map_err(|e| classify(&format!("neighbour {} on {}", neigh.ip, neigh.dev), e))
    }

    async fn sysctl_get(&self, key: &str) -> Result<String, NetworkError> {
        let path = sysctl_path(key);
        let value = self.in_own_netns(move || std::fs::read_to_string(path)).await?;
        Ok(value.trim().to_string())
    }

    async fn sysctl_set(&self, key: &str, value: &str) -> Result<(), NetworkError> {
        let path = sysctl_path(key);
        let value = value.to_string();
        self.in_own_netns(move || std::fs::write(path, value)).await
    }

    fn in_netns(&self, netns: &Path) -> Arc<dyn Netlink> {
        Arc::new(RtNetlink {
            netns: Some(netns.to_path_buf()),
            handle: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_core::ErrorMessage;
    use std::num::NonZeroI32;

    fn link(index: u32, name: &str, attrs: Vec<LinkAttribute>) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::IfName(name.to_string()));
        msg.attributes.extend(attrs);
        msg
    }

    fn names() -> HashMap<u32, String> {
        HashMap::from([(3, "eth1".to_string()), (9, "br_260".to_string())])
    }

    #[test]
    fn test_link_from_message() {
        let mut eth1 = link(
            3,
            "eth1",
            vec![
                LinkAttribute::Address(vec![0x52, 0x54, 0x9e, 0x01, 0x02, 0x03]),
                LinkAttribute::IfAlias("hostnic_260".to_string()),
            ],
        );
        eth1.header.flags.push(LinkFlag::Up);
        let parsed = link_from_message(&eth1, &names()).unwrap();
        assert_eq!(parsed.mac, "52:54:9e:01:02:03");
        assert_eq!(parsed.route_table_from_alias(), Some(260));
        assert!(parsed.up);

        let veth = link(
            7,
            "nicabc",
            vec![
                LinkAttribute::Controller(9),
                LinkAttribute::LinkInfo(vec![LinkInfo::Kind(InfoKind::Veth)]),
                LinkAttribute::IfAlias(String::new()),
            ],
        );
        let parsed = link_from_message(&veth, &names()).unwrap();
        assert!(!parsed.up);
        assert_eq!(parsed.alias, None);
        assert_eq!(parsed.master.as_deref(), Some("br_260"));
        assert_eq!(parsed.kind.as_deref(), Some("veth"));

        assert_eq!(link_from_message(&LinkMessage::default(), &names()), None);
    }

    #[test]
    fn test_addr_prefers_local() {
        let mut msg = AddressMessage::default();
        msg.header.prefix_len = 24;
        msg.attributes.push(AddressAttribute::Address(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1))));
        msg.attributes.push(AddressAttribute::Local(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 10))));
        assert_eq!(addr_from_message(&msg), Some("172.16.0.10/24".parse().unwrap()));

        let mut v6 = AddressMessage::default();
        v6.header.prefix_len = 64;
        v6.attributes.push(AddressAttribute::Address("fe80::1".parse().unwrap()));
        assert_eq!(addr_from_message(&v6), None);
    }

    #[test]
    fn test_route_message_round_trips() {
        let route = Route {
            dst: Some("10.0.0.5/32".parse().unwrap()),
            gateway: None,
            dev: "eth1".to_string(),
            table: 260,
            scope: RouteScope::Link,
        };
        let msg = route_message(&route, Some(3), RouteProtocol::Static);
        assert_eq!(msg.header.table, COMPAT_TABLE);
        assert_eq!(route_from_message(&msg, &names()), Some(route));

        let default = Route {
            dst: None,
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dev: "eth1".to_string(),
            table: MAIN_TABLE,
            scope: RouteScope::Universe,
        };
        let msg = route_message(&default, Some(3), RouteProtocol::Unspec);
        assert_eq!(msg.header.table, 254);
        assert_eq!(msg.header.destination_prefix_length, 0);
        assert_eq!(route_from_message(&msg, &names()), Some(default));
    }

    #[test]
    fn test_route_from_message_skips_inet6() {
        let mut msg = RouteMessage::default();
        msg.header.address_family = AddressFamily::Inet6;
        assert_eq!(route_from_message(&msg, &names()), None);
    }

    #[test]
    fn test_rule_message_round_trips() {
        let rules = [
            Rule::to_dst("10.0.0.5/32".parse().unwrap(), MAIN_TABLE, TO_POD_RULE_PRIORITY),
            Rule::from_src("10.0.8.0/24".parse().unwrap(), 261, FROM_POD_RULE_PRIORITY),
            Rule {
                priority: CONNMARK_RULE_PRIORITY,
                src: None,
                dst: None,
                fwmark: Some((0x80, 0x80)),
                table: MAIN_TABLE,
            },
        ];
        for rule in rules {
            assert_eq!(rule_from_message(&rule_message(&rule)), Some(rule));
        }
    }

    #[test]
    fn test_rule_fwmark_without_mask_matches_all_bits() {
        let mut msg = RuleMessage::default();
        msg.header.family = AddressFamily::Inet;
        msg.header.action = RuleAction::ToTable;
        msg.header.table = 254;
        msg.attributes.push(RuleAttribute::FwMark(0x80));
        let rule = rule_from_message(&msg).unwrap();
        assert_eq!(rule.fwmark, Some((0x80, u32::MAX)));
        assert_eq!(rule.table, MAIN_TABLE);
        assert_eq!(rule.priority, 0);

        msg.header.action = RuleAction::Unreachable;
        assert_eq!(rule_from_message(&msg), None);
    }

    #[test]
    fn test_classify_errnos() {
        let kernel = |errno: Errno| {
            let mut msg = ErrorMessage::default();
            msg.code = NonZeroI32::new(-(errno as i32));
            rtnetlink::Error::NetlinkError(msg)
        };
        assert!(matches!(classify("rule", kernel(Errno::EEXIST)), NetworkError::Exists(_)));
        assert!(matches!(classify("route", kernel(Errno::ESRCH)), NetworkError::NotFound(_)));
        assert!(matches!(classify("link", kernel(Errno::ENODEV)), NetworkError::NotFound(_)));
        assert!(matches!(classify("link", kernel(Errno::EPERM)), NetworkError::Netlink { .. }));
    }

    #[test]
    fn test_mac_helpers() {
        assert_eq!(parse_mac("52:54:9E:01:02:03").unwrap(), vec![0x52, 0x54, 0x9e, 1, 2, 3]);
        assert!(parse_mac("52:54:9e").is_err());
        assert!(parse_mac("zz:54:9e:01:02:03").is_err());
        assert_eq!(format_mac(&[0xee, 0xee, 0xee, 0, 0, 1]), "ee:ee:ee:00:00:01");
        assert_eq!(sysctl_path("net.ipv4.conf.eth1.rp_filter"), Path::new("/proc/sys/net/ipv4/conf/eth1/rp_filter"));
    }
}
