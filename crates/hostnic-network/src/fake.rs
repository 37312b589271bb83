//! In-memory kernel for unit testing
//!
//! Implements both [`Netlink`] and [`Firewall`] over a [`KernelState`] that
//! tests can snapshot and compare. Deleting a link drops its addresses,
//! routes and neighbours the way the kernel does.

use crate::error::NetworkError;
use crate::firewall::{Firewall, RuleSpec};
use crate::netlink::Netlink;
use crate::types::*;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

const HOST_NS: &str = "";

const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

/// One network namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NsState {
    pub links: BTreeMap<String, Link>,
    pub addrs: BTreeMap<String, BTreeSet<Ipv4Net>>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
    pub neighs: BTreeSet<Neigh>,
}

/// Everything the fake kernel holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    /// Namespaces keyed by netns path, `""` is the host
    pub netns: BTreeMap<String, NsState>,
    /// veth host end to (peer netns, peer name)
    pub veth_peers: BTreeMap<String, (String, String)>,
    /// (table, chain) to rules; builtin chains are present only when non-empty
    pub iptables: BTreeMap<(String, String), Vec<RuleSpec>>,
    pub ipsets: BTreeMap<String, BTreeSet<String>>,
    pub ebtables: BTreeMap<(String, String), Vec<RuleSpec>>,
    pub sysctls: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: KernelState,
    next_mac: u32,
}

/// Fake kernel for tests
#[derive(Debug, Clone)]
pub struct FakeKernel {
    shared: Arc<Mutex<Shared>>,
    ns: String,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// Empty host namespace with `lo`
    pub fn new() -> Self {
        let mut state = KernelState::default();
        let mut host = NsState::default();
        host.links.insert(
            "lo".to_string(),
            Link {
                name: "lo".to_string(),
                mac: "00:00:00:00:00:00".to_string(),
                up: true,
                ..Link::default()
            },
        );
        state.netns.insert(HOST_NS.to_string(), host);
        state
            .sysctls
            .insert("net.ipv4.conf.default.rp_filter".to_string(), "1".to_string());
        state
            .sysctls
            .insert("net.ipv4.conf.all.rp_filter".to_string(), "1".to_string());
        Self {
            shared: Arc::new(Mutex::new(Shared { state, next_mac: 0 })),
            ns: HOST_NS.to_string(),
        }
    }

    /// Add a physical link to the host (a NIC whose attach completed)
    pub fn add_link(&self, name: &str, mac: &str) {
        let mut shared = self.shared.lock().unwrap();
        let ns = shared.state.netns.entry(HOST_NS.to_string()).or_default();
        ns.links.insert(
            name.to_string(),
            Link {
                name: name.to_string(),
                mac: mac.to_lowercase(),
                ..Link::default()
            },
        );
        shared
            .state
            .sysctls
            .insert(format!("net.ipv4.conf.{}.rp_filter", name), "1".to_string());
    }

    /// Add an address to a host link
    pub fn add_addr(&self, dev: &str, addr: Ipv4Net) {
        let mut shared = self.shared.lock().unwrap();
        let ns = shared.state.netns.entry(HOST_NS.to_string()).or_default();
        ns.addrs.entry(dev.to_string()).or_default().insert(addr);
    }

    /// Add a host route (test setup)
    pub fn add_route(&self, route: Route) {
        let mut shared = self.shared.lock().unwrap();
        let ns = shared.state.netns.entry(HOST_NS.to_string()).or_default();
        ns.routes.push(route);
    }

    /// Create an empty namespace at `path`
    pub fn add_netns(&self, path: &str) {
        let mut shared = self.shared.lock().unwrap();
        shared.state.netns.entry(path.to_string()).or_default();
    }

    /// Remove a host link behind the programmer's back (NIC detached)
    pub fn remove_link(&self, name: &str) {
        let mut shared = self.shared.lock().unwrap();
        Self::drop_link(&mut shared.state, HOST_NS, name);
    }

    /// Copy of the whole kernel state
    pub fn snapshot(&self) -> KernelState {
        self.shared.lock().unwrap().state.clone()
    }

    fn with_ns<T>(&self, f: impl FnOnce(&mut NsState) -> Result<T, NetworkError>) -> Result<T, NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let ns = shared
            .state
            .netns
            .get_mut(&self.ns)
            .ok_or_else(|| NetworkError::NotFound(format!("netns {}", self.ns)))?;
        f(ns)
    }

    fn drop_link(state: &mut KernelState, ns_key: &str, name: &str) {
        if let Some(ns) = state.netns.get_mut(ns_key) {
            ns.links.remove(name);
            ns.addrs.remove(name);
            ns.routes.retain(|r| r.dev != name);
            ns.neighs.retain(|n| n.dev != name);
            for link in ns.links.values_mut() {
                if link.master.as_deref() == Some(name) {
                    link.master = None;
                }
            }
        }
        if ns_key == HOST_NS {
            let prefix = format!("net.ipv4.conf.{}.", name);
            state.sysctls.retain(|k, _| !k.starts_with(&prefix));
            if let Some((peer_ns, peer)) = state.veth_peers.remove(name) {
                Self::drop_link(state, &peer_ns, &peer);
            }
        }
    }

    fn chain_key(table: &str, chain: &str) -> (String, String) {
        (table.to_string(), chain.to_string())
    }

    fn is_builtin(chain: &str) -> bool {
        BUILTIN_CHAINS.contains(&chain)
    }
}

#[async_trait::async_trait]
impl Netlink for FakeKernel {
    async fn link_list(&self) -> Result<Vec<Link>, NetworkError> {
        self.with_ns(|ns| Ok(ns.links.values().cloned().collect()))
    }

    async fn link_by_name(&self, name: &str) -> Result<Option<Link>, NetworkError> {
        self.with_ns(|ns| Ok(ns.links.get(name).cloned()))
    }

    async fn link_by_mac(&self, mac: &str) -> Result<Option<Link>, NetworkError> {
        let mac = mac.to_lowercase();
        self.with_ns(|ns| Ok(ns.links.values().find(|l| l.mac == mac).cloned()))
    }

    async fn link_set_up(&self, name: &str) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            let link = ns.links.get_mut(name).ok_or_else(|| NetworkError::LinkNotFound(name.to_string()))?;
            link.up = true;
            Ok(())
        })
    }

    async fn link_set_down(&self, name: &str) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            let link = ns.links.get_mut(name).ok_or_else(|| NetworkError::LinkNotFound(name.to_string()))?;
            link.up = false;
            Ok(())
        })
    }

    async fn link_set_alias(&self, name: &str, alias: Option<&str>) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            let link = ns.links.get_mut(name).ok_or_else(|| NetworkError::LinkNotFound(name.to_string()))?;
            link.alias = alias.filter(|a| !a.is_empty()).map(str::to_string);
            Ok(())
        })
    }

    async fn link_set_master(&self, name: &str, master: Option<&str>) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            if let Some(m) = master {
                if !ns.links.contains_key(m) {
                    return Err(NetworkError::LinkNotFound(m.to_string()));
                }
            }
            let link = ns.links.get_mut(name).ok_or_else(|| NetworkError::LinkNotFound(name.to_string()))?;
            link.master = master.map(str::to_string);
            Ok(())
        })
    }

    async fn bridge_add(&self, name: &str) -> Result<(), NetworkError> {
        let mac = {
            let mut shared = self.shared.lock().unwrap();
            shared.next_mac += 1;
            format!("02:00:00:00:{:02x}:{:02x}", (shared.next_mac >> 8) & 0xff, shared.next_mac & 0xff)
        };
        self.with_ns(|ns| {
            if ns.links.contains_key(name) {
                return Err(NetworkError::Exists(name.to_string()));
            }
            ns.links.insert(
                name.to_string(),
                Link {
                    name: name.to_string(),
                    mac,
                    kind: Some("bridge".to_string()),
                    ..Link::default()
                },
            );
            Ok(())
        })
    }

    async fn veth_add(&self, host: &str, peer: &str, netns: &Path) -> Result<(), NetworkError> {
        let peer_ns = netns.to_string_lossy().into_owned();
        let mut shared = self.shared.lock().unwrap();
        shared.next_mac += 1;
        let n = shared.next_mac;
        let host_mac = format!("ee:ee:ee:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff);
        let peer_mac = format!("02:aa:aa:00:{:02x}:{:02x}", (n >> 8) & 0xff, n & 0xff);
        let state = &mut shared.state;

        if !state.netns.contains_key(&peer_ns) {
            return Err(NetworkError::NotFound(format!("netns {}", peer_ns)));
        }
        let host_exists = state
            .netns
            .get(&self.ns)
            .is_some_and(|ns| ns.links.contains_key(host));
        let peer_exists = state
            .netns
            .get(&peer_ns)
            .is_some_and(|ns| ns.links.contains_key(peer));
        if host_exists || peer_exists {
            return Err(NetworkError::Exists(format!("{}/{}", host, peer)));
        }

        let kind = Some("veth".to_string());
        if let Some(ns) = state.netns.get_mut(&self.ns) {
            ns.links.insert(
                host.to_string(),
                Link { name: host.to_string(), mac: host_mac, kind: kind.clone(), ..Link::default() },
            );
        }
        if let Some(ns) = state.netns.get_mut(&peer_ns) {
            ns.links.insert(
                peer.to_string(),
                Link { name: peer.to_string(), mac: peer_mac, kind, ..Link::default() },
            );
        }
        state.veth_peers.insert(host.to_string(), (peer_ns, peer.to_string()));
        Ok(())
    }

    async fn link_del(&self, name: &str) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let exists = shared
            .state
            .netns
            .get(&self.ns)
            .is_some_and(|ns| ns.links.contains_key(name));
        if !exists {
            return Err(NetworkError::LinkNotFound(name.to_string()));
        }
        Self::drop_link(&mut shared.state, &self.ns.clone(), name);
        Ok(())
    }

    async fn addr_list(&self, dev: &str) -> Result<Vec<Ipv4Net>, NetworkError> {
        self.with_ns(|ns| Ok(ns.addrs.get(dev).map(|a| a.iter().copied().collect()).unwrap_or_default()))
    }

    async fn addr_add(&self, dev: &str, addr: Ipv4Net) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            if !ns.links.contains_key(dev) {
                return Err(NetworkError::LinkNotFound(dev.to_string()));
            }
            if !ns.addrs.entry(dev.to_string()).or_default().insert(addr) {
                return Err(NetworkError::Exists(format!("{} on {}", addr, dev)));
            }
            Ok(())
        })
    }

    async fn route_list(&self, table: u32) -> Result<Vec<Route>, NetworkError> {
        self.with_ns(|ns| Ok(ns.routes.iter().filter(|r| r.table == table).cloned().collect()))
    }

    async fn route_replace(&self, route: &Route) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            if !ns.links.contains_key(&route.dev) {
                return Err(NetworkError::LinkNotFound(route.dev.clone()));
            }
            match ns.routes.iter_mut().find(|r| r.same_key(route)) {
                Some(existing) => *existing = route.clone(),
                None => ns.routes.push(route.clone()),
            }
            Ok(())
        })
    }

    async fn route_del(&self, route: &Route) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            let before = ns.routes.len();
            ns.routes.retain(|r| !r.same_key(route));
            if ns.routes.len() == before {
                return Err(NetworkError::NotFound(format!("route {:?}", route.dst)));
            }
            Ok(())
        })
    }

    async fn rule_list(&self) -> Result<Vec<Rule>, NetworkError> {
        self.with_ns(|ns| Ok(ns.rules.clone()))
    }

    async fn rule_add(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            ns.rules.push(rule.clone());
            ns.rules.sort_by_key(|r| r.priority);
            Ok(())
        })
    }

    async fn rule_del(&self, rule: &Rule) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            let pos = ns
                .rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| NetworkError::NotFound(format!("rule {:?}", rule)))?;
            ns.rules.remove(pos);
            Ok(())
        })
    }

    async fn neigh_replace(&self, neigh: &Neigh) -> Result<(), NetworkError> {
        self.with_ns(|ns| {
            if !ns.links.contains_key(&neigh.dev) {
                return Err(NetworkError::LinkNotFound(neigh.dev.clone()));
            }
            ns.neighs.retain(|n| !(n.ip == neigh.ip && n.dev == neigh.dev));
            ns.neighs.insert(neigh.clone());
            Ok(())
        })
    }

    async fn sysctl_get(&self, key: &str) -> Result<String, NetworkError> {
        self.shared
            .lock()
            .unwrap()
            .state
            .sysctls
            .get(key)
            .cloned()
            .ok_or_else(|| NetworkError::NotFound(key.to_string()))
    }

    async fn sysctl_set(&self, key: &str, value: &str) -> Result<(), NetworkError> {
        self.shared
            .lock()
            .unwrap()
            .state
            .sysctls
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn in_netns(&self, netns: &Path) -> Arc<dyn Netlink> {
        Arc::new(FakeKernel {
            shared: Arc::clone(&self.shared),
            ns: netns.to_string_lossy().into_owned(),
        })
    }
}

#[async_trait::async_trait]
impl Firewall for FakeKernel {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, NetworkError> {
        if Self::is_builtin(chain) {
            return Ok(true);
        }
        Ok(self
            .shared
            .lock()
            .unwrap()
            .state
            .iptables
            .contains_key(&Self::chain_key(table, chain)))
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let key = Self::chain_key(table, chain);
        if Self::is_builtin(chain) || shared.state.iptables.contains_key(&key) {
            return Err(NetworkError::Exists(format!("{}/{}", table, chain)));
        }
        shared.state.iptables.insert(key, Vec::new());
        Ok(())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let key = Self::chain_key(table, chain);
        if Self::is_builtin(chain) {
            shared.state.iptables.remove(&key);
            return Ok(());
        }
        let rules = shared
            .state
            .iptables
            .get_mut(&key)
            .ok_or_else(|| NetworkError::NotFound(format!("{}/{}", table, chain)))?;
        rules.clear();
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        shared
            .state
            .iptables
            .remove(&Self::chain_key(table, chain))
            .map(|_| ())
            .ok_or_else(|| NetworkError::NotFound(format!("{}/{}", table, chain)))
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>, NetworkError> {
        let shared = self.shared.lock().unwrap();
        match shared.state.iptables.get(&Self::chain_key(table, chain)) {
            Some(rules) => Ok(rules.clone()),
            None if Self::is_builtin(chain) => Ok(Vec::new()),
            None => Err(NetworkError::NotFound(format!("{}/{}", table, chain))),
        }
    }

    async fn rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, NetworkError> {
        let shared = self.shared.lock().unwrap();
        Ok(shared
            .state
            .iptables
            .get(&Self::chain_key(table, chain))
            .is_some_and(|rules| rules.iter().any(|r| r.as_slice() == spec)))
    }

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let key = Self::chain_key(table, chain);
        if !Self::is_builtin(chain) && !shared.state.iptables.contains_key(&key) {
            return Err(NetworkError::NotFound(format!("{}/{}", table, chain)));
        }
        shared.state.iptables.entry(key).or_default().push(spec.to_vec());
        Ok(())
    }

    async fn insert(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let key = Self::chain_key(table, chain);
        if !Self::is_builtin(chain) && !shared.state.iptables.contains_key(&key) {
            return Err(NetworkError::NotFound(format!("{}/{}", table, chain)));
        }
        shared.state.iptables.entry(key).or_default().insert(0, spec.to_vec());
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let key = Self::chain_key(table, chain);
        let rules = shared
            .state
            .iptables
            .get_mut(&key)
            .ok_or_else(|| NetworkError::NotFound(format!("{}/{}", table, chain)))?;
        let pos = rules
            .iter()
            .position(|r| r.as_slice() == spec)
            .ok_or_else(|| NetworkError::NotFound(spec.join(" ")))?;
        rules.remove(pos);
        if rules.is_empty() && Self::is_builtin(chain) {
            shared.state.iptables.remove(&key);
        }
        Ok(())
    }

    async fn ipset_create(&self, name: &str) -> Result<(), NetworkError> {
        self.shared
            .lock()
            .unwrap()
            .state
            .ipsets
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn ipset_list(&self, name: &str) -> Result<Vec<String>, NetworkError> {
        self.shared
            .lock()
            .unwrap()
            .state
            .ipsets
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .ok_or_else(|| NetworkError::NotFound(name.to_string()))
    }

    async fn ipset_add(&self, name: &str, entry: &str) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let set = shared
            .state
            .ipsets
            .get_mut(name)
            .ok_or_else(|| NetworkError::NotFound(name.to_string()))?;
        set.insert(entry.to_string());
        Ok(())
    }

    async fn ipset_del(&self, name: &str, entry: &str) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(set) = shared.state.ipsets.get_mut(name) {
            set.remove(entry);
        }
        Ok(())
    }

    async fn eb_rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, NetworkError> {
        let shared = self.shared.lock().unwrap();
        Ok(shared
            .state
            .ebtables
            .get(&Self::chain_key(table, chain))
            .is_some_and(|rules| rules.iter().any(|r| r.as_slice() == spec)))
    }

    async fn eb_append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        self.shared
            .lock()
            .unwrap()
            .state
            .ebtables
            .entry(Self::chain_key(table, chain))
            .or_default()
            .push(spec.to_vec());
        Ok(())
    }

    async fn eb_delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        let mut shared = self.shared.lock().unwrap();
        let key = Self::chain_key(table, chain);
        let rules = shared
            .state
            .ebtables
            .get_mut(&key)
            .ok_or_else(|| NetworkError::NotFound(spec.join(" ")))?;
        let pos = rules
            .iter()
            .position(|r| r.as_slice() == spec)
            .ok_or_else(|| NetworkError::NotFound(spec.join(" ")))?;
        rules.remove(pos);
        if rules.is_empty() {
            shared.state.ebtables.remove(&key);
        }
        Ok(())
    }
}
