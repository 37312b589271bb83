//! Host networking programmer
//!
//! Installs and removes the kernel state that steers a pod's traffic through
//! its vNIC:
//! - per-NIC routing table, source rules and rp_filter
//! - node-global SNAT, forward and connmark rules plus the `hostnic-ippools` ipset
//! - veth wiring into the pod network namespace and ebtables ARP replies
//!
//! Kernel access goes through the [`Netlink`] and [`Firewall`] traits.
//! [`RtNetlink`] talks rtnetlink; [`CommandFirewall`] drives `iptables`,
//! `ipset` and `ebtables`. [`FakeKernel`] (feature `test-util`) keeps
//! everything in memory.

pub mod command;
pub mod config;
pub mod error;
pub mod firewall;
pub mod monitor;
pub mod netlink;
mod netns;
mod nic;
mod pod;
pub mod programmer;
mod snat;
pub mod types;
#[cfg(feature = "test-util")]
pub mod fake;

pub use config::{NetworkConfig, SnatMode};
pub use error::{NetworkError, NetworkResultExt};
pub use firewall::{CommandFirewall, Firewall};
pub use monitor::{LinkEvent, LinkEventKind, LinkMonitor, link_event};
pub use netlink::{Netlink, RtNetlink};
pub use programmer::{NetworkProgrammer, PodNetwork, PodNetworkResult, discover_primary};
pub use snat::{CONNMARK_CHAIN, IPPOOL_SET, SNAT_CHAIN};
pub use types::*;
#[cfg(feature = "test-util")]
pub use fake::{FakeKernel, KernelState};
