//! Node-global rules
//!
//! Pod traffic leaving the node for anything outside the IP pools is
//! SNATed to the primary address. With node-port support, connections
//! that arrive on the primary NIC are connmarked so their replies from a
//! pod are routed back through the main table instead of the pod's NIC.

use crate::command::args;
use crate::error::{NetworkError, NetworkResultExt};
use crate::firewall::RuleSpec;
use crate::programmer::NetworkProgrammer;
use crate::types::*;
use ipnet::Ipv4Net;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// ipset holding every pool CIDR
pub const IPPOOL_SET: &str = "hostnic-ippools";
pub const SNAT_CHAIN: &str = "QINGCLOUD-SNAT-CHAIN";
pub const CONNMARK_CHAIN: &str = "QINGCLOUD-PREROUTING-CHAIN";

impl NetworkProgrammer {
    fn snat_rules(&self) -> Vec<RuleSpec> {
        if self.config.external_snat {
            return Vec::new();
        }
        let mut rule = args([
            "-m", "comment", "--comment", "hostnic-snat", "-m", "set", "!", "--match-set", IPPOOL_SET, "dst", "-m",
            "addrtype", "!", "--dst-type", "LOCAL", "-j", "SNAT", "--to-source",
        ]);
        rule.push(self.config.primary_ip.to_string());
        if let Some(flag) = self.config.snat_mode.flag() {
            rule.push(flag.to_string());
        }
        vec![rule]
    }

    fn snat_jump(&self) -> RuleSpec {
        args([
            "-m", "comment", "--comment", "hostnic-snat", "-m", "set", "--match-set", IPPOOL_SET, "src", "-j",
            SNAT_CHAIN,
        ])
    }

    fn forward_rules(&self) -> Vec<RuleSpec> {
        let wildcard = format!("{}+", self.config.veth_prefix);
        vec![
            args(["-m", "comment", "--comment", "hostnic-forward", "-i", wildcard.as_str(), "-j", "ACCEPT"]),
            args(["-m", "comment", "--comment", "hostnic-forward", "-o", wildcard.as_str(), "-j", "ACCEPT"]),
        ]
    }

    fn connmark_rules(&self) -> Vec<RuleSpec> {
        let mark = format!("{:#x}", self.config.connmark);
        let both = format!("{}/{}", mark, mark);
        let clear = format!("0x0/{}", mark);
        let wildcard = format!("{}+", self.config.veth_prefix);
        vec![
            // pod to pod connections never carry the node-port mark
            args([
                "-m",
                "comment",
                "--comment",
                "hostnic-connmark",
                "-i",
                wildcard.as_str(),
                "-m",
                "set",
                "--match-set",
                IPPOOL_SET,
                "dst",
                "-j",
                "CONNMARK",
                "--set-xmark",
                clear.as_str(),
            ]),
            args([
                "-m",
                "comment",
                "--comment",
                "hostnic-connmark",
                "-i",
                self.config.primary_nic.as_str(),
                "-m",
                "addrtype",
                "--dst-type",
                "LOCAL",
                "--limit-iface-in",
                "-j",
                "CONNMARK",
                "--set-xmark",
                both.as_str(),
            ]),
            args([
                "-m",
                "comment",
                "--comment",
                "hostnic-connmark",
                "-i",
                wildcard.as_str(),
                "-j",
                "CONNMARK",
                "--restore-mark",
                "--nfmask",
                mark.as_str(),
                "--ctmask",
                mark.as_str(),
            ]),
        ]
    }

    fn connmark_jump(&self) -> RuleSpec {
        args(["-m", "comment", "--comment", "hostnic-connmark", "-j", CONNMARK_CHAIN])
    }

    fn connmark_rule(&self) -> Rule {
        Rule {
            priority: CONNMARK_RULE_PRIORITY,
            src: None,
            dst: None,
            fwmark: Some((self.config.connmark, self.config.connmark)),
            table: MAIN_TABLE,
        }
    }

    /// Make `chain` hold exactly `desired`, rewriting it only when it differs
    async fn sync_chain(&self, table: &str, chain: &str, desired: &[RuleSpec]) -> Result<(), NetworkError> {
        if !self.firewall.chain_exists(table, chain).await? {
            self.firewall.new_chain(table, chain).await.ignore_exists()?;
        }
        let current = self.firewall.list_rules(table, chain).await?;
        let mut in_sync = current.len() == desired.len();
        for rule in desired {
            if !in_sync {
                break;
            }
            in_sync = self.firewall.rule_exists(table, chain, rule).await?;
        }
        if in_sync {
            debug!("{}/{} already in sync", table, chain);
            return Ok(());
        }

        self.firewall.flush_chain(table, chain).await?;
        for rule in desired {
            self.firewall.append(table, chain, rule).await?;
        }
        info!("Rewrote {}/{} with {} rules", table, chain, desired.len());
        Ok(())
    }

    async fn ensure_append(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), NetworkError> {
        if !self.firewall.rule_exists(table, chain, rule).await? {
            self.firewall.append(table, chain, rule).await?;
        }
        Ok(())
    }

    async fn ensure_insert(&self, table: &str, chain: &str, rule: &[String]) -> Result<(), NetworkError> {
        if !self.firewall.rule_exists(table, chain, rule).await? {
            self.firewall.insert(table, chain, rule).await?;
        }
        Ok(())
    }

    /// Install node-global sysctls, the pool ipset, SNAT, forward and connmark rules
    pub async fn setup_node_network(&self) -> Result<(), NetworkError> {
        let cfg = &self.config;
        self.netlink.sysctl_set("net.ipv4.ip_forward", "1").await?;
        self.netlink
            .sysctl_set(&format!("net.ipv4.conf.{}.rp_filter", cfg.primary_nic), "2")
            .await?;
        self.netlink.sysctl_set("net.ipv4.conf.all.rp_filter", "0").await?;

        self.firewall.ipset_create(IPPOOL_SET).await.ignore_exists()?;

        self.sync_chain("nat", SNAT_CHAIN, &self.snat_rules()).await?;
        self.ensure_append("nat", "POSTROUTING", &self.snat_jump()).await?;

        for rule in self.forward_rules() {
            self.ensure_insert("filter", "FORWARD", &rule).await?;
        }

        if cfg.node_port_support {
            self.sync_chain("mangle", CONNMARK_CHAIN, &self.connmark_rules()).await?;
            self.ensure_insert("mangle", "PREROUTING", &self.connmark_jump()).await?;
            self.ensure_rule(&self.connmark_rule()).await?;
        } else {
            let jump = self.connmark_jump();
            if self.firewall.rule_exists("mangle", "PREROUTING", &jump).await? {
                self.firewall.delete("mangle", "PREROUTING", &jump).await.ignore_not_found()?;
            }
            if self.firewall.chain_exists("mangle", CONNMARK_CHAIN).await? {
                self.firewall.delete_chain("mangle", CONNMARK_CHAIN).await.ignore_not_found()?;
            }
            self.remove_rule(&self.connmark_rule()).await?;
        }

        info!(
            "Node network ready: primary {} ({}), external SNAT {}, node port {}",
            cfg.primary_nic, cfg.primary_ip, cfg.external_snat, cfg.node_port_support
        );
        Ok(())
    }

    /// Make the pool ipset hold exactly `pools`
    pub async fn sync_ippool_set(&self, pools: &[Ipv4Net]) -> Result<(), NetworkError> {
        self.firewall.ipset_create(IPPOOL_SET).await.ignore_exists()?;
        let wanted: BTreeSet<String> = pools.iter().map(|p| p.trunc().to_string()).collect();
        let current: BTreeSet<String> = self.firewall.ipset_list(IPPOOL_SET).await?.into_iter().collect();

        for entry in wanted.difference(&current) {
            self.firewall.ipset_add(IPPOOL_SET, entry).await.ignore_exists()?;
        }
        for entry in current.difference(&wanted) {
            self.firewall.ipset_del(IPPOOL_SET, entry).await.ignore_not_found()?;
        }
        if wanted != current {
            info!("Synced {} with {} pools", IPPOOL_SET, wanted.len());
        }
        Ok(())
    }
}
