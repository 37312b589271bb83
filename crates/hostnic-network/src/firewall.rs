//! iptables, ipset and ebtables
//!
//! Rules are passed as argument vectors (the part after `-A <chain>`), which
//! is also what `-C`/`-D` take, so existence checks and deletes use the exact
//! spec that was installed.

use crate::command::{args, check, exec};
use crate::error::NetworkError;
use crate::types::normalize_mac;

/// A rule spec, e.g. `["-i", "nic+", "-j", "ACCEPT"]`
pub type RuleSpec = Vec<String>;

/// Trait for packet-filter programming
#[async_trait::async_trait]
pub trait Firewall: Send + Sync {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, NetworkError>;
    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError>;
    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError>;
    /// Flush and remove a custom chain
    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError>;
    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>, NetworkError>;
    async fn rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, NetworkError>;
    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError>;
    /// Insert at the head of the chain
    async fn insert(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError>;
    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError>;

    /// Create a `hash:net` set if missing
    async fn ipset_create(&self, name: &str) -> Result<(), NetworkError>;
    async fn ipset_list(&self, name: &str) -> Result<Vec<String>, NetworkError>;
    async fn ipset_add(&self, name: &str, entry: &str) -> Result<(), NetworkError>;
    async fn ipset_del(&self, name: &str, entry: &str) -> Result<(), NetworkError>;

    async fn eb_rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, NetworkError>;
    async fn eb_append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError>;
    async fn eb_delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError>;
}

/// Command-backed `Firewall`
#[derive(Debug, Clone, Default)]
pub struct CommandFirewall;

impl CommandFirewall {
    pub fn new() -> Self {
        Self
    }

    fn ipt(table: &str, op: &str, chain: &str, spec: &[String]) -> Vec<String> {
        let mut parts = args(["-w", "-t", table, op, chain]);
        parts.extend(spec.iter().cloned());
        parts
    }
}

/// Parse `iptables -S <chain>` output into rule specs
pub(crate) fn parse_iptables_save(output: &str, chain: &str) -> Vec<RuleSpec> {
    let prefix = format!("-A {} ", chain);
    output
        .lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|rest| rest.split_whitespace().map(|s| s.trim_matches('"').to_string()).collect())
        .collect()
}

/// Parse `ipset save <name>` output into entries
pub(crate) fn parse_ipset_save(output: &str, name: &str) -> Vec<String> {
    let prefix = format!("add {} ", name);
    output
        .lines()
        .filter_map(|line| line.strip_prefix(&prefix))
        .map(|entry| entry.trim().to_string())
        .collect()
}

/// Normalize an ebtables rule so listed and requested forms compare equal
pub(crate) fn normalize_eb_rule(spec: &[String]) -> Vec<String> {
    spec.iter()
        .map(|token| {
            if token.split(':').count() == 6 {
                normalize_mac(token)
            } else {
                token.clone()
            }
        })
        .collect()
}

/// Parse `ebtables -t <table> -L <chain>` output into normalized rules
pub(crate) fn parse_ebtables_list(output: &str) -> Vec<Vec<String>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('-'))
        .map(|line| {
            let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            normalize_eb_rule(&tokens)
        })
        .collect()
}

#[async_trait::async_trait]
impl Firewall for CommandFirewall {
    async fn chain_exists(&self, table: &str, chain: &str) -> Result<bool, NetworkError> {
        check("iptables", &Self::ipt(table, "-S", chain, &[])).await
    }

    async fn new_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError> {
        exec("iptables", &Self::ipt(table, "-N", chain, &[])).await.map(|_| ())
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError> {
        exec("iptables", &Self::ipt(table, "-F", chain, &[])).await.map(|_| ())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<(), NetworkError> {
        self.flush_chain(table, chain).await?;
        exec("iptables", &Self::ipt(table, "-X", chain, &[])).await.map(|_| ())
    }

    async fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<RuleSpec>, NetworkError> {
        let out = exec("iptables", &Self::ipt(table, "-S", chain, &[])).await?;
        Ok(parse_iptables_save(&out, chain))
    }

    async fn rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, NetworkError> {
        check("iptables", &Self::ipt(table, "-C", chain, spec)).await
    }

    async fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        exec("iptables", &Self::ipt(table, "-A", chain, spec)).await.map(|_| ())
    }

    async fn insert(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        exec("iptables", &Self::ipt(table, "-I", chain, spec)).await.map(|_| ())
    }

    async fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        exec("iptables", &Self::ipt(table, "-D", chain, spec)).await.map(|_| ())
    }

    async fn ipset_create(&self, name: &str) -> Result<(), NetworkError> {
        exec("ipset", &args(["create", name, "hash:net", "-exist"])).await.map(|_| ())
    }

    async fn ipset_list(&self, name: &str) -> Result<Vec<String>, NetworkError> {
        let out = exec("ipset", &args(["save", name])).await?;
        Ok(parse_ipset_save(&out, name))
    }

    async fn ipset_add(&self, name: &str, entry: &str) -> Result<(), NetworkError> {
        exec("ipset", &args(["add", name, entry, "-exist"])).await.map(|_| ())
    }

    async fn ipset_del(&self, name: &str, entry: &str) -> Result<(), NetworkError> {
        exec("ipset", &args(["del", name, entry, "-exist"])).await.map(|_| ())
    }

    async fn eb_rule_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool, NetworkError> {
        let out = exec("ebtables", &args(["-t", table, "-L", chain])).await?;
        let wanted = normalize_eb_rule(spec);
        Ok(parse_ebtables_list(&out).contains(&wanted))
    }

    async fn eb_append(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        let mut parts = args(["-t", table, "-A", chain]);
        parts.extend(spec.iter().cloned());
        exec("ebtables", &parts).await.map(|_| ())
    }

    async fn eb_delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<(), NetworkError> {
        let mut parts = args(["-t", table, "-D", chain]);
        parts.extend(spec.iter().cloned());
        exec("ebtables", &parts).await.map(|_| ())
    }
}
