//! CNI network configuration written at startup

use crate::error::AgentError;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tracing::info;

pub const CNI_VERSION: &str = "0.4.0";
pub const NETWORK_NAME: &str = "hostnic";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Plugin<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    veth_prefix: &'a str,
    socket: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfList<'a> {
    cni_version: &'a str,
    name: &'a str,
    plugins: Vec<Plugin<'a>>,
}

/// Conflist content for this node
pub fn render(veth_prefix: &str, socket: &Path) -> Result<String, AgentError> {
    let socket = socket.to_string_lossy();
    let conf = ConfList {
        cni_version: CNI_VERSION,
        name: NETWORK_NAME,
        plugins: vec![Plugin {
            kind: NETWORK_NAME,
            veth_prefix,
            socket: &socket,
        }],
    };
    Ok(serde_json::to_string_pretty(&conf)?)
}

/// Write the conflist unless one is already there. Returns whether it wrote.
pub fn write_if_absent(path: &Path, veth_prefix: &str, socket: &Path) -> Result<bool, AgentError> {
    if path.exists() {
        info!("CNI config {} already present", path.display());
        return Ok(false);
    }
    let dir = path
        .parent()
        .ok_or_else(|| AgentError::InvalidConfig(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(render(veth_prefix, socket)?.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| AgentError::Store(format!("persist {}: {}", path.display(), e.error)))?;
    info!("Wrote CNI config {}", path.display());
    Ok(true)
}
