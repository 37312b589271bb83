//! Command execution for the kernel-facing implementations
//!
//! Non-zero exits are classified from stderr so callers can tolerate
//! "already exists" and "does not exist" the same way for every tool.

use crate::error::NetworkError;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

const EXISTS_MARKERS: &[&str] = &["already exists", "already added", "Set cannot be created"];

const NOT_FOUND_MARKERS: &[&str] = &[
    "No such file or directory",
    "does not exist",
    "No such process",
    "No chain/target/match by that name",
    "Bad rule (does a matching rule exist",
    "doesn't exist",
    "not found",
    "is NOT in set",
    "Illegal target name",
];

/// Run `program args..` and return stdout
pub async fn exec(program: &str, args: &[String]) -> Result<String, NetworkError> {
    debug!("exec {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let command = format!("{} {}", program, args.join(" "));
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(classify(command, stderr, output.status.code()))
}

/// Run a check command (`iptables -C` and friends); exit status 1 means "no"
pub async fn check(program: &str, args: &[String]) -> Result<bool, NetworkError> {
    match exec(program, args).await {
        Ok(_) => Ok(true),
        Err(NetworkError::NotFound(_)) => Ok(false),
        Err(NetworkError::Command { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) fn classify(command: String, stderr: String, _code: Option<i32>) -> NetworkError {
    if EXISTS_MARKERS.iter().any(|m| stderr.contains(m)) {
        return NetworkError::Exists(format!("{}: {}", command, stderr));
    }
    if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) {
        return NetworkError::NotFound(format!("{}: {}", command, stderr));
    }
    NetworkError::Command { command, stderr }
}

/// Turn `&str` args into owned strings
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
