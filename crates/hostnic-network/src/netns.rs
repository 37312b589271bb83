//! Switching the calling thread into a pod network namespace

use crate::error::NetworkError;
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::path::Path;
use tracing::error;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Keeps the current thread in another network namespace until dropped.
///
/// Nothing may be awaited while a guard is alive: the task could resume on
/// another worker and leave this thread behind in the pod namespace.
#[derive(Debug)]
pub(crate) struct NetnsGuard {
    origin: File,
}

impl NetnsGuard {
    pub(crate) fn enter(path: &Path) -> Result<Self, NetworkError> {
        let origin = File::open(THREAD_NETNS)?;
        let target = open_netns(path)?;
        setns(&target, CloneFlags::CLONE_NEWNET)
            .map_err(|e| NetworkError::Netns(format!("enter {}: {}", path.display(), e)))?;
        Ok(Self { origin })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.origin, CloneFlags::CLONE_NEWNET) {
            error!("Failed to return to the original network namespace: {}", e);
        }
    }
}

/// Open a namespace file; a missing path is `NotFound`
pub(crate) fn open_netns(path: &Path) -> Result<File, NetworkError> {
    File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => NetworkError::NotFound(format!("netns {}", path.display())),
        _ => NetworkError::Io(e),
    })
}
