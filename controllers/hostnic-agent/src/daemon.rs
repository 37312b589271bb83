//! Background loops of the agent
//!
//! Each loop runs until its `watch` receiver reads `true` or the sender is
//! dropped. Errors are logged and retried on the next tick, except
//! [`AgentError::InvalidState`], which ends the loop and the process.

use crate::allocator::NicAllocator;
use crate::error::AgentError;
use crate::k8s::ippool_cidrs;
use hostnic_network::{LinkEvent, LinkEventKind, NetworkProgrammer};
use ipam::{IpamEngine, LivePod};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Job polling and convergence
pub const JOB_TICK: Duration = Duration::from_secs(5);
/// Convergence plus pool rebalancing
pub const NODE_TICK: Duration = Duration::from_secs(30);
pub const REPAIR_TICK: Duration = Duration::from_secs(300);
pub const IPSET_TICK: Duration = Duration::from_secs(30);

fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Resolves once shutdown is requested
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Keep going unless the error says state is corrupt
fn tolerate(result: Result<(), AgentError>, what: &str) -> Result<(), AgentError> {
    match result {
        Ok(()) => Ok(()),
        Err(e @ AgentError::InvalidState(_)) => {
            error!("{} hit an invalid state: {}", what, e);
            Err(e)
        }
        Err(e) => {
            warn!("{} failed: {}", what, e);
            Ok(())
        }
    }
}

pub async fn allocator_loop(
    allocator: Arc<NicAllocator>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    let mut job_tick = interval(JOB_TICK);
    let mut node_tick = interval(NODE_TICK);
    info!("Allocator loop started");
    loop {
        tokio::select! {
            _ = job_tick.tick() => tolerate(allocator.sync_host_nic(false).await, "job sync")?,
            _ = node_tick.tick() => tolerate(allocator.sync_host_nic(true).await, "node sync")?,
            _ = stopped(&mut shutdown) => break,
        }
    }
    info!("Allocator loop stopped");
    Ok(())
}

/// Converge as soon as a tracked NIC's link comes or goes
pub async fn link_loop(
    allocator: Arc<NicAllocator>,
    mut events: mpsc::Receiver<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = stopped(&mut shutdown) => break,
        };
        let Some(event) = event else {
            warn!("Link monitor closed");
            break;
        };
        if !allocator.owns_mac(&event.mac).await {
            continue;
        }
        match event.kind {
            LinkEventKind::Added => debug!("Link {} ({}) appeared", event.name, event.mac),
            LinkEventKind::Removed => info!("Link {} ({}) of a tracked NIC vanished", event.name, event.mac),
        }
        tolerate(allocator.sync_host_nic(false).await, "link sync")?;
    }
    Ok(())
}

/// Release leaked addresses and record silent ones for this node's pods
pub async fn repair_loop<F>(
    ipam: IpamEngine,
    live_pods: F,
    node_name: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError>
where
    F: Fn() -> Vec<LivePod> + Send,
{
    let mut tick = interval(REPAIR_TICK);
    // the first tick fires at once; give the pod reflector time to fill
    tick.reset();
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }
        let pods = live_pods();
        match ipam
            .get_and_fix_broken_blocks(&[], &pods, Some(&node_name), true)
            .await
        {
            Ok(broken) if broken.is_empty() => debug!("No broken blocks"),
            Ok(broken) => info!(
                "Repaired blocks: {} stale, {} duplicate, {} silent, {} conflicts left",
                broken.stale.len(),
                broken.duplicate.len(),
                broken.silent.len(),
                broken.conflicts.len()
            ),
            Err(e) => warn!("Block repair failed: {}", e),
        }
    }
    Ok(())
}

/// Keep the `hostnic-ippools` ipset equal to the IPPool CIDRs
pub async fn ipset_loop(
    client: kube::Client,
    network: Arc<NetworkProgrammer>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AgentError> {
    let mut tick = interval(IPSET_TICK);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }
        let result = async {
            let cidrs = ippool_cidrs(&client).await?;
            network.sync_ippool_set(&cidrs).await?;
            Ok::<_, AgentError>(())
        }
        .await;
        tolerate(result, "ipset sync")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestNode, allocator_config};
    use ipam::MemoryIpamClient;

    #[test]
    fn test_tolerate() {
        assert!(tolerate(Err(AgentError::Store("disk".to_string())), "x").is_ok());
        assert!(tolerate(Err(AgentError::InvalidState("dup".to_string())), "x").is_err());
    }

    #[tokio::test]
    async fn test_allocator_loop_stops() {
        let node = TestNode::new();
        let allocator = Arc::new(node.allocator(allocator_config()));
        allocator.start().await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(allocator_loop(allocator, rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_link_loop_ends_with_monitor() {
        let node = TestNode::new();
        let allocator = Arc::new(node.allocator(allocator_config()));
        let (events_tx, events_rx) = mpsc::channel(4);
        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(link_loop(allocator, events_rx, rx));

        events_tx
            .send(LinkEvent {
                kind: LinkEventKind::Added,
                name: "eth9".to_string(),
                mac: "52:54:00:ff:ff:ff".to_string(),
            })
            .await
            .unwrap();
        drop(events_tx);
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_repair_loop_stops_before_first_tick() {
        let engine = IpamEngine::new(Arc::new(MemoryIpamClient::new()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(repair_loop(engine, Vec::new, "node-1".to_string(), rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
