//! Test utilities for the agent
//!
//! A node made of a mock IaaS, a fake kernel and a temporary store, plus a
//! task that plays udev by adding links for NICs the IaaS reports attached.

#[cfg(test)]
use crate::allocator::{AllocatorConfig, NicAllocator};
#[cfg(test)]
use crate::store::Store;
#[cfg(test)]
use crate::types::{IpamMessage, PodInfo};
#[cfg(test)]
use hostnic_network::{FakeKernel, NetworkConfig, NetworkProgrammer};
#[cfg(test)]
use qingcloud_client::{MockQingCloudClient, VxNet};
#[cfg(test)]
use std::collections::HashSet;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use tokio::task::JoinHandle;

#[cfg(test)]
pub const INSTANCE: &str = "i-node0001";

#[cfg(test)]
pub fn vxnet(id: &str, cidr: &str, gateway: &str) -> VxNet {
    VxNet {
        id: id.to_string(),
        name: id.to_string(),
        cidr: cidr.to_string(),
        gateway: gateway.to_string(),
        ..VxNet::default()
    }
}

#[cfg(test)]
pub fn pod_info(container_id: &str) -> PodInfo {
    PodInfo {
        namespace: "default".to_string(),
        name: format!("pod-{}", container_id),
        container_id: container_id.to_string(),
        ..PodInfo::default()
    }
}

/// Small pool on `vx-A` with fast polling
#[cfg(test)]
pub fn allocator_config() -> AllocatorConfig {
    AllocatorConfig {
        pool_low: 2,
        pool_high: 3,
        max_nic: 5,
        cached_vxnet: Some("vx-A".to_string()),
        poll_interval: Duration::from_millis(10),
        attach_timeout: Duration::from_secs(2),
        ..AllocatorConfig::default()
    }
}

/// Links appear for NICs attached to [`INSTANCE`] and vanish once detached
#[cfg(test)]
pub fn spawn_udev(cloud: MockQingCloudClient, kernel: FakeKernel) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let present: HashSet<String> = kernel
                .snapshot()
                .netns
                .get("")
                .map(|ns| ns.links.values().map(|l| l.mac.clone()).collect())
                .unwrap_or_default();
            for nic in cloud.nics().values() {
                let mac = nic.hardware_addr.to_lowercase();
                let flat = mac.replace(':', "");
                let name = format!("eth{}", &flat[6..]);
                match (nic.is_attached_to(INSTANCE), present.contains(&mac)) {
                    (true, false) => kernel.add_link(&name, &mac),
                    (false, true) => kernel.remove_link(&name),
                    _ => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

/// Mock IaaS with VxNets `vx-A` and `vx-B`, a fake kernel and a store dir
#[cfg(test)]
pub struct TestNode {
    pub cloud: MockQingCloudClient,
    pub kernel: FakeKernel,
    pub dir: tempfile::TempDir,
    udev: JoinHandle<()>,
}

#[cfg(test)]
impl TestNode {
    pub fn new() -> Self {
        let cloud = MockQingCloudClient::new(INSTANCE);
        cloud.add_vxnet(vxnet("vx-A", "10.0.0.0/24", "10.0.0.1"));
        cloud.add_vxnet(vxnet("vx-B", "10.0.1.0/24", "10.0.1.1"));
        let kernel = FakeKernel::new();
        kernel.add_link("eth0", "52:54:99:00:00:01");
        let udev = spawn_udev(cloud.clone(), kernel.clone());
        Self {
            cloud,
            kernel,
            dir: tempfile::tempdir().unwrap(),
            udev,
        }
    }

    pub fn allocator(&self, config: AllocatorConfig) -> NicAllocator {
        let network = Arc::new(NetworkProgrammer::new(
            Arc::new(self.kernel.clone()),
            Arc::new(self.kernel.clone()),
            NetworkConfig::default(),
        ));
        let store = Arc::new(Store::open(self.dir.path()).unwrap());
        NicAllocator::new(Arc::new(self.cloud.clone()), network, store, config)
    }

    /// Every record currently in the store
    pub fn records(&self) -> Vec<(String, IpamMessage)> {
        Store::open(self.dir.path()).unwrap().load_messages().unwrap()
    }
}

#[cfg(test)]
impl Drop for TestNode {
    fn drop(&mut self) {
        self.udev.abort();
    }
}
