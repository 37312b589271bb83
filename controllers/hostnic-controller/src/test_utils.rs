//! Test utilities for unit testing reconcilers

#[cfg(test)]
use crds::{IPPool, IPPoolSpec, PoolType};
#[cfg(test)]
use qingcloud_client::VxNet;

/// Local IPPool with /26 blocks
#[cfg(test)]
pub fn ippool(name: &str, cidr: &str) -> IPPool {
    IPPool::new(
        name,
        IPPoolSpec {
            cidr: cidr.to_string(),
            block_size: 26,
            range_start: None,
            range_end: None,
            gateway: None,
            pool_type: PoolType::Local,
            disabled: false,
        },
    )
}

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
