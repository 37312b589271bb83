//! Allocation table of a single IPAMBlock
//!
//! Cells are addressed by ordinal (offset from the block's network
//! address). Reserved addresses point at an attribute owned by
//! [`RESERVED_HANDLE`] so the free list always matches the null cells.

use crate::error::IpamError;
use crds::{AllocationAttribute, IPAMBlockSpec, IPPoolSpec};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

/// Handle owning range-excluded addresses and the gateway
pub const RESERVED_HANDLE: &str = "hostnic-reserved";

/// Parse a CIDR, rejecting host bits
pub fn parse_cidr(raw: &str) -> Result<Ipv4Net, IpamError> {
    let net: Ipv4Net = raw
        .trim()
        .parse()
        .map_err(|_| IpamError::InvalidCidr(raw.to_string()))?;
    if net.trunc() != net {
        return Err(IpamError::InvalidCidr(format!("{} has host bits set", raw)));
    }
    Ok(net)
}

fn parse_addr(raw: &str, what: &str) -> Result<Ipv4Addr, IpamError> {
    raw.trim()
        .parse()
        .map_err(|_| IpamError::Validation(format!("invalid {} {:?}", what, raw)))
}

/// Object name of the block covering `net`, e.g. `192-168-0-0-26`
pub fn block_name(net: Ipv4Net) -> String {
    format!("{}-{}", net.network().to_string().replace('.', "-"), net.prefix_len())
}

/// Usable range of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
}

impl PoolRange {
    /// Range of a pool spec; unset bounds default to the whole CIDR
    pub fn from_spec(spec: &IPPoolSpec) -> Result<Self, IpamError> {
        let cidr = parse_cidr(&spec.cidr)?;
        let start = match spec.range_start.as_deref() {
            Some(raw) => parse_addr(raw, "rangeStart")?,
            None => cidr.network(),
        };
        let end = match spec.range_end.as_deref() {
            Some(raw) => parse_addr(raw, "rangeEnd")?,
            None => cidr.broadcast(),
        };
        let gateway = spec
            .gateway
            .as_deref()
            .map(|raw| parse_addr(raw, "gateway"))
            .transpose()?;
        Ok(Self { start, end, gateway })
    }

    /// Whether `ip` may never be handed out
    pub fn reserves(&self, ip: Ipv4Addr) -> bool {
        ip < self.start || ip > self.end || Some(ip) == self.gateway
    }

    /// Whether any address of `net` is inside the range
    pub fn overlaps(&self, net: Ipv4Net) -> bool {
        net.network() <= self.end && net.broadcast() >= self.start
    }
}

/// Build an empty block for `net`, reserving what `range` excludes
pub fn new_block(net: Ipv4Net, range: &PoolRange) -> IPAMBlockSpec {
    let base = u32::from(net.network());
    let size = 1usize << (32 - u32::from(net.prefix_len()));
    let mut block = IPAMBlockSpec {
        cidr: net.to_string(),
        allocations: vec![None; size],
        unallocated: Vec::with_capacity(size),
        attributes: Vec::new(),
        deleted: false,
    };
    for ordinal in 0..size {
        let ip = Ipv4Addr::from(base.wrapping_add(ordinal as u32));
        if range.reserves(ip) {
            if block.attributes.is_empty() {
                block.attributes.push(reserved_attribute());
            }
            block.allocations[ordinal] = Some(0);
        } else {
            block.unallocated.push(ordinal);
        }
    }
    block
}

fn reserved_attribute() -> AllocationAttribute {
    AllocationAttribute {
        handle_id: Some(RESERVED_HANDLE.to_string()),
        secondary: BTreeMap::new(),
    }
}

/// Counts of one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub capacity: usize,
    pub allocated: usize,
    pub reserved: usize,
    pub unallocated: usize,
}

/// Allocation operations on an IPAMBlock spec
pub trait BlockExt {
    fn network(&self) -> Result<Ipv4Net, IpamError>;
    fn counts(&self) -> BlockCounts;
    fn ip_at(&self, ordinal: usize) -> Result<Ipv4Addr, IpamError>;
    /// Ordinal of `ip`, `None` when outside the block
    fn ordinal_of(&self, ip: Ipv4Addr) -> Result<Option<usize>, IpamError>;
    fn owner_at(&self, ordinal: usize) -> Option<&str>;
    /// Pop the next free address for `handle`; `None` when full
    fn assign(&mut self, handle: &str, secondary: &BTreeMap<String, String>) -> Result<Option<Ipv4Addr>, IpamError>;
    /// Claim a specific free cell; false when it is taken
    fn assign_ordinal(&mut self, ordinal: usize, handle: &str, secondary: &BTreeMap<String, String>) -> bool;
    /// Free every cell owned by `handle`
    fn release_handle(&mut self, handle: &str) -> usize;
    /// Free one cell, returning its former owner
    fn release_ordinal(&mut self, ordinal: usize) -> Option<String>;
    fn handle_ips(&self, handle: &str) -> Result<Vec<Ipv4Addr>, IpamError>;
    fn handle_count(&self, handle: &str) -> u32;
    /// Every non-reserved allocation as `(ordinal, handle)`
    fn allocations_by_ordinal(&self) -> Vec<(usize, String)>;
}

impl BlockExt for IPAMBlockSpec {
    fn network(&self) -> Result<Ipv4Net, IpamError> {
        parse_cidr(&self.cidr)
    }

    fn counts(&self) -> BlockCounts {
        let mut counts = BlockCounts {
            capacity: self.allocations.len(),
            ..BlockCounts::default()
        };
        for cell in &self.allocations {
            match cell {
                None => counts.unallocated += 1,
                Some(idx) if self.attributes.get(*idx).and_then(|a| a.handle_id.as_deref()) == Some(RESERVED_HANDLE) => {
                    counts.reserved += 1
                }
                Some(_) => counts.allocated += 1,
            }
        }
        counts
    }

    fn ip_at(&self, ordinal: usize) -> Result<Ipv4Addr, IpamError> {
        let net = self.network()?;
        let ordinal = u32::try_from(ordinal).map_err(|_| IpamError::InvalidCidr(self.cidr.clone()))?;
        Ok(Ipv4Addr::from(u32::from(net.network()).wrapping_add(ordinal)))
    }

    fn ordinal_of(&self, ip: Ipv4Addr) -> Result<Option<usize>, IpamError> {
        let net = self.network()?;
        if !net.contains(&ip) {
            return Ok(None);
        }
        Ok(Some((u32::from(ip) - u32::from(net.network())) as usize))
    }

    fn owner_at(&self, ordinal: usize) -> Option<&str> {
        self.allocations
            .get(ordinal)
            .copied()
            .flatten()
            .and_then(|idx| self.attributes.get(idx))
            .and_then(|a| a.handle_id.as_deref())
    }

    fn assign(&mut self, handle: &str, secondary: &BTreeMap<String, String>) -> Result<Option<Ipv4Addr>, IpamError> {
        while !self.unallocated.is_empty() {
            let ordinal = self.unallocated.remove(0);
            if self.allocations.get(ordinal) != Some(&None) {
                // stale free-list entry, drop it
                continue;
            }
            let idx = attribute_index(&mut self.attributes, handle, secondary);
            self.allocations[ordinal] = Some(idx);
            return self.ip_at(ordinal).map(Some);
        }
        Ok(None)
    }

    fn assign_ordinal(&mut self, ordinal: usize, handle: &str, secondary: &BTreeMap<String, String>) -> bool {
        if self.allocations.get(ordinal) != Some(&None) {
            return false;
        }
        self.unallocated.retain(|o| *o != ordinal);
        let idx = attribute_index(&mut self.attributes, handle, secondary);
        self.allocations[ordinal] = Some(idx);
        true
    }

    fn release_handle(&mut self, handle: &str) -> usize {
        let owned: Vec<usize> = (0..self.allocations.len())
            .filter(|o| self.owner_at(*o) == Some(handle))
            .collect();
        for ordinal in &owned {
            self.allocations[*ordinal] = None;
            self.unallocated.push(*ordinal);
        }
        compact_attributes(self);
        owned.len()
    }

    fn release_ordinal(&mut self, ordinal: usize) -> Option<String> {
        let owner = self.owner_at(ordinal)?.to_string();
        if owner == RESERVED_HANDLE {
            return None;
        }
        self.allocations[ordinal] = None;
        self.unallocated.push(ordinal);
        compact_attributes(self);
        Some(owner)
    }

    fn handle_ips(&self, handle: &str) -> Result<Vec<Ipv4Addr>, IpamError> {
        (0..self.allocations.len())
            .filter(|o| self.owner_at(*o) == Some(handle))
            .map(|o| self.ip_at(o))
            .collect()
    }

    fn handle_count(&self, handle: &str) -> u32 {
        (0..self.allocations.len())
            .filter(|o| self.owner_at(*o) == Some(handle))
            .count() as u32
    }

    fn allocations_by_ordinal(&self) -> Vec<(usize, String)> {
        (0..self.allocations.len())
            .filter_map(|o| match self.owner_at(o) {
                Some(h) if h != RESERVED_HANDLE => Some((o, h.to_string())),
                _ => None,
            })
            .collect()
    }
}

fn attribute_index(attributes: &mut Vec<AllocationAttribute>, handle: &str, secondary: &BTreeMap<String, String>) -> usize {
    if let Some(idx) = attributes
        .iter()
        .position(|a| a.handle_id.as_deref() == Some(handle) && &a.secondary == secondary)
    {
        return idx;
    }
    attributes.push(AllocationAttribute {
        handle_id: Some(handle.to_string()),
        secondary: secondary.clone(),
    });
    attributes.len() - 1
}

/// Drop attributes no cell points at and renumber the rest
fn compact_attributes(block: &mut IPAMBlockSpec) {
    let used: BTreeSet<usize> = block.allocations.iter().flatten().copied().collect();
    if used.len() == block.attributes.len() {
        return;
    }
    let mut remap = BTreeMap::new();
    let mut kept = Vec::with_capacity(used.len());
    for (old, attr) in block.attributes.drain(..).enumerate() {
        if used.contains(&old) {
            remap.insert(old, kept.len());
            kept.push(attr);
        }
    }
    block.attributes = kept;
    for cell in block.allocations.iter_mut().flatten() {
        if let Some(new) = remap.get(cell) {
            *cell = *new;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::PoolType;

    fn pool(cidr: &str) -> IPPoolSpec {
        IPPoolSpec {
            cidr: cidr.to_string(),
            block_size: 26,
            range_start: None,
            range_end: None,
            gateway: None,
            pool_type: PoolType::Local,
            disabled: false,
        }
    }

    fn assert_consistent(block: &IPAMBlockSpec) {
        let nulls = block.allocations.iter().filter(|c| c.is_none()).count();
        assert_eq!(block.unallocated.len(), nulls);
        let net = block.network().unwrap();
        assert_eq!(block.allocations.len(), 1usize << (32 - net.prefix_len()));
    }

    #[test]
    fn test_new_block_sizes() {
        let range = PoolRange::from_spec(&pool("192.168.0.0/24")).unwrap();
        let block = new_block("192.168.0.64/26".parse().unwrap(), &range);

        assert_consistent(&block);
        assert_eq!(block.counts(), BlockCounts { capacity: 64, allocated: 0, reserved: 0, unallocated: 64 });
        assert!(block.attributes.is_empty());
    }

    #[test]
    fn test_new_block_reserves_range_and_gateway() {
        let mut spec = pool("10.0.0.0/24");
        spec.range_start = Some("10.0.0.2".to_string());
        spec.range_end = Some("10.0.0.253".to_string());
        spec.gateway = Some("10.0.0.1".to_string());
        let range = PoolRange::from_spec(&spec).unwrap();

        let first = new_block("10.0.0.0/26".parse().unwrap(), &range);
        assert_consistent(&first);
        // .0 and .1 below range, .1 is also the gateway
        assert_eq!(first.counts().reserved, 2);
        assert_eq!(first.owner_at(0), Some(RESERVED_HANDLE));

        let last = new_block("10.0.0.192/26".parse().unwrap(), &range);
        assert_eq!(last.counts().reserved, 2);
        assert_eq!(last.counts().unallocated, 62);
    }

    #[test]
    fn test_assign_and_release_handle() {
        let range = PoolRange::from_spec(&pool("192.168.0.0/24")).unwrap();
        let mut block = new_block("192.168.0.0/26".parse().unwrap(), &range);
        let attrs = BTreeMap::from([("pod".to_string(), "a".to_string())]);

        let ip = block.assign("ns.a", &attrs).unwrap().unwrap();
        assert_eq!(ip, "192.168.0.0".parse::<Ipv4Addr>().unwrap());
        block.assign("ns.b", &BTreeMap::new()).unwrap();
        block.assign("ns.a", &attrs).unwrap();
        assert_eq!(block.handle_count("ns.a"), 2);
        assert_eq!(block.attributes.len(), 2);
        assert_consistent(&block);

        assert_eq!(block.release_handle("ns.a"), 2);
        assert_eq!(block.handle_count("ns.a"), 0);
        assert_eq!(block.attributes.len(), 1);
        assert_eq!(block.owner_at(1), Some("ns.b"));
        assert_consistent(&block);
    }

    #[test]
    fn test_assign_full_block() {
        let range = PoolRange::from_spec(&pool("192.168.0.0/30")).unwrap();
        let mut block = new_block("192.168.0.0/30".parse().unwrap(), &range);
        for i in 0..4 {
            assert!(block.assign(&format!("h{}", i), &BTreeMap::new()).unwrap().is_some());
        }
        assert_eq!(block.assign("h4", &BTreeMap::new()).unwrap(), None);
    }

    #[test]
    fn test_release_ordinal_keeps_reserved() {
        let mut spec = pool("10.0.0.0/28");
        spec.gateway = Some("10.0.0.1".to_string());
        let range = PoolRange::from_spec(&spec).unwrap();
        let mut block = new_block("10.0.0.0/28".parse().unwrap(), &range);

        assert_eq!(block.release_ordinal(1), None);
        assert!(block.assign_ordinal(4, "ns.x", &BTreeMap::new()));
        assert!(!block.assign_ordinal(4, "ns.y", &BTreeMap::new()));
        assert_eq!(block.release_ordinal(4).as_deref(), Some("ns.x"));
        assert_consistent(&block);
        assert_eq!(block.counts().reserved, 1);
    }

    #[test]
    fn test_block_name_and_cidr_parsing() {
        assert_eq!(block_name("192.168.0.64/26".parse().unwrap()), "192-168-0-64-26");
        assert!(parse_cidr("192.168.0.1/24").is_err());
        assert!(parse_cidr("not-a-cidr").is_err());
    }
}
