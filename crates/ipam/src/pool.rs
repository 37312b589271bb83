//! IPPool validation and block generation

use crate::block::{PoolRange, block_name, new_block, parse_cidr};
use crate::error::IpamError;
use crds::labels::{IPPOOL_ID_LABEL, IPPOOL_NAME_LABEL, IPPOOL_TYPE_LABEL};
use crds::{IPAMBlock, IPPool, IPPoolSpec};
use kube::ResourceExt;
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Stable id of a pool CIDR: first 16 hex chars of its SHA-256
pub fn pool_id(cidr: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(cidr.trim().as_bytes()));
    digest[..16].to_string()
}

/// Check a pool on its own and against the pools that already exist
///
/// An entry of `existing` with the same name is treated as the previous
/// version of `new`: its immutable fields must not change and it is not
/// checked for overlap.
pub fn validate_pool(new: &IPPool, existing: &[IPPool]) -> Result<(), IpamError> {
    let name = new.name_any();
    let spec = &new.spec;
    let cidr = parse_cidr(&spec.cidr)?;

    if spec.block_size < cidr.prefix_len() || spec.block_size > 32 {
        return Err(IpamError::Validation(format!(
            "pool {}: blockSize {} must be between {} and 32",
            name,
            spec.block_size,
            cidr.prefix_len()
        )));
    }

    let range = PoolRange::from_spec(spec)?;
    if !cidr.contains(&range.start) || !cidr.contains(&range.end) || range.start > range.end {
        return Err(IpamError::Validation(format!(
            "pool {}: range {}-{} is not inside {}",
            name, range.start, range.end, cidr
        )));
    }
    if let Some(gw) = range.gateway {
        if !cidr.contains(&gw) {
            return Err(IpamError::Validation(format!("pool {}: gateway {} is not inside {}", name, gw, cidr)));
        }
    }

    for other in existing {
        if other.name_any() == name {
            check_immutable(&name, &other.spec, spec)?;
            continue;
        }
        let other_cidr = match parse_cidr(&other.spec.cidr) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if other_cidr.contains(&cidr.network()) || cidr.contains(&other_cidr.network()) {
            return Err(IpamError::Validation(format!(
                "pool {} ({}) overlaps pool {} ({})",
                name,
                cidr,
                other.name_any(),
                other_cidr
            )));
        }
    }
    Ok(())
}

fn check_immutable(name: &str, old: &IPPoolSpec, new: &IPPoolSpec) -> Result<(), IpamError> {
    let changed = if old.cidr != new.cidr {
        Some("cidr")
    } else if old.pool_type != new.pool_type {
        Some("type")
    } else if old.block_size != new.block_size {
        Some("blockSize")
    } else if old.range_start != new.range_start {
        Some("rangeStart")
    } else if old.range_end != new.range_end {
        Some("rangeEnd")
    } else {
        None
    };
    match changed {
        Some(field) => Err(IpamError::Validation(format!("pool {}: {} is immutable", name, field))),
        None => Ok(()),
    }
}

/// Blocks covering `pool`, skipping those entirely outside its range
pub fn generate_blocks(pool: &IPPool) -> Result<Vec<IPAMBlock>, IpamError> {
    let pool_name = pool.name_any();
    let spec = &pool.spec;
    let cidr = parse_cidr(&spec.cidr)?;
    let range = PoolRange::from_spec(spec)?;
    let subnets = cidr
        .subnets(spec.block_size)
        .map_err(|_| IpamError::Validation(format!("pool {}: invalid blockSize {}", pool_name, spec.block_size)))?;

    let labels = BTreeMap::from([
        (IPPOOL_NAME_LABEL.to_string(), pool_name.clone()),
        (IPPOOL_TYPE_LABEL.to_string(), spec.pool_type.as_str().to_string()),
        (IPPOOL_ID_LABEL.to_string(), pool_id(&spec.cidr)),
    ]);

    Ok(subnets
        .filter(|net| range.overlaps(*net))
        .map(|net| IPAMBlock {
            metadata: ObjectMeta {
                name: Some(block_name(net)),
                labels: Some(labels.clone()),
                ..ObjectMeta::default()
            },
            spec: new_block(net, &range),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockExt;
    use crds::PoolType;

    fn pool(name: &str, cidr: &str) -> IPPool {
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

    #[test]
    fn test_pool_id_is_stable() {
        assert_eq!(pool_id("192.168.0.0/24"), pool_id("192.168.0.0/24"));
        assert_ne!(pool_id("192.168.0.0/24"), pool_id("192.168.1.0/24"));
        assert_eq!(pool_id("192.168.0.0/24").len(), 16);
    }

    #[test]
    fn test_generate_blocks() {
        let blocks = generate_blocks(&pool("p1", "192.168.0.0/24")).unwrap();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].name_any(), "192-168-0-0-26");
        assert_eq!(blocks[3].spec.cidr, "192.168.0.192/26");

        let labels = blocks[0].labels();
        assert_eq!(labels.get(IPPOOL_NAME_LABEL).map(String::as_str), Some("p1"));
        assert_eq!(labels.get(IPPOOL_TYPE_LABEL).map(String::as_str), Some("local"));
        assert_eq!(labels.get(IPPOOL_ID_LABEL), Some(&pool_id("192.168.0.0/24")));
        for block in &blocks {
            assert_eq!(block.spec.counts().capacity, 64);
        }
    }

    #[test]
    fn test_generate_blocks_skips_out_of_range() {
        let mut p = pool("vx", "10.0.0.0/24");
        p.spec.range_start = Some("10.0.0.100".to_string());
        p.spec.range_end = Some("10.0.0.150".to_string());

        let blocks = generate_blocks(&p).unwrap();
        let cidrs: Vec<_> = blocks.iter().map(|b| b.spec.cidr.as_str()).collect();
        assert_eq!(cidrs, vec!["10.0.0.64/26", "10.0.0.128/26"]);
        // .64-.99 reserved in the first block
        assert_eq!(blocks[0].spec.counts().reserved, 36);
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let existing = vec![pool("a", "192.168.0.0/24")];
        assert!(matches!(
            validate_pool(&pool("b", "192.168.0.128/25"), &existing),
            Err(IpamError::Validation(_))
        ));
        assert!(matches!(
            validate_pool(&pool("c", "192.168.0.0/16"), &existing),
            Err(IpamError::Validation(_))
        ));
        assert!(validate_pool(&pool("d", "192.168.1.0/24"), &existing).is_ok());
    }

    #[test]
    fn test_validate_immutable_fields() {
        let existing = vec![pool("a", "192.168.0.0/24")];
        let mut updated = pool("a", "192.168.0.0/24");
        updated.spec.disabled = true;
        assert!(validate_pool(&updated, &existing).is_ok());

        updated.spec.block_size = 28;
        assert!(validate_pool(&updated, &existing).is_err());

        let moved = pool("a", "192.168.2.0/24");
        assert!(validate_pool(&moved, &existing).is_err());
    }

    #[test]
    fn test_validate_block_size_and_range() {
        let mut p = pool("a", "192.168.0.0/24");
        p.spec.block_size = 20;
        assert!(validate_pool(&p, &[]).is_err());

        let mut p = pool("a", "192.168.0.0/24");
        p.spec.range_start = Some("192.168.1.1".to_string());
        assert!(validate_pool(&p, &[]).is_err());

        let mut p = pool("a", "192.168.0.0/24");
        p.spec.gateway = Some("10.0.0.1".to_string());
        assert!(validate_pool(&p, &[]).is_err());

        assert!(matches!(validate_pool(&pool("a", "192.168.0.5/24"), &[]), Err(IpamError::InvalidCidr(_))));
    }
}
