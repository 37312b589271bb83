//! Unit tests for the IPPool reconciler helpers

#[cfg(test)]
mod tests {
    use super::super::ippool::*;
    use crate::test_utils::ippool;
    use crds::labels::{IPPOOL_APPLIED_SPEC_ANNOTATION, IPPOOL_DEFAULT_LABEL};
    use ipam::{BlockCounts, BlockUtilization, PoolUtilization, validate_pool};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::ResourceExt;

    fn default_pool(name: &str, cidr: &str) -> crds::IPPool {
        let mut pool = ippool(name, cidr);
        pool.labels_mut().insert(IPPOOL_DEFAULT_LABEL.to_string(), "true".to_string());
        pool
    }

    #[test]
    fn test_last_default_pool_is_guarded() {
        let a = default_pool("a", "10.0.0.0/24");
        let b = default_pool("b", "10.0.1.0/24");
        let c = ippool("c", "10.0.2.0/24");

        assert!(!is_last_default(&a, &[a.clone(), b.clone(), c.clone()]));
        assert!(is_last_default(&a, &[a.clone(), c.clone()]));
        assert!(!is_last_default(&c, &[c.clone()]));

        // a default pool that is itself being deleted does not count
        let mut b_deleting = b.clone();
        b_deleting.metadata.deletion_timestamp = Some(serde_json::from_value::<Time>(serde_json::json!("2026-01-01T00:00:00Z")).unwrap());
        assert!(is_last_default(&a, &[a.clone(), b_deleting]));
    }

    #[test]
    fn test_applied_spec_blocks_mutation() {
        let original = ippool("p", "10.0.0.0/24");
        let mut changed = original.clone();
        changed.annotations_mut().insert(
            IPPOOL_APPLIED_SPEC_ANNOTATION.to_string(),
            serde_json::to_string(&original.spec).unwrap(),
        );
        changed.spec.block_size = 28;

        let previous = applied_pool(&changed).unwrap();
        assert_eq!(previous.name_any(), "p");
        assert!(validate_pool(&changed, &[previous]).is_err());

        // disabling is not a mutation
        let mut disabled = changed.clone();
        disabled.spec.block_size = 26;
        disabled.spec.disabled = true;
        assert!(validate_pool(&disabled, &[applied_pool(&disabled).unwrap()]).is_ok());
    }

    fn created(name: &str, cidr: &str, at: &str) -> crds::IPPool {
        let mut pool = ippool(name, cidr);
        pool.metadata.creation_timestamp = Some(serde_json::from_value::<Time>(serde_json::json!(at)).unwrap());
        pool
    }

    fn accepted(mut pool: crds::IPPool) -> crds::IPPool {
        let spec = serde_json::to_string(&pool.spec).unwrap();
        pool.annotations_mut().insert(IPPOOL_APPLIED_SPEC_ANNOTATION.to_string(), spec);
        pool
    }

    #[test]
    fn test_overlapping_newcomer_does_not_evict_accepted_pool() {
        let old = accepted(created("old", "10.0.0.0/16", "2026-01-01T00:00:00Z"));
        let new = created("new", "10.0.1.0/24", "2026-02-01T00:00:00Z");
        let all = vec![old.clone(), new.clone()];

        // the accepted pool is only checked against its own applied spec
        let set = validation_set(&old, all.clone());
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].name_any(), "old");
        assert!(validate_pool(&old, &set).is_ok());

        // the newcomer is rejected
        assert!(validate_pool(&new, &validation_set(&new, all)).is_err());
    }

    #[test]
    fn test_older_pending_pool_wins_overlap() {
        let first = created("b-first", "10.0.0.0/24", "2026-01-01T00:00:00Z");
        let second = created("a-second", "10.0.0.0/25", "2026-01-02T00:00:00Z");
        let all = vec![first.clone(), second.clone()];

        assert!(validate_pool(&first, &validation_set(&first, all.clone())).is_ok());
        assert!(validate_pool(&second, &validation_set(&second, all)).is_err());

        // same timestamp: the name decides
        let x = created("x", "10.1.0.0/24", "2026-01-01T00:00:00Z");
        let y = created("y", "10.1.0.0/24", "2026-01-01T00:00:00Z");
        let pair = vec![x.clone(), y.clone()];
        assert!(validate_pool(&x, &validation_set(&x, pair.clone())).is_ok());
        assert!(validate_pool(&y, &validation_set(&y, pair)).is_err());
    }

    #[test]
    fn test_unreadable_applied_spec_is_ignored() {
        let mut pool = ippool("p", "10.0.0.0/24");
        pool.annotations_mut()
            .insert(IPPOOL_APPLIED_SPEC_ANNOTATION.to_string(), "{".to_string());
        assert!(applied_pool(&pool).is_none());
        assert!(applied_pool(&ippool("q", "10.0.1.0/24")).is_none());
    }

    #[test]
    fn test_pool_status_from_utilization() {
        let block = |name: &str, allocated: usize| BlockUtilization {
            name: name.to_string(),
            cidr: String::new(),
            counts: BlockCounts {
                capacity: 64,
                allocated,
                reserved: 2,
                unallocated: 62 - allocated,
            },
        };
        let util = PoolUtilization {
            name: "p".to_string(),
            cidr: "10.0.0.0/25".to_string(),
            counts: BlockCounts {
                capacity: 128,
                allocated: 5,
                reserved: 4,
                unallocated: 119,
            },
            blocks: vec![block("10-0-0-0-26", 5), block("10-0-0-64-26", 0)],
        };

        let status = pool_status(&util);
        assert_eq!(status.capacity, 128);
        assert_eq!(status.allocations, 5);
        assert_eq!(status.reserved, 4);
        assert_eq!(status.unallocated, 119);
        assert_eq!(status.blocks, vec!["10-0-0-0-26", "10-0-0-64-26"]);
        assert!(status.last_reconciled.is_none());
    }
}
