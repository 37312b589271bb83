//! Unit tests for the VxNetPool reconciler

#[cfg(test)]
mod tests {
    use super::super::vxnet_pool::*;
    use crate::error::ControllerError;
    use crate::test_utils::vxnet;
    use crds::PoolType;
    use kube::ResourceExt;
    use qingcloud_client::mock::MockCall;
    use qingcloud_client::{MockQingCloudClient, Vip};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn vip(addr: &str) -> Vip {
        Vip {
            id: format!("vip-{}", addr),
            name: "hostnic-vip".to_string(),
            addr: addr.to_string(),
            vxnet_id: "vxnet-a".to_string(),
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn vip_creates(mock: &MockQingCloudClient) -> usize {
        mock.calls().iter().filter(|c| matches!(c, MockCall::CreateVips { .. })).count()
    }

    #[test]
    fn test_vip_range() {
        let (start, end) = vip_range(&vxnet("vxnet-a", "10.0.0.0/24", "10.0.0.1")).unwrap();
        assert_eq!(start, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(end, Ipv4Addr::new(10, 0, 0, 254));

        let mut ranged = vxnet("vxnet-b", "10.0.1.0/24", "10.0.1.1");
        ranged.ip_start = Some("10.0.1.100".to_string());
        ranged.ip_end = Some("10.0.1.200".to_string());
        assert_eq!(
            vip_range(&ranged).unwrap(),
            (Ipv4Addr::new(10, 0, 1, 100), Ipv4Addr::new(10, 0, 1, 200))
        );

        assert!(matches!(
            vip_range(&vxnet("vxnet-c", "bogus", "10.0.0.1")),
            Err(ControllerError::Validation(_))
        ));
    }

    #[test]
    fn test_desired_ippool() {
        let vips = vec![vip("10.0.0.20"), vip("10.0.0.10-10.0.0.15"), vip("10.0.0.30")];
        assert_eq!(
            vip_bounds(&vips),
            Some((Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 30)))
        );

        let pool = desired_ippool(&vxnet("vxnet-a", "10.0.0.0/24", "10.0.0.1"), &vips, 27);
        assert_eq!(pool.name_any(), "vxnet-a");
        assert_eq!(pool.spec.cidr, "10.0.0.0/24");
        assert_eq!(pool.spec.block_size, 27);
        assert_eq!(pool.spec.range_start.as_deref(), Some("10.0.0.10"));
        assert_eq!(pool.spec.range_end.as_deref(), Some("10.0.0.30"));
        assert_eq!(pool.spec.gateway.as_deref(), Some("10.0.0.1"));
        assert_eq!(pool.spec.pool_type, PoolType::Vxnet);

        let bare = desired_ippool(&vxnet("vxnet-a", "10.0.0.0/24", "10.0.0.1"), &[], 26);
        assert!(bare.spec.range_start.is_none());
    }

    #[tokio::test]
    async fn test_vips_created_then_ready() {
        let mock = MockQingCloudClient::new("");
        mock.add_vxnet(vxnet("vxnet-a", "10.0.0.0/24", "10.0.0.1"));
        mock.hold_jobs(true);
        let sync = VxNetSync::new(Arc::new(mock.clone()), Some("sg-1".to_string()));

        let progress = sync.sync(&ids(&["vxnet-a"])).await.unwrap();
        assert!(!progress.is_ready());
        assert!(mock.calls().contains(&MockCall::CreateVips {
            vxnet: "vxnet-a".to_string(),
            range: "10.0.0.2-10.0.0.254".to_string(),
        }));

        // job still running: no second create
        let progress = sync.sync(&ids(&["vxnet-a"])).await.unwrap();
        assert!(!progress.is_ready());
        assert_eq!(vip_creates(&mock), 1);

        mock.complete_jobs();
        let progress = sync.sync(&ids(&["vxnet-a"])).await.unwrap();
        assert!(progress.is_ready());
        assert_eq!(progress.ready.len(), 1);
        assert_eq!(progress.ready[0].1.len(), 1);

        sync.sync(&ids(&["vxnet-a"])).await.unwrap();
        let sg_rules = mock
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::CreateSecurityGroupRule { .. }))
            .count();
        assert_eq!(sg_rules, 1);
        assert_eq!(vip_creates(&mock), 1);
    }

    #[tokio::test]
    async fn test_existing_vips_are_used() {
        let mock = MockQingCloudClient::new("");
        mock.add_vxnet(vxnet("vxnet-a", "10.0.0.0/24", "10.0.0.1"));
        mock.add_vip(vip("10.0.0.50"));
        let sync = VxNetSync::new(Arc::new(mock.clone()), None);

        let progress = sync.sync(&ids(&["vxnet-a"])).await.unwrap();
        assert!(progress.is_ready());
        assert_eq!(vip_creates(&mock), 0);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_vxnet_waits() {
        let mock = MockQingCloudClient::new("");
        mock.add_vxnet(vxnet("vxnet-a", "10.0.0.0/24", "10.0.0.1"));
        mock.add_vip(vip("10.0.0.50"));
        let sync = VxNetSync::new(Arc::new(mock.clone()), None);

        let progress = sync.sync(&ids(&["vxnet-a", "vxnet-zz"])).await.unwrap();
        assert!(!progress.is_ready());
        assert_eq!(progress.ready.len(), 1);
        assert_eq!(progress.waiting, vec!["vxnet vxnet-zz not found".to_string()]);
    }
}
