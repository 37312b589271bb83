//! Mock QingCloudClient for unit testing
//!
//! Keeps NICs, VxNets, VIPs and jobs in memory. Jobs complete immediately by
//! default; `hold_jobs(true)` leaves them pending until `complete_jobs()` so
//! tests can observe the asynchronous attach/detach window.

use crate::error::QingCloudError;
use crate::models::*;
use crate::qingcloud_trait::QingCloudClientTrait;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

/// A mutating call observed by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateNicsAndAttach {
        vxnet: String,
        count: usize,
        ips: Vec<String>,
    },
    AttachNics(Vec<String>),
    DetachNics(Vec<String>),
    DeleteNics(Vec<String>),
    CreateVips {
        vxnet: String,
        range: String,
    },
    DeleteVips(Vec<String>),
    CreateSecurityGroupRule {
        security_group: String,
        vxnet: String,
    },
}

#[derive(Debug, Clone)]
enum JobKind {
    Attach(Vec<String>),
    Detach(Vec<String>),
    CreateVips { vxnet: String, name: String, range: String },
    DeleteVips(Vec<String>),
}

#[derive(Debug, Clone)]
struct MockJob {
    kind: JobKind,
    done: bool,
    failed: bool,
}

#[derive(Debug, Default)]
struct MockState {
    nics: HashMap<String, HostNic>,
    vxnets: HashMap<String, VxNet>,
    vips: HashMap<String, Vip>,
    jobs: HashMap<String, MockJob>,
    cluster_nodes: HashMap<String, Vec<ClusterNode>>,
    calls: Vec<MockCall>,
    failing_actions: HashSet<String>,
    hold_jobs: bool,
    next_id: u32,
}

/// Mock QingCloudClient for testing
#[derive(Clone)]
pub struct MockQingCloudClient {
    instance_id: String,
    state: Arc<Mutex<MockState>>,
}

impl MockQingCloudClient {
    /// Create a new mock client acting for `instance_id`
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Add a VxNet (for test setup)
    pub fn add_vxnet(&self, vxnet: VxNet) {
        self.state.lock().unwrap().vxnets.insert(vxnet.id.clone(), vxnet);
    }

    /// Add a NIC as the IaaS sees it (for test setup)
    pub fn add_nic(&self, nic: HostNic) {
        self.state.lock().unwrap().nics.insert(nic.id.clone(), nic);
    }

    /// Remove a NIC behind the allocator's back
    pub fn remove_nic(&self, id: &str) {
        self.state.lock().unwrap().nics.remove(id);
    }

    /// Add a VIP (for test setup)
    pub fn add_vip(&self, vip: Vip) {
        self.state.lock().unwrap().vips.insert(vip.id.clone(), vip);
    }

    /// Set the nodes returned for `cluster`
    pub fn set_cluster_nodes(&self, cluster: &str, nodes: Vec<ClusterNode>) {
        self.state
            .lock()
            .unwrap()
            .cluster_nodes
            .insert(cluster.to_string(), nodes);
    }

    /// Make every call of `action` fail with an API error
    pub fn fail_action(&self, action: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_actions
            .insert(action.to_string());
    }

    /// Keep new jobs pending until `complete_jobs` is called
    pub fn hold_jobs(&self, hold: bool) {
        self.state.lock().unwrap().hold_jobs = hold;
    }

    /// Finish every pending job successfully
    pub fn complete_jobs(&self) {
        let mut state = self.state.lock().unwrap();
        let ids: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, j)| !j.done)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            Self::finish_job(&mut state, &self.instance_id, &id, false);
        }
    }

    /// Snapshot of the NICs the IaaS knows about
    pub fn nics(&self) -> HashMap<String, HostNic> {
        self.state.lock().unwrap().nics.clone()
    }

    /// VIPs on `vxnet`
    pub fn vips(&self, vxnet: &str) -> Vec<Vip> {
        self.state
            .lock()
            .unwrap()
            .vips
            .values()
            .filter(|v| v.vxnet_id == vxnet)
            .cloned()
            .collect()
    }

    /// All mutating calls in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn check(&self, action: &str) -> Result<(), QingCloudError> {
        if self.state.lock().unwrap().failing_actions.contains(action) {
            return Err(QingCloudError::Api {
                code: 5000,
                message: format!("{} failed (mock)", action),
            });
        }
        Ok(())
    }

    fn next_id(state: &mut MockState) -> u32 {
        state.next_id += 1;
        state.next_id
    }

    fn start_job(&self, state: &mut MockState, kind: JobKind) -> String {
        let id = format!("j-{:08}", Self::next_id(state));
        state.jobs.insert(
            id.clone(),
            MockJob {
                kind,
                done: false,
                failed: false,
            },
        );
        if !state.hold_jobs {
            Self::finish_job(state, &self.instance_id, &id, false);
        }
        id
    }

    fn finish_job(state: &mut MockState, instance: &str, id: &str, failed: bool) {
        let Some(job) = state.jobs.get_mut(id) else {
            return;
        };
        job.done = true;
        job.failed = failed;
        if failed {
            return;
        }
        match job.kind.clone() {
            JobKind::Attach(ids) => {
                for n in &ids {
                    if let Some(nic) = state.nics.get_mut(n) {
                        nic.instance_id = Some(instance.to_string());
                    }
                }
            }
            JobKind::Detach(ids) => {
                for n in &ids {
                    if let Some(nic) = state.nics.get_mut(n) {
                        nic.instance_id = None;
                    }
                }
            }
            JobKind::CreateVips { vxnet, name, range } => {
                let n = Self::next_id(state);
                let id = format!("vip-{:08}", n);
                state.vips.insert(
                    id.clone(),
                    Vip {
                        id,
                        name,
                        addr: range,
                        vxnet_id: vxnet,
                    },
                );
            }
            JobKind::DeleteVips(ids) => {
                for id in ids {
                    state.vips.remove(&id);
                }
            }
        }
    }

    fn address_in(vxnet: &VxNet, n: u32) -> String {
        let base = vxnet
            .cidr
            .split('/')
            .next()
            .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
            .unwrap_or(Ipv4Addr::new(10, 0, 0, 0));
        Ipv4Addr::from(u32::from(base) + 10 + n).to_string()
    }
}

#[async_trait::async_trait]
impl QingCloudClientTrait for MockQingCloudClient {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn create_nics_and_attach(
        &self,
        vxnet: &str,
        count: usize,
        ips: &[String],
    ) -> Result<(Vec<HostNic>, String), QingCloudError> {
        // the vxnet is resolved before anything is created
        self.check("DescribeVxnets")?;
        self.check("CreateNics")?;
        let mut state = self.state.lock().unwrap();
        let info = state
            .vxnets
            .get(vxnet)
            .cloned()
            .ok_or_else(|| QingCloudError::NotFound(format!("vxnet {}", vxnet)))?;
        state.calls.push(MockCall::CreateNicsAndAttach {
            vxnet: vxnet.to_string(),
            count,
            ips: ips.to_vec(),
        });

        let mut nics = Vec::with_capacity(count);
        for i in 0..count {
            let n = Self::next_id(&mut state);
            let id = format!("52:54:00:{:02x}:{:02x}:{:02x}", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff);
            let address = ips
                .get(i)
                .filter(|ip| !ip.is_empty())
                .cloned()
                .unwrap_or_else(|| Self::address_in(&info, n));
            let nic = HostNic {
                id: id.clone(),
                hardware_addr: id.clone(),
                vxnet: info.clone(),
                primary_address: address,
                ..HostNic::default()
            };
            state.nics.insert(id, nic.clone());
            nics.push(nic);
        }
        let ids = nics.iter().map(|n| n.id.clone()).collect();
        let job = self.start_job(&mut state, JobKind::Attach(ids));
        Ok((nics, job))
    }

    async fn attach_nics(&self, ids: &[String]) -> Result<String, QingCloudError> {
        self.check("AttachNics")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::AttachNics(ids.to_vec()));
        Ok(self.start_job(&mut state, JobKind::Attach(ids.to_vec())))
    }

    async fn detach_nics(&self, ids: &[String], sync: bool) -> Result<String, QingCloudError> {
        self.check("DetachNics")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::DetachNics(ids.to_vec()));
        let job = self.start_job(&mut state, JobKind::Detach(ids.to_vec()));
        if sync {
            Self::finish_job(&mut state, &self.instance_id, &job, false);
        }
        Ok(job)
    }

    async fn delete_nics(&self, ids: &[String]) -> Result<(), QingCloudError> {
        self.check("DeleteNics")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::DeleteNics(ids.to_vec()));
        if let Some(id) = ids
            .iter()
            .find(|id| state.nics.get(*id).is_some_and(|n| n.instance_id.is_some()))
        {
            return Err(QingCloudError::Api {
                code: 1400,
                message: format!("nic {} is still attached", id),
            });
        }
        for id in ids {
            state.nics.remove(id);
        }
        Ok(())
    }

    async fn get_nics(&self, ids: &[String]) -> Result<HashMap<String, HostNic>, QingCloudError> {
        self.check("DescribeNics")?;
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| state.nics.get(id).map(|n| (id.clone(), n.clone())))
            .collect())
    }

    async fn get_created_nics_by_name(&self, _name: &str) -> Result<Vec<HostNic>, QingCloudError> {
        self.check("DescribeNics")?;
        let state = self.state.lock().unwrap();
        let mut nics: Vec<HostNic> = state
            .nics
            .values()
            .filter(|n| !n.is_primary)
            .filter(|n| n.instance_id.is_none() || n.is_attached_to(&self.instance_id))
            .cloned()
            .collect();
        nics.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nics)
    }

    async fn describe_nic_jobs(
        &self,
        ids: &[String],
    ) -> Result<(Vec<String>, HashMap<String, bool>), QingCloudError> {
        self.check("DescribeJobs")?;
        let state = self.state.lock().unwrap();
        let mut pending = Vec::new();
        let mut results = HashMap::new();
        for id in ids {
            let Some(job) = state.jobs.get(id) else {
                continue;
            };
            if !job.done {
                pending.push(id.clone());
                continue;
            }
            if let JobKind::Attach(nics) | JobKind::Detach(nics) = &job.kind {
                for nic in nics {
                    results.insert(nic.clone(), !job.failed);
                }
            }
        }
        Ok((pending, results))
    }

    async fn get_vxnets(&self, ids: &[String]) -> Result<HashMap<String, VxNet>, QingCloudError> {
        self.check("DescribeVxnets")?;
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| state.vxnets.get(id).map(|v| (id.clone(), v.clone())))
            .collect())
    }

    async fn create_vips(&self, vxnet: &str, name: &str, range: &str) -> Result<String, QingCloudError> {
        self.check("CreateVips")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::CreateVips {
            vxnet: vxnet.to_string(),
            range: range.to_string(),
        });
        Ok(self.start_job(
            &mut state,
            JobKind::CreateVips {
                vxnet: vxnet.to_string(),
                name: name.to_string(),
                range: range.to_string(),
            },
        ))
    }

    async fn describe_vips(&self, vxnet: &str) -> Result<Vec<Vip>, QingCloudError> {
        self.check("DescribeVips")?;
        Ok(self.vips(vxnet))
    }

    async fn delete_vips(&self, ids: &[String]) -> Result<String, QingCloudError> {
        self.check("DeleteVips")?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::DeleteVips(ids.to_vec()));
        Ok(self.start_job(&mut state, JobKind::DeleteVips(ids.to_vec())))
    }

    async fn create_security_group_rule_for_vxnet(
        &self,
        security_group: &str,
        vxnet: &VxNet,
    ) -> Result<(), QingCloudError> {
        self.check("AddSecurityGroupRules")?;
        self.state
            .lock()
            .unwrap()
            .calls
            .push(MockCall::CreateSecurityGroupRule {
                security_group: security_group.to_string(),
                vxnet: vxnet.id.clone(),
            });
        Ok(())
    }

    async fn describe_cluster_nodes(&self, cluster: &str) -> Result<Vec<ClusterNode>, QingCloudError> {
        self.check("DescribeClusterNodes")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .cluster_nodes
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vxnet() -> VxNet {
        VxNet {
            id: "vxnet-a".to_string(),
            cidr: "10.0.0.0/24".to_string(),
            gateway: "10.0.0.1".to_string(),
            ..VxNet::default()
        }
    }

    #[tokio::test]
    async fn test_create_attaches_immediately() {
        let mock = MockQingCloudClient::new("i-test");
        mock.add_vxnet(vxnet());

        let (nics, job) = mock.create_nics_and_attach("vxnet-a", 2, &[]).await.unwrap();

        assert_eq!(nics.len(), 2);
        let (pending, results) = mock.describe_nic_jobs(&[job]).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(results.len(), 2);
        let live = mock.get_nics(&[nics[0].id.clone()]).await.unwrap();
        assert!(live[&nics[0].id].is_attached_to("i-test"));
    }

    #[tokio::test]
    async fn test_held_jobs_stay_pending() {
        let mock = MockQingCloudClient::new("i-test");
        mock.add_vxnet(vxnet());
        mock.hold_jobs(true);

        let (nics, job) = mock
            .create_nics_and_attach("vxnet-a", 1, &["10.0.0.37".to_string()])
            .await
            .unwrap();
        assert_eq!(nics[0].primary_address, "10.0.0.37");

        let (pending, _) = mock.describe_nic_jobs(&[job.clone()]).await.unwrap();
        assert_eq!(pending, vec![job.clone()]);

        mock.complete_jobs();
        let (pending, results) = mock.describe_nic_jobs(&[job]).await.unwrap();
        assert!(pending.is_empty());
        assert_eq!(results.get(&nics[0].id), Some(&true));
    }

    #[tokio::test]
    async fn test_delete_requires_detach() {
        let mock = MockQingCloudClient::new("i-test");
        mock.add_vxnet(vxnet());
        let (nics, _) = mock.create_nics_and_attach("vxnet-a", 1, &[]).await.unwrap();
        let ids = vec![nics[0].id.clone()];

        assert!(mock.delete_nics(&ids).await.is_err());
        mock.detach_nics(&ids, true).await.unwrap();
        mock.delete_nics(&ids).await.unwrap();
        assert!(mock.nics().is_empty());
    }

    #[tokio::test]
    async fn test_vxnet_lookup_failure_creates_nothing() {
        let mock = MockQingCloudClient::new("i-test");
        mock.add_vxnet(vxnet());
        mock.fail_action("DescribeVxnets");

        let err = mock.create_nics_and_attach("vxnet-a", 2, &[]).await.unwrap_err();
        assert!(matches!(err, QingCloudError::Api { .. }));
        assert!(mock.nics().is_empty());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_vxnet_creates_nothing() {
        let mock = MockQingCloudClient::new("i-test");
        let err = mock.create_nics_and_attach("vxnet-missing", 1, &[]).await.unwrap_err();
        assert!(matches!(err, QingCloudError::NotFound(_)));
        assert!(mock.nics().is_empty());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failing_action() {
        let mock = MockQingCloudClient::new("i-test");
        mock.fail_action("DescribeVips");
        let err = mock.describe_vips("vxnet-a").await.unwrap_err();
        assert!(matches!(err, QingCloudError::Api { .. }));
    }
}
