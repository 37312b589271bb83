//! QingCloud API client
//!
//! Every action is a signed GET against the IaaS endpoint. Responses carry a
//! `ret_code`; non-zero codes fail fast, transport errors are retried.

use crate::config::QingCloudConfig;
use crate::error::QingCloudError;
use crate::models::*;
use crate::qingcloud_trait::QingCloudClientTrait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts per request on transport errors
pub const RETRY_ATTEMPTS: u32 = 3;
/// Pause between transport retries
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
/// Job polling period
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Hard upper bound on a job wait
pub const JOB_TIMEOUT: Duration = Duration::from_secs(180);

const DESCRIBE_LIMIT: usize = 100;

type HmacSha256 = Hmac<Sha256>;

/// QingCloud API client bound to one instance
pub struct QingCloudClient {
    client: Client,
    config: QingCloudConfig,
    instance_id: String,
    nic_name: String,
}

impl QingCloudClient {
    /// Create a new QingCloud client
    ///
    /// # Arguments
    /// * `config` - endpoint and credentials
    /// * `instance_id` - instance NICs are attached to
    /// * `nic_name` - name given to every NIC this client creates
    pub fn new(
        config: QingCloudConfig,
        instance_id: String,
        nic_name: String,
    ) -> Result<Self, QingCloudError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(QingCloudError::Http)?;

        Ok(Self {
            client,
            config,
            instance_id,
            nic_name,
        })
    }

    /// Call `action` with `params`, retrying transport errors
    async fn call<T: DeserializeOwned>(
        &self,
        action: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, QingCloudError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_once(action, &params).await {
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        action, attempt, RETRY_ATTEMPTS, e, RETRY_INTERVAL
                    );
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        action: &str,
        params: &[(String, String)],
    ) -> Result<T, QingCloudError> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let query = sign_request(&self.config, action, params, &timestamp);
        let url = format!("{}?{}", self.config.endpoint(), query);
        debug!("QingCloud {}", action);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;
        let body = response.text().await?;
        decode_response(action, &body)
    }

    /// Poll a job until it finishes or `JOB_TIMEOUT` elapses
    pub async fn wait_job(&self, job_id: &str) -> Result<(), QingCloudError> {
        let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
        loop {
            let resp: DescribeJobsResponse = self
                .call("DescribeJobs", indexed("jobs", &[job_id.to_string()]))
                .await?;
            if let Some(job) = resp.job_set.iter().find(|j| j.job_id == job_id) {
                match JobState::from_status(&job.status) {
                    JobState::Successful => return Ok(()),
                    JobState::Failed => {
                        return Err(QingCloudError::JobFailed {
                            job_id: job_id.to_string(),
                            status: job.status.clone(),
                        });
                    }
                    JobState::Pending => {}
                }
            }
            if tokio::time::Instant::now() + JOB_POLL_INTERVAL > deadline {
                return Err(QingCloudError::JobTimeout(job_id.to_string()));
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    async fn describe_nics(
        &self,
        mut params: Vec<(String, String)>,
    ) -> Result<Vec<NicItem>, QingCloudError> {
        let mut items = Vec::new();
        let mut offset = 0;
        params.push(("limit".to_string(), DESCRIBE_LIMIT.to_string()));
        loop {
            let mut page_params = params.clone();
            page_params.push(("offset".to_string(), offset.to_string()));
            let resp: DescribeNicsResponse = self.call("DescribeNics", page_params).await?;
            let count = resp.nic_set.len();
            items.extend(resp.nic_set);
            if count < DESCRIBE_LIMIT {
                break;
            }
            offset += count;
        }
        Ok(items)
    }

    async fn nics_to_host_nics(&self, items: Vec<NicItem>) -> Result<Vec<HostNic>, QingCloudError> {
        let vxnet_ids: Vec<String> = items
            .iter()
            .map(|n| n.vxnet_id.clone())
            .filter(|id| !id.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let vxnets = if vxnet_ids.is_empty() {
            HashMap::new()
        } else {
            self.get_vxnets(&vxnet_ids).await?
        };

        Ok(items
            .into_iter()
            .map(|item| host_nic_from_item(item, &vxnets))
            .collect())
    }

    async fn delete_quietly(&self, ids: &[String]) {
        if let Err(e) = self.delete_nics(ids).await {
            warn!("Failed to clean up nics {:?}: {}", ids, e);
        }
    }
}

#[async_trait::async_trait]
impl QingCloudClientTrait for QingCloudClient {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn create_nics_and_attach(
        &self,
        vxnet: &str,
        count: usize,
        ips: &[String],
    ) -> Result<(Vec<HostNic>, String), QingCloudError> {
        if count == 0 {
            return Err(QingCloudError::InvalidRequest("nic count must be positive".to_string()));
        }
        let mut params = vec![
            ("vxnet".to_string(), vxnet.to_string()),
            ("nic_name".to_string(), self.nic_name.clone()),
            ("count".to_string(), count.to_string()),
        ];
        let ips: Vec<&String> = ips.iter().filter(|ip| !ip.is_empty()).collect();
        if !ips.is_empty() {
            let joined: Vec<&str> = ips.iter().map(|ip| ip.as_str()).collect();
            params.push(("private_ips".to_string(), joined.join(",")));
        }

        // Resolve the vxnet first: once CreateNics succeeds every error path
        // has to clean up after itself
        let vxnet_info = self
            .get_vxnets(&[vxnet.to_string()])
            .await?
            .remove(vxnet)
            .ok_or_else(|| QingCloudError::NotFound(format!("vxnet {}", vxnet)))?;

        let created: CreateNicsResponse = self.call("CreateNics", params).await?;
        let ids: Vec<String> = created.nics.iter().map(|n| n.nic_id.clone()).collect();
        if ids.len() != count {
            self.delete_quietly(&ids).await;
            return Err(QingCloudError::InvalidRequest(format!(
                "created {} of {} nics on {}",
                ids.len(),
                count,
                vxnet
            )));
        }

        let job_id = match self.attach_nics(&ids).await {
            Ok(job) => job,
            Err(e) => {
                self.delete_quietly(&ids).await;
                return Err(e);
            }
        };

        let nics = created
            .nics
            .into_iter()
            .map(|n| HostNic {
                hardware_addr: n.nic_id.clone(),
                id: n.nic_id,
                vxnet: vxnet_info.clone(),
                primary_address: n.private_ip,
                ..HostNic::default()
            })
            .collect();

        info!("Created {} nics on {}, attach job {}", count, vxnet, job_id);
        Ok((nics, job_id))
    }

    async fn attach_nics(&self, ids: &[String]) -> Result<String, QingCloudError> {
        let mut params = indexed("nics", ids);
        params.push(("instance".to_string(), self.instance_id.clone()));
        let resp: JobResponse = self.call("AttachNics", params).await?;
        Ok(resp.job_id)
    }

    async fn detach_nics(&self, ids: &[String], sync: bool) -> Result<String, QingCloudError> {
        let resp: JobResponse = self.call("DetachNics", indexed("nics", ids)).await?;
        if sync {
            self.wait_job(&resp.job_id).await?;
        }
        Ok(resp.job_id)
    }

    async fn delete_nics(&self, ids: &[String]) -> Result<(), QingCloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _: serde_json::Value = self.call("DeleteNics", indexed("nics", ids)).await?;
        Ok(())
    }

    async fn get_nics(&self, ids: &[String]) -> Result<HashMap<String, HostNic>, QingCloudError> {
        let mut items = Vec::new();
        for chunk in ids.chunks(DESCRIBE_LIMIT) {
            items.extend(self.describe_nics(indexed("nics", chunk)).await?);
        }
        Ok(self
            .nics_to_host_nics(items)
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect())
    }

    async fn get_created_nics_by_name(&self, name: &str) -> Result<Vec<HostNic>, QingCloudError> {
        let items = self
            .describe_nics(vec![("nic_name".to_string(), name.to_string())])
            .await?;
        let nics = self.nics_to_host_nics(items).await?;
        Ok(nics
            .into_iter()
            .filter(|n| n.instance_id.is_none() || n.is_attached_to(&self.instance_id))
            .collect())
    }

    async fn describe_nic_jobs(
        &self,
        ids: &[String],
    ) -> Result<(Vec<String>, HashMap<String, bool>), QingCloudError> {
        if ids.is_empty() {
            return Ok((Vec::new(), HashMap::new()));
        }
        let resp: DescribeJobsResponse = self.call("DescribeJobs", indexed("jobs", ids)).await?;
        Ok(split_jobs(ids, resp.job_set))
    }

    async fn get_vxnets(&self, ids: &[String]) -> Result<HashMap<String, VxNet>, QingCloudError> {
        let mut params = indexed("vxnets", ids);
        params.push(("verbose".to_string(), "1".to_string()));
        let resp: DescribeVxnetsResponse = self.call("DescribeVxnets", params).await?;
        Ok(resp
            .vxnet_set
            .into_iter()
            .filter_map(VxnetItem::into_vxnet)
            .map(|v| (v.id.clone(), v))
            .collect())
    }

    async fn create_vips(&self, vxnet: &str, name: &str, range: &str) -> Result<String, QingCloudError> {
        let params = vec![
            ("vxnet_id".to_string(), vxnet.to_string()),
            ("vip_name".to_string(), name.to_string()),
            ("vip_range".to_string(), range.to_string()),
        ];
        let resp: JobResponse = self.call("CreateVips", params).await?;
        Ok(resp.job_id)
    }

    async fn describe_vips(&self, vxnet: &str) -> Result<Vec<Vip>, QingCloudError> {
        let params = vec![
            ("vxnet_id".to_string(), vxnet.to_string()),
            ("limit".to_string(), "1000".to_string()),
        ];
        let resp: DescribeVipsResponse = self.call("DescribeVips", params).await?;
        Ok(resp.vip_set.into_iter().map(Vip::from).collect())
    }

    async fn delete_vips(&self, ids: &[String]) -> Result<String, QingCloudError> {
        let resp: JobResponse = self.call("DeleteVips", indexed("vips", ids)).await?;
        Ok(resp.job_id)
    }

    async fn create_security_group_rule_for_vxnet(
        &self,
        security_group: &str,
        vxnet: &VxNet,
    ) -> Result<(), QingCloudError> {
        let mut params = vec![("security_group".to_string(), security_group.to_string())];
        for (i, protocol) in ["tcp", "udp"].iter().enumerate() {
            let n = i + 1;
            params.extend([
                (format!("rules.{n}.protocol"), (*protocol).to_string()),
                (format!("rules.{n}.priority"), "1".to_string()),
                (format!("rules.{n}.action"), "accept".to_string()),
                (format!("rules.{n}.direction"), "0".to_string()),
                (format!("rules.{n}.val1"), "1".to_string()),
                (format!("rules.{n}.val2"), "65535".to_string()),
                (format!("rules.{n}.val3"), vxnet.cidr.clone()),
                (format!("rules.{n}.security_group_rule_name"), format!("hostnic-{}", vxnet.id)),
            ]);
        }
        let _: serde_json::Value = self.call("AddSecurityGroupRules", params).await?;
        let _: serde_json::Value = self
            .call(
                "ApplySecurityGroup",
                vec![("security_group".to_string(), security_group.to_string())],
            )
            .await?;
        info!("Allowed {} ({}) in security group {}", vxnet.id, vxnet.cidr, security_group);
        Ok(())
    }

    async fn describe_cluster_nodes(&self, cluster: &str) -> Result<Vec<ClusterNode>, QingCloudError> {
        let params = vec![
            ("cluster".to_string(), cluster.to_string()),
            ("limit".to_string(), "1000".to_string()),
        ];
        let resp: DescribeClusterNodesResponse = self.call("DescribeClusterNodes", params).await?;
        Ok(resp.node_set.into_iter().map(ClusterNode::from).collect())
    }
}

/// Expand `ids` into `prefix.1=..&prefix.2=..` parameters
pub(crate) fn indexed(prefix: &str, ids: &[String]) -> Vec<(String, String)> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| (format!("{}.{}", prefix, i + 1), id.clone()))
        .collect()
}

/// Build the signed query string for one request
pub(crate) fn sign_request(
    config: &QingCloudConfig,
    action: &str,
    params: &[(String, String)],
    timestamp: &str,
) -> String {
    let mut all: Vec<(String, String)> = params.to_vec();
    all.extend([
        ("action".to_string(), action.to_string()),
        ("zone".to_string(), config.zone.clone()),
        ("access_key_id".to_string(), config.qy_access_key_id.clone()),
        ("signature_method".to_string(), "HmacSHA256".to_string()),
        ("signature_version".to_string(), "1".to_string()),
        ("time_stamp".to_string(), timestamp.to_string()),
        ("version".to_string(), "1".to_string()),
    ]);
    all.sort();

    let query = all
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let to_sign = format!("GET\n{}\n{}", config.uri, query);

    // HMAC accepts keys of any length
    let signature = match HmacSha256::new_from_slice(config.qy_secret_access_key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(to_sign.as_bytes());
            STANDARD.encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    };

    format!("{}&signature={}", query, urlencoding::encode(&signature))
}

/// Check the envelope and decode the payload
pub(crate) fn decode_response<T: DeserializeOwned>(action: &str, body: &str) -> Result<T, QingCloudError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    let envelope: ResponseEnvelope = serde_json::from_value(value.clone())?;
    if envelope.ret_code != 0 {
        return Err(QingCloudError::Api {
            code: envelope.ret_code,
            message: envelope
                .message
                .unwrap_or_else(|| format!("{} failed", action)),
        });
    }
    Ok(serde_json::from_value(value)?)
}

/// Split a DescribeJobs answer into pending job ids and per-NIC results
pub(crate) fn split_jobs(
    requested: &[String],
    jobs: Vec<JobItem>,
) -> (Vec<String>, HashMap<String, bool>) {
    let mut pending = Vec::new();
    let mut results = HashMap::new();
    let mut seen = BTreeSet::new();

    for job in jobs {
        if !requested.contains(&job.job_id) {
            warn!("DescribeJobs returned unexpected job {} ({})", job.job_id, job.status);
            continue;
        }
        seen.insert(job.job_id.clone());
        match JobState::from_status(&job.status) {
            JobState::Pending => pending.push(job.job_id),
            state => {
                for nic in job.resource_ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    results.insert(nic.to_string(), state == JobState::Successful);
                }
            }
        }
    }

    for id in requested {
        if !seen.contains(id) {
            warn!("Job {} is unknown to the IaaS, dropping it", id);
        }
    }

    (pending, results)
}

fn host_nic_from_item(item: NicItem, vxnets: &HashMap<String, VxNet>) -> HostNic {
    let vxnet = vxnets.get(&item.vxnet_id).cloned().unwrap_or_else(|| VxNet {
        id: item.vxnet_id.clone(),
        ..VxNet::default()
    });
    HostNic {
        hardware_addr: item.nic_id.clone(),
        id: item.nic_id,
        vxnet,
        primary_address: item.private_ip,
        is_primary: item.role == 1,
        instance_id: item.instance_id.filter(|s| !s.is_empty()),
        ..HostNic::default()
    }
}
