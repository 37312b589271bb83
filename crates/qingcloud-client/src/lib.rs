//! QingCloud IaaS API Client
//!
//! A Rust client for the subset of the QingCloud IaaS API the hostnic agent
//! and controller need: vNIC lifecycle, job polling, VxNets, VIPs, security
//! group rules and cluster nodes.
//!
//! # Example
//!
//! ```no_run
//! use qingcloud_client::{QingCloudClient, QingCloudClientTrait, QingCloudConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = QingCloudConfig::load("/etc/qingcloud/config.yaml")?;
//! let client = QingCloudClient::new(config, "i-abcdefgh".to_string(), "hostnic_".to_string())?;
//!
//! // Create two NICs on a VxNet and attach them to this instance
//! let (nics, job) = client.create_nics_and_attach("vxnet-abc", 2, &[]).await?;
//! println!("created {} nics, attach job {}", nics.len(), job);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Signed requests**: HMAC-SHA256 signature per QingCloud API v1
//! - **Retry Logic**: transport errors are retried 3 times, 5 seconds apart
//! - **Job polling**: bounded wait for asynchronous jobs
//! - **Mock**: in-memory `MockQingCloudClient` behind the `test-util` feature

pub mod client;
pub mod config;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod qingcloud_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::QingCloudClient;
pub use config::QingCloudConfig;
pub use error::QingCloudError;
pub use models::*;
pub use qingcloud_trait::QingCloudClientTrait;
#[cfg(feature = "test-util")]
pub use mock::MockQingCloudClient;
