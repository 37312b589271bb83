//! Integration tests for the QingCloud client
//!
//! These tests require real credentials and an instance to act for.
//! Set QINGCLOUD_CONFIG, QINGCLOUD_INSTANCE and QINGCLOUD_VXNET to run.

use qingcloud_client::{QingCloudClient, QingCloudClientTrait, QingCloudConfig};

fn client() -> QingCloudClient {
    let path = std::env::var("QINGCLOUD_CONFIG")
        .unwrap_or_else(|_| "/etc/qingcloud/config.yaml".to_string());
    let instance = std::env::var("QINGCLOUD_INSTANCE")
        .expect("QINGCLOUD_INSTANCE environment variable must be set");
    let config = QingCloudConfig::load(path).expect("Failed to load config");
    QingCloudClient::new(config, instance, "hostnic_it".to_string()).expect("Failed to create client")
}

#[tokio::test]
#[ignore] // Requires QingCloud credentials
async fn test_describe_vxnet() {
    let vxnet = std::env::var("QINGCLOUD_VXNET")
        .expect("QINGCLOUD_VXNET environment variable must be set");

    let vxnets = client().get_vxnets(&[vxnet.clone()]).await
        .expect("Failed to describe vxnet");

    let info = vxnets.get(&vxnet).expect("vxnet missing from response");
    println!("{} cidr={} gateway={}", info.id, info.cidr, info.gateway);
}

#[tokio::test]
#[ignore]
async fn test_create_attach_detach_delete() {
    let vxnet = std::env::var("QINGCLOUD_VXNET")
        .expect("QINGCLOUD_VXNET environment variable must be set");
    let client = client();

    let (nics, job) = client.create_nics_and_attach(&vxnet, 1, &[]).await
        .expect("Failed to create nic");
    client.wait_job(&job).await.expect("Attach job failed");

    let ids: Vec<String> = nics.iter().map(|n| n.id.clone()).collect();
    client.detach_nics(&ids, true).await.expect("Failed to detach");
    client.delete_nics(&ids).await.expect("Failed to delete");
}

#[tokio::test]
#[ignore]
async fn test_list_created_nics() {
    let nics = client().get_created_nics_by_name("hostnic_it").await
        .expect("Failed to list nics");
    println!("Found {} nics", nics.len());
}
