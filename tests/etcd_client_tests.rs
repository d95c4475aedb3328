//! Access to a node's embedded storage.


use std::sync::Arc;

use scheduler_harness::{HarnessError, NodeOptions};
use test_harness::{fake_node, init_logging, start_node, FakeScheduler};

#[tokio::test]
async fn test_etcd_client_dials_own_client_port() {
    init_logging();
    let node = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    start_node(&node).await;

    let mut etcd = node.etcd_client().await.unwrap();

    // The fake answers gRPC on the storage port but has no KV service.
    match etcd.get("jobs/", None).await {
        Err(etcd_client::Error::GRpcStatus(status)) => {
            assert_eq!(status.code(), tonic::Code::Unimplemented);
        }
        other => panic!("expected Unimplemented from the fake, got {:?}", other),
    }

    node.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_etcd_client_after_cleanup_is_rejected() {
    let node = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    start_node(&node).await;
    node.cleanup().await.unwrap();

    let err = node.etcd_client().await.err().expect("etcd_client should fail after cleanup");
    assert!(matches!(err, HarnessError::NotRunning(id) if id == node.id()));
}

#[tokio::test]
async fn test_each_cluster_member_gets_its_own_storage() {
    let first = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    let second = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    start_node(&first).await;
    start_node(&second).await;

    assert_ne!(first.etcd_client_address(), second.etcd_client_address());
    first.etcd_client().await.unwrap();
    second.etcd_client().await.unwrap();

    first.cleanup().await.unwrap();
    second.cleanup().await.unwrap();
}
