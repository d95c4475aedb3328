
use std::sync::Arc;

use axum::http::StatusCode;
use scheduler_harness::health::http_client;
use scheduler_harness::metrics::scrape;
use scheduler_harness::{HarnessError, NodeOptions};
use test_harness::{fake_node, init_logging, start_node, FakeScheduler};

#[tokio::test]
async fn test_scrape_normalizes_all_metric_kinds() {
    init_logging();
    let node = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    start_node(&node).await;

    let metrics = node.metrics().await.unwrap();

    assert_eq!(metrics.get("scheduler_jobs_created_total|app_id:test"), Some(3.0));
    assert_eq!(metrics.get("scheduler_sidecars_connected"), Some(1.0));
    assert_eq!(
        metrics.get("scheduler_trigger_latency_bucket|app_id:test|le:10"),
        Some(2.0)
    );
    assert_eq!(
        metrics.get("scheduler_trigger_latency_bucket|app_id:test|le:100"),
        Some(3.0)
    );
    assert_eq!(
        metrics.get(&format!(
            "scheduler_trigger_latency_bucket|app_id:test|le:{}",
            u64::MAX
        )),
        Some(4.0)
    );
    assert_eq!(metrics.get("scheduler_trigger_latency_count|app_id:test"), Some(4.0));
    assert_eq!(metrics.get("scheduler_trigger_latency_sum|app_id:test"), Some(250.5));
    assert_eq!(metrics.len(), 7);

    node.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_exact_keys_for_unlabelled_series() {
    let body = "\
# TYPE x gauge
x 5
# TYPE h histogram
h_bucket{le=\"10\"} 3
h_sum 12.5
h_count 4
";
    let node = fake_node(Arc::new(FakeScheduler::new().with_metrics(body)), NodeOptions::new());
    start_node(&node).await;

    let metrics = node.metrics().await.unwrap().into_inner();
    let mut keys: Vec<&str> = metrics.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["h_bucket|le:10", "h_count", "h_sum", "x"]);
    assert_eq!(metrics["x"], 5.0);
    assert_eq!(metrics["h_bucket|le:10"], 3.0);
    assert_eq!(metrics["h_count"], 4.0);
    assert_eq!(metrics["h_sum"], 12.5);

    node.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_each_scrape_is_fresh() {
    let node = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    start_node(&node).await;

    let first = node.metrics().await.unwrap();
    let second = node.metrics().await.unwrap();
    assert_eq!(first, second);

    node.cleanup().await.unwrap();
    assert!(node.metrics().await.is_err());
}

#[tokio::test]
async fn test_non_200_is_an_error() {
    let fake = FakeScheduler::new().with_metrics_status(StatusCode::INTERNAL_SERVER_ERROR);
    let node = fake_node(Arc::new(fake), NodeOptions::new());
    start_node(&node).await;

    match node.metrics().await.unwrap_err() {
        HarnessError::UnexpectedStatus { url, status } => {
            assert_eq!(status, 500);
            assert_eq!(url, format!("http://{}/metrics", node.metrics_address()));
        }
        other => panic!("expected UnexpectedStatus, got {:?}", other),
    }

    node.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_malformed_body_is_an_error() {
    let fake = FakeScheduler::new().with_metrics("# TYPE x gauge\nx five\n");
    let node = fake_node(Arc::new(fake), NodeOptions::new());
    start_node(&node).await;

    let err = node.metrics().await.unwrap_err();
    assert!(matches!(err, HarnessError::MetricsParse { line: 2, .. }));

    node.cleanup().await.unwrap();
}

#[tokio::test]
async fn test_scrape_without_a_node() {
    let node = fake_node(Arc::new(FakeScheduler::new()), NodeOptions::new());
    start_node(&node).await;

    let client = http_client().unwrap();
    let snapshot = scrape(&client, &node.metrics_address()).await.unwrap();
    assert_eq!(snapshot.get("scheduler_sidecars_connected"), Some(1.0));

    node.cleanup().await.unwrap();
}
