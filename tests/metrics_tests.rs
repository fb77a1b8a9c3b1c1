
use std::time::Duration;

use serde_json::json;
use train_dispatch::config::METRICS_CHANNEL;
use train_dispatch::metrics::MetricsIngestor;
use train_dispatch::node::Node;
use train_dispatch::scheduler::JobStatus;
use train_dispatch::store::{DurableStore, EphemeralStore};
use uuid::Uuid;

use test_harness::{wait_until, TestEnv};

fn message(job_id: Uuid, step: i64, loss: f64) -> String {
    json!({"job_id": job_id, "step": step, "epoch": 0.5, "loss": loss}).to_string()
}

/// Publish once the ingestor is subscribed, so the message is not dropped.
async fn publish(env: &TestEnv, raw: String) {
    let ephemeral = env.ephemeral.clone();
    let delivered = wait_until(Duration::from_secs(2), move || {
        let ephemeral = ephemeral.clone();
        let raw = raw.clone();
        async move { matches!(ephemeral.publish(METRICS_CHANNEL, raw).await, Ok(n) if n > 0) }
    })
    .await;
    assert!(delivered, "no subscriber on {}", METRICS_CHANNEL);
}

async fn wait_for_points(env: &TestEnv, job_id: impl ToString, count: usize) -> bool {
    let durable = env.durable.clone();
    let job_id = job_id.to_string();
    wait_until(Duration::from_secs(2), move || {
        let durable = durable.clone();
        let job_id = job_id.clone();
        async move { matches!(durable.metrics(&job_id, None).await, Ok(points) if points.len() >= count) }
    })
    .await
}

fn started_node(env: &TestEnv) -> Node {
    let mut node = env.node();
    node.start();
    node
}

#[tokio::test]
async fn test_series_sorted_by_step_regardless_of_arrival() {
    let env = TestEnv::simulated();
    let mut node = started_node(&env);
    let id = node.submit(None, json!({})).await.unwrap();

    for (step, loss) in [(3, 0.3), (1, 0.9), (2, 0.5)] {
        publish(&env, message(id, step, loss)).await;
    }
    assert!(wait_for_points(&env, id, 3).await);

    let series = node.metrics(id, None).await.unwrap();
    let steps: Vec<i64> = series["loss"].iter().map(|s| s.step).collect();
    assert_eq!(steps, vec![1, 2, 3]);
    let values: Vec<f64> = series["loss"].iter().map(|s| s.value).collect();
    assert_eq!(values, vec![0.9, 0.5, 0.3]);

    node.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_multiple_metrics_per_message_and_name_filter() {
    let env = TestEnv::simulated();
    let mut node = started_node(&env);
    let id = node.submit(None, json!({})).await.unwrap();

    publish(
        &env,
        json!({"job_id": id, "step": 1, "epoch": 1.0, "loss": 0.4, "accuracy": 0.8}).to_string(),
    )
    .await;
    assert!(wait_for_points(&env, id, 2).await);

    let all = node.metrics(id, None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains_key("loss"));
    assert!(all.contains_key("accuracy"));

    let accuracy = node.metrics(id, Some("accuracy")).await.unwrap();
    assert_eq!(accuracy.len(), 1);
    assert_eq!(accuracy["accuracy"][0].value, 0.8);

    node.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_metrics_for_unknown_job_create_placeholder_row() {
    let env = TestEnv::simulated();
    let ingestor = MetricsIngestor::new(env.ephemeral.clone(), env.durable.clone(), METRICS_CHANNEL);
    let id = Uuid::new_v4();

    let stored = ingestor.ingest(&message(id, 5, 0.1)).await.unwrap();
    assert_eq!(stored, 1);

    let row = env.durable.get_job(id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Running);
    assert_eq!(row.config, json!({}));

    // a second message reuses the row
    ingestor.ingest(&message(id, 6, 0.05)).await.unwrap();
    assert_eq!(env.durable.metrics(&id.to_string(), None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_metrics_under_external_job_id_are_stored() {
    let env = TestEnv::simulated();
    let ingestor = MetricsIngestor::new(env.ephemeral.clone(), env.durable.clone(), METRICS_CHANNEL);

    let raw = json!({"job_id": "external-run-42", "step": 1, "loss": 0.5}).to_string();
    assert_eq!(ingestor.ingest(&raw).await.unwrap(), 1);

    let series = train_dispatch::metrics::job_metrics(env.durable.as_ref(), "external-run-42", None)
        .await
        .unwrap();
    assert_eq!(series["loss"][0].value, 0.5);
    assert!(env.durable.list_jobs(10, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_external_job_metrics_arrive_over_channel() {
    let env = TestEnv::simulated();
    let mut node = started_node(&env);

    publish(
        &env,
        json!({"job_id": "external-run-42", "step": 3, "epoch": 1.0, "loss": 0.25}).to_string(),
    )
    .await;
    assert!(wait_for_points(&env, "external-run-42", 1).await);

    node.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_malformed_messages_are_skipped() {
    let env = TestEnv::simulated();
    let mut node = started_node(&env);
    let id = node.submit(None, json!({})).await.unwrap();

    publish(&env, "not json".to_string()).await;
    publish(&env, json!({"step": 1, "loss": 0.2}).to_string()).await;
    publish(&env, json!({"job_id": id, "step": 1, "loss": "high"}).to_string()).await;
    publish(&env, message(id, 2, 0.2)).await;

    assert!(wait_for_points(&env, id, 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let points = env.durable.metrics(&id.to_string(), None).await.unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].step, 2);

    node.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_points_published_during_store_outage_are_kept() {
    let env = TestEnv::simulated();
    let mut node = started_node(&env);
    let id = node.submit(None, json!({})).await.unwrap();

    env.durable.set_down(true);
    publish(&env, message(id, 1, 0.7)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.durable.set_down(false);

    publish(&env, message(id, 2, 0.6)).await;
    assert!(wait_for_points(&env, id, 2).await);
    let points = env.durable.metrics(&id.to_string(), None).await.unwrap();
    let steps: Vec<i64> = points.iter().map(|p| p.step).collect();
    assert_eq!(steps, vec![1, 2]);

    node.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_ingest_retries_until_store_recovers() {
    let env = TestEnv::simulated();
    let ingestor = MetricsIngestor::new(env.ephemeral.clone(), env.durable.clone(), METRICS_CHANNEL)
        .with_retry(10, Duration::from_millis(5));
    let id = Uuid::new_v4();

    env.durable.set_down(true);
    let durable = env.durable.clone();
    let recover = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        durable.set_down(false);
    });

    assert_eq!(ingestor.ingest(&message(id, 1, 0.5)).await.unwrap(), 1);
    recover.await.unwrap();
    assert_eq!(env.durable.metrics(&id.to_string(), None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ingest_gives_up_after_retry_budget() {
    let env = TestEnv::simulated();
    let ingestor = MetricsIngestor::new(env.ephemeral.clone(), env.durable.clone(), METRICS_CHANNEL)
        .with_retry(3, Duration::from_millis(1));

    env.durable.set_down(true);
    let err = ingestor.ingest(&message(Uuid::new_v4(), 1, 0.5)).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_ingestor_resubscribes_after_channel_loss() {
    let env = TestEnv::simulated();
    let mut node = started_node(&env);
    let id = node.submit(None, json!({})).await.unwrap();

    publish(&env, message(id, 1, 0.5)).await;
    assert!(wait_for_points(&env, id, 1).await);

    env.ephemeral.inner().close_channel(METRICS_CHANNEL).await;

    // the supervisor restarts the subscriber after its backoff
    publish(&env, message(id, 2, 0.4)).await;
    assert!(wait_for_points(&env, id, 2).await);

    node.shutdown(Duration::from_secs(1)).await;
}
