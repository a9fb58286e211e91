use super::*;
use nutrisync_core::{Confidence, NutritionFacts};
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn make_store() -> StateStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StateStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn report() -> NutritionReport {
    NutritionReport {
        foods: Vec::new(),
        total: NutritionFacts {
            calories: 250.0,
            ..NutritionFacts::default()
        },
        confidence: Confidence::Medium,
    }
}

fn item(path: &str, retry_count: u32) -> RetryItem {
    RetryItem {
        retry_count,
        ..RetryItem::new("42", path, report(), 1_700_000_000_000)
    }
}

async fn backend_responding(status: u16) -> (MockServer, BackendClient) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/save-background-analysis"))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "success": status == 200 })))
        .mount(&server)
        .await;
    let client = BackendClient::new(&server.uri()).unwrap();
    (server, client)
}

#[tokio::test]
async fn failed_item_is_kept_with_incremented_count() {
    let store = make_store().await;
    let queue = RetryQueue::new(store, EventSink::disabled());
    queue.enqueue(item("/a.jpg", 0)).await.unwrap();
    let (_server, backend) = backend_responding(500).await;

    let report = queue.process_retries(&backend).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 1);
    let items = queue.items().await.unwrap();
    assert_eq!(items[0].retry_count, 1);
    assert!(items[0].last_retry_at.is_some());
}

#[tokio::test]
async fn item_failing_final_attempt_is_discarded() {
    let store = make_store().await;
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let queue = RetryQueue::new(store, EventSink::new(events_tx));
    queue.enqueue(item("/a.jpg", 2)).await.unwrap();
    let (_server, backend) = backend_responding(503).await;

    let report = queue.process_retries(&backend).await.unwrap();

    assert_eq!(report.discarded, 1);
    assert_eq!(report.remaining, 0);
    assert!(queue.items().await.unwrap().is_empty());
    assert_eq!(queue.discarded_total(), 1);
    assert_eq!(
        events_rx.try_recv().unwrap(),
        PipelineEvent::RetryDiscarded {
            user_id: "42".into(),
            path: "/a.jpg".into(),
            attempts: MAX_RETRIES,
        }
    );
}

#[tokio::test]
async fn retry_count_never_exceeds_budget() {
    let store = make_store().await;
    let queue = RetryQueue::new(store, EventSink::disabled());
    queue.enqueue(item("/a.jpg", 0)).await.unwrap();
    let (_server, backend) = backend_responding(500).await;

    for _ in 0..5 {
        queue.process_retries(&backend).await.unwrap();
        for stored in queue.items().await.unwrap() {
            assert!(stored.retry_count <= MAX_RETRIES);
        }
    }

    assert!(queue.items().await.unwrap().is_empty());
    assert_eq!(queue.discarded_total(), 1);
}

#[tokio::test]
async fn successful_items_leave_queue_empty() {
    let store = make_store().await;
    let queue = RetryQueue::new(store, EventSink::disabled());
    queue.enqueue(item("/a.jpg", 0)).await.unwrap();
    queue.enqueue(item("/b.jpg", 1)).await.unwrap();
    let (_server, backend) = backend_responding(200).await;

    let report = queue.process_retries(&backend).await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(queue.items().await.unwrap().is_empty());

    let again = queue.process_retries(&backend).await.unwrap();
    assert_eq!(again, RetryReport::default());
    assert!(queue.items().await.unwrap().is_empty());
}

#[tokio::test]
async fn retry_attempt_is_tagged_in_device_info() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/save-background-analysis"))
        .and(body_partial_json(json!({
            "userId": "42",
            "imagePath": "/a.jpg",
            "timestamp": 1_700_000_000_000i64,
            "deviceInfo": "nutrisyncd background service (retry 2)"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let backend = BackendClient::new(&server.uri()).unwrap();
    let queue = RetryQueue::new(make_store().await, EventSink::disabled());
    queue.enqueue(item("/a.jpg", 1)).await.unwrap();

    let report = queue.process_retries(&backend).await.unwrap();

    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn mixed_outcomes_keep_only_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/save-background-analysis"))
        .and(body_partial_json(json!({ "imagePath": "/bad.jpg" })))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/save-background-analysis"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let backend = BackendClient::new(&server.uri()).unwrap();
    let queue = RetryQueue::new(make_store().await, EventSink::disabled());
    queue.enqueue(item("/good.jpg", 0)).await.unwrap();
    queue.enqueue(item("/bad.jpg", 0)).await.unwrap();

    let report = queue.process_retries(&backend).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    let items = queue.items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].image_path, "/bad.jpg");
}

#[tokio::test]
async fn corrupt_blob_is_treated_as_empty() {
    let store = make_store().await;
    store.set(RETRY_QUEUE_KEY, "{not json").await.unwrap();
    let queue = RetryQueue::new(store, EventSink::disabled());

    assert!(queue.items().await.unwrap().is_empty());
    assert_eq!(queue.enqueue(item("/a.jpg", 0)).await.unwrap(), 1);
}

#[tokio::test]
async fn stored_blob_uses_camel_case_fields() {
    let store = make_store().await;
    let queue = RetryQueue::new(store.clone(), EventSink::disabled());
    queue.enqueue(item("/a.jpg", 0)).await.unwrap();

    let raw = store.get(RETRY_QUEUE_KEY).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value[0]["userId"], "42");
    assert_eq!(value[0]["imagePath"], "/a.jpg");
    assert_eq!(value[0]["retryCount"], 0);
    assert_eq!(value[0]["timestamp"], 1_700_000_000_000i64);
}

#[tokio::test]
async fn stats_count_high_retry_items() {
    let queue = RetryQueue::new(make_store().await, EventSink::disabled());
    assert_eq!(queue.stats().await.unwrap(), RetryStats::default());

    queue.enqueue(item("/a.jpg", 0)).await.unwrap();
    queue.enqueue(item("/b.jpg", 2)).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.high_retry, 1);
    assert_eq!(stats.oldest_age_minutes, Some(0));

    queue.clear().await.unwrap();
    assert_eq!(queue.len().await.unwrap(), 0);
}
