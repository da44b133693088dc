//! Integration tests for the full cycle: directory → store → queue → worker →
//! drain → next pass, and job failure → invalid feed.
//!
//! Each test creates its own in-memory SQLite database and a wiremock server
//! that plays both the directory service and the feed hosts.

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedcycle::directory::{DirectoryClient, SignedTokenIssuer};
use feedcycle::pipeline::{
    CycleConfig, CycleController, InvalidationHandler, Pipeline, StartOutcome,
};
use feedcycle::queue::{JobQueue, QueueEvent, SqliteJobQueue};
use feedcycle::storage::{Database, FeedStore};
use feedcycle::worker::{FeedWorker, WorkerConfig};

const RSS: &str = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Ok</title></channel></rss>"#;

struct Harness {
    server: MockServer,
    db: Database,
    queue: SqliteJobQueue,
    controller: CycleController,
    worker: FeedWorker,
}

async fn harness() -> Harness {
    let server = MockServer::start().await;
    let base = server.uri();

    let users = serde_json::json!([
        { "id": 1, "isFlagged": false, "feeds": [
            format!("{base}/feeds/ok.xml"),
            { "url": format!("{base}/feeds/broken.xml"), "title": "Broken" }
        ]},
        { "id": "mallory", "isFlagged": true, "feeds": [format!("{base}/feeds/spam.xml")] },
        { "name": "dave", "isFlagged": false, "feeds": [format!("{base}/feeds/ok.xml")] },
        { "id": 4, "isFlagged": false }
    ]);
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(users))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feeds/ok.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(RSS)
                .insert_header("ETag", "\"ok-1\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/feeds/broken.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let db = Database::open(":memory:").await.unwrap();
    let queue = SqliteJobQueue::new(db.clone());
    let client = reqwest::Client::new();
    let tokens = SignedTokenIssuer::new(
        "feedcycle",
        SecretString::from("integration-secret".to_string()),
        Duration::from_secs(60),
    )
    .unwrap();
    let directory = DirectoryClient::new(client.clone(), format!("{base}/users"), Arc::new(tokens))
        .with_timeout(Duration::from_secs(5))
        .allow_private_urls(true);

    let controller = CycleController::new(
        Arc::new(db.clone()),
        Arc::new(directory),
        Arc::new(queue.clone()),
        CycleConfig {
            enqueue_concurrency: 4,
            stall_retry: None,
        },
    );
    let worker = FeedWorker::new(
        client,
        db.clone(),
        queue.clone(),
        WorkerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
        },
    );

    Harness {
        server,
        db,
        queue,
        controller,
        worker,
    }
}

async fn directory_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/users")
        .count()
}

// ============================================================================
// Single pass, driven by hand
// ============================================================================

#[tokio::test]
async fn test_pass_then_worker_drains_queue() {
    let h = harness().await;
    let mut events = h.queue.subscribe();

    let report = match h.controller.start().await {
        StartOutcome::Ran(result) => result.unwrap(),
        StartOutcome::Coalesced => panic!("no other pass was running"),
    };
    assert_eq!(report.known, 0);
    assert_eq!(report.discovered, 3);
    assert_eq!(report.created, 2);
    assert_eq!(report.enqueued, 2);

    let feeds = h.db.all().await.unwrap();
    let urls: Vec<&str> = feeds.iter().map(|f| f.url.as_str()).collect();
    let base = h.server.uri();
    assert_eq!(
        urls,
        vec![
            format!("{base}/feeds/ok.xml"),
            format!("{base}/feeds/broken.xml")
        ]
    );
    assert_eq!(feeds[0].author.as_deref(), Some("1"));
    assert_eq!(feeds[1].title.as_deref(), Some("Broken"));

    assert_eq!(h.worker.run_until_idle().await.unwrap(), 2);

    match events.recv().await.unwrap() {
        QueueEvent::JobFailed {
            feed_id, reason, ..
        } => {
            assert_eq!(feed_id, feeds[1].id);
            assert_eq!(reason, "HTTP error: status 404");
        }
        other => panic!("Expected JobFailed, got {:?}", other),
    }
    assert_eq!(events.recv().await.unwrap(), QueueEvent::QueueDrained);

    let ok = h.db.by_id(feeds[0].id).await.unwrap().unwrap();
    assert_eq!(ok.cache.etag.as_deref(), Some("\"ok-1\""));
    assert!(ok.valid);
}

#[tokio::test]
async fn test_directory_receives_signed_bearer_token() {
    let h = harness().await;
    h.controller.start().await;

    let requests = h.server.received_requests().await.unwrap();
    let auth = requests
        .iter()
        .find(|r| r.url.path() == "/users")
        .and_then(|r| r.headers.get("Authorization"))
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert!(auth.starts_with("bearer v1.feedcycle."), "got {auth}");
}

// ============================================================================
// Perpetual cycle
// ============================================================================

#[tokio::test]
async fn test_drain_restarts_cycle_and_failures_invalidate() {
    let h = harness().await;
    let invalidation = InvalidationHandler::new(Arc::new(h.db.clone()))
        .with_failure_log(Arc::new(h.queue.clone()));

    let mut handle = Pipeline::start(&h.controller, &invalidation, &h.queue);
    handle.attach(h.worker.spawn(handle.shutdown_signal()));

    // Every drain starts another pass, so the directory is asked again.
    tokio::time::timeout(Duration::from_secs(10), async {
        while directory_requests(&h.server).await < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queue drain should trigger a second pass");

    let base = h.server.uri();
    let broken_url = format!("{base}/feeds/broken.xml");
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(feed) = h.db.by_url(&broken_url).await.unwrap() {
                if !feed.valid {
                    assert_eq!(feed.invalid_reason.as_deref(), Some("HTTP error: status 404"));
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("failed job should invalidate its feed");

    handle.stop().await;

    let feeds = h.db.all().await.unwrap();
    assert_eq!(feeds.len(), 2);
    assert!(!feeds.iter().any(|f| f.url.contains("spam")));
    let ok = h.db.by_url(&format!("{base}/feeds/ok.xml")).await.unwrap().unwrap();
    assert!(ok.valid);
}

#[tokio::test]
async fn test_unreachable_directory_leaves_store_and_queue_empty() {
    let h = harness().await;
    h.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/users"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;

    let outcome = h.controller.start().await;

    assert!(matches!(outcome, StartOutcome::Ran(Err(_))));
    assert!(h.db.all().await.unwrap().is_empty());
    assert_eq!(h.queue.stats().await.unwrap().outstanding(), 0);
}
