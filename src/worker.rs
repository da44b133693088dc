//! Bundled queue consumer: conditional re-fetch of each queued feed.
//!
//! The worker only checks that a feed answers and keeps its conditional-fetch
//! validators current; it does not parse content. Every claimed job is
//! settled: `complete` on a 2xx or 304, `fail` with the error text otherwise,
//! which is what drives invalidation and queue drains.

use reqwest::header::{HeaderMap, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::queue::{ClaimedJob, QueueError, SqliteJobQueue};
use crate::storage::{Database, Feed, FeedId, FeedStore, StoreError};
use crate::util::{read_limited_bytes, BodyError, MAX_FEED_SIZE};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Feed {0} not found")]
    FeedMissing(FeedId),
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    #[error("{0}")]
    Body(#[from] BodyError),
    #[error("Database error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs processed at once
    pub concurrency: usize,
    /// Fallback wakeup when no `add_feed` signal arrives
    pub poll_interval: Duration,
    /// Whole-request timeout, body included
    pub request_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 2xx; validators replaced with the response's
    Updated { bytes: usize },
    /// 304; stored validators still current
    NotModified,
}

struct Fetched {
    etag: Option<String>,
    last_modified: Option<String>,
    bytes: usize,
}

#[derive(Clone)]
pub struct FeedWorker {
    client: reqwest::Client,
    db: Database,
    queue: SqliteJobQueue,
    config: WorkerConfig,
}

impl FeedWorker {
    pub fn new(
        client: reqwest::Client,
        db: Database,
        queue: SqliteJobQueue,
        config: WorkerConfig,
    ) -> Self {
        Self {
            client,
            db,
            queue,
            config,
        }
    }

    /// Fetch the job's feed and update its bookkeeping. Does not settle the
    /// job.
    pub async fn process(&self, job: &ClaimedJob) -> Result<FetchOutcome, WorkerError> {
        let feed = self
            .db
            .by_id(job.feed_id)
            .await?
            .ok_or(WorkerError::FeedMissing(job.feed_id))?;

        let fetched = tokio::time::timeout(self.config.request_timeout, self.fetch(&feed))
            .await
            .map_err(|_| WorkerError::Timeout)??;

        match fetched {
            None => {
                self.db.record_not_modified(feed.id).await?;
                Ok(FetchOutcome::NotModified)
            }
            Some(fetched) => {
                self.db
                    .record_fetch(
                        feed.id,
                        fetched.etag.as_deref(),
                        fetched.last_modified.as_deref(),
                    )
                    .await?;
                Ok(FetchOutcome::Updated {
                    bytes: fetched.bytes,
                })
            }
        }
    }

    /// Conditional GET. `None` on 304, otherwise the response's validators
    /// and body length.
    async fn fetch(&self, feed: &Feed) -> Result<Option<Fetched>, WorkerError> {
        let mut request = self.client.get(&feed.url);
        if let Some(etag) = &feed.cache.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &feed.cache.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(WorkerError::HttpStatus(status.as_u16()));
        }
        let etag = header_value(response.headers(), ETAG);
        let last_modified = header_value(response.headers(), LAST_MODIFIED);
        let body = read_limited_bytes(response, MAX_FEED_SIZE).await?;
        Ok(Some(Fetched {
            etag,
            last_modified,
            bytes: body.len(),
        }))
    }

    /// Process a claimed job and settle it.
    pub async fn handle(&self, job: ClaimedJob) {
        let settled = match self.process(&job).await {
            Ok(outcome) => {
                tracing::debug!(job_id = job.id, feed_id = job.feed_id, outcome = ?outcome, "Feed fetched");
                self.queue.complete(job.id).await
            }
            Err(e) => {
                tracing::warn!(
                    job_id = job.id,
                    feed_id = job.feed_id,
                    attempts = job.attempts,
                    error = %e,
                    "Feed fetch failed"
                );
                self.queue.fail(job.id, &e.to_string()).await
            }
        };
        if let Err(e) = settled {
            tracing::error!(job_id = job.id, error = %e, "Could not settle job");
        }
    }

    /// Claim and handle jobs one at a time until none are pending. Returns
    /// the number handled.
    pub async fn run_until_idle(&self) -> Result<usize, QueueError> {
        let mut handled = 0;
        while let Some(job) = self.queue.claim_next().await? {
            self.handle(job).await;
            handled += 1;
        }
        Ok(handled)
    }

    /// Consume jobs until `shutdown` flips to `true`, then wait for
    /// in-flight jobs to settle.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            let concurrency = worker.config.concurrency.max(1);
            let slots = Arc::new(Semaphore::new(concurrency));
            tracing::info!(concurrency = concurrency, "Worker started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let permit = tokio::select! {
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                match worker.queue.claim_next().await {
                    Ok(Some(job)) => {
                        let worker = worker.clone();
                        tokio::spawn(async move {
                            worker.handle(job).await;
                            drop(permit);
                        });
                    }
                    Ok(None) => {
                        drop(permit);
                        if !worker.idle(&mut shutdown).await {
                            break;
                        }
                    }
                    Err(e) => {
                        drop(permit);
                        tracing::warn!(error = %e, "Could not claim job");
                        if !worker.idle(&mut shutdown).await {
                            break;
                        }
                    }
                }
            }

            let _ = slots.acquire_many(concurrency as u32).await;
            tracing::info!("Worker stopped");
        })
    }

    /// Wait for a new job, the poll interval or shutdown. Returns `false` on
    /// shutdown.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = self.queue.job_available() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }
}

fn header_value(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{FeedJob, JobQueue, QueueEvent};
    use crate::storage::NewFeed;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?><rss version="2.0"><channel><title>T</title></channel></rss>"#;

    async fn setup(url: &str) -> (Database, SqliteJobQueue, FeedWorker, FeedId) {
        let db = Database::open(":memory:").await.unwrap();
        let feed_id = db
            .create(&NewFeed {
                url: url.to_string(),
                title: None,
                author: None,
            })
            .await
            .unwrap();
        let queue = SqliteJobQueue::new(db.clone());
        let worker = FeedWorker::new(
            reqwest::Client::new(),
            db.clone(),
            queue.clone(),
            WorkerConfig {
                request_timeout: Duration::from_secs(5),
                ..WorkerConfig::default()
            },
        );
        (db, queue, worker, feed_id)
    }

    #[tokio::test]
    async fn test_success_stores_validators_and_completes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("ETag", "\"v2\"")
                    .insert_header("Last-Modified", "Wed, 02 Oct 2024 08:00:00 GMT"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (db, queue, worker, feed_id) = setup(&format!("{}/feed.xml", server.uri())).await;
        let mut events = queue.subscribe();
        queue.add_feed(FeedJob { feed_id }).await.unwrap();

        assert_eq!(worker.run_until_idle().await.unwrap(), 1);

        let feed = db.by_id(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.cache.etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            feed.cache.last_modified.as_deref(),
            Some("Wed, 02 Oct 2024 08:00:00 GMT")
        );
        assert!(feed.last_fetched.is_some());
        assert_eq!(events.recv().await.unwrap(), QueueEvent::QueueDrained);
        assert_eq!(queue.stats().await.unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_sends_stored_validators_and_handles_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let (db, queue, worker, feed_id) = setup(&server.uri()).await;
        db.record_fetch(feed_id, Some("\"v1\""), Some("Tue, 01 Oct 2024 10:00:00 GMT"))
            .await
            .unwrap();
        queue.add_feed(FeedJob { feed_id }).await.unwrap();
        let job = queue.claim_next().await.unwrap().unwrap();

        let outcome = worker.process(&job).await.unwrap();

        assert_eq!(outcome, FetchOutcome::NotModified);
        let requests = server.received_requests().await.unwrap();
        assert_eq!(
            requests[0]
                .headers
                .get("If-Modified-Since")
                .and_then(|v| v.to_str().ok()),
            Some("Tue, 01 Oct 2024 10:00:00 GMT")
        );
        let feed = db.by_id(feed_id).await.unwrap().unwrap();
        assert_eq!(feed.cache.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_error_status_fails_job_with_reason() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (_db, queue, worker, feed_id) = setup(&server.uri()).await;
        let mut events = queue.subscribe();
        let job_id = queue.add_feed(FeedJob { feed_id }).await.unwrap();

        worker.run_until_idle().await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::JobFailed {
                job_id,
                feed_id,
                reason: "HTTP error: status 500".to_string(),
            }
        );
        assert_eq!(events.recv().await.unwrap(), QueueEvent::QueueDrained);
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_slow_feed_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let (db, queue, _, feed_id) = setup(&server.uri()).await;
        let worker = FeedWorker::new(
            reqwest::Client::new(),
            db,
            queue.clone(),
            WorkerConfig {
                request_timeout: Duration::from_millis(100),
                ..WorkerConfig::default()
            },
        );
        queue.add_feed(FeedJob { feed_id }).await.unwrap();
        let job = queue.claim_next().await.unwrap().unwrap();

        assert!(matches!(
            worker.process(&job).await,
            Err(WorkerError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_spawned_worker_drains_queue_and_stops() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let (_db, queue, worker, feed_id) = setup(&server.uri()).await;
        let mut events = queue.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = worker.spawn(shutdown_rx);

        queue.add_feed(FeedJob { feed_id }).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("queue should drain")
            .unwrap();
        assert_eq!(event, QueueEvent::QueueDrained);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
