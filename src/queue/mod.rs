//! Feed job queue.
//!
//! The pipeline produces jobs through [`JobQueue::add_feed`] and reacts to
//! the queue's lifecycle through [`QueueEvent`]s delivered on a broadcast
//! channel. Each subscriber gets its own receiver, so a slow handler for one
//! event kind never holds up another.
//!
//! [`SqliteJobQueue`] is the durable implementation: jobs live in the same
//! SQLite database as the feeds, so producer and consumer processes share
//! them and they survive restarts.
//!
//! The broadcast channel is bounded and drops the oldest events for a slow
//! subscriber. Failures are therefore also kept in a [`FailureLog`] until a
//! consumer acknowledges them, so a lagging consumer can catch up.

mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::storage::FeedId;

pub use sqlite::{ClaimedJob, QueueStats, SqliteJobQueue};

/// Queue-assigned job identifier.
pub type JobId = i64;

/// Capacity of the event broadcast channel. A subscriber that falls further
/// behind observes `RecvError::Lagged`.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// "Process this feed" job payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedJob {
    pub feed_id: FeedId,
}

/// Lifecycle events emitted by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    /// A job failed terminally. `reason` is the consumer's failure message.
    JobFailed {
        job_id: JobId,
        feed_id: FeedId,
        reason: String,
    },
    /// Every outstanding job across the queue has settled.
    QueueDrained,
}

/// A failed job whose failure has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedJob {
    pub job_id: JobId,
    pub feed_id: FeedId,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store could not be reached
    #[error("Job queue unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// complete/fail called for a job that is not active
    #[error("Job {0} is not active")]
    NotActive(JobId),
}

/// Producer side of the queue as seen by the cycle controller.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job for a feed. Jobs are keyed by feed id: if the feed
    /// already has an outstanding job, its id is returned instead.
    async fn add_feed(&self, job: FeedJob) -> Result<JobId, QueueError>;

    /// Subscribe to lifecycle events emitted after this call.
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;
}

/// Durable record of job failures, read by consumers that must not miss one.
#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Failures not yet acknowledged, oldest first. Only the latest failure
    /// of each feed is kept, and none once a later job for it succeeds.
    async fn unapplied_failures(&self) -> Result<Vec<FailedJob>, QueueError>;

    /// Acknowledge a failure. Unknown or already acknowledged ids are ignored.
    async fn mark_applied(&self, job_id: JobId) -> Result<(), QueueError>;
}
