use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

use super::{
    FailedJob, FailureLog, FeedJob, JobId, JobQueue, QueueError, QueueEvent,
    EVENT_CHANNEL_CAPACITY,
};
use crate::storage::{Database, FeedId};

/// A job handed to a consumer by [`SqliteJobQueue::claim_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedJob {
    pub id: JobId,
    pub feed_id: FeedId,
    /// Number of times this job has been claimed, including this one
    pub attempts: i64,
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub active: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn outstanding(&self) -> i64 {
        self.pending + self.active
    }
}

/// Durable job queue stored in the `jobs` table.
///
/// Delivery is at-least-once: a job claimed by a consumer that dies before
/// calling [`complete`](Self::complete) or [`fail`](Self::fail) stays
/// `active` until [`requeue_stalled`](Self::requeue_stalled) returns it to
/// `pending`.
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: Database,
    events: broadcast::Sender<QueueEvent>,
    available: Arc<Notify>,
}

impl SqliteJobQueue {
    pub fn new(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            events,
            available: Arc::new(Notify::new()),
        }
    }

    /// Wait until a job may be available. Wakeups are not lost: an
    /// `add_feed` with no waiter leaves a permit for the next call.
    pub async fn job_available(&self) {
        self.available.notified().await;
    }

    /// Claim the oldest pending job, marking it active.
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let now = chrono::Utc::now().timestamp();
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE jobs SET state = 'active', attempts = attempts + 1, updated_at = ?
            WHERE id = (SELECT id FROM jobs WHERE state = 'pending' ORDER BY id LIMIT 1)
            RETURNING id, feed_id, attempts
        "#,
        )
        .bind(now)
        .fetch_optional(&self.db.pool)
        .await?;

        Ok(row.map(|(id, feed_id, attempts)| ClaimedJob {
            id,
            feed_id,
            attempts,
        }))
    }

    /// Settle an active job successfully. Completed jobs are removed, along
    /// with any earlier failure of the same feed.
    ///
    /// Broadcasts [`QueueEvent::QueueDrained`] if this was the last
    /// outstanding job.
    pub async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut tx = self.db.pool.begin().await?;

        let row: Option<(i64,)> =
            sqlx::query_as("DELETE FROM jobs WHERE id = ? AND state = 'active' RETURNING feed_id")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((feed_id,)) = row else {
            return Err(QueueError::NotActive(job_id));
        };
        sqlx::query("DELETE FROM jobs WHERE feed_id = ? AND state = 'failed'")
            .bind(feed_id)
            .execute(&mut *tx)
            .await?;
        let (outstanding,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'active')",
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(job_id = job_id, outstanding = outstanding, "Job completed");
        if outstanding == 0 {
            self.emit(QueueEvent::QueueDrained);
        }
        Ok(())
    }

    /// Settle an active job as failed, keeping the row with its reason until
    /// it is acknowledged through [`FailureLog`]. Older failures of the same
    /// feed are dropped.
    ///
    /// Broadcasts [`QueueEvent::JobFailed`], then
    /// [`QueueEvent::QueueDrained`] if no outstanding jobs remain.
    pub async fn fail(&self, job_id: JobId, reason: &str) -> Result<(), QueueError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.db.pool.begin().await?;

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE jobs SET state = 'failed', reason = ?, updated_at = ?
            WHERE id = ? AND state = 'active'
            RETURNING feed_id
        "#,
        )
        .bind(reason)
        .bind(now)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((feed_id,)) = row else {
            return Err(QueueError::NotActive(job_id));
        };
        sqlx::query("DELETE FROM jobs WHERE feed_id = ? AND state = 'failed' AND id <> ?")
            .bind(feed_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        let (outstanding,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE state IN ('pending', 'active')",
        )
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(job_id = job_id, feed_id = feed_id, reason = %reason, "Job failed");
        self.emit(QueueEvent::JobFailed {
            job_id,
            feed_id,
            reason: reason.to_string(),
        });
        if outstanding == 0 {
            self.emit(QueueEvent::QueueDrained);
        }
        Ok(())
    }

    /// Return jobs left `active` by a consumer that went away to `pending`.
    /// Call once at startup, before any consumer runs.
    pub async fn requeue_stalled(&self) -> Result<u64, QueueError> {
        let now = chrono::Utc::now().timestamp();
        let result =
            sqlx::query("UPDATE jobs SET state = 'pending', updated_at = ? WHERE state = 'active'")
                .bind(now)
                .execute(&self.db.pool)
                .await?;
        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::info!(requeued = requeued, "Requeued stalled jobs");
            self.available.notify_one();
        }
        Ok(requeued)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.db.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.as_str() {
                "pending" => stats.pending = count,
                "active" => stats.active = count,
                "failed" => stats.failed = count,
                other => tracing::warn!(state = %other, "Unknown job state"),
            }
        }
        Ok(stats)
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine: nobody is listening yet.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn add_feed(&self, job: FeedJob) -> Result<JobId, QueueError> {
        loop {
            let now = chrono::Utc::now().timestamp();
            let inserted: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO jobs (feed_id, state, enqueued_at, updated_at)
                SELECT ?, 'pending', ?, ?
                WHERE NOT EXISTS (
                    SELECT 1 FROM jobs WHERE feed_id = ? AND state IN ('pending', 'active')
                )
                RETURNING id
            "#,
            )
            .bind(job.feed_id)
            .bind(now)
            .bind(now)
            .bind(job.feed_id)
            .fetch_optional(&self.db.pool)
            .await?;

            if let Some((id,)) = inserted {
                tracing::trace!(job_id = id, feed_id = job.feed_id, "Job enqueued");
                self.available.notify_one();
                return Ok(id);
            }

            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE feed_id = ? AND state IN ('pending', 'active') LIMIT 1",
            )
            .bind(job.feed_id)
            .fetch_optional(&self.db.pool)
            .await?;
            if let Some((id,)) = existing {
                tracing::trace!(job_id = id, feed_id = job.feed_id, "Job already outstanding");
                return Ok(id);
            }
            // The outstanding job settled between the two statements; insert again.
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl FailureLog for SqliteJobQueue {
    async fn unapplied_failures(&self) -> Result<Vec<FailedJob>, QueueError> {
        let rows: Vec<(i64, i64, Option<String>)> = sqlx::query_as(
            "SELECT id, feed_id, reason FROM jobs WHERE state = 'failed' AND applied = 0 ORDER BY id",
        )
        .fetch_all(&self.db.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(job_id, feed_id, reason)| FailedJob {
                job_id,
                feed_id,
                reason: reason.unwrap_or_default(),
            })
            .collect())
    }

    async fn mark_applied(&self, job_id: JobId) -> Result<(), QueueError> {
        sqlx::query("UPDATE jobs SET applied = 1 WHERE id = ? AND state = 'failed'")
            .bind(job_id)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn test_queue() -> SqliteJobQueue {
        SqliteJobQueue::new(Database::open(":memory:").await.unwrap())
    }

    #[tokio::test]
    async fn test_add_feed_is_keyed_by_feed_id() {
        let queue = test_queue().await;

        let a = queue.add_feed(FeedJob { feed_id: 1 }).await.unwrap();
        let b = queue.add_feed(FeedJob { feed_id: 1 }).await.unwrap();
        let c = queue.add_feed(FeedJob { feed_id: 2 }).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(queue.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn test_add_feed_while_active_returns_active_job() {
        let queue = test_queue().await;
        let id = queue.add_feed(FeedJob { feed_id: 7 }).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);

        let again = queue.add_feed(FeedJob { feed_id: 7 }).await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_claim_in_fifo_order() {
        let queue = test_queue().await;
        for feed_id in [10, 11, 12] {
            queue.add_feed(FeedJob { feed_id }).await.unwrap();
        }

        let mut claimed = Vec::new();
        while let Some(job) = queue.claim_next().await.unwrap() {
            assert_eq!(job.attempts, 1);
            claimed.push(job.feed_id);
        }
        assert_eq!(claimed, vec![10, 11, 12]);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.active, 3);
    }

    #[tokio::test]
    async fn test_drained_emitted_once_after_last_job() {
        let queue = test_queue().await;
        let mut events = queue.subscribe();

        queue.add_feed(FeedJob { feed_id: 1 }).await.unwrap();
        queue.add_feed(FeedJob { feed_id: 2 }).await.unwrap();
        let first = queue.claim_next().await.unwrap().unwrap();
        let second = queue.claim_next().await.unwrap().unwrap();

        queue.complete(first.id).await.unwrap();
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        queue.complete(second.id).await.unwrap();
        assert_eq!(events.try_recv().unwrap(), QueueEvent::QueueDrained);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_fail_emits_job_failed_then_drained() {
        let queue = test_queue().await;
        let mut events = queue.subscribe();

        let id = queue.add_feed(FeedJob { feed_id: 5 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.fail(id, "HTTP error: status 410").await.unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            QueueEvent::JobFailed {
                job_id: id,
                feed_id: 5,
                reason: "HTTP error: status 410".to_string(),
            }
        );
        assert_eq!(events.try_recv().unwrap(), QueueEvent::QueueDrained);
        assert_eq!(queue.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_failed_job_does_not_block_new_job_for_feed() {
        let queue = test_queue().await;
        let id = queue.add_feed(FeedJob { feed_id: 5 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.fail(id, "boom").await.unwrap();

        let next = queue.add_feed(FeedJob { feed_id: 5 }).await.unwrap();
        assert_ne!(next, id);
    }

    #[tokio::test]
    async fn test_repeated_failures_keep_one_row_per_feed() {
        let queue = test_queue().await;

        let mut last = 0;
        for round in 0..50 {
            last = queue.add_feed(FeedJob { feed_id: 5 }).await.unwrap();
            queue.claim_next().await.unwrap().unwrap();
            queue.fail(last, &format!("timeout #{round}")).await.unwrap();
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(
            queue.unapplied_failures().await.unwrap(),
            vec![FailedJob {
                job_id: last,
                feed_id: 5,
                reason: "timeout #49".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_success_clears_earlier_failure() {
        let queue = test_queue().await;
        let failed = queue.add_feed(FeedJob { feed_id: 5 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.fail(failed, "HTTP error: status 503").await.unwrap();

        let retried = queue.add_feed(FeedJob { feed_id: 5 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.complete(retried).await.unwrap();

        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
        assert!(queue.unapplied_failures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_log_until_applied() {
        let queue = test_queue().await;
        let mut ids = Vec::new();
        for feed_id in [1, 2] {
            let id = queue.add_feed(FeedJob { feed_id }).await.unwrap();
            queue.claim_next().await.unwrap().unwrap();
            queue.fail(id, "boom").await.unwrap();
            ids.push(id);
        }

        queue.mark_applied(ids[0]).await.unwrap();
        queue.mark_applied(999).await.unwrap();

        let pending: Vec<FeedId> = queue
            .unapplied_failures()
            .await
            .unwrap()
            .iter()
            .map(|f| f.feed_id)
            .collect();
        assert_eq!(pending, vec![2]);
        // Applied failures stay visible until superseded.
        assert_eq!(queue.stats().await.unwrap().failed, 2);
    }

    #[tokio::test]
    async fn test_settle_requires_active_job() {
        let queue = test_queue().await;
        let id = queue.add_feed(FeedJob { feed_id: 1 }).await.unwrap();

        assert!(matches!(
            queue.complete(id).await,
            Err(QueueError::NotActive(_))
        ));
        assert!(matches!(
            queue.fail(id, "x").await,
            Err(QueueError::NotActive(_))
        ));
        assert!(matches!(
            queue.complete(999).await,
            Err(QueueError::NotActive(999))
        ));
    }

    #[tokio::test]
    async fn test_requeue_stalled() {
        let queue = test_queue().await;
        queue.add_feed(FeedJob { feed_id: 1 }).await.unwrap();
        queue.add_feed(FeedJob { feed_id: 2 }).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        assert_eq!(queue.requeue_stalled().await.unwrap(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.active, 0);

        let reclaimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.feed_id, 1);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_job_available_permit_not_lost() {
        let queue = test_queue().await;
        queue.add_feed(FeedJob { feed_id: 1 }).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), queue.job_available())
            .await
            .expect("permit stored by add_feed");
    }
}
