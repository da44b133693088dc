//! Marks feeds invalid when their processing job fails.
//!
//! Failure events arrive on a lossy broadcast channel. With a
//! [`FailureLog`] attached, the handler acknowledges each failure it applies
//! and replays the unacknowledged ones at startup, after a lag and on every
//! drain, so no failure is lost to a full channel or an unreachable store.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::queue::{FailedJob, FailureLog, QueueEvent};
use crate::storage::{FeedId, FeedStore, StoreError};

/// Stored in place of an empty failure reason.
pub const UNKNOWN_REASON: &str = "unknown reason";

/// What handling a single failure event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    Invalidated,
    /// The job referenced a feed that does not exist; nothing was changed
    FeedNotFound,
    /// The store could not be reached; the failure stays unacknowledged
    StoreUnavailable,
}

#[derive(Clone)]
pub struct InvalidationHandler {
    store: Arc<dyn FeedStore>,
    failures: Option<Arc<dyn FailureLog>>,
}

impl InvalidationHandler {
    pub fn new(store: Arc<dyn FeedStore>) -> Self {
        Self {
            store,
            failures: None,
        }
    }

    /// Acknowledge applied failures in `failures` and replay the rest.
    pub fn with_failure_log(mut self, failures: Arc<dyn FailureLog>) -> Self {
        self.failures = Some(failures);
        self
    }

    /// Record `reason` on the feed and flip it to invalid. Repeated failures
    /// overwrite the reason with the latest one.
    pub async fn on_job_failed(&self, feed_id: FeedId, reason: &str) -> InvalidationOutcome {
        let reason = if reason.trim().is_empty() {
            UNKNOWN_REASON
        } else {
            reason
        };

        match self.store.by_id(feed_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(feed_id = feed_id, reason = reason, "Failed job references unknown feed");
                return InvalidationOutcome::FeedNotFound;
            }
            Err(e) => {
                tracing::error!(feed_id = feed_id, error = %e, "Could not look up feed for failed job");
                return InvalidationOutcome::StoreUnavailable;
            }
        }

        match self.store.set_invalid(feed_id, reason).await {
            Ok(()) => {
                tracing::info!(feed_id = feed_id, reason = reason, "Feed marked invalid");
                InvalidationOutcome::Invalidated
            }
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(feed_id = feed_id, "Feed disappeared before it could be invalidated");
                InvalidationOutcome::FeedNotFound
            }
            Err(e) => {
                tracing::error!(feed_id = feed_id, error = %e, "Could not mark feed invalid");
                InvalidationOutcome::StoreUnavailable
            }
        }
    }

    /// Apply one failure and acknowledge it unless the store was down.
    async fn apply(&self, failure: &FailedJob) -> InvalidationOutcome {
        let outcome = self.on_job_failed(failure.feed_id, &failure.reason).await;
        if outcome == InvalidationOutcome::StoreUnavailable {
            return outcome;
        }
        if let Some(failures) = &self.failures {
            if let Err(e) = failures.mark_applied(failure.job_id).await {
                tracing::warn!(job_id = failure.job_id, error = %e, "Could not acknowledge job failure");
            }
        }
        outcome
    }

    /// Apply every failure still unacknowledged in the failure log. Returns
    /// how many feeds were invalidated; zero without a failure log.
    pub async fn replay_failures(&self) -> usize {
        let Some(failures) = &self.failures else {
            return 0;
        };
        let pending = match failures.unapplied_failures().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Could not read unacknowledged job failures");
                return 0;
            }
        };

        let mut invalidated = 0;
        for failure in &pending {
            if self.apply(failure).await == InvalidationOutcome::Invalidated {
                invalidated += 1;
            }
        }
        if !pending.is_empty() {
            tracing::info!(
                pending = pending.len(),
                invalidated = invalidated,
                "Replayed unacknowledged job failures"
            );
        }
        invalidated
    }

    /// Handle [`QueueEvent::JobFailed`] events until `shutdown` flips to
    /// `true` or the queue goes away. Runs apart from the cycle controller so
    /// failures are recorded while a pass is in flight.
    pub fn spawn(
        &self,
        mut events: broadcast::Receiver<QueueEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            // Failures recorded while no handler was running.
            handler.replay_failures().await;

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.recv() => match event {
                        Ok(QueueEvent::JobFailed { job_id, feed_id, reason }) => {
                            tracing::debug!(job_id = job_id, feed_id = feed_id, "Job failed");
                            handler.apply(&FailedJob { job_id, feed_id, reason }).await;
                        }
                        Ok(QueueEvent::QueueDrained) => {
                            handler.replay_failures().await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            if handler.failures.is_some() {
                                tracing::warn!(skipped = skipped, "Queue events lagged, replaying unacknowledged failures");
                                handler.replay_failures().await;
                            } else {
                                tracing::warn!(skipped = skipped, "Queue events lagged, some failures were not recorded");
                            }
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::info!("Invalidation handler stopped");
        })
    }
}
