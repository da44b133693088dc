//! Discovery → reconcile → enqueue passes, restarted on queue drain.
//!
//! The controller is Idle or Running. [`CycleController::start`] moves it to
//! Running for one pass; a `start` that arrives while a pass is in flight is
//! coalesced into a single follow-up pass instead of running concurrently.
//! [`CycleController::spawn`] wires `start` to the queue's
//! [`QueueEvent::QueueDrained`], which produces the perpetual cycle.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::reconcile::{Reconciler, Resolution};
use crate::directory::{DirectoryError, SourceDirectory};
use crate::queue::{FeedJob, JobQueue, QueueError, QueueEvent};
use crate::storage::{FeedId, FeedStore, StoreError};

/// Tuning for the cycle controller.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    /// Maximum `add_feed` calls in flight during a pass
    pub enqueue_concurrency: usize,
    /// Delay before retrying after a pass that enqueued nothing. `None`
    /// leaves the drain event as the only trigger.
    pub stall_retry: Option<Duration>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            enqueue_concurrency: 16,
            stall_retry: None,
        }
    }
}

/// Why a pass was aborted. Nothing is enqueued after the failure point.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(#[from] DirectoryError),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Sequence number of the pass since the controller was built (1-based)
    pub pass: u64,
    /// Feeds already persisted when the pass began
    pub known: usize,
    /// Sources returned by the directory
    pub discovered: usize,
    /// Feeds created by this pass
    pub created: usize,
    /// Jobs enqueued, one per distinct feed
    pub enqueued: usize,
}

/// Result of a [`CycleController::start`] call.
#[derive(Debug)]
pub enum StartOutcome {
    /// This call ran the pass (plus any follow-up it absorbed); carries the
    /// result of the last one.
    Ran(Result<PassReport, CycleError>),
    /// A pass was already running; it will run one more pass when done.
    Coalesced,
}

struct Inner {
    store: Arc<dyn FeedStore>,
    directory: Arc<dyn SourceDirectory>,
    queue: Arc<dyn JobQueue>,
    reconciler: Reconciler,
    config: CycleConfig,
    running: AtomicBool,
    rerun: AtomicBool,
    passes: AtomicU64,
}

#[derive(Clone)]
pub struct CycleController {
    inner: Arc<Inner>,
}

impl CycleController {
    pub fn new(
        store: Arc<dyn FeedStore>,
        directory: Arc<dyn SourceDirectory>,
        queue: Arc<dyn JobQueue>,
        config: CycleConfig,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store));
        Self {
            inner: Arc::new(Inner {
                store,
                directory,
                queue,
                reconciler,
                config,
                running: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                passes: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of passes started so far.
    pub fn passes_started(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    /// Run a pass now, or coalesce into the one already running.
    ///
    /// Failures are logged and returned, never propagated as panics; the
    /// controller is Idle again when this returns `Ran`.
    pub async fn start(&self) -> StartOutcome {
        let state = &self.inner;

        // `running` and `rerun` are a Dekker pair: either we see the runner
        // still running after raising `rerun`, in which case it will see
        // `rerun` after clearing `running`, or we take over the run ourselves.
        loop {
            if state
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
            state.rerun.store(true, Ordering::SeqCst);
            if state.running.load(Ordering::SeqCst) {
                tracing::debug!("Pass already running, start coalesced");
                return StartOutcome::Coalesced;
            }
        }

        loop {
            state.rerun.store(false, Ordering::SeqCst);
            let result = self.run_pass().await;
            state.running.store(false, Ordering::SeqCst);

            if state.rerun.load(Ordering::SeqCst)
                && state
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                tracing::debug!("Running coalesced follow-up pass");
                continue;
            }
            return StartOutcome::Ran(result);
        }
    }

    async fn run_pass(&self) -> Result<PassReport, CycleError> {
        let pass = self.inner.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        tracing::info!(pass = pass, "Discovery pass started");

        let result = self.discover_and_enqueue(pass).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(report) => tracing::info!(
                pass = pass,
                known = report.known,
                discovered = report.discovered,
                created = report.created,
                enqueued = report.enqueued,
                elapsed_ms = elapsed_ms,
                "Discovery pass complete"
            ),
            Err(e) => tracing::warn!(
                pass = pass,
                error = %e,
                elapsed_ms = elapsed_ms,
                "Discovery pass aborted, waiting for next trigger"
            ),
        }
        result
    }

    async fn discover_and_enqueue(&self, pass: u64) -> Result<PassReport, CycleError> {
        let inner = &self.inner;

        let existing = inner.store.all().await?;
        let sources = inner.directory.fetch_sources().await?;

        let mut seen_urls: HashSet<&str> = existing.iter().map(|f| f.url.as_str()).collect();
        let mut feed_ids: Vec<FeedId> = existing.iter().map(|f| f.id).collect();
        let mut seen_ids: HashSet<FeedId> = feed_ids.iter().copied().collect();
        let mut created = 0;

        // Sequential, so a URL repeated within the pass sees its own creation.
        for source in &sources {
            if !seen_urls.insert(source.url.as_str()) {
                continue;
            }
            let (feed, resolution) = inner.reconciler.reconcile_with_resolution(source).await?;
            if resolution == Resolution::Created {
                created += 1;
            }
            if seen_ids.insert(feed.id) {
                feed_ids.push(feed.id);
            }
        }

        let queue = Arc::clone(&inner.queue);
        let enqueued = stream::iter(feed_ids)
            .map(|feed_id| {
                let queue = Arc::clone(&queue);
                async move { queue.add_feed(FeedJob { feed_id }).await }
            })
            .buffer_unordered(inner.config.enqueue_concurrency.max(1))
            .try_fold(0usize, |count, _job_id| async move { Ok::<_, QueueError>(count + 1) })
            .await?;

        Ok(PassReport {
            pass,
            known: existing.len(),
            discovered: sources.len(),
            created,
            enqueued,
        })
    }

    /// Start the controller's event loop: one pass immediately, then one per
    /// [`QueueEvent::QueueDrained`], until `shutdown` flips to `true`.
    ///
    /// Subscribe `events` before any job can settle, or the first drain may
    /// be missed. The returned task finishes only after any pass it started
    /// has finished.
    pub fn spawn(
        &self,
        events: broadcast::Receiver<QueueEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.event_loop(events, shutdown).await })
    }

    async fn event_loop(
        self,
        mut events: broadcast::Receiver<QueueEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Each pass task yields whether it enqueued anything, or `None` when
        // it coalesced into a running pass.
        let mut passes: JoinSet<Option<bool>> = JoinSet::new();
        let mut retry_at: Option<Instant> = None;

        self.spawn_start(&mut passes);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(QueueEvent::QueueDrained) => {
                        tracing::debug!("Queue drained, starting next pass");
                        retry_at = None;
                        self.spawn_start(&mut passes);
                    }
                    Ok(QueueEvent::JobFailed { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "Queue events lagged, starting pass in case a drain was missed");
                        self.spawn_start(&mut passes);
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Queue event stream closed");
                        break;
                    }
                },
                Some(joined) = passes.join_next(), if !passes.is_empty() => {
                    match joined {
                        Ok(Some(enqueued_any)) => {
                            retry_at = match (enqueued_any, self.inner.config.stall_retry) {
                                (false, Some(delay)) => {
                                    tracing::info!(
                                        retry_secs = delay.as_secs_f64(),
                                        "Pass enqueued nothing, queue will not drain; scheduling retry"
                                    );
                                    Some(Instant::now() + delay)
                                }
                                _ => None,
                            };
                        }
                        Ok(None) => {}
                        Err(e) => tracing::error!(error = %e, "Pass task ended abnormally"),
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                    self.spawn_start(&mut passes);
                }
            }
        }

        if !passes.is_empty() {
            tracing::info!(passes = passes.len(), "Waiting for in-flight pass to finish");
        }
        while let Some(joined) = passes.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Pass task ended abnormally");
            }
        }
        tracing::info!("Cycle controller stopped");
    }

    fn spawn_start(&self, passes: &mut JoinSet<Option<bool>>) {
        let controller = self.clone();
        passes.spawn(async move {
            match controller.start().await {
                StartOutcome::Ran(result) => {
                    Some(matches!(&result, Ok(report) if report.enqueued > 0))
                }
                StartOutcome::Coalesced => None,
            }
        });
    }
}
