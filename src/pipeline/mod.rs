//! The perpetual discovery cycle.
//!
//! - [`reconcile`] - maps discovered sources onto canonical feed records
//! - [`cycle`] - runs passes and restarts them when the queue drains
//! - [`invalidation`] - marks feeds invalid when their jobs fail
//!
//! [`Pipeline::start`] wires the cycle controller and the invalidation
//! handler to a queue's event stream; [`PipelineHandle::stop`] tears both
//! down.

pub mod cycle;
pub mod invalidation;
pub mod reconcile;

use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use cycle::{CycleConfig, CycleController, CycleError, PassReport, StartOutcome};
pub use invalidation::{InvalidationHandler, InvalidationOutcome, UNKNOWN_REASON};
pub use reconcile::{Reconciler, Resolution};

use crate::queue::JobQueue;

pub struct Pipeline;

impl Pipeline {
    /// Subscribe both consumers to `queue`'s events, then spawn them. The
    /// controller's first pass starts immediately.
    pub fn start(
        controller: &CycleController,
        invalidation: &InvalidationHandler,
        queue: &dyn JobQueue,
    ) -> PipelineHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);

        // Both receivers exist before the first pass can enqueue anything.
        let cycle_events = queue.subscribe();
        let failure_events = queue.subscribe();

        let tasks = vec![
            invalidation.spawn(failure_events, shutdown_rx.clone()),
            controller.spawn(cycle_events, shutdown_rx),
        ];
        tracing::info!("Pipeline started");

        PipelineHandle { shutdown, tasks }
    }
}

/// Running pipeline tasks. Dropping the handle leaves them running.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// A receiver that flips to `true` on [`stop`](Self::stop), for tasks
    /// attached with [`attach`](Self::attach).
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Join `task` on stop. The task should exit once
    /// [`shutdown_signal`](Self::shutdown_signal) fires.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Signal shutdown and wait for every task. A pass already in flight is
    /// not interrupted; this returns once it has finished.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task ended abnormally");
            }
        }
        tracing::info!("Pipeline stopped");
    }
}
