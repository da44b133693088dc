//! Continuous feed ingestion.
//!
//! Each pass asks the [`directory`] service for every feed owned by an
//! unflagged user, reconciles the results against the [`storage`] layer and
//! enqueues one job per known feed on the [`queue`]. When the queue drains,
//! the [`pipeline`] starts the next pass; when a job fails, its feed is
//! marked invalid. The bundled [`worker`] is a reference consumer.

pub mod config;
pub mod directory;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod util;
pub mod worker;
