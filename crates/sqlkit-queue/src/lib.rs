// crates/sqlkit-queue/src/lib.rs
//! Durable job queue on Postgres (`queue` schema).
//!
//! Jobs move through a six-state machine (`created` → `active` → terminal),
//! claimed in batches via `FOR UPDATE SKIP LOCKED` so any number of workers
//! can fetch concurrently without coordination. Retries with optional
//! exponential backoff, singleton keys, dead-letter routing, expiration and
//! retention cleanup are all enforced server-side.

use anyhow::Result;
use sqlx::PgPool;

pub mod jobs;
pub mod maintenance;
pub mod queues;
pub mod schedules;

pub use jobs::{
    cancel, complete, fail, fetch, get_job, send, send_batch, CancelOutcome, FailOutcome, Job,
    JobState, SendOptions,
};
pub use maintenance::{cleanup, expire_jobs, list_jobs_by_state, purge, CleanupCount, ExpireCount};
pub use queues::{create_queue, delete_queue, get_queue, list_queues, QueueOptions, QueueRow};
pub use schedules::{
    create_schedule, delete_schedule, get_schedule, list_schedules, record_schedule_run,
    set_schedule_enabled, Schedule, ScheduleOptions,
};

/// Install the `queue` schema. Idempotent.
pub async fn install(pool: &PgPool) -> Result<()> {
    sqlkit_db::run_install_script(pool, "queue", include_str!("../sql/install.sql")).await
}
