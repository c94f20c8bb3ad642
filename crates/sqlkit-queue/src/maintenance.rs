// crates/sqlkit-queue/src/maintenance.rs
//! Periodic maintenance: expiration sweep, retention cleanup, purge.
//!
//! These are invoked on a timer by an external collaborator; each call is a
//! single bulk statement (or one short transaction) and is safe to run
//! concurrently from several hosts.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::jobs::JobState;

/// Per-queue result of [`expire_jobs`].
#[derive(Debug, Clone)]
pub struct ExpireCount {
    pub queue_name: String,
    pub expired: i64,
}

/// Transition stale `active` jobs (past their `expire_at`) to `expired`.
///
/// `completed_at` is stamped so retention cleanup can age these rows out.
pub async fn expire_jobs(pool: &PgPool) -> Result<Vec<ExpireCount>> {
    let rows = sqlx::query(
        r#"
        with expired as (
            update queue.jobs
               set state        = 'expired',
                   completed_at = now(),
                   expire_at    = null
             where state = 'active'
               and expire_at < now()
            returning queue_name
        )
        select queue_name, count(*)::bigint as expired
        from expired
        group by queue_name
        order by queue_name
        "#,
    )
    .fetch_all(pool)
    .await
    .context("expire_jobs failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ExpireCount {
            queue_name: row.try_get("queue_name")?,
            expired: row.try_get("expired")?,
        });
    }
    if !out.is_empty() {
        tracing::info!(
            queues = out.len(),
            total = out.iter().map(|c| c.expired).sum::<i64>(),
            "expired stale active jobs"
        );
    }
    Ok(out)
}

/// Result of [`cleanup`].
#[derive(Debug, Clone, Default)]
pub struct CleanupCount {
    pub completed_deleted: u64,
    pub failed_deleted: u64,
}

/// Delete jobs past their queue's retention windows.
///
/// `completed` rows age against `retain_completed`; `failed`, `expired` and
/// `cancelled` rows age against `retain_failed`. Both clocks start at
/// `completed_at`, which every terminal transition stamps.
pub async fn cleanup(pool: &PgPool) -> Result<CleanupCount> {
    let mut tx = pool.begin().await.context("cleanup begin failed")?;

    let completed = sqlx::query(
        r#"
        delete from queue.jobs j
        using queue.queues q
        where q.name = j.queue_name
          and j.state = 'completed'
          and j.completed_at < now() - make_interval(secs => q.retain_completed::double precision)
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("cleanup completed delete failed")?;

    let failed = sqlx::query(
        r#"
        delete from queue.jobs j
        using queue.queues q
        where q.name = j.queue_name
          and j.state in ('failed', 'expired', 'cancelled')
          and j.completed_at < now() - make_interval(secs => q.retain_failed::double precision)
        "#,
    )
    .execute(&mut *tx)
    .await
    .context("cleanup failed delete failed")?;

    tx.commit().await.context("cleanup commit failed")?;

    let counts = CleanupCount {
        completed_deleted: completed.rows_affected(),
        failed_deleted: failed.rows_affected(),
    };
    tracing::debug!(
        completed = counts.completed_deleted,
        failed = counts.failed_deleted,
        "retention cleanup"
    );
    Ok(counts)
}

/// Delete a queue's jobs, optionally restricted to one state. Returns the
/// number of rows removed.
pub async fn purge(pool: &PgPool, queue_name: &str, state: Option<JobState>) -> Result<u64> {
    let res = match state {
        Some(state) => sqlx::query(
            r#"
            delete from queue.jobs
            where queue_name = $1 and state = $2
            "#,
        )
        .bind(queue_name)
        .bind(state.as_str())
        .execute(pool)
        .await
        .context("purge by state failed")?,
        None => sqlx::query(
            r#"
            delete from queue.jobs
            where queue_name = $1
            "#,
        )
        .bind(queue_name)
        .execute(pool)
        .await
        .context("purge failed")?,
    };

    Ok(res.rows_affected())
}

/// Reassemble an expired job's id list for observability. Not part of the
/// hot path; used by hosts that want to alert on expirations.
pub async fn list_jobs_by_state(
    pool: &PgPool,
    queue_name: &str,
    state: JobState,
    limit: i64,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        select id
        from queue.jobs
        where queue_name = $1 and state = $2
        order by created_at asc
        limit $3
        "#,
    )
    .bind(queue_name)
    .bind(state.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_jobs_by_state failed")?;

    rows.into_iter()
        .map(|row| row.try_get("id").map_err(Into::into))
        .collect()
}
