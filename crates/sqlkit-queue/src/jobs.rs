// crates/sqlkit-queue/src/jobs.rs
//! Job lifecycle: send, fetch, complete, fail, cancel.
//!
//! State machine:
//!
//! ```text
//! created ──fetch──▶ active ──complete──▶ completed
//!    │                 │
//!    │                 ├─fail (retry allowed)──▶ created (start_after = now + backoff)
//!    │                 ├─fail (exhausted)──────▶ failed  [→ optional dead-letter insert]
//!    │                 └─expire───────────────▶ expired
//!    └─cancel────────▶ cancelled  (also from active)
//! ```
//!
//! `expire_at` is non-NULL only while a job is `active`; every transition out
//! of `active` clears it. `completed_at` is stamped on every terminal
//! transition — retention cleanup keys on it.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::queues::fetch_queue_on;

pub(crate) const JOB_COLUMNS: &str = "id, queue_name, singleton_key, data, state, start_after, \
     expire_at, retry_count, retry_limit, retry_delay, retry_backoff, priority, output, \
     dead_letter_id, last_error, created_at, started_at, completed_at";

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(JobState::Created),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "expired" => Ok(JobState::Expired),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(anyhow!("invalid job state: {}", other)),
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Expired | JobState::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue_name: String,
    pub singleton_key: Option<String>,
    pub data: Value,
    pub state: JobState,
    pub start_after: DateTime<Utc>,
    pub expire_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retry_backoff: bool,
    pub priority: i32,
    pub output: Option<Value>,
    pub dead_letter_id: Option<Uuid>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub(crate) fn job_from_row(row: sqlx::postgres::PgRow) -> Result<Job> {
    Ok(Job {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        singleton_key: row.try_get("singleton_key")?,
        data: row.try_get("data")?,
        state: JobState::parse(&row.try_get::<String, _>("state")?)?,
        start_after: row.try_get("start_after")?,
        expire_at: row.try_get("expire_at")?,
        retry_count: row.try_get("retry_count")?,
        retry_limit: row.try_get("retry_limit")?,
        retry_delay: row.try_get("retry_delay")?,
        retry_backoff: row.try_get("retry_backoff")?,
        priority: row.try_get("priority")?,
        output: row.try_get("output")?,
        dead_letter_id: row.try_get("dead_letter_id")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

// ---------------------------------------------------------------------------
// send
// ---------------------------------------------------------------------------

/// Options for [`send`]. Retry settings default to the queue's configuration.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: i32,
    /// Absolute earliest start; wins over `delay_secs`.
    pub start_after: Option<DateTime<Utc>>,
    /// Relative delay from now, in seconds.
    pub delay_secs: Option<i64>,
    pub singleton_key: Option<String>,
    pub retry_limit: Option<i32>,
    pub retry_delay: Option<i64>,
    pub retry_backoff: Option<bool>,
}

/// Enqueue one job.
///
/// Returns `None` when a singleton key is given and another job with that key
/// is already `created` or `active` in the queue (the insert is suppressed by
/// `ON CONFLICT DO NOTHING` against the partial unique index).
pub async fn send(
    pool: &PgPool,
    queue_name: &str,
    data: Value,
    options: &SendOptions,
) -> Result<Option<Uuid>> {
    let mut conn = pool.acquire().await.context("send acquire failed")?;

    let queue = fetch_queue_on(&mut conn, queue_name)
        .await?
        .ok_or_else(|| anyhow!("queue '{queue_name}' not found"))?;

    let start_after = options.start_after.unwrap_or_else(|| {
        Utc::now() + Duration::seconds(options.delay_secs.unwrap_or(0).max(0))
    });

    let id = Uuid::new_v4();
    let row = sqlx::query(
        r#"
        insert into queue.jobs (
          id, queue_name, singleton_key, data, state, start_after,
          retry_limit, retry_delay, retry_backoff, priority
        ) values (
          $1, $2, $3, $4, 'created', $5, $6, $7, $8, $9
        )
        on conflict (queue_name, singleton_key)
          where singleton_key is not null and state in ('created', 'active')
          do nothing
        returning id
        "#,
    )
    .bind(id)
    .bind(queue_name)
    .bind(&options.singleton_key)
    .bind(&data)
    .bind(start_after)
    .bind(options.retry_limit.unwrap_or(queue.retry_limit))
    .bind(options.retry_delay.unwrap_or(queue.retry_delay))
    .bind(options.retry_backoff.unwrap_or(queue.retry_backoff))
    .bind(options.priority)
    .fetch_optional(&mut *conn)
    .await
    .context("send insert failed")?;

    match row {
        Some(row) => Ok(Some(row.try_get("id")?)),
        None => Ok(None),
    }
}

/// Enqueue a batch of payloads with shared options. Singleton suppression
/// applies per payload; suppressed entries are absent from the result.
pub async fn send_batch(
    pool: &PgPool,
    queue_name: &str,
    payloads: &[Value],
    options: &SendOptions,
) -> Result<Vec<Uuid>> {
    let mut out = Vec::with_capacity(payloads.len());
    for payload in payloads {
        if let Some(id) = send(pool, queue_name, payload.clone(), options).await? {
            out.push(id);
        }
    }
    Ok(out)
}

pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query(&format!(
        "select {JOB_COLUMNS} from queue.jobs where id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("get_job failed")?;

    row.map(job_from_row).transpose()
}

// ---------------------------------------------------------------------------
// fetch
// ---------------------------------------------------------------------------

/// Claim up to `batch_size` due jobs for exclusive processing.
///
/// Candidates are `created` rows whose `start_after` has passed, ordered by
/// priority (descending) then creation time. `FOR UPDATE SKIP LOCKED` makes
/// concurrent fetches return pairwise-disjoint sets with no coordination
/// beyond row locks. Claimed rows transition to `active` with `started_at`
/// and `expire_at = now() + queue.expire_in` stamped.
pub async fn fetch(pool: &PgPool, queue_name: &str, batch_size: i64) -> Result<Vec<Job>> {
    let mut conn = pool.acquire().await.context("fetch acquire failed")?;

    let queue = fetch_queue_on(&mut conn, queue_name)
        .await?
        .ok_or_else(|| anyhow!("queue '{queue_name}' not found"))?;

    let rows = sqlx::query(&format!(
        r#"
        with next as (
            select id
            from queue.jobs
            where queue_name = $1
              and state = 'created'
              and start_after <= now()
            order by priority desc, created_at asc
            limit $2
            for update skip locked
        )
        update queue.jobs j
           set state      = 'active',
               started_at = now(),
               expire_at  = now() + make_interval(secs => $3)
          from next
         where j.id = next.id
        returning {}
        "#,
        JOB_COLUMNS
            .split(", ")
            .map(|c| format!("j.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    ))
    .bind(queue_name)
    .bind(batch_size)
    .bind(queue.expire_in as f64)
    .fetch_all(&mut *conn)
    .await
    .context("fetch claim failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(job_from_row(row)?);
    }
    // Claim order is not guaranteed by UPDATE … RETURNING.
    out.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });
    Ok(out)
}

// ---------------------------------------------------------------------------
// complete / fail / cancel
// ---------------------------------------------------------------------------

/// Mark an active job completed. Returns `None` when the job is not `active`
/// (already finished, retried, or never fetched) — a no-op, not an error.
pub async fn complete(pool: &PgPool, id: Uuid, output: Option<Value>) -> Result<Option<Job>> {
    let row = sqlx::query(&format!(
        r#"
        update queue.jobs
           set state        = 'completed',
               output       = $2,
               completed_at = now(),
               expire_at    = null
         where id = $1 and state = 'active'
        returning {JOB_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(output)
    .fetch_optional(pool)
    .await
    .context("complete failed")?;

    row.map(job_from_row).transpose()
}

/// Result of [`fail`].
#[derive(Debug, Clone)]
pub struct FailOutcome {
    pub job_id: Uuid,
    pub will_retry: bool,
    /// Retry count after this failure.
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Dead-letter job created when retries were exhausted and the queue has
    /// a dead-letter target.
    pub dead_letter_job_id: Option<Uuid>,
}

/// Seconds until the next retry attempt. `retry_count` is the number of
/// failures before this one; with backoff the delay doubles per prior
/// failure, so the first retry waits exactly `retry_delay`.
pub(crate) fn retry_backoff_secs(retry_delay: i64, retry_backoff: bool, retry_count: i32) -> i64 {
    if !retry_backoff {
        return retry_delay;
    }
    let shift = retry_count.clamp(0, 31) as u32;
    retry_delay.saturating_mul(1i64 << shift)
}

/// Fail an active job.
///
/// If retries remain, the job returns to `created` with `start_after`
/// pushed out by the (optionally exponential) backoff. Otherwise it
/// transitions to `failed`; when the queue has a `dead_letter` target a new
/// job carrying `data`, `priority` and a `dead_letter_id` backlink is
/// inserted there. Returns `None` when the job is not `active`.
pub async fn fail(pool: &PgPool, id: Uuid, error: Option<&str>) -> Result<Option<FailOutcome>> {
    let mut tx = pool.begin().await.context("fail begin failed")?;

    let row = sqlx::query(&format!(
        "select {JOB_COLUMNS} from queue.jobs where id = $1 and state = 'active' for update"
    ))
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .context("fail lookup failed")?;

    let Some(row) = row else { return Ok(None) };
    let job = job_from_row(row)?;

    if job.retry_count < job.retry_limit {
        let delay = retry_backoff_secs(job.retry_delay, job.retry_backoff, job.retry_count);
        let next_retry_at = Utc::now() + Duration::seconds(delay);

        sqlx::query(
            r#"
            update queue.jobs
               set state       = 'created',
                   retry_count = retry_count + 1,
                   start_after = $2,
                   started_at  = null,
                   expire_at   = null,
                   last_error  = $3
             where id = $1
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(error)
        .execute(&mut *tx)
        .await
        .context("fail retry update failed")?;

        tx.commit().await.context("fail commit failed")?;
        return Ok(Some(FailOutcome {
            job_id: id,
            will_retry: true,
            retry_count: job.retry_count + 1,
            next_retry_at: Some(next_retry_at),
            dead_letter_job_id: None,
        }));
    }

    sqlx::query(
        r#"
        update queue.jobs
           set state        = 'failed',
               completed_at = now(),
               expire_at    = null,
               last_error   = $2
         where id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .execute(&mut *tx)
    .await
    .context("fail terminal update failed")?;

    let queue = fetch_queue_on(&mut *tx, &job.queue_name)
        .await?
        .ok_or_else(|| anyhow!("queue '{}' not found", job.queue_name))?;

    let mut dead_letter_job_id = None;
    if let Some(dead_letter) = &queue.dead_letter {
        let dl_queue = fetch_queue_on(&mut *tx, dead_letter)
            .await?
            .ok_or_else(|| anyhow!("dead-letter queue '{dead_letter}' not found"))?;

        let dl_id = Uuid::new_v4();
        sqlx::query(
            r#"
            insert into queue.jobs (
              id, queue_name, data, state, priority, dead_letter_id,
              retry_limit, retry_delay, retry_backoff, last_error
            ) values (
              $1, $2, $3, 'created', $4, $5, $6, $7, $8, $9
            )
            "#,
        )
        .bind(dl_id)
        .bind(dead_letter)
        .bind(&job.data)
        .bind(job.priority)
        .bind(job.id)
        .bind(dl_queue.retry_limit)
        .bind(dl_queue.retry_delay)
        .bind(dl_queue.retry_backoff)
        .bind(error)
        .execute(&mut *tx)
        .await
        .context("fail dead-letter insert failed")?;
        dead_letter_job_id = Some(dl_id);
    }

    tx.commit().await.context("fail commit failed")?;
    Ok(Some(FailOutcome {
        job_id: id,
        will_retry: false,
        retry_count: job.retry_count,
        next_retry_at: None,
        dead_letter_job_id,
    }))
}

/// Result of [`cancel`].
#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub cancelled: bool,
    /// The state the job was in before the call, when it existed.
    pub previous_state: Option<JobState>,
}

/// Cancel a `created` or `active` job. Any other state (or a missing id) is a
/// no-op reported as `cancelled = false`.
pub async fn cancel(pool: &PgPool, id: Uuid) -> Result<CancelOutcome> {
    let mut tx = pool.begin().await.context("cancel begin failed")?;

    let row = sqlx::query("select state from queue.jobs where id = $1 for update")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("cancel lookup failed")?;

    let Some(row) = row else {
        return Ok(CancelOutcome {
            cancelled: false,
            previous_state: None,
        });
    };
    let previous = JobState::parse(&row.try_get::<String, _>("state")?)?;

    if !matches!(previous, JobState::Created | JobState::Active) {
        return Ok(CancelOutcome {
            cancelled: false,
            previous_state: Some(previous),
        });
    }

    sqlx::query(
        r#"
        update queue.jobs
           set state        = 'cancelled',
               completed_at = now(),
               expire_at    = null
         where id = $1
        "#,
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("cancel update failed")?;

    tx.commit().await.context("cancel commit failed")?;
    Ok(CancelOutcome {
        cancelled: true,
        previous_state: Some(previous),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips() {
        for state in [
            JobState::Created,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
            JobState::Expired,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()).unwrap(), state);
        }
        assert!(JobState::parse("armed").is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Expired.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn backoff_doubles_per_prior_failure() {
        // First retry waits exactly retry_delay.
        assert_eq!(retry_backoff_secs(10, true, 0), 10);
        assert_eq!(retry_backoff_secs(10, true, 1), 20);
        assert_eq!(retry_backoff_secs(10, true, 2), 40);
        // Without backoff the delay is flat.
        assert_eq!(retry_backoff_secs(10, false, 5), 10);
        // Saturates instead of overflowing.
        assert_eq!(retry_backoff_secs(i64::MAX, true, 31), i64::MAX);
    }
}
