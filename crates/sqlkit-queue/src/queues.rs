// crates/sqlkit-queue/src/queues.rs
//! Queue configuration rows.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};

/// Settings applied when creating or updating a queue. All durations are in
/// seconds.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retry_backoff: bool,
    pub expire_in: i64,
    pub retain_completed: i64,
    pub retain_failed: i64,
    pub dead_letter: Option<String>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            retry_delay: 0,
            retry_backoff: false,
            expire_in: 900,
            retain_completed: 86_400,
            retain_failed: 604_800,
            dead_letter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueRow {
    pub name: String,
    pub retry_limit: i32,
    pub retry_delay: i64,
    pub retry_backoff: bool,
    pub expire_in: i64,
    pub retain_completed: i64,
    pub retain_failed: i64,
    pub dead_letter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create a queue, or update its settings if it already exists.
pub async fn create_queue(pool: &PgPool, name: &str, options: &QueueOptions) -> Result<QueueRow> {
    if name.trim().is_empty() {
        return Err(anyhow!("queue name must not be empty"));
    }
    if let Some(dl) = &options.dead_letter {
        if dl == name {
            return Err(anyhow!("queue '{name}' cannot be its own dead letter"));
        }
    }

    let row = sqlx::query(
        r#"
        insert into queue.queues (
          name, retry_limit, retry_delay, retry_backoff,
          expire_in, retain_completed, retain_failed, dead_letter
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8
        )
        on conflict (name) do update
            set retry_limit      = excluded.retry_limit,
                retry_delay      = excluded.retry_delay,
                retry_backoff    = excluded.retry_backoff,
                expire_in        = excluded.expire_in,
                retain_completed = excluded.retain_completed,
                retain_failed    = excluded.retain_failed,
                dead_letter      = excluded.dead_letter,
                updated_at       = now()
        returning name, retry_limit, retry_delay, retry_backoff,
                  expire_in, retain_completed, retain_failed, dead_letter,
                  created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(options.retry_limit)
    .bind(options.retry_delay)
    .bind(options.retry_backoff)
    .bind(options.expire_in)
    .bind(options.retain_completed)
    .bind(options.retain_failed)
    .bind(&options.dead_letter)
    .fetch_one(pool)
    .await
    .context("create_queue failed")?;

    queue_from_row(row)
}

pub async fn get_queue(pool: &PgPool, name: &str) -> Result<Option<QueueRow>> {
    let mut conn = pool.acquire().await.context("get_queue acquire failed")?;
    fetch_queue_on(&mut conn, name).await
}

pub(crate) async fn fetch_queue_on(conn: &mut PgConnection, name: &str) -> Result<Option<QueueRow>> {
    let row = sqlx::query(
        r#"
        select name, retry_limit, retry_delay, retry_backoff,
               expire_in, retain_completed, retain_failed, dead_letter,
               created_at, updated_at
        from queue.queues
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(conn)
    .await
    .context("fetch queue failed")?;

    row.map(queue_from_row).transpose()
}

pub async fn list_queues(pool: &PgPool) -> Result<Vec<QueueRow>> {
    let rows = sqlx::query(
        r#"
        select name, retry_limit, retry_delay, retry_backoff,
               expire_in, retain_completed, retain_failed, dead_letter,
               created_at, updated_at
        from queue.queues
        order by name asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_queues failed")?;

    rows.into_iter().map(queue_from_row).collect()
}

/// Drop a queue along with its jobs and schedules. Returns false when the
/// queue did not exist.
pub async fn delete_queue(pool: &PgPool, name: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("delete_queue begin failed")?;

    sqlx::query("delete from queue.schedules where queue_name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("delete_queue schedules failed")?;

    sqlx::query("delete from queue.jobs where queue_name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("delete_queue jobs failed")?;

    let res = sqlx::query("delete from queue.queues where name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("delete_queue failed")?;

    tx.commit().await.context("delete_queue commit failed")?;
    Ok(res.rows_affected() > 0)
}

fn queue_from_row(row: sqlx::postgres::PgRow) -> Result<QueueRow> {
    Ok(QueueRow {
        name: row.try_get("name")?,
        retry_limit: row.try_get("retry_limit")?,
        retry_delay: row.try_get("retry_delay")?,
        retry_backoff: row.try_get("retry_backoff")?,
        expire_in: row.try_get("expire_in")?,
        retain_completed: row.try_get("retain_completed")?,
        retain_failed: row.try_get("retain_failed")?,
        dead_letter: row.try_get("dead_letter")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
