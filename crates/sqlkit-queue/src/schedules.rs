// crates/sqlkit-queue/src/schedules.rs
//! Schedule rows.
//!
//! The core stores and manages schedules; it never interprets `cron` or
//! `timezone`. An external collaborator evaluates due schedules, enqueues the
//! jobs, and reports back via [`record_schedule_run`].

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct Schedule {
    pub name: String,
    pub queue_name: String,
    pub cron: String,
    pub timezone: String,
    pub data: Value,
    pub priority: i32,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub timezone: String,
    pub data: Value,
    pub priority: i32,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            data: Value::Object(Default::default()),
            priority: 0,
        }
    }
}

const SCHEDULE_COLUMNS: &str = "name, queue_name, cron, timezone, data, priority, enabled, \
     last_run_at, next_run_at, created_at, updated_at";

/// Create a schedule, or update it in place if the name is taken (the
/// enabled flag and run bookkeeping survive updates).
pub async fn create_schedule(
    pool: &PgPool,
    name: &str,
    queue_name: &str,
    cron: &str,
    options: &ScheduleOptions,
) -> Result<Schedule> {
    if name.trim().is_empty() {
        return Err(anyhow!("schedule name must not be empty"));
    }
    if cron.trim().is_empty() {
        return Err(anyhow!("schedule cron expression must not be empty"));
    }

    let row = sqlx::query(&format!(
        r#"
        insert into queue.schedules (name, queue_name, cron, timezone, data, priority)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (name) do update
            set queue_name = excluded.queue_name,
                cron       = excluded.cron,
                timezone   = excluded.timezone,
                data       = excluded.data,
                priority   = excluded.priority,
                updated_at = now()
        returning {SCHEDULE_COLUMNS}
        "#
    ))
    .bind(name)
    .bind(queue_name)
    .bind(cron)
    .bind(&options.timezone)
    .bind(&options.data)
    .bind(options.priority)
    .fetch_one(pool)
    .await
    .context("create_schedule failed")?;

    schedule_from_row(row)
}

pub async fn get_schedule(pool: &PgPool, name: &str) -> Result<Option<Schedule>> {
    let row = sqlx::query(&format!(
        "select {SCHEDULE_COLUMNS} from queue.schedules where name = $1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("get_schedule failed")?;

    row.map(schedule_from_row).transpose()
}

pub async fn list_schedules(pool: &PgPool) -> Result<Vec<Schedule>> {
    let rows = sqlx::query(&format!(
        "select {SCHEDULE_COLUMNS} from queue.schedules order by name asc"
    ))
    .fetch_all(pool)
    .await
    .context("list_schedules failed")?;

    rows.into_iter().map(schedule_from_row).collect()
}

/// Enable or disable a schedule. Returns false when the name is unknown.
pub async fn set_schedule_enabled(pool: &PgPool, name: &str, enabled: bool) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update queue.schedules
           set enabled = $2, updated_at = now()
         where name = $1
        "#,
    )
    .bind(name)
    .bind(enabled)
    .execute(pool)
    .await
    .context("set_schedule_enabled failed")?;

    Ok(res.rows_affected() > 0)
}

pub async fn delete_schedule(pool: &PgPool, name: &str) -> Result<bool> {
    let res = sqlx::query("delete from queue.schedules where name = $1")
        .bind(name)
        .execute(pool)
        .await
        .context("delete_schedule failed")?;

    Ok(res.rows_affected() > 0)
}

/// Bookkeeping hook for the external cron evaluator: records when the
/// schedule last fired and, if known, when it fires next.
pub async fn record_schedule_run(
    pool: &PgPool,
    name: &str,
    ran_at: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update queue.schedules
           set last_run_at = $2,
               next_run_at = $3,
               updated_at  = now()
         where name = $1
        "#,
    )
    .bind(name)
    .bind(ran_at)
    .bind(next_run_at)
    .execute(pool)
    .await
    .context("record_schedule_run failed")?;

    Ok(res.rows_affected() > 0)
}

fn schedule_from_row(row: sqlx::postgres::PgRow) -> Result<Schedule> {
    Ok(Schedule {
        name: row.try_get("name")?,
        queue_name: row.try_get("queue_name")?,
        cron: row.try_get("cron")?,
        timezone: row.try_get("timezone")?,
        data: row.try_get("data")?,
        priority: row.try_get("priority")?,
        enabled: row.try_get("enabled")?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
