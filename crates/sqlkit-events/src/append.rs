// crates/sqlkit-events/src/append.rs
//! Append with optimistic concurrency.
//!
//! Appends serialize per stream: the stream row is locked `FOR UPDATE` for
//! the duration of the transaction, so per-stream versions are gapless and
//! the global position sequence assigns in insert order.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::types::{ensure_type_on, event_from_row, stream_from_row, EventRecord, EventType,
    StreamRow, EVENT_COLUMNS};

/// Options for [`append`].
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    pub metadata: Option<Value>,
    /// Optimistic concurrency check:
    /// - `None`: no check.
    /// - `Some(-1)`: the stream must not exist yet.
    /// - `Some(v), v ≥ 0`: the stream's current version must equal `v`
    ///   (0 matches a stream that does not exist yet).
    pub expected_version: Option<i64>,
    /// Category used to qualify a bare `"type"`; ignored when `event_type`
    /// is already `"category/type"`.
    pub category: Option<String>,
}

/// Append one event to a stream, creating the stream (and registering the
/// category/type) as needed. Returns the stored event with its assigned
/// global position and stream version.
pub async fn append(
    pool: &PgPool,
    stream_id: &str,
    event_type: &str,
    data: Value,
    options: &AppendOptions,
) -> Result<EventRecord> {
    if stream_id.trim().is_empty() {
        return Err(anyhow!("stream id must not be empty"));
    }
    if let Some(expected) = options.expected_version {
        if expected < -1 {
            return Err(anyhow!("expected_version must be -1 or >= 0, got {expected}"));
        }
    }

    let event_type = EventType::parse(event_type, options.category.as_deref())?;

    let mut tx = pool.begin().await.context("append begin failed")?;

    ensure_type_on(&mut *tx, &event_type).await?;

    // Materialize the stream row first so the FOR UPDATE lock below always
    // has something to grab; rolled back with everything else on failure.
    sqlx::query(
        r#"
        insert into events.streams (id, category_id)
        values ($1, $2)
        on conflict (id) do nothing
        "#,
    )
    .bind(stream_id)
    .bind(&event_type.category_id)
    .execute(&mut *tx)
    .await
    .context("append stream upsert failed")?;

    let row = sqlx::query("select version from events.streams where id = $1 for update")
        .bind(stream_id)
        .fetch_one(&mut *tx)
        .await
        .context("append stream lock failed")?;
    let version: i64 = row.try_get("version")?;

    // A live stream always has version >= 1 (it is only materialized by an
    // append that bumps the version before commit), so version 0 here means
    // the stream did not exist before this call.
    match options.expected_version {
        Some(-1) if version != 0 => {
            return Err(anyhow!("stream '{stream_id}' already exists"));
        }
        Some(expected) if expected > 0 && version == 0 => {
            return Err(anyhow!(
                "stream '{stream_id}' does not exist (expected version {expected})"
            ));
        }
        Some(expected) if expected >= 0 && expected != version => {
            return Err(anyhow!(
                "Concurrency conflict: stream '{stream_id}' is at version {version}, expected {expected}"
            ));
        }
        _ => {}
    }

    let new_version = version + 1;
    let event_id = Uuid::new_v4();

    let row = sqlx::query(&format!(
        r#"
        insert into events.events (
          id, stream_id, stream_version, category_id, type_id, data, metadata
        ) values (
          $1, $2, $3, $4, $5, $6, $7
        )
        returning {EVENT_COLUMNS}
        "#
    ))
    .bind(event_id)
    .bind(stream_id)
    .bind(new_version)
    .bind(&event_type.category_id)
    .bind(&event_type.type_id)
    .bind(&data)
    .bind(options.metadata.clone().unwrap_or_else(|| Value::Object(Default::default())))
    .fetch_one(&mut *tx)
    .await
    .context("append event insert failed")?;

    sqlx::query(
        r#"
        update events.streams
           set version = $2, updated_at = now()
         where id = $1
        "#,
    )
    .bind(stream_id)
    .bind(new_version)
    .execute(&mut *tx)
    .await
    .context("append stream version update failed")?;

    tx.commit().await.context("append commit failed")?;

    event_from_row(row)
}

/// Register a category/type pair without appending. Idempotent.
pub async fn register_type(pool: &PgPool, event_type: &str) -> Result<()> {
    let event_type = EventType::parse(event_type, None)?;
    let mut conn = pool.acquire().await.context("register_type acquire failed")?;
    ensure_type_on(&mut conn, &event_type).await
}

pub async fn get_stream(pool: &PgPool, stream_id: &str) -> Result<Option<StreamRow>> {
    let mut conn = pool.acquire().await.context("get_stream acquire failed")?;
    fetch_stream_on(&mut conn, stream_id).await
}

pub(crate) async fn fetch_stream_on(
    conn: &mut PgConnection,
    stream_id: &str,
) -> Result<Option<StreamRow>> {
    let row = sqlx::query(
        r#"
        select id, category_id, version, created_at, updated_at
        from events.streams
        where id = $1
        "#,
    )
    .bind(stream_id)
    .fetch_optional(conn)
    .await
    .context("fetch stream failed")?;

    row.map(stream_from_row).transpose()
}

/// Current version of a stream; 0 when the stream does not exist.
pub async fn stream_version(pool: &PgPool, stream_id: &str) -> Result<i64> {
    Ok(get_stream(pool, stream_id).await?.map_or(0, |s| s.version))
}
