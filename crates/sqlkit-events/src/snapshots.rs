// crates/sqlkit-events/src/snapshots.rs
//! Named per-stream snapshots.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub stream_id: String,
    pub name: String,
    pub version: i64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}

/// Upsert a snapshot for `(stream_id, name)`. The stream must exist.
pub async fn save_snapshot(
    pool: &PgPool,
    stream_id: &str,
    name: &str,
    version: i64,
    state: Value,
) -> Result<Snapshot> {
    let row = sqlx::query(
        r#"
        insert into events.snapshots (stream_id, name, version, state)
        values ($1, $2, $3, $4)
        on conflict (stream_id, name) do update
            set version    = excluded.version,
                state      = excluded.state,
                created_at = now()
        returning stream_id, name, version, state, created_at
        "#,
    )
    .bind(stream_id)
    .bind(name)
    .bind(version)
    .bind(&state)
    .fetch_one(pool)
    .await
    .context("save_snapshot failed")?;

    snapshot_from_row(row)
}

pub async fn load_snapshot(pool: &PgPool, stream_id: &str, name: &str) -> Result<Option<Snapshot>> {
    let row = sqlx::query(
        r#"
        select stream_id, name, version, state, created_at
        from events.snapshots
        where stream_id = $1 and name = $2
        "#,
    )
    .bind(stream_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("load_snapshot failed")?;

    row.map(snapshot_from_row).transpose()
}

pub async fn delete_snapshot(pool: &PgPool, stream_id: &str, name: &str) -> Result<bool> {
    let res = sqlx::query("delete from events.snapshots where stream_id = $1 and name = $2")
        .bind(stream_id)
        .bind(name)
        .execute(pool)
        .await
        .context("delete_snapshot failed")?;

    Ok(res.rows_affected() > 0)
}

fn snapshot_from_row(row: sqlx::postgres::PgRow) -> Result<Snapshot> {
    Ok(Snapshot {
        stream_id: row.try_get("stream_id")?,
        name: row.try_get("name")?,
        version: row.try_get("version")?,
        state: row.try_get("state")?,
        created_at: row.try_get("created_at")?,
    })
}
