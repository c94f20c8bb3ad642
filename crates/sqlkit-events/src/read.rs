// crates/sqlkit-events/src/read.rs
//! Read paths over the event log.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::types::{event_from_row, EventRecord, EVENT_COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// Read a stream's events, version-gated and limit-capped.
///
/// `Forward` returns events with `stream_version >= from_version` in
/// ascending order; `Backward` returns `stream_version <= from_version`
/// descending (pass `i64::MAX` to start from the tip).
pub async fn read_stream(
    pool: &PgPool,
    stream_id: &str,
    from_version: i64,
    limit: i64,
    direction: ReadDirection,
) -> Result<Vec<EventRecord>> {
    let sql = match direction {
        ReadDirection::Forward => format!(
            r#"
            select {EVENT_COLUMNS}
            from events.events
            where stream_id = $1 and stream_version >= $2
            order by stream_version asc
            limit $3
            "#
        ),
        ReadDirection::Backward => format!(
            r#"
            select {EVENT_COLUMNS}
            from events.events
            where stream_id = $1 and stream_version <= $2
            order by stream_version desc
            limit $3
            "#
        ),
    };

    let rows = sqlx::query(&sql)
        .bind(stream_id)
        .bind(from_version)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("read_stream failed")?;

    rows.into_iter().map(event_from_row).collect()
}

/// Read across all streams in global-position order.
///
/// `filter_types` entries are either `"type"` (any category) or
/// `"category/type"`; `filter_streams` restricts to the listed stream ids.
pub async fn read_all(
    pool: &PgPool,
    from_position: i64,
    limit: i64,
    filter_types: Option<&[String]>,
    filter_streams: Option<&[String]>,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query(&format!(
        r#"
        select {EVENT_COLUMNS}
        from events.events e
        where e.position > $1
          and (
            $3::text[] is null
            or e.type_id = any($3)
            or (e.category_id || '/' || e.type_id) = any($3)
          )
          and ($4::text[] is null or e.stream_id = any($4))
        order by e.position asc
        limit $2
        "#
    ))
    .bind(from_position)
    .bind(limit)
    .bind(filter_types)
    .bind(filter_streams)
    .fetch_all(pool)
    .await
    .context("read_all failed")?;

    rows.into_iter().map(event_from_row).collect()
}

pub async fn read_by_type(
    pool: &PgPool,
    category: &str,
    type_id: &str,
    from_position: i64,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query(&format!(
        r#"
        select {EVENT_COLUMNS}
        from events.events
        where category_id = $1 and type_id = $2 and position > $3
        order by position asc
        limit $4
        "#
    ))
    .bind(category)
    .bind(type_id)
    .bind(from_position)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("read_by_type failed")?;

    rows.into_iter().map(event_from_row).collect()
}

pub async fn read_by_category(
    pool: &PgPool,
    category: &str,
    from_position: i64,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query(&format!(
        r#"
        select {EVENT_COLUMNS}
        from events.events
        where category_id = $1 and position > $2
        order by position asc
        limit $3
        "#
    ))
    .bind(category)
    .bind(from_position)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("read_by_category failed")?;

    rows.into_iter().map(event_from_row).collect()
}

pub async fn get_event(pool: &PgPool, id: Uuid) -> Result<Option<EventRecord>> {
    let row = sqlx::query(&format!(
        "select {EVENT_COLUMNS} from events.events where id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("get_event failed")?;

    row.map(event_from_row).transpose()
}

pub async fn get_event_at_position(pool: &PgPool, position: i64) -> Result<Option<EventRecord>> {
    let row = sqlx::query(&format!(
        "select {EVENT_COLUMNS} from events.events where position = $1"
    ))
    .bind(position)
    .fetch_optional(pool)
    .await
    .context("get_event_at_position failed")?;

    row.map(event_from_row).transpose()
}

/// Highest assigned global position; 0 on an empty store.
pub async fn max_position(pool: &PgPool) -> Result<i64> {
    let row = sqlx::query("select coalesce(max(position), 0) as max_position from events.events")
        .fetch_one(pool)
        .await
        .context("max_position failed")?;
    Ok(row.try_get("max_position")?)
}
