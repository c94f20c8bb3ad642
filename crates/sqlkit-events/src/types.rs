// crates/sqlkit-events/src/types.rs
//! Row types and event-type syntax.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

/// A fully-qualified event type: `"category/type"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventType {
    pub category_id: String,
    pub type_id: String,
}

impl EventType {
    /// Parse `"category/type"`. When `default_category` is given, a bare
    /// `"type"` is also accepted and qualified with it.
    pub fn parse(input: &str, default_category: Option<&str>) -> Result<Self> {
        let make = |category: &str, type_id: &str| -> Result<Self> {
            if category.is_empty() || type_id.is_empty() {
                return Err(anyhow!(
                    "invalid event type '{input}': expected \"category/type\""
                ));
            }
            Ok(Self {
                category_id: category.to_string(),
                type_id: type_id.to_string(),
            })
        };

        match input.split_once('/') {
            Some((category, type_id)) => {
                if type_id.contains('/') {
                    return Err(anyhow!(
                        "invalid event type '{input}': expected \"category/type\""
                    ));
                }
                make(category, type_id)
            }
            None => match default_category {
                Some(category) => make(category, input),
                None => Err(anyhow!(
                    "invalid event type '{input}': expected \"category/type\""
                )),
            },
        }
    }

    pub fn qualified(&self) -> String {
        format!("{}/{}", self.category_id, self.type_id)
    }
}

/// Register a category and one of its types. Idempotent.
pub(crate) async fn ensure_type_on(conn: &mut PgConnection, event_type: &EventType) -> Result<()> {
    sqlx::query("insert into events.categories (id) values ($1) on conflict (id) do nothing")
        .bind(&event_type.category_id)
        .execute(&mut *conn)
        .await
        .context("ensure category failed")?;

    sqlx::query(
        "insert into events.types (category_id, id) values ($1, $2) on conflict (category_id, id) do nothing",
    )
    .bind(&event_type.category_id)
    .bind(&event_type.type_id)
    .execute(&mut *conn)
    .await
    .context("ensure type failed")?;

    Ok(())
}

/// One appended event, as read back from the store.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Global position, strictly monotonic by insert order.
    pub position: i64,
    pub id: Uuid,
    pub stream_id: String,
    /// Per-stream version, gapless from 1.
    pub stream_version: i64,
    pub category_id: String,
    pub type_id: String,
    pub data: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

pub(crate) const EVENT_COLUMNS: &str = "position, id, stream_id, stream_version, category_id, \
     type_id, data, metadata, created_at";

pub(crate) fn event_from_row(row: sqlx::postgres::PgRow) -> Result<EventRecord> {
    Ok(EventRecord {
        position: row.try_get("position")?,
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        stream_version: row.try_get("stream_version")?,
        category_id: row.try_get("category_id")?,
        type_id: row.try_get("type_id")?,
        data: row.try_get("data")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct StreamRow {
    pub id: String,
    pub category_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn stream_from_row(row: sqlx::postgres::PgRow) -> Result<StreamRow> {
    Ok(StreamRow {
        id: row.try_get("id")?,
        category_id: row.try_get("category_id")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qualified_types() {
        let t = EventType::parse("cart/item-added", None).unwrap();
        assert_eq!(t.category_id, "cart");
        assert_eq!(t.type_id, "item-added");
        assert_eq!(t.qualified(), "cart/item-added");
    }

    #[test]
    fn bare_type_requires_default_category() {
        assert!(EventType::parse("item-added", None).is_err());
        let t = EventType::parse("item-added", Some("cart")).unwrap();
        assert_eq!(t.qualified(), "cart/item-added");
    }

    #[test]
    fn rejects_malformed_types() {
        for bad in ["", "/", "cart/", "/item", "a/b/c"] {
            assert!(EventType::parse(bad, None).is_err(), "expected rejection: {bad}");
            assert!(
                EventType::parse(bad, Some("cat")).is_err(),
                "expected rejection with default category: {bad}"
            );
        }
    }
}
