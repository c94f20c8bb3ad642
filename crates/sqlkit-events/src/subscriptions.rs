// crates/sqlkit-events/src/subscriptions.rs
//! Subscriptions: claim-based polling over the event log.
//!
//! A subscription is a named cursor (`last_position`) plus optional type and
//! stream filters. `poll` selects unclaimed events past the cursor with
//! `FOR UPDATE SKIP LOCKED` and records a claim per position, so concurrent
//! pollers of the same subscription receive disjoint batches; `ack` releases
//! the claim and advances the cursor (never backward). Claims expire, which
//! is what makes delivery at-least-once when a worker dies mid-batch.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};

use crate::types::{ensure_type_on, event_from_row, EventRecord, EventType, EVENT_COLUMNS};

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub name: String,
    pub last_position: i64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// [`SubscriptionRow`] plus lag bookkeeping for listings.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub subscription: SubscriptionRow,
    /// Distance from the global max position (not the filtered max): a
    /// subscription with narrow filters reports lag it will never consume.
    pub events_behind: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// `"category/type"` filters; empty means all types.
    pub filter_types: Vec<String>,
    /// Stream-id filters; empty means all streams.
    pub filter_streams: Vec<String>,
    /// Starting cursor; events at or before this position are skipped.
    pub from_position: i64,
}

/// Create a subscription. Idempotent on the name: re-creating refreshes the
/// filter sets but leaves the cursor and active flag alone.
pub async fn create_subscription(
    pool: &PgPool,
    name: &str,
    options: &SubscriptionOptions,
) -> Result<SubscriptionRow> {
    let mut tx = pool.begin().await.context("create_subscription begin failed")?;
    let row = create_subscription_on(&mut *tx, name, options).await?;
    tx.commit().await.context("create_subscription commit failed")?;
    Ok(row)
}

pub(crate) async fn create_subscription_on(
    conn: &mut PgConnection,
    name: &str,
    options: &SubscriptionOptions,
) -> Result<SubscriptionRow> {
    if name.trim().is_empty() {
        return Err(anyhow!("subscription name must not be empty"));
    }

    sqlx::query(
        r#"
        insert into events.subscriptions (name, last_position)
        values ($1, $2)
        on conflict (name) do nothing
        "#,
    )
    .bind(name)
    .bind(options.from_position)
    .execute(&mut *conn)
    .await
    .context("create_subscription insert failed")?;

    sqlx::query("delete from events.subscription_types where subscription_name = $1")
        .bind(name)
        .execute(&mut *conn)
        .await
        .context("create_subscription type filter reset failed")?;

    for filter in &options.filter_types {
        let event_type = EventType::parse(filter, None)?;
        ensure_type_on(&mut *conn, &event_type).await?;
        sqlx::query(
            r#"
            insert into events.subscription_types (subscription_name, category_id, type_id)
            values ($1, $2, $3)
            on conflict do nothing
            "#,
        )
        .bind(name)
        .bind(&event_type.category_id)
        .bind(&event_type.type_id)
        .execute(&mut *conn)
        .await
        .context("create_subscription type filter insert failed")?;
    }

    sqlx::query("delete from events.subscription_streams where subscription_name = $1")
        .bind(name)
        .execute(&mut *conn)
        .await
        .context("create_subscription stream filter reset failed")?;

    for stream_id in &options.filter_streams {
        sqlx::query(
            r#"
            insert into events.subscription_streams (subscription_name, stream_id)
            values ($1, $2)
            on conflict do nothing
            "#,
        )
        .bind(name)
        .bind(stream_id)
        .execute(&mut *conn)
        .await
        .context("create_subscription stream filter insert failed")?;
    }

    fetch_subscription_on(conn, name)
        .await?
        .ok_or_else(|| anyhow!("subscription vanished during create"))
}

pub async fn get_subscription(pool: &PgPool, name: &str) -> Result<Option<SubscriptionRow>> {
    let mut conn = pool.acquire().await.context("get_subscription acquire failed")?;
    fetch_subscription_on(&mut conn, name).await
}

async fn fetch_subscription_on(
    conn: &mut PgConnection,
    name: &str,
) -> Result<Option<SubscriptionRow>> {
    let row = sqlx::query(
        r#"
        select name, last_position, last_processed_at, active, created_at, updated_at
        from events.subscriptions
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(conn)
    .await
    .context("fetch subscription failed")?;

    row.map(subscription_from_row).transpose()
}

/// List subscriptions with `events_behind` computed against the global max
/// position.
pub async fn list_subscriptions(pool: &PgPool) -> Result<Vec<SubscriptionInfo>> {
    let rows = sqlx::query(
        r#"
        select s.name, s.last_position, s.last_processed_at, s.active,
               s.created_at, s.updated_at,
               greatest(
                 coalesce((select max(position) from events.events), 0) - s.last_position,
                 0
               ) as events_behind
        from events.subscriptions s
        order by s.name asc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_subscriptions failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let events_behind: i64 = row.try_get("events_behind")?;
        out.push(SubscriptionInfo {
            subscription: subscription_from_row(row)?,
            events_behind,
        });
    }
    Ok(out)
}

pub async fn set_subscription_active(pool: &PgPool, name: &str, active: bool) -> Result<bool> {
    let res = sqlx::query(
        r#"
        update events.subscriptions
           set active = $2, updated_at = now()
         where name = $1
        "#,
    )
    .bind(name)
    .bind(active)
    .execute(pool)
    .await
    .context("set_subscription_active failed")?;

    Ok(res.rows_affected() > 0)
}

/// Delete a subscription; filters and claims cascade.
pub async fn delete_subscription(pool: &PgPool, name: &str) -> Result<bool> {
    let res = sqlx::query("delete from events.subscriptions where name = $1")
        .bind(name)
        .execute(pool)
        .await
        .context("delete_subscription failed")?;

    Ok(res.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// poll / ack
// ---------------------------------------------------------------------------

/// Claim the next batch of events for a subscription.
///
/// In one statement: unclaimed events past `last_position`, matching the
/// type and stream filters (when present), ordered by ascending position,
/// locked with `FOR UPDATE OF e SKIP LOCKED`. Claims are then upserted with
/// `expires_at = now() + claim_timeout`, refreshing any expired claim for
/// the same position.
pub async fn poll(
    pool: &PgPool,
    name: &str,
    batch_size: i64,
    claim_timeout_secs: i64,
) -> Result<Vec<EventRecord>> {
    let mut tx = pool.begin().await.context("poll begin failed")?;

    let subscription = fetch_subscription_on(&mut *tx, name)
        .await?
        .ok_or_else(|| anyhow!("subscription '{name}' not found"))?;
    if !subscription.active {
        return Err(anyhow!("subscription '{name}' is not active"));
    }

    let rows = sqlx::query(&format!(
        r#"
        select {}
        from events.events e
        where e.position > $2
          and (
            not exists (
              select 1 from events.subscription_types st
              where st.subscription_name = $1
            )
            or exists (
              select 1 from events.subscription_types st
              where st.subscription_name = $1
                and st.category_id = e.category_id
                and st.type_id = e.type_id
            )
          )
          and (
            not exists (
              select 1 from events.subscription_streams ss
              where ss.subscription_name = $1
            )
            or exists (
              select 1 from events.subscription_streams ss
              where ss.subscription_name = $1
                and ss.stream_id = e.stream_id
            )
          )
          and not exists (
            select 1 from events.event_claims c
            where c.subscription_name = $1
              and c.position = e.position
              and c.expires_at > now()
          )
        order by e.position asc
        limit $3
        for update of e skip locked
        "#,
        EVENT_COLUMNS
            .split(", ")
            .map(|c| format!("e.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    ))
    .bind(name)
    .bind(subscription.last_position)
    .bind(batch_size)
    .fetch_all(&mut *tx)
    .await
    .context("poll claim query failed")?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        events.push(event_from_row(row)?);
    }

    if !events.is_empty() {
        let positions: Vec<i64> = events.iter().map(|e| e.position).collect();
        sqlx::query(
            r#"
            insert into events.event_claims (subscription_name, position, expires_at)
            select $1, t.position, now() + make_interval(secs => $3)
            from unnest($2::bigint[]) as t (position)
            on conflict (subscription_name, position) do update
                set claimed_at = now(),
                    expires_at = excluded.expires_at
            "#,
        )
        .bind(name)
        .bind(&positions)
        .bind(claim_timeout_secs as f64)
        .execute(&mut *tx)
        .await
        .context("poll claim upsert failed")?;
    }

    tx.commit().await.context("poll commit failed")?;
    Ok(events)
}

/// Acknowledge one position: the claim is released and `last_position`
/// advances to at least that position (never backward).
pub async fn ack(pool: &PgPool, name: &str, position: i64) -> Result<()> {
    let mut tx = pool.begin().await.context("ack begin failed")?;

    sqlx::query(
        "delete from events.event_claims where subscription_name = $1 and position = $2",
    )
    .bind(name)
    .bind(position)
    .execute(&mut *tx)
    .await
    .context("ack claim delete failed")?;

    let res = sqlx::query(
        r#"
        update events.subscriptions
           set last_position     = greatest(last_position, $2),
               last_processed_at = now(),
               updated_at        = now()
         where name = $1
        "#,
    )
    .bind(name)
    .bind(position)
    .execute(&mut *tx)
    .await
    .context("ack cursor update failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow!("subscription '{name}' not found"));
    }

    tx.commit().await.context("ack commit failed")?;
    Ok(())
}

/// Drop claims whose timeout has passed. Returns the number removed.
pub async fn cleanup_expired_claims(pool: &PgPool) -> Result<u64> {
    let res = sqlx::query("delete from events.event_claims where expires_at <= now()")
        .execute(pool)
        .await
        .context("cleanup_expired_claims failed")?;

    let removed = res.rows_affected();
    if removed > 0 {
        tracing::debug!(removed, "expired event claims dropped");
    }
    Ok(removed)
}

/// Drop every claim held by one subscription (worker crash recovery).
pub async fn cleanup_subscription_claims(pool: &PgPool, name: &str) -> Result<u64> {
    let res = sqlx::query("delete from events.event_claims where subscription_name = $1")
        .bind(name)
        .execute(pool)
        .await
        .context("cleanup_subscription_claims failed")?;

    Ok(res.rows_affected())
}

fn subscription_from_row(row: sqlx::postgres::PgRow) -> Result<SubscriptionRow> {
    Ok(SubscriptionRow {
        name: row.try_get("name")?,
        last_position: row.try_get("last_position")?,
        last_processed_at: row.try_get("last_processed_at")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
