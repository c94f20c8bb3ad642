// crates/sqlkit-events/src/projections.rs
//! Projections: sync (trigger-backed) and async (subscription-backed).
//!
//! Sync handlers are SQL statements installed behind a single
//! `AFTER INSERT` trigger on the events table; they run inside the appending
//! transaction, dispatched by an inner CASE on `category/type`. Handler
//! statements may reference the inserted row as `new` (e.g.
//! `new.data->>'id'`). Async handlers run in the host: registration creates
//! a dedicated subscription `projection:<name>` filtered to the listed
//! types, and a host-side runner polls and acks it.
//!
//! Handler statements, like reducer expressions, are privileged input spliced
//! verbatim into the generated trigger function.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::subscriptions::{create_subscription_on, SubscriptionOptions};
use crate::types::{ensure_type_on, EventType};

#[derive(Debug, Clone)]
pub struct ProjectionDef {
    pub name: String,
    /// `"category/type"` → SQL statement, run in the appending transaction.
    pub sync_handlers: BTreeMap<String, String>,
    pub trigger_name: Option<String>,
    pub trigger_function_name: Option<String>,
    /// Backing subscription for async handlers (`projection:<name>`).
    pub subscription_name: Option<String>,
    /// `"category/type"` entries routed to the async subscription.
    pub async_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Subscription name used for a projection's async side.
pub fn projection_subscription_name(projection_name: &str) -> String {
    format!("projection:{projection_name}")
}

// ---------------------------------------------------------------------------
// Trigger emission
// ---------------------------------------------------------------------------

pub(crate) fn emit_trigger_function_sql(
    function_name: &str,
    sync_handlers: &BTreeMap<String, String>,
) -> String {
    let mut arms = String::new();
    for (qualified, statement) in sync_handlers {
        let literal = sqlkit_db::sql_quote(qualified);
        let statement = statement.trim().trim_end_matches(';');
        arms.push_str(&format!("        when {literal} then\n            {statement};\n"));
    }

    format!(
        r#"create or replace function {function_name}()
returns trigger
language plpgsql
as $projection$
begin
    case new.category_id || '/' || new.type_id
{arms}        else
            null;
    end case;
    return new;
end;
$projection$"#
    )
}

fn trigger_names(projection_name: &str) -> Result<(String, String)> {
    let ident = sqlkit_db::sql_ident(projection_name)?;
    Ok((
        format!("projection_{ident}_trigger"),
        format!("events.projection_{ident}_fn"),
    ))
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register (or re-register) a projection: sync handlers become a trigger,
/// async types become a dedicated subscription. Both sides install in one
/// transaction.
pub async fn register_projection(
    pool: &PgPool,
    name: &str,
    sync_handlers: &BTreeMap<String, String>,
    async_types: &[String],
) -> Result<ProjectionDef> {
    if sync_handlers.is_empty() && async_types.is_empty() {
        return Err(anyhow!(
            "projection '{name}' needs at least one sync handler or async type"
        ));
    }

    let (trigger_name, trigger_function_name) = trigger_names(name)?;

    let mut tx = pool.begin().await.context("register_projection begin failed")?;

    // Validate and register every referenced type up front.
    for qualified in sync_handlers.keys().chain(async_types.iter()) {
        let event_type = EventType::parse(qualified, None)?;
        ensure_type_on(&mut *tx, &event_type).await?;
    }

    let (trigger_name, trigger_function_name) = if sync_handlers.is_empty() {
        // A previous registration may have installed a trigger; clear it.
        sqlx::query(&format!(
            "drop trigger if exists {trigger_name} on events.events"
        ))
        .execute(&mut *tx)
        .await
        .context("register_projection stale trigger drop failed")?;
        sqlx::query(&format!("drop function if exists {trigger_function_name}()"))
            .execute(&mut *tx)
            .await
            .context("register_projection stale function drop failed")?;
        (None, None)
    } else {
        let function_sql = emit_trigger_function_sql(&trigger_function_name, sync_handlers);
        sqlx::query(&function_sql)
            .execute(&mut *tx)
            .await
            .context("register_projection trigger function failed")?;

        sqlx::query(&format!(
            "drop trigger if exists {trigger_name} on events.events"
        ))
        .execute(&mut *tx)
        .await
        .context("register_projection trigger drop failed")?;

        sqlx::query(&format!(
            "create trigger {trigger_name} after insert on events.events \
             for each row execute function {trigger_function_name}()"
        ))
        .execute(&mut *tx)
        .await
        .context("register_projection trigger create failed")?;

        (Some(trigger_name), Some(trigger_function_name))
    };

    let subscription_name = if async_types.is_empty() {
        None
    } else {
        let sub_name = projection_subscription_name(name);
        create_subscription_on(
            &mut *tx,
            &sub_name,
            &SubscriptionOptions {
                filter_types: async_types.to_vec(),
                ..Default::default()
            },
        )
        .await?;
        Some(sub_name)
    };

    let row = sqlx::query(
        r#"
        insert into events.projections (
          name, sync_handlers, trigger_name, trigger_function_name, subscription_name
        ) values (
          $1, $2, $3, $4, $5
        )
        on conflict (name) do update
            set sync_handlers         = excluded.sync_handlers,
                trigger_name          = excluded.trigger_name,
                trigger_function_name = excluded.trigger_function_name,
                subscription_name     = excluded.subscription_name,
                updated_at            = now()
        returning created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(serde_json::to_value(sync_handlers).context("sync_handlers are not serializable")?)
    .bind(&trigger_name)
    .bind(&trigger_function_name)
    .bind(&subscription_name)
    .fetch_one(&mut *tx)
    .await
    .context("register_projection registry upsert failed")?;

    sqlx::query("delete from events.projection_async_types where projection_name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("register_projection async type reset failed")?;

    for qualified in async_types {
        let event_type = EventType::parse(qualified, None)?;
        sqlx::query(
            r#"
            insert into events.projection_async_types (projection_name, category_id, type_id)
            values ($1, $2, $3)
            on conflict do nothing
            "#,
        )
        .bind(name)
        .bind(&event_type.category_id)
        .bind(&event_type.type_id)
        .execute(&mut *tx)
        .await
        .context("register_projection async type insert failed")?;
    }

    tx.commit().await.context("register_projection commit failed")?;
    tracing::debug!(projection = name, "projection registered");

    Ok(ProjectionDef {
        name: name.to_string(),
        sync_handlers: sync_handlers.clone(),
        trigger_name,
        trigger_function_name,
        subscription_name,
        async_types: async_types.to_vec(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn get_projection(pool: &PgPool, name: &str) -> Result<Option<ProjectionDef>> {
    let row = sqlx::query(
        r#"
        select name, sync_handlers, trigger_name, trigger_function_name, subscription_name,
               created_at, updated_at
        from events.projections
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("get_projection failed")?;

    let Some(row) = row else { return Ok(None) };

    let async_rows = sqlx::query(
        r#"
        select category_id, type_id
        from events.projection_async_types
        where projection_name = $1
        order by category_id, type_id
        "#,
    )
    .bind(name)
    .fetch_all(pool)
    .await
    .context("get_projection async types failed")?;

    let mut async_types = Vec::with_capacity(async_rows.len());
    for async_row in async_rows {
        async_types.push(format!(
            "{}/{}",
            async_row.try_get::<String, _>("category_id")?,
            async_row.try_get::<String, _>("type_id")?
        ));
    }

    let sync_handlers: BTreeMap<String, String> =
        serde_json::from_value(row.try_get::<Value, _>("sync_handlers")?)
            .context("stored sync_handlers are malformed")?;

    Ok(Some(ProjectionDef {
        name: row.try_get("name")?,
        sync_handlers,
        trigger_name: row.try_get("trigger_name")?,
        trigger_function_name: row.try_get("trigger_function_name")?,
        subscription_name: row.try_get("subscription_name")?,
        async_types,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

pub async fn list_projections(pool: &PgPool) -> Result<Vec<String>> {
    let rows = sqlx::query("select name from events.projections order by name asc")
        .fetch_all(pool)
        .await
        .context("list_projections failed")?;

    rows.into_iter()
        .map(|row| row.try_get("name").map_err(Into::into))
        .collect()
}

/// Drop a projection: its trigger, generated function, backing subscription
/// and registry rows. Returns false when the name is unknown.
pub async fn unregister_projection(pool: &PgPool, name: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("unregister_projection begin failed")?;

    let row = sqlx::query(
        r#"
        select trigger_name, trigger_function_name, subscription_name
        from events.projections
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(&mut *tx)
    .await
    .context("unregister_projection lookup failed")?;

    let Some(row) = row else { return Ok(false) };

    // Recompute the generated names instead of trusting the stored ones
    // blindly; both must match this crate's shapes before splicing into DDL.
    let (expected_trigger, expected_function) = trigger_names(name)?;
    let trigger_name: Option<String> = row.try_get("trigger_name")?;
    let trigger_function_name: Option<String> = row.try_get("trigger_function_name")?;
    let subscription_name: Option<String> = row.try_get("subscription_name")?;

    if let Some(trigger) = trigger_name {
        if trigger != expected_trigger {
            return Err(anyhow!("unexpected trigger name '{trigger}' for projection '{name}'"));
        }
        sqlx::query(&format!("drop trigger if exists {trigger} on events.events"))
            .execute(&mut *tx)
            .await
            .context("unregister_projection trigger drop failed")?;
    }
    if let Some(function) = trigger_function_name {
        if function != expected_function {
            return Err(anyhow!("unexpected function name '{function}' for projection '{name}'"));
        }
        sqlx::query(&format!("drop function if exists {function}()"))
            .execute(&mut *tx)
            .await
            .context("unregister_projection function drop failed")?;
    }
    if let Some(subscription) = subscription_name {
        sqlx::query("delete from events.subscriptions where name = $1")
            .bind(subscription)
            .execute(&mut *tx)
            .await
            .context("unregister_projection subscription delete failed")?;
    }

    sqlx::query("delete from events.projections where name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("unregister_projection delete failed")?;

    tx.commit().await.context("unregister_projection commit failed")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_names_follow_projection_name() {
        let (trigger, function) = trigger_names("Cart-Totals").unwrap();
        assert_eq!(trigger, "projection_cart_totals_trigger");
        assert_eq!(function, "events.projection_cart_totals_fn");
        assert!(trigger_names("bad name").is_err());
    }

    #[test]
    fn emitted_trigger_dispatches_per_qualified_type() {
        let mut handlers = BTreeMap::new();
        handlers.insert(
            "cart/item-added".to_string(),
            "insert into cart_totals (cart_id) values (new.data->>'cart_id');".to_string(),
        );
        handlers.insert(
            "cart/cleared".to_string(),
            "delete from cart_totals where cart_id = new.data->>'cart_id'".to_string(),
        );

        let sql = emit_trigger_function_sql("events.projection_totals_fn", &handlers);
        assert!(sql.contains("case new.category_id || '/' || new.type_id"));
        assert!(sql.contains("when 'cart/item-added' then"));
        assert!(sql.contains("when 'cart/cleared' then"));
        // Handler statements get exactly one terminating semicolon.
        assert!(sql.contains("values (new.data->>'cart_id');\n"));
        assert!(sql.contains("else\n            null;"));
        assert!(sql.ends_with("$projection$"));
    }
}
