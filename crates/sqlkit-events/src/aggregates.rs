// crates/sqlkit-events/src/aggregates.rs
//! Registered aggregates: named folds compiled into generated pl/pgsql
//! loader functions.
//!
//! `register_aggregate` persists the registry row and emits
//! `CREATE OR REPLACE FUNCTION events.load_<snake_case(name)>`. The loader
//! seeds its state from the `"<name>-auto"` snapshot (or the registered
//! initial state), replays events past the snapshot version applying the
//! reducer expression keyed by each event's `type_id`, and — when a
//! snapshot threshold is configured and enough events were replayed — saves
//! a refreshed snapshot before returning `(state, version)`.
//!
//! Reducer expressions are SQL expressions evaluated against two columns:
//! `state` (the current jsonb state) and `event` (the event's jsonb data).
//! They are privileged input: registration splices them into the function
//! body verbatim. Names and JSON literals, in contrast, are strictly
//! sanitized/quoted by the emitter.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::read::{read_stream, ReadDirection};
use crate::types::{ensure_type_on, EventRecord, EventType};

#[derive(Debug, Clone)]
pub struct AggregateDef {
    pub name: String,
    pub category_id: String,
    pub initial_state: Value,
    /// type_id → reducer SQL expression.
    pub reducers: BTreeMap<String, String>,
    /// Schema-qualified generated loader, e.g. `events.load_cart`.
    pub function_name: String,
    pub snapshot_threshold: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of loading an aggregate: the folded state and the stream version
/// it reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedAggregate {
    pub state: Value,
    pub version: i64,
}

// ---------------------------------------------------------------------------
// Loader emission
// ---------------------------------------------------------------------------

/// Emit the loader function DDL for one aggregate.
pub(crate) fn emit_loader_sql(
    function_name: &str,
    aggregate_name: &str,
    initial_state: &Value,
    reducers: &BTreeMap<String, String>,
    snapshot_threshold: Option<i32>,
) -> Result<String> {
    let initial_literal = sqlkit_db::sql_quote(
        &serde_json::to_string(initial_state).context("initial_state is not serializable")?,
    );
    let snapshot_literal = sqlkit_db::sql_quote(&format!("{aggregate_name}-auto"));

    let mut dispatch = String::new();
    for (i, (type_id, expr)) in reducers.iter().enumerate() {
        let keyword = if i == 0 { "if" } else { "elsif" };
        let type_literal = sqlkit_db::sql_quote(type_id);
        dispatch.push_str(&format!(
            "        {keyword} rec.type_id = {type_literal} then\n            select ({expr})\n              into v_state\n              from (select v_state::jsonb as state, rec.event::jsonb as event) as r;\n"
        ));
    }
    if !reducers.is_empty() {
        dispatch.push_str("        end if;\n");
    }

    let snapshot_block = match snapshot_threshold {
        Some(threshold) => format!(
            r#"
    if v_replayed >= {threshold} then
        insert into events.snapshots (stream_id, name, version, state)
        values (p_stream_id, {snapshot_literal}, v_version, v_state)
        on conflict (stream_id, name) do update
            set version    = excluded.version,
                state      = excluded.state,
                created_at = now();
    end if;
"#
        ),
        None => String::new(),
    };

    Ok(format!(
        r#"create or replace function {function_name}(p_stream_id text)
returns table (state jsonb, version bigint)
language plpgsql
as $aggregate$
declare
    v_state jsonb := {initial_literal}::jsonb;
    v_version bigint := 0;
    v_replayed bigint := 0;
    rec record;
begin
    select s.state, s.version
      into v_state, v_version
      from events.snapshots s
     where s.stream_id = p_stream_id
       and s.name = {snapshot_literal};
    if not found then
        v_state := {initial_literal}::jsonb;
        v_version := 0;
    end if;

    for rec in
        select e.type_id, e.data as event, e.stream_version
          from events.events e
         where e.stream_id = p_stream_id
           and e.stream_version > v_version
         order by e.stream_version asc
    loop
{dispatch}        v_version := rec.stream_version;
        v_replayed := v_replayed + 1;
    end loop;
{snapshot_block}
    return query select v_state, v_version;
end;
$aggregate$"#
    ))
}

fn loader_function_name(aggregate_name: &str) -> Result<String> {
    Ok(format!("events.load_{}", sqlkit_db::sql_ident(aggregate_name)?))
}

/// Check that a registry-stored function name is one this crate could have
/// generated, before splicing it into a query.
fn validate_function_name(function_name: &str) -> Result<()> {
    let bare = function_name
        .strip_prefix("events.load_")
        .ok_or_else(|| anyhow!("unexpected aggregate function name '{function_name}'"))?;
    if bare.is_empty() || sqlkit_db::sql_ident(bare)? != bare {
        return Err(anyhow!("unexpected aggregate function name '{function_name}'"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register (or re-register) an aggregate and generate its loader function.
pub async fn register_aggregate(
    pool: &PgPool,
    name: &str,
    category: &str,
    initial_state: Value,
    reducers: &BTreeMap<String, String>,
    snapshot_threshold: Option<i32>,
) -> Result<AggregateDef> {
    if let Some(threshold) = snapshot_threshold {
        if threshold <= 0 {
            return Err(anyhow!("snapshot_threshold must be positive, got {threshold}"));
        }
    }

    // Reducer keys may be bare type ids or "category/type" within the
    // aggregate's category; dispatch always keys on the bare type id.
    let mut normalized: BTreeMap<String, String> = BTreeMap::new();
    for (key, expr) in reducers {
        let event_type = EventType::parse(key, Some(category))?;
        if event_type.category_id != category {
            return Err(anyhow!(
                "reducer type '{key}' does not belong to category '{category}'"
            ));
        }
        normalized.insert(event_type.type_id, expr.clone());
    }
    let reducers = normalized;

    let function_name = loader_function_name(name)?;
    let loader_sql =
        emit_loader_sql(&function_name, name, &initial_state, &reducers, snapshot_threshold)?;

    let mut tx = pool.begin().await.context("register_aggregate begin failed")?;

    for type_id in reducers.keys() {
        let event_type = EventType {
            category_id: category.to_string(),
            type_id: type_id.clone(),
        };
        ensure_type_on(&mut *tx, &event_type).await?;
    }
    if reducers.is_empty() {
        sqlx::query("insert into events.categories (id) values ($1) on conflict (id) do nothing")
            .bind(category)
            .execute(&mut *tx)
            .await
            .context("register_aggregate category insert failed")?;
    }

    let row = sqlx::query(
        r#"
        insert into events.aggregates (
          name, category_id, initial_state, reducers, function_name, snapshot_threshold
        ) values (
          $1, $2, $3, $4, $5, $6
        )
        on conflict (name) do update
            set category_id        = excluded.category_id,
                initial_state      = excluded.initial_state,
                reducers           = excluded.reducers,
                function_name      = excluded.function_name,
                snapshot_threshold = excluded.snapshot_threshold,
                updated_at         = now()
        returning created_at, updated_at
        "#,
    )
    .bind(name)
    .bind(category)
    .bind(&initial_state)
    .bind(serde_json::to_value(&reducers).context("reducers are not serializable")?)
    .bind(&function_name)
    .bind(snapshot_threshold)
    .fetch_one(&mut *tx)
    .await
    .context("register_aggregate registry upsert failed")?;

    sqlx::query(&loader_sql)
        .execute(&mut *tx)
        .await
        .context("register_aggregate loader creation failed")?;

    tx.commit().await.context("register_aggregate commit failed")?;
    tracing::debug!(aggregate = name, function = %function_name, "aggregate registered");

    Ok(AggregateDef {
        name: name.to_string(),
        category_id: category.to_string(),
        initial_state,
        reducers: reducers.clone(),
        function_name,
        snapshot_threshold,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn get_aggregate(pool: &PgPool, name: &str) -> Result<Option<AggregateDef>> {
    let row = sqlx::query(
        r#"
        select name, category_id, initial_state, reducers, function_name,
               snapshot_threshold, created_at, updated_at
        from events.aggregates
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("get_aggregate failed")?;

    let Some(row) = row else { return Ok(None) };

    let reducers: BTreeMap<String, String> =
        serde_json::from_value(row.try_get::<Value, _>("reducers")?)
            .context("stored reducers are malformed")?;

    Ok(Some(AggregateDef {
        name: row.try_get("name")?,
        category_id: row.try_get("category_id")?,
        initial_state: row.try_get("initial_state")?,
        reducers,
        function_name: row.try_get("function_name")?,
        snapshot_threshold: row.try_get("snapshot_threshold")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

/// Run the generated loader for a registered aggregate against one stream.
/// Returns `None` when no aggregate is registered under the name.
pub async fn load_registered_aggregate(
    pool: &PgPool,
    name: &str,
    stream_id: &str,
) -> Result<Option<LoadedAggregate>> {
    let Some(def) = get_aggregate(pool, name).await? else {
        return Ok(None);
    };
    validate_function_name(&def.function_name)?;

    let row = sqlx::query(&format!(
        "select state, version from {}($1)",
        def.function_name
    ))
    .bind(stream_id)
    .fetch_one(pool)
    .await
    .context("load_registered_aggregate failed")?;

    Ok(Some(LoadedAggregate {
        state: row.try_get("state")?,
        version: row.try_get("version")?,
    }))
}

/// Remove an aggregate and drop its generated loader. Returns false when the
/// name is unknown.
pub async fn unregister_aggregate(pool: &PgPool, name: &str) -> Result<bool> {
    let mut tx = pool.begin().await.context("unregister_aggregate begin failed")?;

    let row = sqlx::query("select function_name from events.aggregates where name = $1")
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .context("unregister_aggregate lookup failed")?;

    let Some(row) = row else { return Ok(false) };
    let function_name: String = row.try_get("function_name")?;
    validate_function_name(&function_name)?;

    sqlx::query(&format!("drop function if exists {function_name}(text)"))
        .execute(&mut *tx)
        .await
        .context("unregister_aggregate drop failed")?;

    sqlx::query("delete from events.aggregates where name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await
        .context("unregister_aggregate delete failed")?;

    tx.commit().await.context("unregister_aggregate commit failed")?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Host-side fold
// ---------------------------------------------------------------------------

/// Fold a stream in the host language, for reducers that cannot be expressed
/// as SQL expressions. Replays the full stream (no snapshot involvement).
pub async fn load_aggregate<F>(
    pool: &PgPool,
    stream_id: &str,
    initial: Value,
    mut reduce: F,
) -> Result<LoadedAggregate>
where
    F: FnMut(Value, &EventRecord) -> Value,
{
    const BATCH: i64 = 1_000;

    let mut state = initial;
    let mut version = 0i64;

    loop {
        let batch = read_stream(pool, stream_id, version + 1, BATCH, ReadDirection::Forward).await?;
        let done = (batch.len() as i64) < BATCH;
        for event in &batch {
            state = reduce(state, event);
            version = event.stream_version;
        }
        if done {
            break;
        }
    }

    Ok(LoadedAggregate { state, version })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reducers(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loader_name_is_sanitized() {
        assert_eq!(loader_function_name("Cart-Totals").unwrap(), "events.load_cart_totals");
        assert!(loader_function_name("").is_err());
        assert!(loader_function_name("bad name").is_err());
    }

    #[test]
    fn validate_function_name_rejects_foreign_shapes() {
        assert!(validate_function_name("events.load_cart").is_ok());
        assert!(validate_function_name("public.evil").is_err());
        assert!(validate_function_name("events.load_").is_err());
        assert!(validate_function_name("events.load_x; drop table y").is_err());
    }

    #[test]
    fn emitted_loader_contains_dispatch_and_snapshot_block() {
        let sql = emit_loader_sql(
            "events.load_counter",
            "counter",
            &json!({"total": 0}),
            &reducers(&[
                ("add", "jsonb_set(state, '{total}', to_jsonb((state->>'total')::bigint + (event->>'amount')::bigint))"),
                ("reset", "'{\"total\": 0}'::jsonb"),
            ]),
            Some(3),
        )
        .unwrap();

        assert!(sql.starts_with("create or replace function events.load_counter"));
        assert!(sql.contains("if rec.type_id = 'add' then"));
        assert!(sql.contains("elsif rec.type_id = 'reset' then"));
        assert!(sql.contains("'counter-auto'"));
        assert!(sql.contains("v_replayed >= 3"));
        assert!(sql.contains(r#"'{"total":0}'::jsonb"#));
    }

    #[test]
    fn emitted_loader_without_threshold_skips_snapshot_save() {
        let sql = emit_loader_sql(
            "events.load_plain",
            "plain",
            &json!({}),
            &reducers(&[("noop", "state")]),
            None,
        )
        .unwrap();

        assert!(!sql.contains("insert into events.snapshots"));
        // It still reads the snapshot for seeding.
        assert!(sql.contains("from events.snapshots"));
    }

    #[test]
    fn emitted_loader_quotes_literals() {
        let sql = emit_loader_sql(
            "events.load_quoty",
            "quoty",
            &json!({"s": "it's"}),
            &reducers(&[("o'type", "state")]),
            None,
        )
        .unwrap();

        assert!(sql.contains(r#"'{"s":"it''s"}'::jsonb"#));
        assert!(sql.contains("rec.type_id = 'o''type'"));
    }
}
