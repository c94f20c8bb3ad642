// crates/sqlkit-db/src/lib.rs
//! Shared database plumbing for the sqlkit subsystems.
//!
//! Each subsystem crate owns its schema and its `install()` function; this
//! crate holds what they share: pool construction, idempotent DDL execution,
//! Postgres error classification, and the quoting helpers used by the
//! SQL-emitting code generators in `sqlkit-events`.

use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

pub const ENV_DB_URL: &str = "SQLKIT_DATABASE_URL";

/// Connect to Postgres using SQLKIT_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Execute an embedded DDL script over the simple query protocol.
///
/// The script may contain any number of statements (including dollar-quoted
/// function bodies and DO blocks). Scripts are written with
/// `CREATE … IF NOT EXISTS` / guarded `ALTER TABLE` semantics, so running
/// one repeatedly — or concurrently with an older install — is safe.
pub async fn run_install_script(pool: &PgPool, schema: &str, script: &str) -> Result<()> {
    pool.execute(script)
        .await
        .with_context(|| format!("install script for schema '{schema}' failed"))?;
    tracing::debug!(schema, "schema installed");
    Ok(())
}

/// Detect a Postgres unique constraint violation by constraint name.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}

/// Detect any Postgres unique constraint violation (SQLSTATE 23505).
pub fn is_any_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Sanitize a user-supplied name into a SQL identifier fragment.
///
/// Lowercases, maps `-` to `_`, and rejects everything else outside
/// `[a-z0-9_]`. Identifiers cannot be empty and cannot start with a digit.
/// Used by the generated-function and trigger emitters, where the result is
/// spliced into DDL text.
pub fn sql_ident(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(anyhow!("identifier must not be empty"));
    }
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = match ch {
            'A'..='Z' => ch.to_ascii_lowercase(),
            'a'..='z' | '0'..='9' | '_' => ch,
            '-' => '_',
            other => {
                return Err(anyhow!(
                    "identifier '{name}' contains unsupported character '{other}'"
                ))
            }
        };
        out.push(mapped);
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(anyhow!("identifier '{name}' must not start with a digit"));
    }
    Ok(out)
}

/// Quote a string as a SQL literal (single quotes doubled).
pub fn sql_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push('\'');
        }
        out.push(ch);
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_ident_lowercases_and_maps_hyphens() {
        assert_eq!(sql_ident("Order-Totals").unwrap(), "order_totals");
        assert_eq!(sql_ident("cart_v2").unwrap(), "cart_v2");
    }

    #[test]
    fn sql_ident_rejects_empty_and_bad_chars() {
        assert!(sql_ident("").is_err());
        assert!(sql_ident("a b").is_err());
        assert!(sql_ident("drop;table").is_err());
        assert!(sql_ident("1starts_with_digit").is_err());
    }

    #[test]
    fn sql_quote_doubles_single_quotes() {
        assert_eq!(sql_quote("plain"), "'plain'");
        assert_eq!(sql_quote("it's"), "'it''s'");
        assert_eq!(sql_quote(""), "''");
    }
}
