// crates/sqlkit-testkit/src/lib.rs
//! Test support: one pool, all three schemas installed.
//!
//! Integration tests across the workspace connect through [`db_pool`] and
//! name their fixtures with [`unique_name`], so suites can run concurrently
//! against one shared database without colliding.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

/// Install the `fs`, `queue` and `events` schemas. Idempotent; safe to call
/// from every test.
pub async fn install_all(pool: &PgPool) -> Result<()> {
    sqlkit_fs::install(pool).await?;
    sqlkit_queue::install(pool).await?;
    sqlkit_events::install(pool).await?;
    Ok(())
}

/// Connect using SQLKIT_DATABASE_URL and ensure all schemas are installed.
pub async fn db_pool() -> Result<PgPool> {
    let pool = sqlkit_db::connect_from_env().await?;
    install_all(&pool).await?;
    Ok(pool)
}

/// A collision-free fixture name.
pub fn unique_name(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// A collision-free name restricted to the SQL-identifier charset (for
/// aggregate and projection names that feed the code generators).
pub fn unique_ident(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}
