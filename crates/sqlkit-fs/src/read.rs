// crates/sqlkit-fs/src/read.rs
//! Read resolution: walking commit ancestry to materialize file state.
//!
//! Plain reads follow `parent_commit_id` only. The nearest delta for a path
//! wins; a tombstone at the nearest delta means the path is absent. Symlinks
//! are returned as their stored target — never dereferenced.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::paths::{normalize_path, normalize_prefix};
use crate::repo::fetch_commit_on;

/// Upper bound on ancestry traversal. A walk that exhausts the guard without
/// reaching a root indicates a cycle (or an absurdly deep history) and is
/// reported as an error rather than silently truncated.
pub const ANCESTRY_STEP_GUARD: i64 = 100_000;

/// Resolved file content at a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRead {
    /// File content, or the symlink target when `is_symlink`.
    pub content: String,
    pub is_symlink: bool,
    /// The ancestor commit whose delta supplied this state.
    pub commit_id: Uuid,
}

/// One path in a snapshot listing (content deliberately omitted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub path: String,
    pub is_symlink: bool,
    /// The ancestor commit whose delta supplied this state.
    pub commit_id: Uuid,
}

/// Resolved state of one path, used by merge/rebase patch computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub content: String,
    pub is_symlink: bool,
}

/// One entry of a path's history.
#[derive(Debug, Clone)]
pub struct FileVersion {
    pub commit_id: Uuid,
    pub message: String,
    /// None on tombstones.
    pub content: Option<String>,
    pub is_deleted: bool,
    pub is_symlink: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

/// Read a path at a commit. Returns None when the path does not exist there
/// (no delta anywhere in the ancestry, or the nearest delta is a tombstone).
pub async fn read_file(pool: &PgPool, commit_id: Uuid, path: &str) -> Result<Option<FileRead>> {
    let mut conn = pool.acquire().await.context("read_file acquire failed")?;
    read_file_on(&mut conn, commit_id, path).await
}

pub(crate) async fn read_file_on(
    conn: &mut PgConnection,
    commit_id: Uuid,
    path: &str,
) -> Result<Option<FileRead>> {
    let path = normalize_path(path)?;

    if fetch_commit_on(conn, commit_id).await?.is_none() {
        return Err(anyhow!("commit {commit_id} not found"));
    }

    let row = sqlx::query(
        r#"
        with recursive ancestry as (
            select c.id, c.parent_commit_id, 0::bigint as depth
            from fs.commits c
            where c.id = $1
            union all
            select c.id, c.parent_commit_id, a.depth + 1
            from fs.commits c
            join ancestry a on c.id = a.parent_commit_id
            where a.depth + 1 < $3
        ),
        hit as (
            select f.content, f.is_deleted, f.is_symlink, f.commit_id
            from ancestry a
            join fs.files f on f.commit_id = a.id
            where f.path = $2
            order by a.depth asc
            limit 1
        )
        select
            (select count(*) from ancestry) as walked,
            h.content, h.is_deleted, h.is_symlink, h.commit_id
        from (select 1) as one
        left join hit h on true
        "#,
    )
    .bind(commit_id)
    .bind(&path)
    .bind(ANCESTRY_STEP_GUARD)
    .fetch_one(&mut *conn)
    .await
    .context("read_file query failed")?;

    let walked: i64 = row.try_get("walked")?;
    let is_deleted: Option<bool> = row.try_get("is_deleted")?;

    match is_deleted {
        Some(true) => Ok(None),
        Some(false) => Ok(Some(FileRead {
            content: row.try_get("content")?,
            is_symlink: row.try_get("is_symlink")?,
            commit_id: row.try_get("commit_id")?,
        })),
        None => {
            if walked >= ANCESTRY_STEP_GUARD {
                return Err(anyhow!(
                    "ancestry walk exceeded {ANCESTRY_STEP_GUARD} steps (commit graph cycle?)"
                ));
            }
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// snapshot
// ---------------------------------------------------------------------------

/// List the paths present at a commit, optionally restricted to a prefix.
///
/// Prefix matching is a literal `starts_with` against the normalized prefix:
/// pass `"/src/"` for everything under the directory, `"/src"` to also match
/// `/src` itself and siblings like `/srcx`.
pub async fn snapshot(
    pool: &PgPool,
    commit_id: Uuid,
    prefix: Option<&str>,
) -> Result<Vec<SnapshotEntry>> {
    let mut conn = pool.acquire().await.context("snapshot acquire failed")?;

    let prefix = match prefix {
        Some(p) => Some(normalize_prefix(p)?),
        None => None,
    };

    if fetch_commit_on(&mut conn, commit_id).await?.is_none() {
        return Err(anyhow!("commit {commit_id} not found"));
    }

    let rows = sqlx::query(
        r#"
        with recursive ancestry as (
            select c.id, c.parent_commit_id, 0::bigint as depth
            from fs.commits c
            where c.id = $1
            union all
            select c.id, c.parent_commit_id, a.depth + 1
            from fs.commits c
            join ancestry a on c.id = a.parent_commit_id
            where a.depth + 1 < $3
        ),
        winners as (
            select distinct on (f.path)
                f.path, f.is_deleted, f.is_symlink, f.commit_id
            from ancestry a
            join fs.files f on f.commit_id = a.id
            where $2::text is null or starts_with(f.path, $2)
            order by f.path asc, a.depth asc
        )
        select path, is_symlink, commit_id
        from winners
        where not is_deleted
        order by path asc
        "#,
    )
    .bind(commit_id)
    .bind(prefix)
    .bind(ANCESTRY_STEP_GUARD)
    .fetch_all(&mut *conn)
    .await
    .context("snapshot query failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(SnapshotEntry {
            path: row.try_get("path")?,
            is_symlink: row.try_get("is_symlink")?,
            commit_id: row.try_get("commit_id")?,
        });
    }
    Ok(out)
}

/// Full path → state map at a commit, content included.
///
/// This is the working set for merge and rebase patch computation. The
/// winning delta row already carries the resolved content, so one
/// `DISTINCT ON` pass materializes the same result as a per-path
/// [`read_file`] over the snapshot listing.
pub async fn snapshot_with_content(
    pool: &PgPool,
    commit_id: Uuid,
) -> Result<BTreeMap<String, FileState>> {
    let mut conn = pool
        .acquire()
        .await
        .context("snapshot_with_content acquire failed")?;
    snapshot_with_content_on(&mut conn, commit_id).await
}

pub(crate) async fn snapshot_with_content_on(
    conn: &mut PgConnection,
    commit_id: Uuid,
) -> Result<BTreeMap<String, FileState>> {
    let rows = sqlx::query(
        r#"
        with recursive ancestry as (
            select c.id, c.parent_commit_id, 0::bigint as depth
            from fs.commits c
            where c.id = $1
            union all
            select c.id, c.parent_commit_id, a.depth + 1
            from fs.commits c
            join ancestry a on c.id = a.parent_commit_id
            where a.depth + 1 < $2
        ),
        winners as (
            select distinct on (f.path)
                f.path, f.content, f.is_deleted, f.is_symlink
            from ancestry a
            join fs.files f on f.commit_id = a.id
            order by f.path asc, a.depth asc
        )
        select path, content, is_symlink
        from winners
        where not is_deleted
        "#,
    )
    .bind(commit_id)
    .bind(ANCESTRY_STEP_GUARD)
    .fetch_all(&mut *conn)
    .await
    .context("snapshot_with_content query failed")?;

    let mut out = BTreeMap::new();
    for row in rows {
        out.insert(
            row.try_get("path")?,
            FileState {
                content: row.try_get("content")?,
                is_symlink: row.try_get("is_symlink")?,
            },
        );
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// file_history
// ---------------------------------------------------------------------------

/// Every commit along the ancestry that carries an explicit delta for the
/// path, nearest first. Tombstones appear with `content = None`.
pub async fn file_history(pool: &PgPool, commit_id: Uuid, path: &str) -> Result<Vec<FileVersion>> {
    let mut conn = pool.acquire().await.context("file_history acquire failed")?;
    let path = normalize_path(path)?;

    if fetch_commit_on(&mut conn, commit_id).await?.is_none() {
        return Err(anyhow!("commit {commit_id} not found"));
    }

    let rows = sqlx::query(
        r#"
        with recursive ancestry as (
            select c.id, c.parent_commit_id, 0::bigint as depth
            from fs.commits c
            where c.id = $1
            union all
            select c.id, c.parent_commit_id, a.depth + 1
            from fs.commits c
            join ancestry a on c.id = a.parent_commit_id
            where a.depth + 1 < $3
        )
        select f.commit_id, c.message, c.created_at, f.content, f.is_deleted, f.is_symlink
        from ancestry a
        join fs.files f on f.commit_id = a.id
        join fs.commits c on c.id = a.id
        where f.path = $2
        order by a.depth asc
        "#,
    )
    .bind(commit_id)
    .bind(&path)
    .bind(ANCESTRY_STEP_GUARD)
    .fetch_all(&mut *conn)
    .await
    .context("file_history query failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let is_deleted: bool = row.try_get("is_deleted")?;
        out.push(FileVersion {
            commit_id: row.try_get("commit_id")?,
            message: row.try_get("message")?,
            content: if is_deleted {
                None
            } else {
                Some(row.try_get("content")?)
            },
            is_deleted,
            is_symlink: row.try_get("is_symlink")?,
            created_at: row.try_get("created_at")?,
        });
    }
    Ok(out)
}
