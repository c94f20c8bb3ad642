// crates/sqlkit-fs/src/repo.rs
//! Repositories, branches, commits and file deltas — the write side.
//!
//! Commits and file rows are append-only: nothing here issues an UPDATE
//! against `fs.commits` or `fs.files`. The only mutable pointer is
//! `fs.branches.head_commit_id`, moved explicitly via [`set_branch_head`]
//! (creating a commit never advances a branch).

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::paths::normalize_path;

pub const DEFAULT_BRANCH_NAME: &str = "main";

#[derive(Debug, Clone)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub default_branch_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub name: String,
    pub head_commit_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Commit {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub parent_commit_id: Option<Uuid>,
    pub merged_from_commit_id: Option<Uuid>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable row in `fs.files`.
#[derive(Debug, Clone)]
pub struct FileDelta {
    pub id: Uuid,
    pub commit_id: Uuid,
    pub path: String,
    pub content: String,
    pub is_deleted: bool,
    pub is_symlink: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`write_file`].
///
/// Coercion rules applied on insert:
/// - `is_deleted`: `is_symlink` forced false, `content` forced `""`
/// - `is_symlink`: `content` is the target path, normalized like any path
/// - otherwise `content` is required
#[derive(Debug, Clone)]
pub struct NewFile {
    pub path: String,
    pub content: Option<String>,
    pub is_deleted: bool,
    pub is_symlink: bool,
}

impl NewFile {
    pub fn write(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            is_deleted: false,
            is_symlink: false,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: None,
            is_deleted: true,
            is_symlink: false,
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: Some(target.into()),
            is_deleted: false,
            is_symlink: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// Create a repository and its default `main` branch atomically.
///
/// The branch starts with a NULL head; `default_branch_id` is linked back
/// before the transaction commits.
pub async fn create_repository(pool: &PgPool, name: &str) -> Result<Repository> {
    if name.trim().is_empty() {
        return Err(anyhow!("repository name must not be empty"));
    }

    let mut tx = pool.begin().await.context("create_repository begin failed")?;

    let repo_id = Uuid::new_v4();
    let res = sqlx::query(
        r#"
        insert into fs.repositories (id, name)
        values ($1, $2)
        "#,
    )
    .bind(repo_id)
    .bind(name)
    .execute(&mut *tx)
    .await;

    if let Err(e) = res {
        if sqlkit_db::is_unique_violation(&e, "fs_repositories_name_key") {
            return Err(anyhow!("repository '{name}' already exists"));
        }
        return Err(anyhow::Error::new(e).context("create_repository insert failed"));
    }

    let branch_id = Uuid::new_v4();
    sqlx::query(
        r#"
        insert into fs.branches (id, repository_id, name)
        values ($1, $2, $3)
        "#,
    )
    .bind(branch_id)
    .bind(repo_id)
    .bind(DEFAULT_BRANCH_NAME)
    .execute(&mut *tx)
    .await
    .context("create_repository default branch insert failed")?;

    sqlx::query(
        r#"
        update fs.repositories
        set default_branch_id = $2
        where id = $1
        "#,
    )
    .bind(repo_id)
    .bind(branch_id)
    .execute(&mut *tx)
    .await
    .context("create_repository default branch link failed")?;

    let repo = fetch_repository_on(&mut *tx, repo_id)
        .await?
        .ok_or_else(|| anyhow!("repository vanished during create"))?;

    tx.commit().await.context("create_repository commit failed")?;
    Ok(repo)
}

pub async fn get_repository(pool: &PgPool, name: &str) -> Result<Option<Repository>> {
    let row = sqlx::query(
        r#"
        select id, name, default_branch_id, created_at
        from fs.repositories
        where name = $1
        "#,
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("get_repository failed")?;

    row.map(repository_from_row).transpose()
}

pub async fn get_repository_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Repository>> {
    let mut conn = pool.acquire().await.context("get_repository_by_id acquire failed")?;
    fetch_repository_on(&mut conn, id).await
}

async fn fetch_repository_on(conn: &mut PgConnection, id: Uuid) -> Result<Option<Repository>> {
    let row = sqlx::query(
        r#"
        select id, name, default_branch_id, created_at
        from fs.repositories
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .context("fetch repository failed")?;

    row.map(repository_from_row).transpose()
}

fn repository_from_row(row: sqlx::postgres::PgRow) -> Result<Repository> {
    Ok(Repository {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        default_branch_id: row.try_get("default_branch_id")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Branches
// ---------------------------------------------------------------------------

/// Create a branch. When `head` is None the head defaults to the default
/// branch's current head (which may itself be NULL on a fresh repository).
pub async fn create_branch(
    pool: &PgPool,
    repository_id: Uuid,
    name: &str,
    head: Option<Uuid>,
) -> Result<Branch> {
    if name.trim().is_empty() {
        return Err(anyhow!("branch name must not be empty"));
    }

    let mut tx = pool.begin().await.context("create_branch begin failed")?;

    let head = match head {
        Some(h) => Some(h),
        None => default_branch_head_on(&mut *tx, repository_id).await?,
    };

    let branch_id = Uuid::new_v4();
    let res = sqlx::query(
        r#"
        insert into fs.branches (id, repository_id, name, head_commit_id)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(branch_id)
    .bind(repository_id)
    .bind(name)
    .bind(head)
    .execute(&mut *tx)
    .await;

    if let Err(e) = res {
        if sqlkit_db::is_unique_violation(&e, "fs_branches_repo_name_key") {
            return Err(anyhow!("branch '{name}' already exists in this repository"));
        }
        return Err(anyhow::Error::new(e).context("create_branch insert failed"));
    }

    let branch = fetch_branch_on(&mut *tx, branch_id)
        .await?
        .ok_or_else(|| anyhow!("branch vanished during create"))?;

    tx.commit().await.context("create_branch commit failed")?;
    Ok(branch)
}

pub async fn get_branch(pool: &PgPool, repository_id: Uuid, name: &str) -> Result<Option<Branch>> {
    let row = sqlx::query(
        r#"
        select id, repository_id, name, head_commit_id, created_at
        from fs.branches
        where repository_id = $1 and name = $2
        "#,
    )
    .bind(repository_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("get_branch failed")?;

    row.map(branch_from_row).transpose()
}

pub async fn get_branch_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Branch>> {
    let mut conn = pool.acquire().await.context("get_branch_by_id acquire failed")?;
    fetch_branch_on(&mut conn, id).await
}

pub async fn list_branches(pool: &PgPool, repository_id: Uuid) -> Result<Vec<Branch>> {
    let rows = sqlx::query(
        r#"
        select id, repository_id, name, head_commit_id, created_at
        from fs.branches
        where repository_id = $1
        order by name asc
        "#,
    )
    .bind(repository_id)
    .fetch_all(pool)
    .await
    .context("list_branches failed")?;

    rows.into_iter().map(branch_from_row).collect()
}

/// Move a branch head. This is the only way a branch pointer changes.
pub async fn set_branch_head(pool: &PgPool, branch_id: Uuid, commit_id: Uuid) -> Result<()> {
    let mut conn = pool.acquire().await.context("set_branch_head acquire failed")?;
    set_branch_head_on(&mut conn, branch_id, commit_id).await
}

pub(crate) async fn set_branch_head_on(
    conn: &mut PgConnection,
    branch_id: Uuid,
    commit_id: Uuid,
) -> Result<()> {
    let res = sqlx::query(
        r#"
        update fs.branches
        set head_commit_id = $2
        where id = $1
        "#,
    )
    .bind(branch_id)
    .bind(commit_id)
    .execute(conn)
    .await
    .context("set_branch_head failed")?;

    if res.rows_affected() == 0 {
        return Err(anyhow!("branch {branch_id} not found"));
    }
    Ok(())
}

pub(crate) async fn fetch_branch_on(conn: &mut PgConnection, id: Uuid) -> Result<Option<Branch>> {
    let row = sqlx::query(
        r#"
        select id, repository_id, name, head_commit_id, created_at
        from fs.branches
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .context("fetch branch failed")?;

    row.map(branch_from_row).transpose()
}

/// Fetch a branch row with a row lock, for operations that will move its head.
pub(crate) async fn lock_branch_on(conn: &mut PgConnection, id: Uuid) -> Result<Option<Branch>> {
    let row = sqlx::query(
        r#"
        select id, repository_id, name, head_commit_id, created_at
        from fs.branches
        where id = $1
        for update
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .context("lock branch failed")?;

    row.map(branch_from_row).transpose()
}

fn branch_from_row(row: sqlx::postgres::PgRow) -> Result<Branch> {
    Ok(Branch {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        name: row.try_get("name")?,
        head_commit_id: row.try_get("head_commit_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Head of the repository's default branch, or None when unset/unresolvable.
async fn default_branch_head_on(
    conn: &mut PgConnection,
    repository_id: Uuid,
) -> Result<Option<Uuid>> {
    let row = sqlx::query(
        r#"
        select b.head_commit_id
        from fs.repositories r
        join fs.branches b on b.id = r.default_branch_id
        where r.id = $1
        "#,
    )
    .bind(repository_id)
    .fetch_optional(conn)
    .await
    .context("default branch head lookup failed")?;

    match row {
        Some(row) => Ok(row.try_get("head_commit_id")?),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// Create a commit.
///
/// Parent defaulting: when `parent` is None, the repository's default branch
/// head is used; if that is also unresolvable and the repository already has
/// commits, the caller must supply an explicit parent. A NULL parent is only
/// accepted for the very first commit of a repository (enforced both here and
/// by the single-root partial unique index).
pub async fn create_commit(
    pool: &PgPool,
    repository_id: Uuid,
    parent: Option<Uuid>,
    merged_from: Option<Uuid>,
    message: &str,
) -> Result<Commit> {
    let mut tx = pool.begin().await.context("create_commit begin failed")?;

    if fetch_repository_on(&mut *tx, repository_id).await?.is_none() {
        return Err(anyhow!("repository {repository_id} not found"));
    }

    let parent = match parent {
        Some(p) => Some(p),
        None => {
            let head = default_branch_head_on(&mut *tx, repository_id).await?;
            if head.is_none() && repository_has_commits_on(&mut *tx, repository_id).await? {
                return Err(anyhow!(
                    "repository already has commits; parent_commit_id is required"
                ));
            }
            head
        }
    };

    for (label, reference) in [("parent", parent), ("merged_from", merged_from)] {
        if let Some(commit_id) = reference {
            let referenced = fetch_commit_on(&mut *tx, commit_id)
                .await?
                .ok_or_else(|| anyhow!("{label} commit {commit_id} not found"))?;
            if referenced.repository_id != repository_id {
                return Err(anyhow!(
                    "{label} commit {commit_id} belongs to a different repository"
                ));
            }
        }
    }

    let commit = insert_commit_on(&mut *tx, repository_id, parent, merged_from, message).await?;

    tx.commit().await.context("create_commit commit failed")?;
    Ok(commit)
}

pub(crate) async fn insert_commit_on(
    conn: &mut PgConnection,
    repository_id: Uuid,
    parent: Option<Uuid>,
    merged_from: Option<Uuid>,
    message: &str,
) -> Result<Commit> {
    let commit_id = Uuid::new_v4();
    let res = sqlx::query(
        r#"
        insert into fs.commits (id, repository_id, parent_commit_id, merged_from_commit_id, message)
        values ($1, $2, $3, $4, $5)
        returning created_at
        "#,
    )
    .bind(commit_id)
    .bind(repository_id)
    .bind(parent)
    .bind(merged_from)
    .bind(message)
    .fetch_one(conn)
    .await;

    let row = match res {
        Ok(row) => row,
        Err(e) => {
            if sqlkit_db::is_unique_violation(&e, "fs_commits_single_root_idx") {
                return Err(anyhow!("repository already has a root commit"));
            }
            return Err(anyhow::Error::new(e).context("insert commit failed"));
        }
    };

    Ok(Commit {
        id: commit_id,
        repository_id,
        parent_commit_id: parent,
        merged_from_commit_id: merged_from,
        message: message.to_string(),
        created_at: row.try_get("created_at")?,
    })
}

pub async fn get_commit(pool: &PgPool, id: Uuid) -> Result<Option<Commit>> {
    let mut conn = pool.acquire().await.context("get_commit acquire failed")?;
    fetch_commit_on(&mut conn, id).await
}

pub(crate) async fn fetch_commit_on(conn: &mut PgConnection, id: Uuid) -> Result<Option<Commit>> {
    let row = sqlx::query(
        r#"
        select id, repository_id, parent_commit_id, merged_from_commit_id, message, created_at
        from fs.commits
        where id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(conn)
    .await
    .context("fetch commit failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(Commit {
        id: row.try_get("id")?,
        repository_id: row.try_get("repository_id")?,
        parent_commit_id: row.try_get("parent_commit_id")?,
        merged_from_commit_id: row.try_get("merged_from_commit_id")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    }))
}

async fn repository_has_commits_on(conn: &mut PgConnection, repository_id: Uuid) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (select 1 from fs.commits where repository_id = $1)
        "#,
    )
    .bind(repository_id)
    .fetch_one(conn)
    .await
    .context("repository_has_commits failed")?;
    Ok(exists)
}

// ---------------------------------------------------------------------------
// File deltas
// ---------------------------------------------------------------------------

/// Insert one file delta into a commit.
pub async fn write_file(pool: &PgPool, commit_id: Uuid, file: &NewFile) -> Result<FileDelta> {
    let mut conn = pool.acquire().await.context("write_file acquire failed")?;
    write_file_on(&mut conn, commit_id, file).await
}

/// Insert several deltas into a commit atomically.
pub async fn write_files(pool: &PgPool, commit_id: Uuid, files: &[NewFile]) -> Result<Vec<FileDelta>> {
    let mut tx = pool.begin().await.context("write_files begin failed")?;
    let mut out = Vec::with_capacity(files.len());
    for file in files {
        out.push(write_file_on(&mut *tx, commit_id, file).await?);
    }
    tx.commit().await.context("write_files commit failed")?;
    Ok(out)
}

pub(crate) async fn write_file_on(
    conn: &mut PgConnection,
    commit_id: Uuid,
    file: &NewFile,
) -> Result<FileDelta> {
    let path = normalize_path(&file.path)?;

    let (content, is_deleted, is_symlink) = if file.is_deleted {
        (String::new(), true, false)
    } else if file.is_symlink {
        let target = file
            .content
            .as_deref()
            .ok_or_else(|| anyhow!("symlink requires a target path in content"))?;
        (normalize_path(target)?, false, true)
    } else {
        let content = file
            .content
            .clone()
            .ok_or_else(|| anyhow!("content is required for a file write"))?;
        (content, false, false)
    };

    insert_delta_on(conn, commit_id, &path, &content, is_deleted, is_symlink).await
}

/// Raw delta insert; callers are responsible for having normalized `path`
/// (and `content` when it is a symlink target).
pub(crate) async fn insert_delta_on(
    conn: &mut PgConnection,
    commit_id: Uuid,
    path: &str,
    content: &str,
    is_deleted: bool,
    is_symlink: bool,
) -> Result<FileDelta> {
    let id = Uuid::new_v4();
    let res = sqlx::query(
        r#"
        insert into fs.files (id, commit_id, path, content, is_deleted, is_symlink)
        values ($1, $2, $3, $4, $5, $6)
        returning created_at
        "#,
    )
    .bind(id)
    .bind(commit_id)
    .bind(path)
    .bind(content)
    .bind(is_deleted)
    .bind(is_symlink)
    .fetch_one(conn)
    .await;

    let row = match res {
        Ok(row) => row,
        Err(e) => {
            if sqlkit_db::is_unique_violation(&e, "fs_files_commit_path_key") {
                return Err(anyhow!("path '{path}' already written in this commit"));
            }
            return Err(anyhow::Error::new(e).context("insert file delta failed"));
        }
    };

    Ok(FileDelta {
        id,
        commit_id,
        path: path.to_string(),
        content: content.to_string(),
        is_deleted,
        is_symlink,
        created_at: row.try_get("created_at")?,
    })
}
