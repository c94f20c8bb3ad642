// crates/sqlkit-fs/src/lib.rs
//! Versioned filesystem on Postgres (`fs` schema).
//!
//! Git-like repositories, branches and commits where every file write is an
//! immutable per-commit delta and reads resolve by walking commit ancestry.
//! Merge finalization and rebase compute set-level patches between
//! snapshots; both are atomic and leave branch pointers untouched on any
//! failure.

use anyhow::Result;
use sqlx::PgPool;

pub mod merge;
pub mod paths;
pub mod read;
pub mod rebase;
pub mod repo;

pub use merge::{
    conflicts, finalize_commit, merge_base, Conflict, ConflictKind, MergeOperation, MergeOutcome,
};
pub use paths::{normalize_path, normalize_prefix, MAX_PATH_LEN};
pub use read::{
    file_history, read_file, snapshot, snapshot_with_content, FileRead, FileState, FileVersion,
    SnapshotEntry, ANCESTRY_STEP_GUARD,
};
pub use rebase::{rebase_branch, RebaseOperation, RebaseOutcome, DEFAULT_REBASE_MESSAGE};
pub use repo::{
    create_branch, create_commit, create_repository, get_branch, get_branch_by_id, get_commit,
    get_repository, get_repository_by_id, list_branches, set_branch_head, write_file, write_files,
    Branch, Commit, FileDelta, NewFile, Repository, DEFAULT_BRANCH_NAME,
};

/// Install the `fs` schema. Idempotent.
pub async fn install(pool: &PgPool) -> Result<()> {
    sqlkit_db::run_install_script(pool, "fs", include_str!("../sql/install.sql")).await
}
