// crates/sqlkit-fs/src/rebase.rs
//! Branch rebase with squash semantics.
//!
//! Commits carry a single parent, so a rebase cannot replay individual
//! commits: the branch's net changes since the merge base are squashed into
//! one new commit on top of `onto`'s head. A rebase with any conflict is
//! refused outright; there is no resolution channel here.

use anyhow::{anyhow, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::merge::{apply_patch_on, conflicts_on, merge_base_on, minimal_patch, overlay_net_changes};
use crate::read::snapshot_with_content_on;
use crate::repo::{insert_commit_on, lock_branch_on, set_branch_head_on};

use std::collections::HashSet;

pub const DEFAULT_REBASE_MESSAGE: &str = "Rebase";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseOperation {
    /// Branch and onto are the same branch.
    Noop,
    /// The branch already contains everything on onto (or onto is empty).
    UpToDate,
    /// The branch head moved to onto's head; no new commit.
    FastForward,
    /// A new squash commit was created on top of onto's head.
    Rebased,
}

impl RebaseOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebaseOperation::Noop => "noop",
            RebaseOperation::UpToDate => "up_to_date",
            RebaseOperation::FastForward => "fast_forward",
            RebaseOperation::Rebased => "rebased",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RebaseOutcome {
    pub operation: RebaseOperation,
    /// The branch head after the operation (None when nothing moved and the
    /// branch has no head).
    pub commit_id: Option<Uuid>,
    pub applied_file_count: usize,
}

/// Rebase `branch` onto `onto_branch`'s head.
///
/// Atomic: the branch pointer moves only if every step succeeds; any failure
/// rolls the whole transaction back.
pub async fn rebase_branch(
    pool: &PgPool,
    branch_id: Uuid,
    onto_branch_id: Uuid,
    message: Option<&str>,
) -> Result<RebaseOutcome> {
    let mut tx = pool.begin().await.context("rebase_branch begin failed")?;

    let branch = lock_branch_on(&mut *tx, branch_id)
        .await?
        .ok_or_else(|| anyhow!("branch {branch_id} not found"))?;

    if branch_id == onto_branch_id {
        return Ok(RebaseOutcome {
            operation: RebaseOperation::Noop,
            commit_id: branch.head_commit_id,
            applied_file_count: 0,
        });
    }

    let onto = lock_branch_on(&mut *tx, onto_branch_id)
        .await?
        .ok_or_else(|| anyhow!("branch {onto_branch_id} not found"))?;

    if branch.repository_id != onto.repository_id {
        return Err(anyhow!(
            "branches {branch_id} and {onto_branch_id} belong to different repositories"
        ));
    }

    // An empty onto has nothing to rebase onto.
    let Some(onto_head) = onto.head_commit_id else {
        return Ok(RebaseOutcome {
            operation: RebaseOperation::UpToDate,
            commit_id: branch.head_commit_id,
            applied_file_count: 0,
        });
    };

    // An empty branch just adopts onto's head.
    let Some(branch_head) = branch.head_commit_id else {
        set_branch_head_on(&mut *tx, branch_id, onto_head).await?;
        tx.commit().await.context("rebase_branch commit failed")?;
        return Ok(RebaseOutcome {
            operation: RebaseOperation::FastForward,
            commit_id: Some(onto_head),
            applied_file_count: 0,
        });
    };

    let base = merge_base_on(&mut *tx, branch_head, onto_head)
        .await?
        .ok_or_else(|| anyhow!("branch and onto have no common ancestor"))?;

    if base == onto_head {
        // Branch already contains onto.
        return Ok(RebaseOutcome {
            operation: RebaseOperation::UpToDate,
            commit_id: Some(branch_head),
            applied_file_count: 0,
        });
    }

    if base == branch_head {
        set_branch_head_on(&mut *tx, branch_id, onto_head).await?;
        tx.commit().await.context("rebase_branch commit failed")?;
        return Ok(RebaseOutcome {
            operation: RebaseOperation::FastForward,
            commit_id: Some(onto_head),
            applied_file_count: 0,
        });
    }

    let found_conflicts = conflicts_on(&mut *tx, branch_head, onto_head).await?;
    if !found_conflicts.is_empty() {
        return Err(anyhow!(
            "Rebase blocked by {} conflicts",
            found_conflicts.len()
        ));
    }

    let base_snap = snapshot_with_content_on(&mut *tx, base).await?;
    let branch_snap = snapshot_with_content_on(&mut *tx, branch_head).await?;
    let onto_snap = snapshot_with_content_on(&mut *tx, onto_head).await?;

    let desired = overlay_net_changes(&onto_snap, &base_snap, &branch_snap);
    let ops = minimal_patch(&onto_snap, &desired, &HashSet::new());

    if ops.is_empty() {
        // Diverged in history but not in content.
        set_branch_head_on(&mut *tx, branch_id, onto_head).await?;
        tx.commit().await.context("rebase_branch commit failed")?;
        return Ok(RebaseOutcome {
            operation: RebaseOperation::FastForward,
            commit_id: Some(onto_head),
            applied_file_count: 0,
        });
    }

    let commit = insert_commit_on(
        &mut *tx,
        branch.repository_id,
        Some(onto_head),
        None,
        message.unwrap_or(DEFAULT_REBASE_MESSAGE),
    )
    .await?;

    let applied_file_count = apply_patch_on(&mut *tx, commit.id, &ops).await?;
    set_branch_head_on(&mut *tx, branch_id, commit.id).await?;

    tx.commit().await.context("rebase_branch commit failed")?;
    tracing::debug!(
        branch = %branch_id,
        commit = %commit.id,
        applied = applied_file_count,
        "branch rebased"
    );

    Ok(RebaseOutcome {
        operation: RebaseOperation::Rebased,
        commit_id: Some(commit.id),
        applied_file_count,
    })
}
