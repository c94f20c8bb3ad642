// crates/sqlkit-fs/src/merge.rs
//! Merge support: merge-base, conflict detection, finalize-merge.
//!
//! `merge_base` walks both `parent_commit_id` and `merged_from_commit_id`
//! edges, so a previously-merged commit contributes both of its inputs as
//! ancestors. This can select a base that is not a strict parent-chain
//! ancestor; that is the intended contract.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{anyhow, Context, Result};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::read::{snapshot_with_content_on, FileState, ANCESTRY_STEP_GUARD};
use crate::repo::{fetch_commit_on, insert_delta_on, lock_branch_on, set_branch_head_on};

// ---------------------------------------------------------------------------
// merge_base
// ---------------------------------------------------------------------------

/// Common ancestor of `left` and `right` minimizing summed depth, walking
/// parent and merged_from edges on both sides. Ties break on the lowest
/// commit id, which is deterministic for a given graph.
pub async fn merge_base(pool: &PgPool, left: Uuid, right: Uuid) -> Result<Option<Uuid>> {
    let mut conn = pool.acquire().await.context("merge_base acquire failed")?;
    merge_base_on(&mut conn, left, right).await
}

pub(crate) async fn merge_base_on(
    conn: &mut PgConnection,
    left: Uuid,
    right: Uuid,
) -> Result<Option<Uuid>> {
    let left_commit = fetch_commit_on(&mut *conn, left)
        .await?
        .ok_or_else(|| anyhow!("commit {left} not found"))?;
    let right_commit = fetch_commit_on(&mut *conn, right)
        .await?
        .ok_or_else(|| anyhow!("commit {right} not found"))?;
    if left_commit.repository_id != right_commit.repository_id {
        return Err(anyhow!(
            "commits {left} and {right} belong to different repositories"
        ));
    }

    let row = sqlx::query(
        r#"
        with recursive lwalk as (
            select $1::uuid as id, 0::bigint as depth
            union
            select e.next_id, w.depth + 1
            from lwalk w
            join fs.commits c on c.id = w.id
            cross join lateral (
                values (c.parent_commit_id), (c.merged_from_commit_id)
            ) as e (next_id)
            where e.next_id is not null
              and w.depth + 1 < $3
        ),
        rwalk as (
            select $2::uuid as id, 0::bigint as depth
            union
            select e.next_id, w.depth + 1
            from rwalk w
            join fs.commits c on c.id = w.id
            cross join lateral (
                values (c.parent_commit_id), (c.merged_from_commit_id)
            ) as e (next_id)
            where e.next_id is not null
              and w.depth + 1 < $3
        ),
        lmin as (select id, min(depth) as depth from lwalk group by id),
        rmin as (select id, min(depth) as depth from rwalk group by id)
        select l.id
        from lmin l
        join rmin r on r.id = l.id
        order by l.depth + r.depth asc, l.id asc
        limit 1
        "#,
    )
    .bind(left)
    .bind(right)
    .bind(ANCESTRY_STEP_GUARD)
    .fetch_optional(&mut *conn)
    .await
    .context("merge_base query failed")?;

    match row {
        Some(row) => Ok(Some(row.try_get("id")?)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    AddAdd,
    DeleteModify,
    ModifyModify,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::AddAdd => "add/add",
            ConflictKind::DeleteModify => "delete/modify",
            ConflictKind::ModifyModify => "modify/modify",
        }
    }
}

/// One conflicting path between two commits relative to their merge base.
/// `None` sides mean the path is absent there (never existed or deleted).
#[derive(Debug, Clone)]
pub struct Conflict {
    pub path: String,
    pub kind: ConflictKind,
    pub base: Option<FileState>,
    pub left: Option<FileState>,
    pub right: Option<FileState>,
}

/// Paths changed on both sides relative to the merge base, where the two
/// sides disagree.
pub async fn conflicts(pool: &PgPool, left: Uuid, right: Uuid) -> Result<Vec<Conflict>> {
    let mut conn = pool.acquire().await.context("conflicts acquire failed")?;
    conflicts_on(&mut conn, left, right).await
}

pub(crate) async fn conflicts_on(
    conn: &mut PgConnection,
    left: Uuid,
    right: Uuid,
) -> Result<Vec<Conflict>> {
    let base = merge_base_on(&mut *conn, left, right)
        .await?
        .ok_or_else(|| anyhow!("commits {left} and {right} have no common ancestor"))?;

    let base_snap = snapshot_with_content_on(&mut *conn, base).await?;
    let left_snap = snapshot_with_content_on(&mut *conn, left).await?;
    let right_snap = snapshot_with_content_on(&mut *conn, right).await?;

    Ok(diff_conflicts(&base_snap, &left_snap, &right_snap))
}

/// Pure conflict computation over three snapshots.
fn diff_conflicts(
    base: &BTreeMap<String, FileState>,
    left: &BTreeMap<String, FileState>,
    right: &BTreeMap<String, FileState>,
) -> Vec<Conflict> {
    let mut paths: BTreeSet<&String> = BTreeSet::new();
    paths.extend(base.keys());
    paths.extend(left.keys());
    paths.extend(right.keys());

    let mut out = Vec::new();
    for path in paths {
        let b = base.get(path);
        let l = left.get(path);
        let r = right.get(path);

        let changed_left = l != b;
        let changed_right = r != b;
        if !(changed_left && changed_right && l != r) {
            continue;
        }

        let kind = if b.is_none() {
            ConflictKind::AddAdd
        } else if l.is_none() || r.is_none() {
            ConflictKind::DeleteModify
        } else {
            ConflictKind::ModifyModify
        };

        out.push(Conflict {
            path: path.clone(),
            kind,
            base: b.cloned(),
            left: l.cloned(),
            right: r.cloned(),
        });
    }
    out
}

// ---------------------------------------------------------------------------
// patch computation (shared with rebase)
// ---------------------------------------------------------------------------

/// One step of a minimal patch transforming a snapshot into a desired state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PatchOp {
    Write { path: String, state: FileState },
    Delete { path: String },
}

/// Overlay `side`'s net changes since `base` onto `onto`: any path whose
/// state differs between base and side takes side's state (including
/// deletion); everything else keeps onto's state.
pub(crate) fn overlay_net_changes(
    onto: &BTreeMap<String, FileState>,
    base: &BTreeMap<String, FileState>,
    side: &BTreeMap<String, FileState>,
) -> BTreeMap<String, FileState> {
    let mut desired = onto.clone();

    let mut touched: BTreeSet<&String> = BTreeSet::new();
    touched.extend(base.keys());
    touched.extend(side.keys());

    for path in touched {
        if side.get(path) != base.get(path) {
            match side.get(path) {
                Some(state) => {
                    desired.insert(path.clone(), state.clone());
                }
                None => {
                    desired.remove(path);
                }
            }
        }
    }
    desired
}

/// Minimal patch turning `current` into `desired`, skipping `skip` paths
/// (already resolved by the caller).
pub(crate) fn minimal_patch(
    current: &BTreeMap<String, FileState>,
    desired: &BTreeMap<String, FileState>,
    skip: &HashSet<String>,
) -> Vec<PatchOp> {
    let mut paths: BTreeSet<&String> = BTreeSet::new();
    paths.extend(current.keys());
    paths.extend(desired.keys());

    let mut ops = Vec::new();
    for path in paths {
        if skip.contains(path.as_str()) {
            continue;
        }
        match (current.get(path), desired.get(path)) {
            (Some(_), None) => ops.push(PatchOp::Delete { path: path.clone() }),
            (None, Some(d)) => ops.push(PatchOp::Write {
                path: path.clone(),
                state: d.clone(),
            }),
            (Some(c), Some(d)) if c != d => ops.push(PatchOp::Write {
                path: path.clone(),
                state: d.clone(),
            }),
            _ => {}
        }
    }
    ops
}

pub(crate) async fn apply_patch_on(
    conn: &mut PgConnection,
    commit_id: Uuid,
    ops: &[PatchOp],
) -> Result<usize> {
    for op in ops {
        match op {
            PatchOp::Write { path, state } => {
                insert_delta_on(
                    &mut *conn,
                    commit_id,
                    path,
                    &state.content,
                    false,
                    state.is_symlink,
                )
                .await?;
            }
            PatchOp::Delete { path } => {
                insert_delta_on(&mut *conn, commit_id, path, "", true, false).await?;
            }
        }
    }
    Ok(ops.len())
}

// ---------------------------------------------------------------------------
// finalize_commit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOperation {
    FastForward,
    AlreadyUpToDate,
    Merged,
    MergedWithConflictsResolved,
}

impl MergeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOperation::FastForward => "fast_forward",
            MergeOperation::AlreadyUpToDate => "already_up_to_date",
            MergeOperation::Merged => "merged",
            MergeOperation::MergedWithConflictsResolved => "merged_with_conflicts_resolved",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub operation: MergeOperation,
    pub commit_id: Uuid,
    pub applied_file_count: usize,
}

/// Finalize a pre-created merge commit.
///
/// The merge commit's parent is the merge target (the branch head being
/// merged into); `merged_from_commit_id`, when set, is the source. Any
/// conflicting path must already carry a resolution row in the merge commit;
/// the remaining net changes from the source side are materialized as
/// additional deltas. When `branch_id` is supplied its head must equal the
/// merge commit's parent and is advanced to the merge commit on success.
pub async fn finalize_commit(
    pool: &PgPool,
    merge_commit_id: Uuid,
    branch_id: Option<Uuid>,
) -> Result<MergeOutcome> {
    let mut tx = pool.begin().await.context("finalize_commit begin failed")?;

    let merge_commit = fetch_commit_on(&mut *tx, merge_commit_id)
        .await?
        .ok_or_else(|| anyhow!("merge commit {merge_commit_id} not found"))?;
    let target_head = merge_commit
        .parent_commit_id
        .ok_or_else(|| anyhow!("merge commit {merge_commit_id} has no parent"))?;

    if let Some(branch_id) = branch_id {
        let branch = lock_branch_on(&mut *tx, branch_id)
            .await?
            .ok_or_else(|| anyhow!("branch {branch_id} not found"))?;
        if branch.repository_id != merge_commit.repository_id {
            return Err(anyhow!(
                "branch {branch_id} belongs to a different repository"
            ));
        }
        if branch.head_commit_id != Some(target_head) {
            return Err(anyhow!(
                "branch head does not match merge commit parent; refusing to finalize"
            ));
        }
    }

    let Some(source) = merge_commit.merged_from_commit_id else {
        // No source recorded: nothing to compute, treat as a fast-forward
        // finalize of the pre-built commit.
        if let Some(branch_id) = branch_id {
            set_branch_head_on(&mut *tx, branch_id, merge_commit_id).await?;
        }
        tx.commit().await.context("finalize_commit commit failed")?;
        return Ok(MergeOutcome {
            operation: MergeOperation::FastForward,
            commit_id: merge_commit_id,
            applied_file_count: 0,
        });
    };

    let base = merge_base_on(&mut *tx, target_head, source)
        .await?
        .ok_or_else(|| anyhow!("merge target and source have no common ancestor"))?;

    let found_conflicts = conflicts_on(&mut *tx, target_head, source).await?;

    let resolved: HashSet<String> = sqlx::query(
        r#"
        select path from fs.files where commit_id = $1
        "#,
    )
    .bind(merge_commit_id)
    .fetch_all(&mut *tx)
    .await
    .context("finalize_commit resolution lookup failed")?
    .into_iter()
    .map(|row| row.try_get::<String, _>("path"))
    .collect::<Result<_, _>>()?;

    let unresolved = found_conflicts
        .iter()
        .filter(|c| !resolved.contains(&c.path))
        .count();
    if unresolved > 0 {
        return Err(anyhow!(
            "Merge requires resolutions for {unresolved} conflict paths"
        ));
    }

    let applied_file_count = if base == source {
        0
    } else {
        let base_snap = snapshot_with_content_on(&mut *tx, base).await?;
        let source_snap = snapshot_with_content_on(&mut *tx, source).await?;
        let target_snap = snapshot_with_content_on(&mut *tx, target_head).await?;

        let desired = overlay_net_changes(&target_snap, &base_snap, &source_snap);
        let ops = minimal_patch(&target_snap, &desired, &resolved);
        apply_patch_on(&mut *tx, merge_commit_id, &ops).await?
    };

    if let Some(branch_id) = branch_id {
        set_branch_head_on(&mut *tx, branch_id, merge_commit_id).await?;
    }

    let operation = if base == source {
        MergeOperation::AlreadyUpToDate
    } else if !found_conflicts.is_empty() {
        MergeOperation::MergedWithConflictsResolved
    } else {
        MergeOperation::Merged
    };

    tx.commit().await.context("finalize_commit commit failed")?;
    tracing::debug!(
        merge_commit = %merge_commit_id,
        operation = operation.as_str(),
        applied = applied_file_count,
        "merge finalized"
    );

    Ok(MergeOutcome {
        operation,
        commit_id: merge_commit_id,
        applied_file_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(content: &str) -> FileState {
        FileState {
            content: content.to_string(),
            is_symlink: false,
        }
    }

    fn snap(entries: &[(&str, &str)]) -> BTreeMap<String, FileState> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), state(c)))
            .collect()
    }

    #[test]
    fn conflict_requires_both_sides_changed_and_differing() {
        let base = snap(&[("/a", "base")]);
        let left = snap(&[("/a", "left")]);
        let right = snap(&[("/a", "base")]);
        // Only left changed: no conflict.
        assert!(diff_conflicts(&base, &left, &right).is_empty());

        let right = snap(&[("/a", "right")]);
        let found = diff_conflicts(&base, &left, &right);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, ConflictKind::ModifyModify);

        // Both changed to the same content: converged, no conflict.
        let right = snap(&[("/a", "left")]);
        assert!(diff_conflicts(&base, &left, &right).is_empty());
    }

    #[test]
    fn conflict_kinds() {
        let base = snap(&[]);
        let left = snap(&[("/new", "l")]);
        let right = snap(&[("/new", "r")]);
        assert_eq!(diff_conflicts(&base, &left, &right)[0].kind, ConflictKind::AddAdd);

        let base = snap(&[("/a", "base")]);
        let left = snap(&[]);
        let right = snap(&[("/a", "edited")]);
        assert_eq!(
            diff_conflicts(&base, &left, &right)[0].kind,
            ConflictKind::DeleteModify
        );
    }

    #[test]
    fn symlink_flag_differences_conflict() {
        let base = snap(&[("/a", "t")]);
        let left: BTreeMap<String, FileState> = [(
            "/a".to_string(),
            FileState {
                content: "t".to_string(),
                is_symlink: true,
            },
        )]
        .into_iter()
        .collect();
        let right = snap(&[("/a", "other")]);
        let found = diff_conflicts(&base, &left, &right);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn overlay_applies_only_side_changes() {
        let onto = snap(&[("/a", "onto-a"), ("/b", "onto-b")]);
        let base = snap(&[("/b", "base-b"), ("/c", "base-c")]);
        let side = snap(&[("/b", "base-b"), ("/d", "side-d")]);

        // side deleted /c, added /d, left /b alone.
        let desired = overlay_net_changes(&onto, &base, &side);
        assert_eq!(desired.get("/a"), Some(&state("onto-a")));
        assert_eq!(desired.get("/b"), Some(&state("onto-b")));
        assert_eq!(desired.get("/c"), None);
        assert_eq!(desired.get("/d"), Some(&state("side-d")));
    }

    #[test]
    fn minimal_patch_skips_resolved_paths_and_noops() {
        let current = snap(&[("/same", "x"), ("/stale", "old"), ("/gone", "y")]);
        let desired = snap(&[("/same", "x"), ("/stale", "new"), ("/added", "z")]);
        let skip: HashSet<String> = ["/stale".to_string()].into_iter().collect();

        let ops = minimal_patch(&current, &desired, &skip);
        assert_eq!(
            ops,
            vec![
                PatchOp::Write {
                    path: "/added".to_string(),
                    state: state("z"),
                },
                PatchOp::Delete {
                    path: "/gone".to_string(),
                },
            ]
        );
    }
}
