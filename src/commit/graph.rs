//! Commit DAG traversal.
//!
//! Walks are breadth-first with a visited set, so they terminate on cyclic
//! edge sets as well.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::storage::Database;
use crate::types::CommitId;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

fn walk(
    start: &CommitId,
    max_depth: Option<usize>,
    include_self: bool,
    next: impl Fn(&CommitId) -> Vec<CommitId>,
) -> BTreeMap<CommitId, usize> {
    let mut seen: BTreeMap<CommitId, usize> = BTreeMap::new();
    let mut visited = BTreeSet::from([start.clone()]);
    let mut queue = VecDeque::from([(start.clone(), 0usize)]);

    while let Some((commit_id, depth)) = queue.pop_front() {
        if depth > 0 || include_self {
            seen.insert(commit_id.clone(), depth);
        }
        if max_depth.map_or(false, |max| depth >= max) {
            continue;
        }
        for neighbour in next(&commit_id) {
            if visited.insert(neighbour.clone()) {
                queue.push_back((neighbour, depth + 1));
            }
        }
    }

    seen
}

/// Ancestors of `commit_id` with their distance, up to `max_depth` hops.
pub fn ancestors_within(
    db: &Database,
    commit_id: &CommitId,
    max_depth: Option<usize>,
    include_self: bool,
) -> BTreeMap<CommitId, usize> {
    walk(commit_id, max_depth, include_self, |id| db.parents_of(id))
}

/// Descendants of `commit_id` with their distance, up to `max_depth` hops.
pub fn descendants_within(
    db: &Database,
    commit_id: &CommitId,
    max_depth: Option<usize>,
    include_self: bool,
) -> BTreeMap<CommitId, usize> {
    walk(commit_id, max_depth, include_self, |id| db.children_of(id))
}

/// Nearest commit reachable from both `a` and `b` (each included).
///
/// Minimizes the summed distance; ties go to the smaller id.
pub fn common_ancestor(db: &Database, a: &CommitId, b: &CommitId) -> Option<CommitId> {
    let from_a = ancestors_within(db, a, None, true);
    let from_b = ancestors_within(db, b, None, true);
    from_a
        .iter()
        .filter_map(|(id, da)| from_b.get(id).map(|db_| (da + db_, id)))
        .min()
        .map(|(_, id)| id.clone())
}

impl Engine {
    /// Commits `commit_id` descends from, within `depth` hops when given.
    pub fn commit_is_ancestor_of(
        &self,
        commit_id: &CommitId,
        depth: Option<usize>,
        include_self: bool,
    ) -> Result<BTreeSet<CommitId>> {
        self.commit(commit_id)?;
        Ok(ancestors_within(&self.db, commit_id, depth, include_self)
            .into_keys()
            .collect())
    }

    /// Commits that descend from `commit_id`, within `depth` hops when given.
    pub fn commit_is_descendant_of(
        &self,
        commit_id: &CommitId,
        depth: Option<usize>,
        include_self: bool,
    ) -> Result<BTreeSet<CommitId>> {
        self.commit(commit_id)?;
        Ok(descendants_within(&self.db, commit_id, depth, include_self)
            .into_keys()
            .collect())
    }

    pub fn common_ancestor(&self, a: &CommitId, b: &CommitId) -> Result<CommitId> {
        self.commit(a)?;
        self.commit(b)?;
        common_ancestor(&self.db, a, b).ok_or_else(|| LixError::NoCommonAncestor {
            source_commit: a.clone(),
            target_commit: b.clone(),
        })
    }
}
