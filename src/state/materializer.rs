//! Resolves the visible state of every version from the change log.
//!
//! The pipeline is a pure function of the persistent tables:
//!
//! 1. `build_commit_parents` indexes commit edges by child.
//! 2. `build_version_pointers` collects, per version, every working commit
//!    its `lix_version` changes ever referenced.
//! 3. `resolve_tips` picks the head of each version's own walk.
//! 4. `build_commit_depths` walks parents breadth-first from each tip; the
//!    minimum depth wins when merges reach a commit twice.
//! 5. `build_latest_visible_state` keeps, per entity key, the change from
//!    the shallowest commit. Tombstones are kept.
//! 6. `resolve_inheritance` overlays ancestor state, closest ancestor first.

use crate::error::Result;
use crate::schema::VERSION_SCHEMA_KEY;
use crate::storage::{Database, SnapshotStore};
use crate::types::{Change, ChangeId, CommitId, EntityKey, StateRow, Timestamp, VersionId};
use crate::version::VersionTree;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Row counts of one pipeline stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageStat {
    pub stage: &'static str,
    pub input_rows: usize,
    pub output_rows: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializationWarning {
    pub code: &'static str,
    pub message: String,
}

/// Output of a full materialization.
#[derive(Clone, Debug, Default)]
pub struct Materialized {
    /// Each version's own rows (no inheritance), tombstones included.
    pub own: BTreeMap<VersionId, Vec<StateRow>>,
    pub tips: BTreeMap<VersionId, CommitId>,
    pub tree: VersionTree,
    pub stats: Vec<StageStat>,
    pub warnings: Vec<MaterializationWarning>,
}

impl Materialized {
    /// Resolved rows of one version, tombstones included.
    pub fn resolved(&self, version_id: &VersionId) -> Vec<StateRow> {
        resolve_inheritance(&self.own, &self.tree, version_id)
    }
}

/// What a version's pointer changes say about it.
#[derive(Clone, Debug, Default)]
struct VersionPointer {
    /// Working commit -> most recent (created_at, change id) referencing it.
    candidates: BTreeMap<CommitId, (Timestamp, ChangeId)>,
    inherits_from: Option<VersionId>,
    latest: Option<(Timestamp, ChangeId)>,
    deleted: bool,
}

/// Run the full pipeline.
pub fn materialize(db: &Database, snapshots: &SnapshotStore) -> Result<Materialized> {
    let mut stats = Vec::new();
    let mut warnings = Vec::new();

    let parents = build_commit_parents(db, &mut stats);
    let pointers = build_version_pointers(db, snapshots, &mut stats)?;
    let tips = resolve_tips(&pointers, &parents, &mut stats);

    let tree = VersionTree::from_pairs(
        pointers
            .iter()
            .filter(|(_, pointer)| !pointer.deleted)
            .map(|(id, pointer)| (id.clone(), pointer.inherits_from.clone())),
    );

    let mut own = BTreeMap::new();
    let mut depth_rows = 0usize;
    for (version_id, tip) in &tips {
        let depths = build_commit_depths(tip, &parents);
        depth_rows += depths.len();
        let rows =
            build_latest_visible_state(db, snapshots, version_id, &depths, None, &mut warnings)?;
        own.insert(version_id.clone(), rows.into_values().collect::<Vec<_>>());
    }
    stats.push(StageStat {
        stage: "commit_graph",
        input_rows: tips.len() + parents.values().map(Vec::len).sum::<usize>(),
        output_rows: depth_rows,
    });
    stats.push(StageStat {
        stage: "latest_visible_state",
        input_rows: depth_rows,
        output_rows: own.values().map(Vec::len).sum(),
    });

    for warning in &warnings {
        warn!(code = warning.code, "{}", warning.message);
    }
    debug!(versions = tips.len(), "materialized state");

    Ok(Materialized {
        own,
        tips,
        tree,
        stats,
        warnings,
    })
}

/// Depth-ranked state reachable from one commit, without inheritance.
///
/// With `keys`, the walk stops after the first depth level at which every
/// requested key has been resolved.
pub fn state_at_commit(
    db: &Database,
    snapshots: &SnapshotStore,
    version_id: &VersionId,
    commit_id: &CommitId,
    keys: Option<&BTreeSet<EntityKey>>,
) -> Result<BTreeMap<EntityKey, StateRow>> {
    let parents = build_commit_parents(db, &mut Vec::new());
    let depths = match keys {
        Some(keys) => build_commit_depths_until(db, commit_id, &parents, keys),
        None => build_commit_depths(commit_id, &parents),
    };
    let mut warnings = Vec::new();
    let rows = build_latest_visible_state(db, snapshots, version_id, &depths, keys, &mut warnings)?;
    for warning in &warnings {
        warn!(code = warning.code, "{}", warning.message);
    }
    Ok(rows)
}

/// Every change to `key` reachable from `commit_id`, shallowest first.
pub fn history_of(
    db: &Database,
    commit_id: &CommitId,
    key: &EntityKey,
) -> Vec<(usize, CommitId, Change)> {
    let parents = build_commit_parents(db, &mut Vec::new());
    let depths = build_commit_depths(commit_id, &parents);
    let mut rows = Vec::new();
    for (commit, depth) in &depths {
        let Some(commit_row) = db.commits.get(commit) else {
            continue;
        };
        let element_key = (commit_row.change_set_id.clone(), key.clone());
        if let Some(element) = db.change_set_elements.get(&element_key) {
            if let Some(change) = db.changes.get(&element.change_id) {
                rows.push((*depth, commit.clone(), change.clone()));
            }
        }
    }
    rows.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| b.2.created_at.cmp(&a.2.created_at))
            .then_with(|| b.2.id.cmp(&a.2.id))
    });
    rows
}

pub(crate) fn build_commit_parents(
    db: &Database,
    stats: &mut Vec<StageStat>,
) -> BTreeMap<CommitId, Vec<CommitId>> {
    let mut parents: BTreeMap<CommitId, Vec<CommitId>> = BTreeMap::new();
    for (parent, child) in db.commit_edges.keys() {
        parents.entry(child.clone()).or_default().push(parent.clone());
    }
    stats.push(StageStat {
        stage: "all_commit_edges",
        input_rows: db.commit_edges.len(),
        output_rows: parents.len(),
    });
    parents
}

fn build_version_pointers(
    db: &Database,
    snapshots: &SnapshotStore,
    stats: &mut Vec<StageStat>,
) -> Result<BTreeMap<VersionId, VersionPointer>> {
    let mut pointers: BTreeMap<VersionId, VersionPointer> = BTreeMap::new();
    let mut input_rows = 0usize;

    for change in db.changes.values() {
        if change.schema_key != VERSION_SCHEMA_KEY {
            continue;
        }
        input_rows += 1;
        let version_id = VersionId::from(change.entity_id.as_str());
        let reference = (change.created_at, change.id.clone());
        let pointer = pointers.entry(version_id).or_default();
        let is_latest = pointer.latest.as_ref().map_or(true, |latest| reference > *latest);

        let content = snapshots.get(db, &change.snapshot_id)?;
        match content.as_deref() {
            None => {
                if is_latest {
                    pointer.deleted = true;
                    pointer.latest = Some(reference);
                }
            }
            Some(content) => {
                if let Some(working) = content.get("working_commit_id").and_then(Value::as_str) {
                    let slot = pointer
                        .candidates
                        .entry(CommitId::from(working))
                        .or_insert_with(|| reference.clone());
                    if reference > *slot {
                        *slot = reference.clone();
                    }
                }
                if is_latest {
                    pointer.deleted = false;
                    pointer.inherits_from = content
                        .get("inherits_from_version_id")
                        .and_then(Value::as_str)
                        .map(VersionId::from);
                    pointer.latest = Some(reference);
                }
            }
        }
    }

    stats.push(StageStat {
        stage: "version_pointers",
        input_rows,
        output_rows: pointers.len(),
    });
    Ok(pointers)
}

fn resolve_tips(
    pointers: &BTreeMap<VersionId, VersionPointer>,
    parents: &BTreeMap<CommitId, Vec<CommitId>>,
    stats: &mut Vec<StageStat>,
) -> BTreeMap<VersionId, CommitId> {
    let mut tips = BTreeMap::new();

    for (version_id, pointer) in pointers {
        if pointer.deleted || pointer.candidates.is_empty() {
            continue;
        }

        // A candidate that is the parent of another candidate is history.
        let non_tips: BTreeSet<&CommitId> = pointer
            .candidates
            .keys()
            .flat_map(|child| parents.get(child).into_iter().flatten())
            .filter(|parent| pointer.candidates.contains_key(*parent))
            .collect();

        let tip = pointer
            .candidates
            .iter()
            .filter(|(id, _)| !non_tips.contains(id))
            .max_by(|a, b| a.1.cmp(b.1))
            .or_else(|| pointer.candidates.iter().max_by(|a, b| a.1.cmp(b.1)))
            .map(|(id, _)| id.clone());
        if let Some(tip) = tip {
            tips.insert(version_id.clone(), tip);
        }
    }

    stats.push(StageStat {
        stage: "tips",
        input_rows: pointers.len(),
        output_rows: tips.len(),
    });
    tips
}

/// Breadth-first walk from `tip` through parents. Min depth per commit.
pub(crate) fn build_commit_depths(
    tip: &CommitId,
    parents: &BTreeMap<CommitId, Vec<CommitId>>,
) -> BTreeMap<CommitId, usize> {
    let mut depths: BTreeMap<CommitId, usize> = BTreeMap::new();
    let mut queue = VecDeque::from([(tip.clone(), 0usize)]);

    while let Some((commit_id, depth)) = queue.pop_front() {
        if depths.get(&commit_id).map_or(false, |seen| *seen <= depth) {
            continue;
        }
        depths.insert(commit_id.clone(), depth);
        if let Some(list) = parents.get(&commit_id) {
            for parent in list {
                if !depths.contains_key(parent) {
                    queue.push_back((parent.clone(), depth + 1));
                }
            }
        }
    }

    depths
}

/// Level-by-level walk that stops once every key is resolved.
fn build_commit_depths_until(
    db: &Database,
    tip: &CommitId,
    parents: &BTreeMap<CommitId, Vec<CommitId>>,
    keys: &BTreeSet<EntityKey>,
) -> BTreeMap<CommitId, usize> {
    let mut depths: BTreeMap<CommitId, usize> = BTreeMap::new();
    let mut remaining: BTreeSet<&EntityKey> = keys.iter().collect();
    let mut level = vec![tip.clone()];
    let mut depth = 0usize;

    while !level.is_empty() && !remaining.is_empty() {
        let mut next = Vec::new();
        for commit_id in level {
            if depths.contains_key(&commit_id) {
                continue;
            }
            depths.insert(commit_id.clone(), depth);
            if let Some(commit) = db.commits.get(&commit_id) {
                remaining.retain(|key| {
                    !db.change_set_elements
                        .contains_key(&(commit.change_set_id.clone(), (*key).clone()))
                });
            }
            if let Some(list) = parents.get(&commit_id) {
                next.extend(list.iter().filter(|p| !depths.contains_key(*p)).cloned());
            }
        }
        level = next;
        depth += 1;
    }

    depths
}

struct Candidate<'a> {
    depth: usize,
    commit_id: &'a CommitId,
    change: &'a Change,
}

fn build_latest_visible_state(
    db: &Database,
    snapshots: &SnapshotStore,
    version_id: &VersionId,
    depths: &BTreeMap<CommitId, usize>,
    keys: Option<&BTreeSet<EntityKey>>,
    warnings: &mut Vec<MaterializationWarning>,
) -> Result<BTreeMap<EntityKey, StateRow>> {
    let mut candidates: BTreeMap<EntityKey, Vec<Candidate<'_>>> = BTreeMap::new();

    for (commit_id, depth) in depths {
        let Some(commit) = db.commits.get(commit_id) else {
            warnings.push(MaterializationWarning {
                code: "missing_commit",
                message: format!("version '{version_id}' reaches unknown commit '{commit_id}'"),
            });
            continue;
        };
        for element in db.elements_of(&commit.change_set_id) {
            let key = element.key();
            if keys.map_or(false, |keys| !keys.contains(&key)) {
                continue;
            }
            let Some(change) = db.changes.get(&element.change_id) else {
                warnings.push(MaterializationWarning {
                    code: "missing_change",
                    message: format!(
                        "change set '{}' references missing change '{}'",
                        commit.change_set_id, element.change_id
                    ),
                });
                continue;
            };
            candidates.entry(key).or_default().push(Candidate {
                depth: *depth,
                commit_id,
                change,
            });
        }
    }

    let mut winners = BTreeMap::new();
    for (key, mut rows) in candidates {
        rows.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| b.change.created_at.cmp(&a.change.created_at))
                .then_with(|| b.change.id.cmp(&a.change.id))
        });
        let Some(winner) = rows.first() else {
            continue;
        };
        let created_at = rows
            .last()
            .map_or(winner.change.created_at, |deepest| deepest.change.created_at);

        let content = snapshots.content(db, &winner.change.snapshot_id)?;
        winners.insert(
            key,
            StateRow {
                entity_id: winner.change.entity_id.clone(),
                schema_key: winner.change.schema_key.clone(),
                file_id: winner.change.file_id.clone(),
                version_id: version_id.clone(),
                plugin_key: winner.change.plugin_key.clone(),
                schema_version: winner.change.schema_version.clone(),
                snapshot_content: content,
                change_id: winner.change.id.clone(),
                commit_id: winner.commit_id.clone(),
                created_at,
                updated_at: winner.change.created_at,
                inherited_from_version_id: None,
            },
        );
    }

    Ok(winners)
}

/// Overlay ancestor state: the closest ancestor holding a key wins.
pub fn resolve_inheritance(
    own: &BTreeMap<VersionId, Vec<StateRow>>,
    tree: &VersionTree,
    version_id: &VersionId,
) -> Vec<StateRow> {
    let mut chosen: BTreeMap<EntityKey, StateRow> = BTreeMap::new();
    for (ancestor, depth) in tree.ancestry(version_id) {
        let Some(rows) = own.get(&ancestor) else {
            continue;
        };
        for row in rows {
            let key = row.key();
            if chosen.contains_key(&key) {
                continue;
            }
            let mut resolved = row.clone();
            resolved.version_id = version_id.clone();
            resolved.inherited_from_version_id = (depth > 0).then(|| ancestor.clone());
            chosen.insert(key, resolved);
        }
    }
    chosen.into_values().collect()
}
