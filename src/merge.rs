//! Merging the active version of another store into this one.
//!
//! The source's commit history (the closure of its active commit) is
//! imported first, so both sides share one commit graph. The merge then
//! runs against the common ancestor:
//! - theirs already reachable: nothing to do
//! - ours is the ancestor: fast-forward the version pointer
//! - otherwise a three-way merge per entity, recorded as a commit with
//!   both heads as parents

use crate::commit::{ancestors_within, common_ancestor};
use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::plugin::{three_way, MergeOutcome};
use crate::schema::VERSION_SCHEMA_KEY;
use crate::state::state_at_commit;
use crate::lix::LixConfig;
use crate::storage::{decode_image, encode_image};
use crate::types::{
    ChangeEdge, ChangeId, ChangeSetId, Commit, CommitEdge, CommitId, Conflict, EntityKey,
    NewChange, StateRow, Version,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

#[derive(Clone, Debug, PartialEq)]
pub struct MergeReport {
    /// The version's commit after the merge.
    pub commit_id: CommitId,
    pub fast_forward: bool,
    pub imported_commits: usize,
    pub conflicts: Vec<Conflict>,
}

fn ensure_committed(engine: &Engine, version: &Version) -> Result<()> {
    let working = engine.commit(&version.working_commit_id)?;
    if engine.db.elements_of(&working.change_set_id).next().is_some() {
        return Err(LixError::UncommittedChanges(version.id.clone()));
    }
    Ok(())
}

fn collision(kind: &str, id: &str) -> LixError {
    LixError::InvalidOperation(format!("{kind} '{id}' exists in both stores with different content"))
}

impl Engine {
    /// An independent copy of this store.
    ///
    /// Every version of the copy continues on a fresh working commit
    /// (uncommitted elements carried over), so the two stores never write
    /// into the same commit and can later be merged with [`merge_from`].
    ///
    /// [`merge_from`]: Engine::merge_from
    pub fn fork(&self, config: &LixConfig) -> Result<Engine> {
        let db = decode_image(&encode_image(&self.db)?)?;
        let mut forked = Engine::open(db, config)?;
        forked.transaction(|engine| {
            for mut version in engine.list_versions() {
                let old = engine.commit(&version.working_commit_id)?;
                let set = engine.new_change_set(false);
                let carried: Vec<ChangeId> = engine
                    .db
                    .elements_of(&old.change_set_id)
                    .map(|element| element.change_id.clone())
                    .collect();
                for change_id in carried {
                    let change = engine.change(&change_id)?;
                    engine.add_element(&set.id, &change)?;
                }
                let working = engine.new_commit(&set.id, std::slice::from_ref(&version.commit_id))?;
                version.working_commit_id = working.id;
                engine.write_version(&version)?;
            }
            engine.invalidate_cache()
        })?;
        info!(lix_id = forked.lix_id().unwrap_or_default(), "forked store");
        Ok(forked)
    }

    /// Merge `source`'s active version into this store's active version.
    ///
    /// Both versions must have empty working change sets. Entities changed
    /// on both sides go through the owning plugin's merger, or a plain
    /// three-way comparison when it has none. Unresolvable entities keep
    /// our side and are recorded as conflicts.
    pub fn merge_from(&mut self, source: &Engine) -> Result<MergeReport> {
        let theirs_version = source.active_version()?;
        ensure_committed(source, &theirs_version)?;

        self.transaction(|engine| {
            let mut version = engine.active_version()?;
            ensure_committed(engine, &version)?;

            let ours = version.commit_id.clone();
            let theirs = theirs_version.commit_id.clone();
            let imported = engine.import_history(source, &theirs)?;

            let base = common_ancestor(&engine.db, &ours, &theirs).ok_or_else(|| {
                LixError::NoCommonAncestor {
                    source_commit: theirs.clone(),
                    target_commit: ours.clone(),
                }
            })?;
            debug!(ours = %ours, theirs = %theirs, base = %base, imported, "merging");

            if base == theirs {
                return Ok(MergeReport {
                    commit_id: ours,
                    fast_forward: false,
                    imported_commits: imported,
                    conflicts: Vec::new(),
                });
            }

            let fast_forward = base == ours;
            let (head, conflicts) = if fast_forward {
                (theirs.clone(), Vec::new())
            } else {
                engine.three_way_merge(&version, &base, &ours, &theirs)?
            };

            let working_set = engine.new_change_set(false);
            let working = engine.new_commit(&working_set.id, std::slice::from_ref(&head))?;
            version.commit_id = head.clone();
            version.working_commit_id = working.id;
            engine.write_version(&version)?;
            engine.invalidate_cache()?;

            info!(
                version = %version.id,
                commit = %head,
                fast_forward,
                conflicts = conflicts.len(),
                "merged store"
            );
            Ok(MergeReport {
                commit_id: head,
                fast_forward,
                imported_commits: imported,
                conflicts,
            })
        })
    }

    /// Copy every commit reachable from `head` in `source`, with its change
    /// set, elements, changes and snapshots. Returns the number of commits
    /// that were new.
    fn import_history(&mut self, source: &Engine, head: &CommitId) -> Result<usize> {
        let closure = ancestors_within(&source.db, head, None, true);
        let mut imported = 0usize;
        let mut imported_changes: BTreeSet<ChangeId> = BTreeSet::new();

        for commit_id in closure.keys() {
            let commit = source.commit(commit_id)?;
            if let Some(existing) = self.db.commits.get(commit_id) {
                if *existing != commit {
                    return Err(collision("commit", commit_id.as_str()));
                }
                if self.change_set_matches(source, &commit) {
                    continue;
                }
                if !self.is_unused_working_set(&commit.change_set_id) {
                    return Err(collision("change set", commit.change_set_id.as_str()));
                }
            }

            let set = source
                .db
                .change_sets
                .get(&commit.change_set_id)
                .cloned()
                .ok_or_else(|| LixError::ChangeSetNotFound(commit.change_set_id.to_string()))?;
            if let Some(existing) = self.db.change_sets.get(&set.id) {
                if *existing != set && !self.is_unused_working_set(&set.id) {
                    return Err(collision("change set", set.id.as_str()));
                }
            }

            for element in source.db.elements_of(&set.id) {
                let change = source.change(&element.change_id)?;
                match self.db.changes.get(&change.id) {
                    Some(existing) if *existing != change => {
                        return Err(collision("change", change.id.as_str()));
                    }
                    Some(_) => {}
                    None => {
                        if let Some(snapshot) = source.db.snapshots.get(&change.snapshot_id) {
                            self.db.snapshots.insert(change.snapshot_id.clone(), snapshot.clone());
                        }
                        imported_changes.insert(change.id.clone());
                        self.db.changes.insert(change.id.clone(), change);
                    }
                }
                self.db
                    .change_set_elements
                    .insert((set.id.clone(), element.key()), element.clone());
            }

            self.db.change_sets.insert(set.id.clone(), set);
            self.db.commits.insert(commit.id.clone(), commit.clone());
            for parent in source.db.parents_of(commit_id) {
                self.db.commit_edges.insert(
                    (parent.clone(), commit.id.clone()),
                    CommitEdge {
                        parent_id: parent,
                        child_id: commit.id.clone(),
                    },
                );
            }
            if source.is_checkpoint(commit_id) {
                self.label_commit_as_checkpoint(commit_id)?;
            }
            imported += 1;
        }

        for ((parent, child), edge) in source.db.change_edges.iter() {
            if imported_changes.contains(child) && self.db.changes.contains_key(parent) {
                self.db
                    .change_edges
                    .insert((parent.clone(), child.clone()), edge.clone());
            }
        }
        Ok(imported)
    }

    fn change_set_matches(&self, source: &Engine, commit: &Commit) -> bool {
        let id = &commit.change_set_id;
        self.db.change_sets.get(id) == source.db.change_sets.get(id)
            && self.db.elements_of(id).eq(source.db.elements_of(id))
    }

    /// An open, empty change set that no version is writing into. Such a
    /// set belongs to a working commit abandoned by a fork and may take the
    /// content the other store committed under the same id.
    fn is_unused_working_set(&self, id: &ChangeSetId) -> bool {
        let open = self
            .db
            .change_sets
            .get(id)
            .map_or(false, |set| !set.immutable_elements);
        let in_use = self.db.versions.values().any(|version| {
            self.db
                .commits
                .get(&version.working_commit_id)
                .map_or(false, |commit| commit.change_set_id == *id)
        });
        open && !in_use && self.db.elements_of(id).next().is_none()
    }

    /// Merge two heads entity by entity. Returns the merge commit and the
    /// conflicts it recorded.
    fn three_way_merge(
        &mut self,
        version: &Version,
        base: &CommitId,
        ours: &CommitId,
        theirs: &CommitId,
    ) -> Result<(CommitId, Vec<Conflict>)> {
        let at = |engine: &Engine, commit: &CommitId| -> Result<BTreeMap<EntityKey, StateRow>> {
            let mut rows = state_at_commit(&engine.db, &engine.snapshots, &version.id, commit, None)?;
            rows.retain(|key, _| key.schema_key != VERSION_SCHEMA_KEY);
            Ok(rows)
        };
        let base_rows = at(self, base)?;
        let our_rows = at(self, ours)?;
        let their_rows = at(self, theirs)?;

        let keys: BTreeSet<EntityKey> = our_rows.keys().chain(their_rows.keys()).cloned().collect();
        let mut elements = Vec::with_capacity(keys.len());
        let mut conflicts = Vec::new();

        for key in keys {
            let b = base_rows.get(&key);
            let (o, t) = (our_rows.get(&key), their_rows.get(&key));
            let id = |row: Option<&StateRow>| row.map(|r| r.change_id.clone());

            let chosen = if id(o) == id(t) || id(t) == id(b) {
                id(o)
            } else if id(o) == id(b) {
                id(t)
            } else {
                self.merge_entity(&key, b, o, t, &mut conflicts)?
            };
            elements.extend(chosen);
        }

        let (_, commit) = self.create_change_set(&elements, &[ours.clone(), theirs.clone()])?;
        let commit =
            commit.ok_or_else(|| LixError::InvalidOperation("merge commit was not created".into()))?;
        Ok((commit.id, conflicts))
    }

    /// Both sides changed `key`. Returns the change representing the result.
    fn merge_entity(
        &mut self,
        key: &EntityKey,
        base: Option<&StateRow>,
        ours: Option<&StateRow>,
        theirs: Option<&StateRow>,
        conflicts: &mut Vec<Conflict>,
    ) -> Result<Option<ChangeId>> {
        let content = |row: Option<&StateRow>| row.and_then(|r| r.snapshot_content.clone());
        let (b, o, t) = (content(base), content(ours), content(theirs));
        let Some(template) = ours.or(theirs) else {
            return Ok(None);
        };

        let outcome = match self
            .plugins
            .get(&template.plugin_key)
            .and_then(|plugin| plugin.merger().map(|m| m.merge_cell(&key.schema_key, b.as_ref(), o.as_ref(), t.as_ref())))
        {
            Some(outcome) => outcome,
            None => three_way(b.as_ref(), o.as_ref(), t.as_ref()),
        };

        let merged: Option<Value> = match outcome {
            MergeOutcome::Conflict => {
                let ours_id = ours.map(|r| r.change_id.clone());
                if let (Some(o), Some(t)) = (ours, theirs) {
                    let conflict = self.create_conflict(&o.change_id, &t.change_id)?;
                    debug!(entity = %key, conflict = %conflict.id, "merge conflict");
                    conflicts.push(conflict);
                }
                return Ok(ours_id.or_else(|| theirs.map(|r| r.change_id.clone())));
            }
            MergeOutcome::Content(value) => Some(value),
            MergeOutcome::Deleted => None,
        };

        for side in [ours, theirs].into_iter().flatten() {
            if side.snapshot_content == merged {
                return Ok(Some(side.change_id.clone()));
            }
        }

        let new = NewChange::entity(&key.entity_id, &key.schema_key, merged)
            .with_file(&key.file_id, &template.plugin_key)
            .with_schema_version(&template.schema_version);
        let change = self.insert_change(None, new)?;
        for parent in [ours, theirs].into_iter().flatten() {
            self.db.change_edges.insert(
                (parent.change_id.clone(), change.id.clone()),
                ChangeEdge {
                    parent_id: parent.change_id.clone(),
                    child_id: change.id.clone(),
                },
            );
        }
        Ok(Some(change.id))
    }
}
