//! The persistent tables and their transaction boundary.

use crate::error::{LixError, Result};
use crate::storage::table::Table;
use crate::types::{
    Change, ChangeEdge, ChangeId, ChangeSet, ChangeSetElement, ChangeSetId, Commit, CommitEdge,
    CommitId, Conflict, ConflictId, EntityKey, EntityLabel, Label, LabelId, Snapshot, SnapshotId,
    Version, VersionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema keys whose entities live in dedicated tables rather than the change log.
pub const COMMIT_SCHEMA_KEY: &str = "lix_commit";
pub const CHANGE_SET_SCHEMA_KEY: &str = "lix_change_set";
pub const CHANGE_SCHEMA_KEY: &str = "lix_change";

/// All persistent nouns of a store.
///
/// Everything else (materialized state, the state cache) is derived from
/// these tables and can be rebuilt.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Database {
    pub(crate) snapshots: Table<SnapshotId, Snapshot>,
    pub(crate) changes: Table<ChangeId, Change>,
    pub(crate) change_sets: Table<ChangeSetId, ChangeSet>,
    pub(crate) change_set_elements: Table<(ChangeSetId, EntityKey), ChangeSetElement>,
    pub(crate) commits: Table<CommitId, Commit>,
    pub(crate) commit_edges: Table<(CommitId, CommitId), CommitEdge>,
    pub(crate) change_edges: Table<(ChangeId, ChangeId), ChangeEdge>,
    pub(crate) versions: Table<VersionId, Version>,
    pub(crate) labels: Table<LabelId, Label>,
    pub(crate) entity_labels: Table<(EntityKey, LabelId), EntityLabel>,
    pub(crate) conflicts: Table<ConflictId, Conflict>,
    /// Untracked key-values (active version, deterministic state, store id).
    pub(crate) key_value: Table<String, Value>,
}

macro_rules! for_each_table {
    ($db:expr, $method:ident) => {{
        $db.snapshots.$method();
        $db.changes.$method();
        $db.change_sets.$method();
        $db.change_set_elements.$method();
        $db.commits.$method();
        $db.commit_edges.$method();
        $db.change_edges.$method();
        $db.versions.$method();
        $db.labels.$method();
        $db.entity_labels.$method();
        $db.conflicts.$method();
        $db.key_value.$method();
    }};
}

fn violation(
    table: &'static str,
    column: &'static str,
    target: &'static str,
    key: impl ToString,
) -> LixError {
    LixError::ForeignKeyViolation {
        table,
        column,
        target,
        key: key.to_string(),
    }
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_open(&self) -> bool {
        self.changes.in_transaction()
    }

    pub fn begin(&mut self) {
        for_each_table!(self, begin);
    }

    pub fn commit(&mut self) {
        for_each_table!(self, commit);
    }

    pub fn rollback(&mut self) {
        for_each_table!(self, rollback);
    }

    /// Check the references of every row written in the open transaction.
    ///
    /// Runs at transaction end, so insertion order inside a transaction
    /// never matters.
    pub fn validate_deferred(&self) -> Result<()> {
        for id in self.changes.touched_keys() {
            if let Some(change) = self.changes.get(&id) {
                if !self.snapshots.contains_key(&change.snapshot_id) {
                    return Err(violation("change", "snapshot_id", "snapshot", &change.snapshot_id));
                }
            }
        }

        for key in self.change_set_elements.touched_keys() {
            if let Some(element) = self.change_set_elements.get(&key) {
                if !self.change_sets.contains_key(&element.change_set_id) {
                    return Err(violation(
                        "change_set_element",
                        "change_set_id",
                        "change_set",
                        &element.change_set_id,
                    ));
                }
                if !self.changes.contains_key(&element.change_id) {
                    return Err(violation(
                        "change_set_element",
                        "change_id",
                        "change",
                        &element.change_id,
                    ));
                }
            }
        }

        for id in self.commits.touched_keys() {
            if let Some(commit) = self.commits.get(&id) {
                if !self.change_sets.contains_key(&commit.change_set_id) {
                    return Err(violation(
                        "commit",
                        "change_set_id",
                        "change_set",
                        &commit.change_set_id,
                    ));
                }
            }
        }

        for (parent, child) in self.commit_edges.touched_keys() {
            if !self.commits.contains_key(&parent) {
                return Err(violation("commit_edge", "parent_id", "commit", parent));
            }
            if !self.commits.contains_key(&child) {
                return Err(violation("commit_edge", "child_id", "commit", child));
            }
        }

        for (parent, child) in self.change_edges.touched_keys() {
            if !self.changes.contains_key(&parent) {
                return Err(violation("change_edge", "parent_id", "change", parent));
            }
            if !self.changes.contains_key(&child) {
                return Err(violation("change_edge", "child_id", "change", child));
            }
        }

        for id in self.versions.touched_keys() {
            if let Some(version) = self.versions.get(&id) {
                if !self.commits.contains_key(&version.commit_id) {
                    return Err(violation("version", "commit_id", "commit", &version.commit_id));
                }
                if !self.commits.contains_key(&version.working_commit_id) {
                    return Err(violation(
                        "version",
                        "working_commit_id",
                        "commit",
                        &version.working_commit_id,
                    ));
                }
                if let Some(parent) = &version.inherits_from_version_id {
                    if !self.versions.contains_key(parent) {
                        return Err(violation(
                            "version",
                            "inherits_from_version_id",
                            "version",
                            parent,
                        ));
                    }
                }
            }
        }

        for key in self.entity_labels.touched_keys() {
            let (entity, label_id) = &key;
            if !self.labels.contains_key(label_id) {
                return Err(violation("entity_label", "label_id", "label", label_id));
            }
            if !self.entity_exists(entity) {
                return Err(violation("entity_label", "entity_id", "entity", entity));
            }
        }

        for id in self.conflicts.touched_keys() {
            if let Some(conflict) = self.conflicts.get(&id) {
                for change_id in [&conflict.change_id, &conflict.conflicting_change_id] {
                    if !self.changes.contains_key(change_id) {
                        return Err(violation("conflict", "change_id", "change", change_id));
                    }
                }
            }
        }

        Ok(())
    }

    /// Whether any table or change references the entity.
    pub fn entity_exists(&self, entity: &EntityKey) -> bool {
        match entity.schema_key.as_str() {
            COMMIT_SCHEMA_KEY => self
                .commits
                .contains_key(&CommitId::new(entity.entity_id.clone())),
            CHANGE_SET_SCHEMA_KEY => self
                .change_sets
                .contains_key(&ChangeSetId::new(entity.entity_id.clone())),
            CHANGE_SCHEMA_KEY => self
                .changes
                .contains_key(&ChangeId::new(entity.entity_id.clone())),
            _ => self.changes.values().any(|change| {
                change.entity_id == entity.entity_id
                    && change.schema_key == entity.schema_key
                    && change.file_id == entity.file_id
            }),
        }
    }

    /// Elements of one change set, ordered by entity key.
    pub fn elements_of<'a>(
        &'a self,
        change_set_id: &ChangeSetId,
    ) -> impl Iterator<Item = &'a ChangeSetElement> + 'a {
        let start = (change_set_id.clone(), EntityKey::default());
        let id = change_set_id.clone();
        self.change_set_elements
            .range(start..)
            .take_while(move |((set_id, _), _)| *set_id == id)
            .map(|(_, element)| element)
    }

    /// Parent commit ids of a commit.
    pub fn parents_of(&self, commit_id: &CommitId) -> Vec<CommitId> {
        self.commit_edges
            .values()
            .filter(|edge| edge.child_id == *commit_id)
            .map(|edge| edge.parent_id.clone())
            .collect()
    }

    /// Child commit ids of a commit.
    pub fn children_of(&self, commit_id: &CommitId) -> Vec<CommitId> {
        let start = (commit_id.clone(), CommitId::default());
        let id = commit_id.clone();
        self.commit_edges
            .range(start..)
            .take_while(move |((parent, _), _)| *parent == id)
            .map(|((_, child), _)| child.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn change(id: &str, snapshot: &str) -> Change {
        Change {
            id: ChangeId::from(id),
            entity_id: "e".into(),
            schema_key: "s".into(),
            schema_version: "1.0".into(),
            file_id: "f".into(),
            plugin_key: "p".into(),
            snapshot_id: SnapshotId::from(snapshot),
            created_at: Timestamp(0),
            metadata: None,
        }
    }

    #[test]
    fn test_deferred_check_ignores_insertion_order() {
        let mut db = Database::new();
        db.begin();
        // Change first, its snapshot afterwards.
        db.changes.insert(ChangeId::from("c1"), change("c1", "snap"));
        db.snapshots.insert(
            SnapshotId::from("snap"),
            Snapshot {
                id: SnapshotId::from("snap"),
                content: Some("{}".into()),
            },
        );
        assert!(db.validate_deferred().is_ok());
        db.commit();
    }

    #[test]
    fn test_missing_snapshot_is_violation() {
        let mut db = Database::new();
        db.begin();
        db.changes.insert(ChangeId::from("c1"), change("c1", "missing"));
        let err = db.validate_deferred().unwrap_err();
        assert!(matches!(err, LixError::ForeignKeyViolation { table: "change", .. }));
        db.rollback();
        assert!(db.changes.is_empty());
    }

    #[test]
    fn test_entity_label_requires_label_and_entity() {
        let mut db = Database::new();
        db.begin();
        let entity = EntityKey::new("nope", COMMIT_SCHEMA_KEY, "lix");
        db.labels.insert(
            LabelId::from("l1"),
            Label {
                id: LabelId::from("l1"),
                name: "checkpoint".into(),
            },
        );
        db.entity_labels.insert(
            (entity.clone(), LabelId::from("l1")),
            EntityLabel {
                entity,
                label_id: LabelId::from("l1"),
            },
        );
        let err = db.validate_deferred().unwrap_err();
        assert!(matches!(
            err,
            LixError::ForeignKeyViolation {
                table: "entity_label",
                column: "entity_id",
                ..
            }
        ));
    }

    #[test]
    fn test_elements_of_is_scoped_to_set() {
        let mut db = Database::new();
        for (set, entity) in [("a", "1"), ("a", "2"), ("b", "1")] {
            let element = ChangeSetElement {
                change_set_id: ChangeSetId::from(set),
                change_id: ChangeId::from(format!("{set}{entity}")),
                entity_id: entity.into(),
                schema_key: "s".into(),
                file_id: "f".into(),
            };
            db.change_set_elements
                .insert((element.change_set_id.clone(), element.key()), element);
        }
        assert_eq!(db.elements_of(&ChangeSetId::from("a")).count(), 2);
        assert_eq!(db.elements_of(&ChangeSetId::from("b")).count(), 1);
        assert_eq!(db.elements_of(&ChangeSetId::from("c")).count(), 0);
    }
}
