//! Conflicts between changes and their resolution.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::types::{Change, ChangeEdge, ChangeId, Conflict, ConflictId, NewChange};
use tracing::info;

impl Engine {
    pub(crate) fn create_conflict(
        &mut self,
        change_id: &ChangeId,
        conflicting_change_id: &ChangeId,
    ) -> Result<Conflict> {
        let conflict = Conflict {
            id: ConflictId::from(self.uuid()),
            change_id: change_id.clone(),
            conflicting_change_id: conflicting_change_id.clone(),
            resolved_by: None,
        };
        self.db.conflicts.insert(conflict.id.clone(), conflict.clone());
        Ok(conflict)
    }

    pub fn conflict(&self, conflict_id: &ConflictId) -> Result<Conflict> {
        self.db
            .conflicts
            .get(conflict_id)
            .cloned()
            .ok_or_else(|| LixError::ConflictNotFound(conflict_id.to_string()))
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.db.conflicts.values().cloned().collect()
    }

    pub fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.db
            .conflicts
            .values()
            .filter(|conflict| conflict.resolved_by.is_none())
            .cloned()
            .collect()
    }

    /// Resolve a conflict with a new change that is a direct child of the
    /// conflicting pair.
    ///
    /// `parent_ids` must be non-empty and drawn from the two conflicting
    /// changes; the new change must target the conflict's file. The change
    /// is recorded in the active version like any other write.
    pub fn resolve_conflict_with_new_change(
        &mut self,
        conflict_id: &ConflictId,
        id: Option<ChangeId>,
        new: NewChange,
        parent_ids: &[ChangeId],
    ) -> Result<Change> {
        self.transaction(|engine| {
            let mut conflict = engine.conflict(conflict_id)?;

            let id = match id {
                Some(id) if engine.db.changes.contains_key(&id) => {
                    return Err(LixError::ChangeAlreadyExists(id));
                }
                Some(id) => id,
                None => ChangeId::from(engine.uuid()),
            };

            let pair = [&conflict.change_id, &conflict.conflicting_change_id];
            if parent_ids.is_empty() || parent_ids.iter().any(|parent| !pair.contains(&parent)) {
                return Err(LixError::ChangeNotDirectChildOfConflict {
                    change_id: id,
                    left: conflict.change_id.clone(),
                    right: conflict.conflicting_change_id.clone(),
                });
            }

            let expected = engine.change(&conflict.change_id)?.file_id;
            if new.file_id != expected {
                return Err(LixError::ChangeDoesNotBelongToFile {
                    change_id: id,
                    expected,
                    got: new.file_id,
                });
            }

            let version_id = engine.active_version_id()?;
            let change = engine.write_change(&version_id, Some(id), new)?;
            for parent in parent_ids {
                engine.db.change_edges.insert(
                    (parent.clone(), change.id.clone()),
                    ChangeEdge {
                        parent_id: parent.clone(),
                        child_id: change.id.clone(),
                    },
                );
            }
            conflict.resolved_by = Some(change.id.clone());
            engine.db.conflicts.insert(conflict.id.clone(), conflict);

            info!(conflict = %conflict_id, change = %change.id, "resolved conflict");
            Ok(change)
        })
    }

    /// Direct parents of a change in the change graph.
    pub fn change_parents(&self, change_id: &ChangeId) -> Vec<ChangeId> {
        self.db
            .change_edges
            .values()
            .filter(|edge| edge.child_id == *change_id)
            .map(|edge| edge.parent_id.clone())
            .collect()
    }
}
