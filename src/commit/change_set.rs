//! Change sets and the commits that wrap them.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::types::{
    Change, ChangeId, ChangeSet, ChangeSetElement, ChangeSetId, Commit, CommitEdge, CommitId,
};

impl Engine {
    /// Create a change set holding `elements`.
    ///
    /// With parents, the set is sealed and wrapped in a commit linked to
    /// every parent. Two elements for the same entity keep the later one.
    pub fn create_change_set(
        &mut self,
        elements: &[ChangeId],
        parents: &[CommitId],
    ) -> Result<(ChangeSet, Option<Commit>)> {
        self.transaction(|engine| {
            let mut set = engine.new_change_set(false);
            for change_id in elements {
                let change = engine.change(change_id)?;
                engine.add_element(&set.id, &change)?;
            }

            if parents.is_empty() {
                return Ok((set, None));
            }
            engine.seal_change_set(&set.id)?;
            set.immutable_elements = true;
            let commit = engine.new_commit(&set.id, parents)?;
            Ok((set, Some(commit)))
        })
    }

    pub(crate) fn new_change_set(&mut self, immutable: bool) -> ChangeSet {
        let set = ChangeSet {
            id: ChangeSetId::from(self.uuid()),
            immutable_elements: immutable,
        };
        self.db.change_sets.insert(set.id.clone(), set.clone());
        set
    }

    /// Upsert the element for the change's entity.
    pub(crate) fn add_element(&mut self, change_set_id: &ChangeSetId, change: &Change) -> Result<()> {
        let set = self
            .db
            .change_sets
            .get(change_set_id)
            .ok_or_else(|| LixError::ChangeSetNotFound(change_set_id.to_string()))?;
        if set.immutable_elements {
            return Err(LixError::InvalidOperation(format!(
                "change set '{change_set_id}' is sealed"
            )));
        }
        let element = ChangeSetElement {
            change_set_id: change_set_id.clone(),
            change_id: change.id.clone(),
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            file_id: change.file_id.clone(),
        };
        self.db
            .change_set_elements
            .insert((change_set_id.clone(), element.key()), element);
        Ok(())
    }

    pub(crate) fn seal_change_set(&mut self, change_set_id: &ChangeSetId) -> Result<()> {
        let mut set = self
            .db
            .change_sets
            .get(change_set_id)
            .cloned()
            .ok_or_else(|| LixError::ChangeSetNotFound(change_set_id.to_string()))?;
        set.immutable_elements = true;
        self.db.change_sets.insert(change_set_id.clone(), set);
        Ok(())
    }

    /// Insert a commit for a change set with edges from every parent.
    pub(crate) fn new_commit(&mut self, change_set_id: &ChangeSetId, parents: &[CommitId]) -> Result<Commit> {
        if !self.db.change_sets.contains_key(change_set_id) {
            return Err(LixError::ChangeSetNotFound(change_set_id.to_string()));
        }
        for parent in parents {
            if !self.db.commits.contains_key(parent) {
                return Err(LixError::CommitNotFound(parent.to_string()));
            }
        }

        let commit = Commit {
            id: CommitId::from(self.uuid()),
            change_set_id: change_set_id.clone(),
            created_at: self.timestamp(),
        };
        self.db.commits.insert(commit.id.clone(), commit.clone());
        for parent in parents {
            self.db.commit_edges.insert(
                (parent.clone(), commit.id.clone()),
                CommitEdge {
                    parent_id: parent.clone(),
                    child_id: commit.id.clone(),
                },
            );
        }
        Ok(commit)
    }

    pub fn commit(&self, commit_id: &CommitId) -> Result<Commit> {
        self.db
            .commits
            .get(commit_id)
            .cloned()
            .ok_or_else(|| LixError::CommitNotFound(commit_id.to_string()))
    }

    pub fn change_set_elements(&self, change_set_id: &ChangeSetId) -> Result<Vec<ChangeSetElement>> {
        if !self.db.change_sets.contains_key(change_set_id) {
            return Err(LixError::ChangeSetNotFound(change_set_id.to_string()));
        }
        Ok(self.db.elements_of(change_set_id).cloned().collect())
    }
}
