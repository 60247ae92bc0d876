//! Checkpoints and labels.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::storage::COMMIT_SCHEMA_KEY;
use crate::types::{Commit, CommitId, EntityKey, EntityLabel, Label, LabelId, LIX_FILE_ID};
use tracing::info;

/// Reserved label marking durable history points.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

fn commit_entity(commit_id: &CommitId) -> EntityKey {
    EntityKey::new(commit_id.as_str(), COMMIT_SCHEMA_KEY, LIX_FILE_ID)
}

impl Engine {
    /// Promote the active version's working commit to a checkpoint.
    ///
    /// The working commit is labeled, its change set sealed, and a fresh
    /// empty working commit is started as its child. Returns the
    /// checkpoint commit.
    pub fn create_checkpoint(&mut self) -> Result<Commit> {
        self.transaction(|engine| {
            let mut version = engine.active_version()?;
            let checkpoint = engine.commit(&version.working_commit_id)?;

            engine.label_commit_as_checkpoint(&checkpoint.id)?;
            engine.seal_change_set(&checkpoint.change_set_id)?;

            let working_set = engine.new_change_set(false);
            let working = engine.new_commit(&working_set.id, std::slice::from_ref(&checkpoint.id))?;
            version.commit_id = checkpoint.id.clone();
            version.working_commit_id = working.id;
            engine.write_version(&version)?;

            info!(version = %version.id, commit = %checkpoint.id, "created checkpoint");
            Ok(checkpoint)
        })
    }

    pub(crate) fn label_commit_as_checkpoint(&mut self, commit_id: &CommitId) -> Result<()> {
        let label = self.create_label_internal(CHECKPOINT_LABEL)?;
        self.attach_label(commit_entity(commit_id), label.id);
        Ok(())
    }

    pub fn is_checkpoint(&self, commit_id: &CommitId) -> bool {
        self.label_by_name(CHECKPOINT_LABEL).map_or(false, |label| {
            self.db
                .entity_labels
                .contains_key(&(commit_entity(commit_id), label.id))
        })
    }

    /// Checkpoints reachable from the active version, nearest first.
    pub fn checkpoints(&self) -> Result<Vec<Commit>> {
        let version = self.active_version()?;
        let mut reachable: Vec<(usize, CommitId)> =
            crate::commit::ancestors_within(&self.db, &version.working_commit_id, None, true)
                .into_iter()
                .filter(|(id, _)| self.is_checkpoint(id))
                .map(|(id, depth)| (depth, id))
                .collect();
        reachable.sort();
        reachable
            .into_iter()
            .map(|(_, id)| self.commit(&id))
            .collect()
    }

    // --- Labels ---

    /// Label by name, created if missing.
    pub(crate) fn create_label_internal(&mut self, name: &str) -> Result<Label> {
        if let Some(existing) = self.label_by_name(name) {
            return Ok(existing);
        }
        let label = Label {
            id: LabelId::from(self.uuid()),
            name: name.to_string(),
        };
        self.db.labels.insert(label.id.clone(), label.clone());
        Ok(label)
    }

    pub fn create_label(&mut self, name: &str) -> Result<Label> {
        if name.trim().is_empty() {
            return Err(LixError::InvalidOperation("label name must not be empty".into()));
        }
        self.transaction(|engine| engine.create_label_internal(name))
    }

    pub fn label_by_name(&self, name: &str) -> Option<Label> {
        self.db.labels.values().find(|label| label.name == name).cloned()
    }

    pub fn list_labels(&self) -> Vec<Label> {
        self.db.labels.values().cloned().collect()
    }

    /// Attach a label to an entity. Both must exist when the transaction ends.
    pub fn add_label(&mut self, entity: &EntityKey, label_id: &LabelId) -> Result<()> {
        self.transaction(|engine| {
            engine.attach_label(entity.clone(), label_id.clone());
            Ok(())
        })
    }

    pub fn remove_label(&mut self, entity: &EntityKey, label_id: &LabelId) -> Result<()> {
        self.transaction(|engine| {
            engine
                .db
                .entity_labels
                .remove(&(entity.clone(), label_id.clone()))
                .map(|_| ())
                .ok_or_else(|| LixError::LabelNotFound(label_id.to_string()))
        })
    }

    pub fn labels_of(&self, entity: &EntityKey) -> Vec<Label> {
        self.db
            .entity_labels
            .values()
            .filter(|link| link.entity == *entity)
            .filter_map(|link| self.db.labels.get(&link.label_id).cloned())
            .collect()
    }

    fn attach_label(&mut self, entity: EntityKey, label_id: LabelId) {
        self.db.entity_labels.insert(
            (entity.clone(), label_id.clone()),
            EntityLabel { entity, label_id },
        );
    }
}
