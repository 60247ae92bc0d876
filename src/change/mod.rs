//! The append-only change log.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::schema::{coerce_content, validate_content, LixSchema};
use crate::types::{
    Change, ChangeId, ChangeSetElement, EntityKey, NewChange, StateRow, Version, VersionId,
};
use serde_json::Value;

impl Engine {
    /// Insert a change row. The snapshot is stored (or reused) first.
    pub(crate) fn insert_change(&mut self, id: Option<ChangeId>, new: NewChange) -> Result<Change> {
        let id = match id {
            Some(id) if self.db.changes.contains_key(&id) => {
                return Err(LixError::ChangeAlreadyExists(id));
            }
            Some(id) => id,
            None => ChangeId::from(self.uuid()),
        };

        let snapshot_id = self.snapshots.put(&mut self.db, new.snapshot_content.as_ref())?;
        let change = Change {
            id: id.clone(),
            entity_id: new.entity_id,
            schema_key: new.schema_key,
            schema_version: new.schema_version,
            file_id: new.file_id,
            plugin_key: new.plugin_key,
            snapshot_id,
            created_at: self.timestamp(),
            metadata: new.metadata,
        };
        self.db.changes.insert(id, change.clone());
        Ok(change)
    }

    /// Record a change in the active version.
    pub fn create_change(&mut self, new: NewChange) -> Result<Change> {
        let version_id = self.active_version_id()?;
        self.create_change_in(&version_id, new)
    }

    /// Record a change in a version.
    ///
    /// Schemas pinned to a version are written there regardless of
    /// `version_id`. The change joins the version's working change set and
    /// its state row is staged for the cache.
    pub fn create_change_in(&mut self, version_id: &VersionId, new: NewChange) -> Result<Change> {
        self.transaction(|engine| engine.write_change(version_id, None, new))
    }

    /// Validate a change against its schema, then append and stage it.
    ///
    /// Content is coerced and validated; a tombstone skips validation. An
    /// entity of an immutable schema that already exists cannot be written
    /// again.
    pub(crate) fn write_change(
        &mut self,
        version_id: &VersionId,
        id: Option<ChangeId>,
        mut new: NewChange,
    ) -> Result<Change> {
        if !self.cache.is_fresh() {
            self.ensure_cache_fresh()?;
        }

        let schema = self.schema_for(&new.schema_key)?;
        let target = self.write_target(version_id, &new.schema_key);
        if let Some(content) = new.snapshot_content.take() {
            let content = coerce_content(&schema, content);
            validate_content(&schema, &content)?;
            new.snapshot_content = Some(content);

            if schema.immutable {
                let key = EntityKey::new(&new.entity_id, &new.schema_key, &new.file_id);
                if self.get_entity(&target, &key)?.is_some() {
                    return Err(LixError::ImmutableSchemaViolation {
                        schema_key: schema.key,
                        entity_id: new.entity_id,
                    });
                }
            }
        }

        let version = self.version(&target)?;
        let content = new.snapshot_content.clone();
        let change = self.insert_change(id, new)?;
        self.attach_to_working(&version, &change)?;
        self.stage_state(StateRow {
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            file_id: change.file_id.clone(),
            version_id: target,
            plugin_key: change.plugin_key.clone(),
            schema_version: change.schema_version.clone(),
            snapshot_content: content,
            change_id: change.id.clone(),
            commit_id: version.working_commit_id.clone(),
            created_at: change.created_at,
            updated_at: change.created_at,
            inherited_from_version_id: None,
        });
        Ok(change)
    }

    /// Builtin and plugin schemas first, then the stored ones.
    fn schema_for(&mut self, schema_key: &str) -> Result<LixSchema> {
        if let Some(schema) = self
            .known_schemas()
            .into_iter()
            .find(|schema| schema.key == schema_key)
        {
            return Ok(schema);
        }
        self.stored_schemas()?
            .into_iter()
            .rev()
            .find(|schema| schema.key == schema_key)
            .ok_or_else(|| LixError::SchemaNotFound(schema_key.to_string()))
    }

    fn write_target(&self, version_id: &VersionId, schema_key: &str) -> VersionId {
        self.known_schemas()
            .into_iter()
            .find(|schema| schema.key == schema_key)
            .and_then(|schema| schema.pinned_version().cloned())
            .unwrap_or_else(|| version_id.clone())
    }

    /// Add a change to the version's working change set, replacing any
    /// element for the same entity.
    pub(crate) fn attach_to_working(&mut self, version: &Version, change: &Change) -> Result<()> {
        let change_set_id = self
            .db
            .commits
            .get(&version.working_commit_id)
            .map(|commit| commit.change_set_id.clone())
            .ok_or_else(|| LixError::CommitNotFound(version.working_commit_id.to_string()))?;
        self.add_element(&change_set_id, change)
    }

    /// Elements of a version's working change set.
    pub fn working_change_set(&self, version_id: &VersionId) -> Result<Vec<ChangeSetElement>> {
        let version = self.version(version_id)?;
        let commit = self
            .db
            .commits
            .get(&version.working_commit_id)
            .ok_or_else(|| LixError::CommitNotFound(version.working_commit_id.to_string()))?;
        Ok(self.db.elements_of(&commit.change_set_id).cloned().collect())
    }

    pub fn change(&self, id: &ChangeId) -> Result<Change> {
        self.db
            .changes
            .get(id)
            .cloned()
            .ok_or_else(|| LixError::ChangeNotFound(id.to_string()))
    }

    /// Snapshot content of a change. `None` for tombstones.
    pub fn change_content(&self, id: &ChangeId) -> Result<Option<Value>> {
        let change = self.change(id)?;
        self.snapshots.content(&self.db, &change.snapshot_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::Engine;
    use crate::error::LixError;
    use crate::lix::LixConfig;
    use crate::schema::{KEY_VALUE_SCHEMA_KEY, STORED_SCHEMA_KEY};
    use crate::types::{ChangeId, NewChange, VersionId};
    use serde_json::json;

    #[test]
    fn test_change_joins_working_set() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        let change = engine
            .create_change(NewChange::entity(
                "k",
                KEY_VALUE_SCHEMA_KEY,
                Some(json!({"key": "k", "value": 1})),
            ))
            .unwrap();
        let working = engine.working_change_set(&VersionId::from("main")).unwrap();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].change_id, change.id);

        let update = engine
            .create_change(NewChange::entity(
                "k",
                KEY_VALUE_SCHEMA_KEY,
                Some(json!({"key": "k", "value": 2})),
            ))
            .unwrap();
        let working = engine.working_change_set(&VersionId::from("main")).unwrap();
        assert_eq!(working.len(), 1);
        assert_eq!(working[0].change_id, update.id);
    }

    #[test]
    fn test_deletions_share_the_tombstone_snapshot() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        for key in ["a", "b", "c"] {
            engine
                .create_change(NewChange::entity(key, KEY_VALUE_SCHEMA_KEY, None))
                .unwrap();
        }
        let nulls = engine
            .database()
            .snapshots
            .values()
            .filter(|s| s.content.is_none())
            .count();
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_explicit_id_must_be_new() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        let new = || NewChange::entity("k", KEY_VALUE_SCHEMA_KEY, None);
        let first = engine
            .transaction(|e| e.insert_change(Some(ChangeId::from("fixed")), new()))
            .unwrap();
        assert_eq!(first.id, ChangeId::from("fixed"));
        let err = engine
            .transaction(|e| e.insert_change(Some(ChangeId::from("fixed")), new()))
            .unwrap_err();
        assert!(matches!(err, LixError::ChangeAlreadyExists(_)));
    }

    #[test]
    fn test_pinned_schema_writes_to_global() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        let definition = json!({
            "x-lix-key": "note",
            "x-lix-version": "1.0",
            "type": "object",
            "properties": {"id": {"type": "string"}}
        });
        engine
            .create_change(NewChange::entity(
                "note~1.0",
                STORED_SCHEMA_KEY,
                Some(json!({"key": "note", "version": "1.0", "value": definition})),
            ))
            .unwrap();
        assert!(engine.working_change_set(&VersionId::from("main")).unwrap().is_empty());
        let global = engine.working_change_set(&VersionId::from("global")).unwrap();
        assert!(global.iter().any(|e| e.schema_key == STORED_SCHEMA_KEY));
        assert!(engine.schema_registry().unwrap().contains("note"));
    }
}
