//! Entity-level diffs between a version's checkpoint and its working set,
//! and between two versions.
//!
//! Diff rows carry change and commit ids only. Snapshot contents are
//! loaded on demand through [`Engine::diff_content`].

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::state::state_at_commit;
use crate::types::{ChangeId, CommitId, EntityKey, StateRow, VersionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Created,
    Updated,
    Deleted,
    Unchanged,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiffRow {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub before_change_id: Option<ChangeId>,
    pub after_change_id: Option<ChangeId>,
    pub before_commit_id: Option<CommitId>,
    pub after_commit_id: Option<CommitId>,
    pub status: DiffStatus,
}

impl DiffRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// A diff row with both snapshot contents loaded.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffDetail {
    pub row: DiffRow,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Classify one entity. `None` when there is nothing to report: a
/// tombstone for an entity that did not exist before.
fn classify(before: Option<&StateRow>, after: Option<&StateRow>) -> Option<DiffStatus> {
    let before = before.filter(|row| !row.is_tombstone());
    match (before, after) {
        (None, None) => None,
        (Some(_), None) => Some(DiffStatus::Unchanged),
        (None, Some(after)) if after.is_tombstone() => None,
        (None, Some(_)) => Some(DiffStatus::Created),
        (Some(_), Some(after)) if after.is_tombstone() => Some(DiffStatus::Deleted),
        (Some(before), Some(after)) if before.change_id == after.change_id => {
            Some(DiffStatus::Unchanged)
        }
        (Some(_), Some(_)) => Some(DiffStatus::Updated),
    }
}

fn diff_row(key: &EntityKey, before: Option<&StateRow>, after: Option<&StateRow>, status: DiffStatus) -> DiffRow {
    let before = before.filter(|row| !row.is_tombstone());
    // Entities missing on the after side are reported with the before ids.
    let after = after.or(before);
    DiffRow {
        entity_id: key.entity_id.clone(),
        schema_key: key.schema_key.clone(),
        file_id: key.file_id.clone(),
        before_change_id: before.map(|row| row.change_id.clone()),
        after_change_id: after.map(|row| row.change_id.clone()),
        before_commit_id: before.map(|row| row.commit_id.clone()),
        after_commit_id: after.map(|row| row.commit_id.clone()),
        status,
    }
}

impl Engine {
    /// Uncommitted changes of a version against its last checkpoint.
    ///
    /// Only the two change-set endpoints are compared: working elements
    /// are looked up at the version's commit, everything else the version
    /// owns is reported `unchanged`. Defaults to the active version.
    pub fn working_diff(&mut self, version_id: Option<&VersionId>) -> Result<Vec<DiffRow>> {
        let version = match version_id {
            Some(id) => self.version(id)?,
            None => self.active_version()?,
        };
        let elements = self.working_change_set(&version.id)?;
        let keys: BTreeSet<EntityKey> = elements.iter().map(|element| element.key()).collect();
        let before = state_at_commit(
            &self.db,
            &self.snapshots,
            &version.id,
            &version.commit_id,
            Some(&keys),
        )?;

        let mut rows = BTreeMap::new();
        for element in &elements {
            let change = self.change(&element.change_id)?;
            let content = self.snapshots.content(&self.db, &change.snapshot_id)?;
            let after = StateRow {
                entity_id: change.entity_id.clone(),
                schema_key: change.schema_key.clone(),
                file_id: change.file_id.clone(),
                version_id: version.id.clone(),
                plugin_key: change.plugin_key.clone(),
                schema_version: change.schema_version.clone(),
                snapshot_content: content,
                change_id: change.id.clone(),
                commit_id: version.working_commit_id.clone(),
                created_at: change.created_at,
                updated_at: change.created_at,
                inherited_from_version_id: None,
            };
            let key = element.key();
            let prior = before.get(&key);
            if let Some(status) = classify(prior, Some(&after)) {
                rows.insert(key.clone(), diff_row(&key, prior, Some(&after), status));
            }
        }

        self.ensure_cache_fresh()?;
        for entry in self.cache.own_entries(&version.id) {
            let key = entry.row.key();
            if entry.row.is_tombstone() || keys.contains(&key) {
                continue;
            }
            let row = Some(&entry.row);
            rows.insert(key.clone(), diff_row(&key, row, row, DiffStatus::Unchanged));
        }

        debug!(version = %version.id, working = elements.len(), rows = rows.len(), "working diff");
        Ok(rows.into_values().collect())
    }

    /// Full visible state of `target` against `base`.
    ///
    /// Entities only `base` has are `unchanged`.
    pub fn version_diff(&mut self, base: &VersionId, target: &VersionId) -> Result<Vec<DiffRow>> {
        let index = |rows: Vec<StateRow>| -> BTreeMap<EntityKey, StateRow> {
            rows.into_iter().map(|row| (row.key(), row)).collect()
        };
        let before = index(self.state_with_tombstones(base, None)?);
        let after = index(self.state_with_tombstones(target, None)?);

        let keys: BTreeSet<&EntityKey> = before.keys().chain(after.keys()).collect();
        let rows: Vec<DiffRow> = keys
            .into_iter()
            .filter_map(|key| {
                let (b, a) = (before.get(key), after.get(key));
                classify(b, a).map(|status| diff_row(key, b, a, status))
            })
            .collect();
        debug!(base = %base, target = %target, rows = rows.len(), "version diff");
        Ok(rows)
    }

    /// Load before/after contents for diff rows.
    pub fn diff_content(&self, rows: &[DiffRow]) -> Result<Vec<DiffDetail>> {
        let load = |id: &Option<ChangeId>| -> Result<Option<Value>> {
            match id {
                Some(id) => self.change_content(id),
                None => Ok(None),
            }
        };
        rows.iter()
            .map(|row| {
                let before = load(&row.before_change_id)?;
                let after = match row.status {
                    DiffStatus::Deleted => None,
                    _ => load(&row.after_change_id)?,
                };
                Ok(DiffDetail {
                    row: row.clone(),
                    before,
                    after,
                })
            })
            .collect()
    }

    /// Render the rows of one file through its plugin's differ.
    ///
    /// `None` when the file's plugin has no differ.
    pub fn render_diff(&self, file_id: &str, rows: &[DiffRow]) -> Result<Option<String>> {
        let rows: Vec<DiffRow> = rows.iter().filter(|row| row.file_id == file_id).cloned().collect();
        let Some(change_id) = rows
            .iter()
            .find_map(|row| row.after_change_id.as_ref().or(row.before_change_id.as_ref()))
        else {
            return Ok(None);
        };
        let plugin_key = self.change(change_id)?.plugin_key;
        let plugin = self
            .plugins
            .get(&plugin_key)
            .ok_or_else(|| LixError::Plugin(format!("plugin '{plugin_key}' is not registered")))?;
        let Some(differ) = plugin.differ() else {
            return Ok(None);
        };
        let details = self.diff_content(&rows)?;
        Ok(Some(differ.render_diff(&details)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lix::LixConfig;
    use crate::schema::KEY_VALUE_SCHEMA_KEY;
    use crate::types::NewChange;
    use crate::version::CreateVersion;
    use serde_json::json;

    fn kv(key: &str, value: Option<Value>) -> NewChange {
        NewChange::entity(key, KEY_VALUE_SCHEMA_KEY, value.map(|v| json!({"key": key, "value": v})))
    }

    fn status_of(rows: &[DiffRow], entity: &str) -> Option<DiffStatus> {
        rows.iter()
            .find(|row| row.entity_id == entity && row.schema_key == KEY_VALUE_SCHEMA_KEY)
            .map(|row| row.status)
    }

    #[test]
    fn test_working_diff_classifies_each_entity() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        engine.create_change(kv("kept", Some(json!(1)))).unwrap();
        engine.create_change(kv("edited", Some(json!(1)))).unwrap();
        engine.create_change(kv("removed", Some(json!(1)))).unwrap();
        engine.create_checkpoint().unwrap();

        engine.create_change(kv("edited", Some(json!(2)))).unwrap();
        engine.create_change(kv("removed", None)).unwrap();
        engine.create_change(kv("added", Some(json!(3)))).unwrap();
        engine.create_change(kv("ghost", None)).unwrap();

        let rows = engine.working_diff(None).unwrap();
        assert_eq!(status_of(&rows, "kept"), Some(DiffStatus::Unchanged));
        assert_eq!(status_of(&rows, "edited"), Some(DiffStatus::Updated));
        assert_eq!(status_of(&rows, "removed"), Some(DiffStatus::Deleted));
        assert_eq!(status_of(&rows, "added"), Some(DiffStatus::Created));
        assert_eq!(status_of(&rows, "ghost"), None);

        let kept = rows.iter().find(|row| row.entity_id == "kept").unwrap();
        assert_eq!(kept.before_change_id, kept.after_change_id);

        let details = engine.diff_content(&rows).unwrap();
        let edited = details.iter().find(|d| d.row.entity_id == "edited").unwrap();
        assert_eq!(edited.before.as_ref().unwrap()["value"], json!(1));
        assert_eq!(edited.after.as_ref().unwrap()["value"], json!(2));
    }

    #[test]
    fn test_working_diff_after_checkpoint_is_unchanged() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        engine.create_change(kv("a", Some(json!(1)))).unwrap();
        engine.create_checkpoint().unwrap();
        let rows = engine.working_diff(None).unwrap();
        assert!(rows
            .iter()
            .filter(|row| row.schema_key == KEY_VALUE_SCHEMA_KEY)
            .all(|row| row.status == DiffStatus::Unchanged));
    }

    #[test]
    fn test_version_diff() {
        let mut engine = Engine::in_memory(&LixConfig::default()).unwrap();
        engine.create_change(kv("shared", Some(json!(1)))).unwrap();
        engine.create_change(kv("only_base", Some(json!(1)))).unwrap();
        engine.create_checkpoint().unwrap();

        let feature = engine.create_version(CreateVersion::new("feature")).unwrap();
        engine.switch_version(&feature.id).unwrap();
        engine.create_change(kv("shared", Some(json!(2)))).unwrap();
        engine.create_change(kv("new", Some(json!(1)))).unwrap();
        engine.create_change(kv("only_base", None)).unwrap();

        let main = VersionId::from("main");
        let rows = engine.version_diff(&main, &feature.id).unwrap();
        assert_eq!(status_of(&rows, "shared"), Some(DiffStatus::Updated));
        assert_eq!(status_of(&rows, "new"), Some(DiffStatus::Created));
        assert_eq!(status_of(&rows, "only_base"), Some(DiffStatus::Deleted));

        let reverse = engine.version_diff(&feature.id, &main).unwrap();
        assert_eq!(status_of(&reverse, "new"), Some(DiffStatus::Unchanged));
    }
}
