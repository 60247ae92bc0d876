//! Materialized entity state.
//!
//! The materializer derives every version's state from the change log; the
//! cache memoizes its output and is kept current by write batches. Reads go
//! through the cache, rebuilding it first when a graph rewrite (checkpoint,
//! transition, merge) left it stale.

mod cache;
mod materializer;

pub use cache::{CacheEntry, StateCache};
pub use materializer::{
    history_of, materialize, resolve_inheritance, state_at_commit, MaterializationWarning,
    Materialized, StageStat,
};

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::schema::{LixSchema, GLOBAL_VERSION_ID, STORED_SCHEMA_KEY};
use crate::types::{Change, CommitId, EntityKey, StateRow, VersionId};
use crate::version::VersionTree;
use serde_json::Value;
use tracing::warn;

/// One reachable change of an entity, with its distance from the tip.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub depth: usize,
    pub commit_id: CommitId,
    pub change: Change,
    pub snapshot_content: Option<Value>,
}

impl Engine {
    /// Live rows of the active version.
    pub fn state(&mut self) -> Result<Vec<StateRow>> {
        let version_id = self.active_version_id()?;
        self.state_of(&version_id, None)
    }

    /// Live rows of a version, optionally restricted to one schema.
    pub fn state_of(&mut self, version_id: &VersionId, schema_key: Option<&str>) -> Result<Vec<StateRow>> {
        Ok(self
            .state_with_tombstones(version_id, schema_key)?
            .into_iter()
            .filter(|row| !row.is_tombstone())
            .collect())
    }

    /// Resolved rows of a version including tombstones.
    pub fn state_with_tombstones(
        &mut self,
        version_id: &VersionId,
        schema_key: Option<&str>,
    ) -> Result<Vec<StateRow>> {
        self.ensure_cache_fresh()?;
        let tree = VersionTree::from_db(&self.db);
        if !tree.contains(version_id) {
            return Err(LixError::VersionNotFound(version_id.to_string()));
        }
        Ok(self
            .cache
            .visible_entries(&tree, version_id, schema_key)
            .into_iter()
            .map(|entry| entry.row)
            .collect())
    }

    /// Live rows of every version.
    pub fn state_all(&mut self, schema_key: Option<&str>) -> Result<Vec<StateRow>> {
        let version_ids: Vec<VersionId> = self.db.versions.keys().cloned().collect();
        let mut rows = Vec::new();
        for version_id in version_ids {
            rows.extend(self.state_of(&version_id, schema_key)?);
        }
        Ok(rows)
    }

    /// Current row of one entity in a version. Tombstoned entities are `None`.
    pub fn get_entity(&mut self, version_id: &VersionId, key: &EntityKey) -> Result<Option<StateRow>> {
        self.ensure_cache_fresh()?;
        let tree = VersionTree::from_db(&self.db);
        let Some((entry, depth, ancestor)) = self.cache.visible_entry(&tree, version_id, key) else {
            return Ok(None);
        };
        if entry.row.is_tombstone() {
            return Ok(None);
        }
        let mut row = entry.row.clone();
        if depth > 0 {
            row.version_id = version_id.clone();
            row.inherited_from_version_id = Some(ancestor);
        }
        Ok(Some(row))
    }

    /// Live state reachable from a commit, ignoring inheritance.
    pub fn state_at_commit(&mut self, commit_id: &CommitId) -> Result<Vec<StateRow>> {
        if !self.db.commits.contains_key(commit_id) {
            return Err(LixError::CommitNotFound(commit_id.to_string()));
        }
        let version_id = self.active_version_id()?;
        let rows = state_at_commit(&self.db, &self.snapshots, &version_id, commit_id, None)?;
        Ok(rows.into_values().filter(|row| !row.is_tombstone()).collect())
    }

    /// Every change to `key` reachable from the active version's working
    /// commit, shallowest first.
    pub fn state_history(&mut self, key: &EntityKey) -> Result<Vec<HistoryEntry>> {
        let version = self.active_version()?;
        history_of(&self.db, &version.working_commit_id, key)
            .into_iter()
            .map(|(depth, commit_id, change)| {
                let snapshot_content = self.snapshots.content(&self.db, &change.snapshot_id)?;
                Ok(HistoryEntry {
                    depth,
                    commit_id,
                    change,
                    snapshot_content,
                })
            })
            .collect()
    }

    /// Schemas declared through `lix_stored_schema` rows.
    pub(crate) fn stored_schemas(&mut self) -> Result<Vec<LixSchema>> {
        let rows = self.state_of(&VersionId::from(GLOBAL_VERSION_ID), Some(STORED_SCHEMA_KEY))?;
        let mut schemas = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(definition) = row.snapshot_content.as_ref().and_then(|c| c.get("value")) else {
                continue;
            };
            match LixSchema::from_definition(definition.clone()) {
                Ok(schema) => schemas.push(schema),
                Err(e) => warn!(entity = %row.entity_id, error = %e, "skipping invalid stored schema"),
            }
        }
        Ok(schemas)
    }

    /// Full materialization straight from the change log, bypassing the cache.
    pub fn materialize(&self) -> Result<Materialized> {
        materialize(&self.db, &self.snapshots)
    }
}
