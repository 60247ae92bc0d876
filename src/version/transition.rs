//! Moving a version to another commit through a merge commit.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::schema::VERSION_SCHEMA_KEY;
use crate::state::state_at_commit;
use crate::types::{Commit, CommitId, NewChange};
use tracing::info;

impl Engine {
    /// Move the active version to the state of `to`.
    ///
    /// Records a merge commit whose parents are the version's current commit
    /// and `to`. Its change set restores every entity reachable from `to`
    /// and tombstones entities that exist now but not at `to`. Uncommitted
    /// working changes are discarded. If the version already sits at `to`
    /// with an empty working set, nothing is written and `to` is returned.
    pub fn transition(&mut self, to: &CommitId) -> Result<Commit> {
        self.transaction(|engine| {
            let target = engine
                .db
                .commits
                .get(to)
                .cloned()
                .ok_or_else(|| LixError::CommitNotFound(to.to_string()))?;
            let mut version = engine.active_version()?;

            let working_set = engine
                .db
                .commits
                .get(&version.working_commit_id)
                .map(|commit| commit.change_set_id.clone())
                .ok_or_else(|| LixError::CommitNotFound(version.working_commit_id.to_string()))?;
            let working_is_empty = engine.db.elements_of(&working_set).next().is_none();
            if version.commit_id == *to && working_is_empty {
                return Ok(target);
            }

            let target_state = state_at_commit(&engine.db, &engine.snapshots, &version.id, to, None)?;
            let current_state = state_at_commit(
                &engine.db,
                &engine.snapshots,
                &version.id,
                &version.working_commit_id,
                None,
            )?;

            let mut restored = Vec::new();
            for row in target_state.values() {
                if row.schema_key != VERSION_SCHEMA_KEY {
                    restored.push(row.change_id.clone());
                }
            }
            let mut removed = 0usize;
            for (key, row) in &current_state {
                if row.schema_key == VERSION_SCHEMA_KEY
                    || row.is_tombstone()
                    || target_state.contains_key(key)
                {
                    continue;
                }
                let tombstone = NewChange::entity(&row.entity_id, &row.schema_key, None)
                    .with_file(&row.file_id, &row.plugin_key)
                    .with_schema_version(&row.schema_version);
                let change = engine.insert_change(None, tombstone)?;
                restored.push(change.id);
                removed += 1;
            }

            let mut parents = vec![version.commit_id.clone()];
            if version.commit_id != *to {
                parents.push(to.clone());
            }
            let (_, merge) = engine.create_change_set(&restored, &parents)?;
            let merge = merge.ok_or_else(|| {
                LixError::InvalidOperation("transition commit was not created".into())
            })?;

            let working_set = engine.new_change_set(false);
            let working = engine.new_commit(&working_set.id, std::slice::from_ref(&merge.id))?;
            version.commit_id = merge.id.clone();
            version.working_commit_id = working.id;
            engine.write_version(&version)?;
            engine.invalidate_cache()?;

            info!(
                version = %version.id,
                to = %to,
                commit = %merge.id,
                restored = restored.len() - removed,
                removed,
                "transitioned version"
            );
            Ok(merge)
        })
    }
}
