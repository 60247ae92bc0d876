//! Versions: mutable named pointers into the commit graph.
//!
//! Every pointer mutation goes through [`Engine::write_version`], which
//! updates the version table and appends a `lix_version` change to the
//! global version's working change set. The materializer resolves tips and
//! the inheritance tree from those changes.

mod transition;
mod tree;

pub use tree::{VersionTree, MAX_INHERITANCE_DEPTH};

use crate::engine::{Engine, ACTIVE_VERSION_KEY};
use crate::error::{LixError, Result};
use crate::schema::{GLOBAL_VERSION_ID, VERSION_SCHEMA_KEY};
use crate::types::{CommitId, NewChange, Version, VersionId};
use serde_json::{json, Value};
use tracing::info;

/// Parameters of a new version.
#[derive(Clone, Debug)]
pub struct CreateVersion {
    id: Option<VersionId>,
    name: String,
    from_commit: Option<CommitId>,
    inherits_from: Option<Option<VersionId>>,
}

impl CreateVersion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            from_commit: None,
            inherits_from: None,
        }
    }

    pub fn id(mut self, id: impl Into<VersionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Start from this commit instead of the active version's commit.
    pub fn from_commit(mut self, commit_id: impl Into<CommitId>) -> Self {
        self.from_commit = Some(commit_id.into());
        self
    }

    /// Inherit from this version instead of `global`.
    pub fn inherits_from(mut self, version_id: impl Into<VersionId>) -> Self {
        self.inherits_from = Some(Some(version_id.into()));
        self
    }

    pub fn without_inheritance(mut self) -> Self {
        self.inherits_from = Some(None);
        self
    }
}

impl Engine {
    pub fn version(&self, version_id: &VersionId) -> Result<Version> {
        self.db
            .versions
            .get(version_id)
            .cloned()
            .ok_or_else(|| LixError::VersionNotFound(version_id.to_string()))
    }

    pub fn list_versions(&self) -> Vec<Version> {
        self.db.versions.values().cloned().collect()
    }

    pub fn active_version_id(&self) -> Result<VersionId> {
        self.get_untracked(ACTIVE_VERSION_KEY)
            .and_then(Value::as_str)
            .map(VersionId::from)
            .ok_or(LixError::NotInitialized)
    }

    pub fn active_version(&self) -> Result<Version> {
        self.version(&self.active_version_id()?)
    }

    /// Create a version whose working commit is a child of the base commit.
    pub fn create_version(&mut self, params: CreateVersion) -> Result<Version> {
        self.transaction(|engine| {
            let id = match params.id {
                Some(id) => id,
                None => VersionId::from(engine.uuid()),
            };
            if engine.db.versions.contains_key(&id) {
                return Err(LixError::InvalidOperation(format!("version '{id}' already exists")));
            }

            let base = match params.from_commit {
                Some(commit_id) => commit_id,
                None => engine.active_version()?.commit_id,
            };
            if !engine.db.commits.contains_key(&base) {
                return Err(LixError::CommitNotFound(base.to_string()));
            }

            let inherits = params
                .inherits_from
                .unwrap_or_else(|| Some(VersionId::from(GLOBAL_VERSION_ID)));
            if let Some(parent) = &inherits {
                engine.version(parent)?;
            }

            let version = engine.create_root_version(id, &params.name, &base, inherits)?;
            info!(version = %version.id, base = %base, "created version");
            Ok(version)
        })
    }

    pub fn create_version_from_commit(
        &mut self,
        commit_id: &CommitId,
        name: impl Into<String>,
    ) -> Result<Version> {
        self.create_version(CreateVersion::new(name).from_commit(commit_id.clone()))
    }

    /// Insert a version pointing at `base`, with a fresh working commit.
    pub(crate) fn create_root_version(
        &mut self,
        id: VersionId,
        name: &str,
        base: &CommitId,
        inherits_from: Option<VersionId>,
    ) -> Result<Version> {
        let working_set = self.new_change_set(false);
        let working = self.new_commit(&working_set.id, std::slice::from_ref(base))?;
        let version = Version {
            id,
            name: name.to_string(),
            commit_id: base.clone(),
            working_commit_id: working.id,
            inherits_from_version_id: inherits_from,
            hidden: false,
        };
        self.write_version(&version)?;
        Ok(version)
    }

    pub fn switch_version(&mut self, version_id: &VersionId) -> Result<()> {
        self.transaction(|engine| {
            engine.version(version_id)?;
            engine.set_untracked(ACTIVE_VERSION_KEY, json!(version_id.as_str()));
            info!(version = %version_id, "switched version");
            Ok(())
        })
    }

    /// Remove a version. `global`, the active version and versions that
    /// others inherit from cannot be deleted.
    pub fn delete_version(&mut self, version_id: &VersionId) -> Result<()> {
        self.transaction(|engine| {
            engine.version(version_id)?;
            if version_id == GLOBAL_VERSION_ID {
                return Err(LixError::InvalidOperation("the global version cannot be deleted".into()));
            }
            if engine.active_version_id()? == *version_id {
                return Err(LixError::InvalidOperation(format!(
                    "version '{version_id}' is active; switch first"
                )));
            }
            let children = VersionTree::from_db(&engine.db).children_of(version_id);
            if !children.is_empty() {
                return Err(LixError::InvalidOperation(format!(
                    "version '{version_id}' is inherited by {} other version(s)",
                    children.len()
                )));
            }

            engine.db.versions.remove(version_id);
            engine.create_change_in(
                &VersionId::from(GLOBAL_VERSION_ID),
                NewChange::entity(version_id.as_str(), VERSION_SCHEMA_KEY, None),
            )?;
            engine.invalidate_cache()?;
            info!(version = %version_id, "deleted version");
            Ok(())
        })
    }

    /// Change (or clear) the version a version inherits from.
    pub fn set_inherits_from(&mut self, version_id: &VersionId, parent: Option<VersionId>) -> Result<()> {
        self.transaction(|engine| {
            let mut version = engine.version(version_id)?;
            if let Some(parent) = &parent {
                engine.version(parent)?;
                if VersionTree::from_db(&engine.db).would_cycle(version_id, parent) {
                    return Err(LixError::InvalidOperation(format!(
                        "inheriting from '{parent}' would make '{version_id}' its own ancestor"
                    )));
                }
            }
            version.inherits_from_version_id = parent;
            engine.write_version(&version)
        })
    }

    pub fn rename_version(&mut self, version_id: &VersionId, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.transaction(|engine| {
            let mut version = engine.version(version_id)?;
            version.name = name;
            engine.write_version(&version)
        })
    }

    /// Persist a version row and record it as a `lix_version` change.
    pub(crate) fn write_version(&mut self, version: &Version) -> Result<()> {
        self.db.versions.insert(version.id.clone(), version.clone());
        let content = json!({
            "id": version.id.as_str(),
            "name": version.name,
            "commit_id": version.commit_id.as_str(),
            "working_commit_id": version.working_commit_id.as_str(),
            "inherits_from_version_id": version.inherits_from_version_id.as_ref().map(VersionId::as_str),
            "hidden": version.hidden,
        });
        self.create_change_in(
            &VersionId::from(GLOBAL_VERSION_ID),
            NewChange::entity(version.id.as_str(), VERSION_SCHEMA_KEY, Some(content)),
        )?;
        Ok(())
    }
}
