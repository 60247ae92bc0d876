//! The plugin capability contract.
//!
//! A plugin claims files by glob and may implement any subset of the
//! capabilities below. Callers check for a capability before using it.

pub mod csv;
mod glob;

pub use glob::glob_matches;

use crate::diff::DiffDetail;
use crate::error::Result;
use crate::types::StateRow;
use serde_json::Value;
use std::sync::Arc;

/// File bytes plus descriptor metadata, as handed to plugins.
#[derive(Clone, Debug, PartialEq)]
pub struct FileData {
    pub id: String,
    pub path: String,
    pub data: Vec<u8>,
    pub metadata: Option<Value>,
}

/// One entity-level change found by comparing file contents.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    /// `None` deletes the entity.
    pub snapshot_content: Option<Value>,
}

/// Result of a three-way merge of one entity.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    Content(Value),
    Deleted,
    Conflict,
}

pub trait ChangeDetector {
    /// Entity changes between `before` and `after`.
    ///
    /// Returns an empty list when metadata the plugin needs is missing.
    fn detect_changes(&self, before: Option<&FileData>, after: &FileData) -> Result<Vec<DetectedChange>>;
}

pub trait ChangeApplier {
    /// Rebuild file bytes from the file's resolved entity rows.
    fn apply_changes(&self, file: &FileData, rows: &[StateRow]) -> Result<Vec<u8>>;
}

pub trait Merger {
    fn merge_cell(
        &self,
        schema_key: &str,
        base: Option<&Value>,
        ours: Option<&Value>,
        theirs: Option<&Value>,
    ) -> MergeOutcome;
}

pub trait Differ {
    /// Presentation of a set of entity diffs.
    fn render_diff(&self, diffs: &[DiffDetail]) -> String;
}

pub trait Plugin: Send + Sync {
    fn key(&self) -> &str;

    /// Paths this plugin handles.
    fn glob(&self) -> &str;

    /// Schema definitions of the entities the plugin emits.
    fn schemas(&self) -> Vec<Value> {
        Vec::new()
    }

    fn change_detector(&self) -> Option<&dyn ChangeDetector> {
        None
    }

    fn change_applier(&self) -> Option<&dyn ChangeApplier> {
        None
    }

    fn merger(&self) -> Option<&dyn Merger> {
        None
    }

    fn differ(&self) -> Option<&dyn Differ> {
        None
    }
}

/// Content-level three-way merge: a side that did not change loses.
pub fn three_way(base: Option<&Value>, ours: Option<&Value>, theirs: Option<&Value>) -> MergeOutcome {
    let outcome = |value: Option<&Value>| match value {
        Some(value) => MergeOutcome::Content(value.clone()),
        None => MergeOutcome::Deleted,
    };
    if ours == theirs || theirs == base {
        outcome(ours)
    } else if ours == base {
        outcome(theirs)
    } else {
        MergeOutcome::Conflict
    }
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin, replacing one registered under the same key.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.retain(|existing| existing.key() != plugin.key());
        self.plugins.push(plugin);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|plugin| plugin.key() == key)
    }

    /// First registered plugin whose glob matches `path`.
    pub fn find_for_path(&self, path: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.iter().find(|plugin| glob_matches(plugin.glob(), path))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
