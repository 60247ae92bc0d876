//! Files tracked as entities.
//!
//! A file is a `lix_file_descriptor` row plus the entities its plugin
//! detects in the bytes. Files no plugin fully handles are stored whole as
//! a hex-encoded `lix_binary_blob`.

use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::plugin::{FileData, Plugin};
use crate::schema::{BINARY_BLOB_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_KEY};
use crate::types::{NewChange, StateRow, VersionId, LIX_OWN_ENTITY_PLUGIN};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl FileDescriptor {
    fn from_row(row: &StateRow) -> Option<Self> {
        let content = row.snapshot_content.clone()?;
        serde_json::from_value(content).ok()
    }
}

fn check_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(LixError::InvalidOperation(format!("invalid file path '{path}'")));
    }
    Ok(())
}

/// Plugins that can both split a file into entities and rebuild it.
fn full_plugin(plugin: Option<&Arc<dyn Plugin>>) -> Option<Arc<dyn Plugin>> {
    plugin
        .filter(|p| p.change_detector().is_some() && p.change_applier().is_some())
        .cloned()
}

impl Engine {
    pub fn list_files(&mut self) -> Result<Vec<FileDescriptor>> {
        let version_id = self.active_version_id()?;
        Ok(self
            .state_of(&version_id, Some(FILE_DESCRIPTOR_SCHEMA_KEY))?
            .iter()
            .filter_map(FileDescriptor::from_row)
            .collect())
    }

    pub fn file_by_path(&mut self, path: &str) -> Result<Option<FileDescriptor>> {
        Ok(self.list_files()?.into_iter().find(|file| file.path == path))
    }

    /// Write a file in the active version.
    ///
    /// The descriptor keeps its id when the path already exists. A matching
    /// plugin without a change detector, or one whose detection fails,
    /// contributes no entity changes.
    pub fn write_file(&mut self, path: &str, data: &[u8], metadata: Option<Value>) -> Result<FileDescriptor> {
        check_path(path)?;
        self.transaction(|engine| {
            let version_id = engine.active_version_id()?;
            let existing = engine.file_by_path(path)?;
            let before = match &existing {
                Some(file) => Some(FileData {
                    id: file.id.clone(),
                    path: file.path.clone(),
                    data: engine.file_bytes(&version_id, file)?,
                    metadata: file.metadata.clone(),
                }),
                None => None,
            };

            let descriptor = FileDescriptor {
                id: match &existing {
                    Some(file) => file.id.clone(),
                    None => engine.uuid(),
                },
                path: path.to_string(),
                metadata,
            };
            if existing.as_ref() != Some(&descriptor) {
                let content = json!({
                    "id": descriptor.id,
                    "path": descriptor.path,
                    "metadata": descriptor.metadata,
                });
                engine.write_change(
                    &version_id,
                    None,
                    NewChange::entity(&descriptor.id, FILE_DESCRIPTOR_SCHEMA_KEY, Some(content)),
                )?;
            }

            let after = FileData {
                id: descriptor.id.clone(),
                path: descriptor.path.clone(),
                data: data.to_vec(),
                metadata: descriptor.metadata.clone(),
            };
            let plugin = engine.plugins.find_for_path(path).cloned();
            let detected = match &plugin {
                Some(plugin) => match plugin.change_detector() {
                    Some(detector) => match detector.detect_changes(before.as_ref(), &after) {
                        Ok(changes) => changes,
                        Err(e) => {
                            warn!(plugin = plugin.key(), path, error = %e, "change detection failed");
                            Vec::new()
                        }
                    },
                    None => {
                        warn!(plugin = plugin.key(), path, "plugin cannot detect changes");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };

            match full_plugin(plugin.as_ref()) {
                Some(plugin) => {
                    debug!(path, changes = detected.len(), plugin = plugin.key(), "file changes detected");
                    for change in detected {
                        let new = NewChange {
                            entity_id: change.entity_id,
                            schema_key: change.schema_key,
                            schema_version: change.schema_version,
                            file_id: descriptor.id.clone(),
                            plugin_key: plugin.key().to_string(),
                            snapshot_content: change.snapshot_content,
                            metadata: None,
                        };
                        engine.write_change(&version_id, None, new)?;
                    }
                }
                None => {
                    let blob = NewChange::entity(
                        &descriptor.id,
                        BINARY_BLOB_SCHEMA_KEY,
                        Some(json!({ "data": hex::encode(data) })),
                    )
                    .with_file(&descriptor.id, LIX_OWN_ENTITY_PLUGIN);
                    engine.write_change(&version_id, None, blob)?;
                }
            }
            Ok(descriptor)
        })
    }

    /// Current bytes of a file in the active version.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let version_id = self.active_version_id()?;
        let file = self
            .file_by_path(path)?
            .ok_or_else(|| LixError::FileNotFound(path.to_string()))?;
        self.file_bytes(&version_id, &file)
    }

    fn file_bytes(&mut self, version_id: &VersionId, file: &FileDescriptor) -> Result<Vec<u8>> {
        let rows: Vec<StateRow> = self
            .state_of(version_id, None)?
            .into_iter()
            .filter(|row| row.file_id == file.id)
            .collect();

        if let Some(plugin) = full_plugin(self.plugins.find_for_path(&file.path)) {
            if let Some(applier) = plugin.change_applier() {
                let data = FileData {
                    id: file.id.clone(),
                    path: file.path.clone(),
                    data: Vec::new(),
                    metadata: file.metadata.clone(),
                };
                return applier.apply_changes(&data, &rows);
            }
        }

        let blob = rows
            .iter()
            .find(|row| row.schema_key == BINARY_BLOB_SCHEMA_KEY)
            .and_then(|row| row.snapshot_content.as_ref())
            .and_then(|content| content.get("data"))
            .and_then(Value::as_str);
        match blob {
            Some(encoded) => hex::decode(encoded)
                .map_err(|e| LixError::InvalidFormat(format!("file '{}': {e}", file.path))),
            None => Ok(Vec::new()),
        }
    }

    /// Tombstone a file's descriptor and every entity it owns.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.transaction(|engine| {
            let version_id = engine.active_version_id()?;
            let file = engine
                .file_by_path(path)?
                .ok_or_else(|| LixError::FileNotFound(path.to_string()))?;

            let owned: Vec<StateRow> = engine
                .state_of(&version_id, None)?
                .into_iter()
                .filter(|row| row.file_id == file.id)
                .collect();
            for row in owned {
                let tombstone = NewChange::entity(&row.entity_id, &row.schema_key, None)
                    .with_file(&row.file_id, &row.plugin_key)
                    .with_schema_version(&row.schema_version);
                engine.write_change(&version_id, None, tombstone)?;
            }
            engine.write_change(
                &version_id,
                None,
                NewChange::entity(&file.id, FILE_DESCRIPTOR_SCHEMA_KEY, None),
            )?;
            debug!(path, "deleted file");
            Ok(())
        })
    }
}
