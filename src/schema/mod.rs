//! Schema declarations that make entity views resolvable.
//!
//! A schema is a JSON-Schema object carrying reserved `x-lix-*` keys:
//! `x-lix-key` (view name), `x-lix-version`, `x-lix-primary-key`,
//! `x-lix-immutable` and `x-lix-override-lixcols`.

mod validate;

pub use validate::{coerce_content, validate_content};

use crate::error::{LixError, Result};
use crate::types::VersionId;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const KEY_VALUE_SCHEMA_KEY: &str = "lix_key_value";
pub const STORED_SCHEMA_KEY: &str = "lix_stored_schema";
pub const VERSION_SCHEMA_KEY: &str = "lix_version";
pub const FILE_DESCRIPTOR_SCHEMA_KEY: &str = "lix_file_descriptor";
pub const BINARY_BLOB_SCHEMA_KEY: &str = "lix_binary_blob";

/// Id of the root version every other version inherits from by default.
pub const GLOBAL_VERSION_ID: &str = "global";

/// Columns fixed for every row of a schema.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverrideLixcols {
    pub file_id: Option<String>,
    pub plugin_key: Option<String>,
    pub version_id: Option<VersionId>,
}

/// A parsed schema declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct LixSchema {
    pub key: String,
    pub version: String,
    pub primary_key: Vec<String>,
    pub immutable: bool,
    pub override_lixcols: OverrideLixcols,
    /// Declared property names, sorted.
    pub properties: Vec<String>,
    pub definition: Value,
}

impl LixSchema {
    pub fn from_definition(definition: Value) -> Result<Self> {
        let object = definition
            .as_object()
            .ok_or_else(|| LixError::schema("schema", "definition must be a JSON object"))?;

        let key = object
            .get("x-lix-key")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| LixError::schema("schema", "missing x-lix-key"))?
            .to_string();

        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(LixError::schema(
                &key,
                "x-lix-key may only contain ASCII letters, digits and underscores",
            ));
        }

        let version = object
            .get("x-lix-version")
            .and_then(Value::as_str)
            .unwrap_or("1.0")
            .to_string();

        let primary_key = match object.get("x-lix-primary-key") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| LixError::schema(&key, "x-lix-primary-key must list strings"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(LixError::schema(&key, "x-lix-primary-key must be an array"));
            }
        };

        let immutable = object
            .get("x-lix-immutable")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let override_lixcols = match object.get("x-lix-override-lixcols") {
            Some(Value::Object(cols)) => {
                let read = |name: &str| cols.get(name).and_then(Value::as_str).map(unquote);
                OverrideLixcols {
                    file_id: read("lixcol_file_id"),
                    plugin_key: read("lixcol_plugin_key"),
                    version_id: read("lixcol_version_id").map(VersionId::from),
                }
            }
            _ => OverrideLixcols::default(),
        };

        let properties: Vec<String> = object
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default();

        for column in &primary_key {
            if !properties.contains(column) {
                return Err(LixError::schema(
                    &key,
                    format!("primary key '{column}' is not a declared property"),
                ));
            }
        }

        Ok(Self {
            key,
            version,
            primary_key,
            immutable,
            override_lixcols,
            properties,
            definition,
        })
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p == name)
    }

    /// Declared JSON schema of one property.
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.definition.get("properties")?.get(name)
    }

    /// Version the schema's rows are pinned to, if any.
    pub fn pinned_version(&self) -> Option<&VersionId> {
        self.override_lixcols.version_id.as_ref()
    }

    /// Entity id: primary-key property values joined by `~`.
    pub fn entity_id_for(&self, content: &Value) -> Result<String> {
        if self.primary_key.is_empty() {
            return Err(LixError::schema(&self.key, "schema declares no primary key"));
        }
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for column in &self.primary_key {
            match content.get(column) {
                None | Some(Value::Null) => {
                    return Err(LixError::schema(
                        &self.key,
                        format!("primary key property '{column}' is missing"),
                    ));
                }
                Some(Value::String(s)) => parts.push(s.clone()),
                Some(other) => parts.push(other.to_string()),
            }
        }
        Ok(parts.join("~"))
    }
}

fn unquote(raw: &str) -> String {
    let trimmed = raw.trim();
    for quote in ['"', '\''] {
        if trimmed.len() >= 2 && trimmed.starts_with(quote) && trimmed.ends_with(quote) {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Definitions of the schemas every store knows.
pub fn builtin_definitions() -> Vec<Value> {
    vec![
        json!({
            "x-lix-key": KEY_VALUE_SCHEMA_KEY,
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["key"],
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "value": {}
            },
            "required": ["key", "value"],
            "additionalProperties": false
        }),
        json!({
            "x-lix-key": STORED_SCHEMA_KEY,
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["key", "version"],
            "x-lix-immutable": true,
            "x-lix-override-lixcols": { "lixcol_version_id": GLOBAL_VERSION_ID },
            "type": "object",
            "properties": {
                "key": { "type": "string" },
                "version": { "type": "string" },
                "value": { "type": "object" }
            },
            "required": ["key", "version", "value"],
            "additionalProperties": false
        }),
        json!({
            "x-lix-key": VERSION_SCHEMA_KEY,
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["id"],
            "x-lix-override-lixcols": { "lixcol_version_id": GLOBAL_VERSION_ID },
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "name": { "type": "string" },
                "commit_id": { "type": "string" },
                "working_commit_id": { "type": "string" },
                "inherits_from_version_id": { "type": ["string", "null"] },
                "hidden": { "type": "boolean", "default": false }
            },
            "required": ["id", "name", "commit_id", "working_commit_id"],
            "additionalProperties": false
        }),
        json!({
            "x-lix-key": FILE_DESCRIPTOR_SCHEMA_KEY,
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["id"],
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "path": { "type": "string" },
                "metadata": { "type": ["object", "null"] }
            },
            "required": ["id", "path"],
            "additionalProperties": false
        }),
        json!({
            "x-lix-key": BINARY_BLOB_SCHEMA_KEY,
            "x-lix-version": "1.0",
            "type": "object",
            "properties": {
                "data": { "type": "string" }
            },
            "required": ["data"],
            "additionalProperties": false
        }),
    ]
}

/// Parsed builtin schemas.
pub fn builtin_schemas() -> Vec<LixSchema> {
    builtin_definitions()
        .into_iter()
        .filter_map(|definition| LixSchema::from_definition(definition).ok())
        .collect()
}

/// Schemas known to one preprocessing call, keyed by `x-lix-key`.
///
/// Loaded fresh per call; never shared across calls.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, LixSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for schema in builtin_schemas() {
            registry.insert(schema);
        }
        registry
    }

    /// Later registrations of the same key replace earlier ones.
    pub fn insert(&mut self, schema: LixSchema) {
        self.schemas.insert(schema.key.clone(), schema);
    }

    pub fn get(&self, key: &str) -> Option<&LixSchema> {
        self.schemas.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.schemas.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
