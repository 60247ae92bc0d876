//! Error types for the change-control engine.

use crate::types::{ChangeId, CommitId, VersionId};
use thiserror::Error;

/// Main error type for engine operations.
///
/// The first group of variants are precondition failures. They abort the
/// enclosing transaction and are never retried.
#[derive(Debug, Error)]
pub enum LixError {
    #[error("Change already exists: {0}")]
    ChangeAlreadyExists(ChangeId),

    #[error("Change {change_id} is not a direct child of conflict ({left} <> {right})")]
    ChangeNotDirectChildOfConflict {
        change_id: ChangeId,
        left: ChangeId,
        right: ChangeId,
    },

    #[error("Change {change_id} targets file {got} but the conflict belongs to file {expected}")]
    ChangeDoesNotBelongToFile {
        change_id: ChangeId,
        expected: String,
        got: String,
    },

    #[error("Foreign key violation: {table}.{column} references missing {target} '{key}'")]
    ForeignKeyViolation {
        table: &'static str,
        column: &'static str,
        target: &'static str,
        key: String,
    },

    #[error("Schema '{schema_key}' is immutable; entity '{entity_id}' cannot be updated")]
    ImmutableSchemaViolation { schema_key: String, entity_id: String },

    #[error("No common ancestor between commits {source_commit} and {target_commit}")]
    NoCommonAncestor {
        source_commit: CommitId,
        target_commit: CommitId,
    },

    #[error("Version {0} has uncommitted changes")]
    UncommittedChanges(VersionId),

    #[error("Schema validation failed for '{schema_key}': {message}")]
    SchemaValidation { schema_key: String, message: String },

    // --- Lookup errors ---
    #[error("Version not found: {0}")]
    VersionNotFound(String),

    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Change set not found: {0}")]
    ChangeSetNotFound(String),

    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Schema not found: {0}")]
    SchemaNotFound(String),

    #[error("Label not found: {0}")]
    LabelNotFound(String),

    // --- SQL ---
    #[error("SQL parse error at offset {offset}: {message}")]
    SqlParse { offset: usize, message: String },

    #[error("SQL error: {0}")]
    Sql(String),

    // --- Infrastructure ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl LixError {
    pub(crate) fn schema(schema_key: &str, message: impl Into<String>) -> Self {
        LixError::SchemaValidation {
            schema_key: schema_key.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for LixError {
    fn from(e: serde_json::Error) -> Self {
        LixError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for LixError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LixError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for LixError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LixError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, LixError>;
