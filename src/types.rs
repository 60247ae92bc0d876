//! Core types for the change-control engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_id!(
    /// Identifier of an immutable change record.
    ChangeId
);
string_id!(
    /// Identifier of a snapshot (content hash, or `no-content`).
    SnapshotId
);
string_id!(
    /// Identifier of a change set.
    ChangeSetId
);
string_id!(
    /// Identifier of a commit.
    CommitId
);
string_id!(
    /// Identifier of a version.
    VersionId
);
string_id!(LabelId);
string_id!(ConflictId);

/// Id of the singleton snapshot with null content.
pub const NO_CONTENT_SNAPSHOT_ID: &str = "no-content";

/// File id used by entities that do not belong to a user file.
pub const LIX_FILE_ID: &str = "lix";

/// Plugin key used by entities written through entity views.
pub const LIX_OWN_ENTITY_PLUGIN: &str = "lix_own_entity";

impl SnapshotId {
    /// The tombstone snapshot id.
    pub fn no_content() -> Self {
        SnapshotId(NO_CONTENT_SNAPSHOT_ID.to_string())
    }

    pub fn is_no_content(&self) -> bool {
        self.0 == NO_CONTENT_SNAPSHOT_ID
    }

    /// Content address of canonical JSON text.
    pub fn for_content(canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        SnapshotId(hex::encode(hasher.finalize()))
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Wall clock time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identity of an entity inside a version: (entity, schema, file).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.file_id, self.schema_key, self.entity_id)
    }
}

/// Stored snapshot row. Content is canonical JSON text; `None` only for
/// the `no-content` singleton.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub content: Option<String>,
}

/// An immutable mutation record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_id: SnapshotId,
    pub created_at: Timestamp,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl Change {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_no_content()
    }
}

/// Input for creating a change (before id, snapshot and timestamp are assigned).
#[derive(Clone, Debug)]
pub struct NewChange {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: Option<Value>,
    pub metadata: Option<Value>,
}

impl NewChange {
    /// A change written through the engine's own entity surface.
    pub fn entity(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        snapshot_content: Option<Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            schema_version: "1.0".to_string(),
            file_id: LIX_FILE_ID.to_string(),
            plugin_key: LIX_OWN_ENTITY_PLUGIN.to_string(),
            snapshot_content,
            metadata: None,
        }
    }

    pub fn with_file(mut self, file_id: impl Into<String>, plugin_key: impl Into<String>) -> Self {
        self.file_id = file_id.into();
        self.plugin_key = plugin_key.into();
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// A named collection of changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    /// Sealed sets (checkpoints, merges) reject element mutation.
    pub immutable_elements: bool,
}

/// Membership of a change in a change set, keyed by (set, entity key).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: ChangeSetId,
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

impl ChangeSetElement {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// A change set positioned in the commit DAG.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    pub created_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEdge {
    pub parent_id: CommitId,
    pub child_id: CommitId,
}

/// Direct parenthood between changes (conflict resolutions, merges).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEdge {
    pub parent_id: ChangeId,
    pub child_id: ChangeId,
}

/// Mutable named pointer into the commit graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    /// Last checkpointed (or transitioned/merged) commit.
    pub commit_id: CommitId,
    /// Commit whose change set holds in-progress edits.
    pub working_commit_id: CommitId,
    pub inherits_from_version_id: Option<VersionId>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityLabel {
    pub entity: EntityKey,
    pub label_id: LabelId,
}

/// Two changes to the same entity that a merge could not reconcile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub change_id: ChangeId,
    pub conflicting_change_id: ChangeId,
    pub resolved_by: Option<ChangeId>,
}

/// A materialized row: the latest visible value of an entity in a version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    /// `None` is a tombstone.
    pub snapshot_content: Option<Value>,
    pub change_id: ChangeId,
    pub commit_id: CommitId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub inherited_from_version_id: Option<VersionId>,
}

impl StateRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    pub fn is_tombstone(&self) -> bool {
        self.snapshot_content.is_none()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreStats {
    pub change_count: usize,
    pub snapshot_count: usize,
    pub change_set_count: usize,
    pub commit_count: usize,
    pub version_count: usize,
    pub cache_row_count: usize,
}
