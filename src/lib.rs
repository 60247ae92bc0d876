//! # Lix Engine
//!
//! An embedded change-control engine: every write to tracked state becomes
//! an immutable change, grouped into commits on a graph, and exposed as
//! materialized state per version.
//!
//! ## Core Concepts
//!
//! - **Changes**: Immutable mutation records referencing content-addressed snapshots
//! - **Commits**: Change sets placed on a DAG of parent commits
//! - **Versions**: Named pointers into the graph that can inherit from each other
//! - **State**: Latest-wins resolution by commit depth, then inheritance depth
//! - **Entity views**: SQL tables declared by JSON schemas, rewritten onto the change log
//!
//! ## Example
//!
//! ```ignore
//! use lix_engine::{Lix, LixConfig};
//! use serde_json::json;
//!
//! let lix = Lix::open(LixConfig::at("./project.lix"))?;
//!
//! // Write tracked state through an entity view
//! lix.execute(
//!     "INSERT INTO lix_key_value (key, value) VALUES (?, ?)",
//!     &[json!("greeting"), json!("hello")],
//! )?;
//!
//! // Seal the working change set
//! let checkpoint = lix.create_checkpoint()?;
//!
//! // Branch off and diverge
//! lix.transaction(|engine| {
//!     let draft = engine.create_version(CreateVersion::new("draft"))?;
//!     engine.switch_version(&draft.id)
//! })?;
//! ```

pub mod autosave;
pub mod change;
pub mod commit;
pub mod deterministic;
pub mod diff;
pub mod engine;
pub mod error;
pub mod file;
pub mod hooks;
pub mod lix;
pub mod merge;
pub mod plugin;
pub mod schema;
pub mod sql;
pub mod state;
pub mod storage;
pub mod types;
pub mod version;

// Re-exports
pub use autosave::{AutoSave, AutoSaveStats};
pub use commit::{common_ancestor, CHECKPOINT_LABEL};
pub use deterministic::DeterministicConfig;
pub use diff::{DiffDetail, DiffRow, DiffStatus};
pub use engine::{Engine, ACTIVE_VERSION_KEY, MAIN_VERSION_ID};
pub use error::{LixError, Result};
pub use file::FileDescriptor;
pub use hooks::{
    ChangeSummary, DropReason, HookId, HookManager, LixEvent, SubscriptionConfig,
    SubscriptionFilter, SubscriptionHandle, SubscriptionId,
};
pub use lix::{Lix, LixConfig};
pub use merge::MergeReport;
pub use plugin::{
    ChangeApplier, ChangeDetector, DetectedChange, Differ, FileData, MergeOutcome, Merger,
    Plugin, PluginRegistry,
};
pub use schema::{LixSchema, SchemaRegistry, GLOBAL_VERSION_ID};
pub use sql::QueryResult;
pub use state::{HistoryEntry, Materialized};
pub use storage::Database;
pub use types::*;
pub use version::{CreateVersion, VersionTree};
