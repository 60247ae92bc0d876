//! Persistent tables, content-addressed snapshots, and store images.
//!
//! Tables are ordered maps with an undo journal. A transaction opens the
//! journal on every table; foreign keys are checked once at transaction end.

mod database;
mod persist;
mod snapshots;
mod table;

pub use database::{Database, CHANGE_SCHEMA_KEY, CHANGE_SET_SCHEMA_KEY, COMMIT_SCHEMA_KEY};
pub use persist::{decode_image, encode_image, load_image, save_image};
pub use snapshots::SnapshotStore;
pub use table::Table;
