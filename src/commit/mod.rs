//! Change sets, the commit DAG, labels and conflicts.

mod change_set;
mod checkpoint;
mod conflict;
mod graph;

pub use checkpoint::CHECKPOINT_LABEL;
pub use graph::{ancestors_within, common_ancestor, descendants_within};
