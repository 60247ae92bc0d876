//! Version inheritance tree.

use crate::storage::Database;
use crate::types::VersionId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Ancestry walks stop after this many hops.
pub const MAX_INHERITANCE_DEPTH: usize = 64;

/// Parent links between versions.
///
/// Built from either the version table or the `lix_version` change log.
/// Walks are bounded by a visited set, so malformed (cyclic) links still
/// terminate.
#[derive(Clone, Debug, Default)]
pub struct VersionTree {
    parents: BTreeMap<VersionId, Option<VersionId>>,
}

impl VersionTree {
    pub fn from_db(db: &Database) -> Self {
        Self::from_pairs(
            db.versions
                .values()
                .map(|v| (v.id.clone(), v.inherits_from_version_id.clone())),
        )
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (VersionId, Option<VersionId>)>) -> Self {
        Self {
            parents: pairs.into_iter().collect(),
        }
    }

    pub fn contains(&self, version_id: &VersionId) -> bool {
        self.parents.contains_key(version_id)
    }

    pub fn versions(&self) -> impl Iterator<Item = &VersionId> {
        self.parents.keys()
    }

    pub fn parent_of(&self, version_id: &VersionId) -> Option<&VersionId> {
        self.parents.get(version_id).and_then(Option::as_ref)
    }

    /// The version itself (depth 0) followed by its ancestors.
    pub fn ancestry(&self, version_id: &VersionId) -> Vec<(VersionId, usize)> {
        let mut rows = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = version_id.clone();
        let mut depth = 0usize;

        loop {
            if !seen.insert(current.clone()) {
                warn!(version = %version_id, at = %current, "version inheritance cycle");
                break;
            }
            rows.push((current.clone(), depth));

            let Some(next) = self.parent_of(&current) else {
                break;
            };
            if depth >= MAX_INHERITANCE_DEPTH {
                warn!(version = %version_id, "version inheritance depth limit reached");
                break;
            }
            current = next.clone();
            depth += 1;
        }

        rows
    }

    /// Versions that inherit directly from `version_id`.
    pub fn children_of(&self, version_id: &VersionId) -> Vec<VersionId> {
        self.parents
            .iter()
            .filter(|(_, parent)| parent.as_ref() == Some(version_id))
            .map(|(child, _)| child.clone())
            .collect()
    }

    /// Whether making `version_id` inherit from `parent` would close a loop.
    pub fn would_cycle(&self, version_id: &VersionId, parent: &VersionId) -> bool {
        parent == version_id
            || self
                .ancestry(parent)
                .iter()
                .any(|(ancestor, _)| ancestor == version_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: &str) -> VersionId {
        VersionId::from(id)
    }

    #[test]
    fn test_ancestry_depths() {
        let tree = VersionTree::from_pairs([
            (v("global"), None),
            (v("main"), Some(v("global"))),
            (v("feature"), Some(v("main"))),
        ]);
        assert_eq!(
            tree.ancestry(&v("feature")),
            vec![(v("feature"), 0), (v("main"), 1), (v("global"), 2)]
        );
        assert_eq!(tree.children_of(&v("main")), vec![v("feature")]);
    }

    #[test]
    fn test_cycle_terminates() {
        let tree = VersionTree::from_pairs([
            (v("a"), Some(v("b"))),
            (v("b"), Some(v("c"))),
            (v("c"), Some(v("a"))),
        ]);
        let ancestry = tree.ancestry(&v("a"));
        assert_eq!(ancestry.len(), 3);
        assert!(tree.would_cycle(&v("c"), &v("a")));
    }

    #[test]
    fn test_depth_limit() {
        let pairs = (0..100).map(|i| (v(&format!("v{i}")), Some(v(&format!("v{}", i + 1)))));
        let tree = VersionTree::from_pairs(pairs);
        assert_eq!(tree.ancestry(&v("v0")).len(), MAX_INHERITANCE_DEPTH + 1);
    }
}
