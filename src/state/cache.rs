//! Materialized-state cache with inheritance copy-down.

use crate::state::materializer::Materialized;
use crate::storage::Table;
use crate::types::{EntityKey, StateRow, VersionId};
use crate::version::VersionTree;
use std::collections::{BTreeMap, BTreeSet};

type CacheKey = (VersionId, EntityKey);

/// One cached row owned by a version.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub row: StateRow,
    /// Tombstone written over state the version only inherited.
    pub inheritance_delete_marker: bool,
}

/// Per-version memo of the materializer's output.
///
/// Holds only each version's own rows (tombstones included); inherited
/// rows are resolved at read time. Never a source of truth: `rebuild`
/// reproduces it from the change log.
#[derive(Debug, Default)]
pub struct StateCache {
    rows: Table<CacheKey, CacheEntry>,
    fresh: bool,
    fresh_at_begin: bool,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn mark_stale(&mut self) {
        self.fresh = false;
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn begin(&mut self) {
        self.rows.begin();
        self.fresh_at_begin = self.fresh;
    }

    pub fn commit(&mut self) {
        self.rows.commit();
    }

    pub fn rollback(&mut self) {
        self.rows.rollback();
        self.fresh = self.fresh_at_begin;
    }

    /// Replace every row with the materializer's output.
    pub fn rebuild(&mut self, materialized: &Materialized) {
        self.rows.clear();
        for rows in materialized.own.values() {
            for row in rows {
                self.rows.insert(
                    (row.version_id.clone(), row.key()),
                    CacheEntry {
                        row: row.clone(),
                        inheritance_delete_marker: false,
                    },
                );
            }
        }

        let tombstones: Vec<CacheKey> = self
            .rows
            .iter()
            .filter(|(_, entry)| entry.row.is_tombstone())
            .map(|(key, _)| key.clone())
            .collect();
        for (version_id, key) in tombstones {
            let marker = self.ancestor_is_live(&materialized.tree, &version_id, &key);
            if let Some(entry) = self.rows.get(&(version_id.clone(), key.clone())).cloned() {
                self.rows.insert(
                    (version_id, key),
                    CacheEntry {
                        inheritance_delete_marker: marker,
                        ..entry
                    },
                );
            }
        }

        self.fresh = true;
    }

    pub fn get(&self, version_id: &VersionId, key: &EntityKey) -> Option<&CacheEntry> {
        self.rows.get(&(version_id.clone(), key.clone()))
    }

    /// Rows the version owns, tombstones included.
    pub fn own_entries<'a>(
        &'a self,
        version_id: &VersionId,
    ) -> impl Iterator<Item = &'a CacheEntry> + 'a {
        let start = (version_id.clone(), EntityKey::default());
        let id = version_id.clone();
        self.rows
            .range(start..)
            .take_while(move |((owner, _), _)| *owner == id)
            .map(|(_, entry)| entry)
    }

    /// First row for `key` along the version's ancestry.
    pub fn visible_entry(
        &self,
        tree: &VersionTree,
        version_id: &VersionId,
        key: &EntityKey,
    ) -> Option<(&CacheEntry, usize, VersionId)> {
        tree.ancestry(version_id)
            .into_iter()
            .find_map(|(ancestor, depth)| {
                self.get(&ancestor, key)
                    .map(|entry| (entry, depth, ancestor.clone()))
            })
    }

    /// Resolved rows of a version: own rows first, then the closest
    /// ancestor's row for every key the version does not own.
    ///
    /// Tombstones are returned so callers can tell deletions from absence.
    pub fn visible_entries(
        &self,
        tree: &VersionTree,
        version_id: &VersionId,
        schema_key: Option<&str>,
    ) -> Vec<CacheEntry> {
        let mut chosen: BTreeMap<EntityKey, CacheEntry> = BTreeMap::new();
        for (ancestor, depth) in tree.ancestry(version_id) {
            for entry in self.own_entries(&ancestor) {
                if schema_key.map_or(false, |s| entry.row.schema_key != s) {
                    continue;
                }
                let key = entry.row.key();
                if chosen.contains_key(&key) {
                    continue;
                }
                let mut resolved = entry.clone();
                if depth > 0 {
                    resolved.row.version_id = version_id.clone();
                    resolved.row.inherited_from_version_id = Some(ancestor.clone());
                    resolved.inheritance_delete_marker = false;
                }
                chosen.insert(key, resolved);
            }
        }
        chosen.into_values().collect()
    }

    fn ancestor_is_live(&self, tree: &VersionTree, version_id: &VersionId, key: &EntityKey) -> bool {
        tree.ancestry(version_id)
            .into_iter()
            .skip(1)
            .find_map(|(ancestor, _)| self.get(&ancestor, key))
            .map_or(false, |entry| !entry.row.is_tombstone())
    }

    /// Apply a batch of written rows.
    ///
    /// For every deletion in a version with inheriting children, the
    /// version's last live row is copied into each child that has no row
    /// of its own before the tombstone lands. Returns the copied rows
    /// (with the child's version id). Schemas for which `is_pinned`
    /// returns true are never copied.
    pub fn apply_batch(
        &mut self,
        updates: Vec<StateRow>,
        tree: &VersionTree,
        is_pinned: impl Fn(&str) -> bool,
    ) -> Vec<StateRow> {
        let mut copy_downs = Vec::new();
        let mut copied: BTreeSet<CacheKey> = BTreeSet::new();
        let mut children: BTreeMap<VersionId, Vec<VersionId>> = BTreeMap::new();

        for mut update in updates {
            let key = update.key();
            let own_key = (update.version_id.clone(), key.clone());
            let mut marker = false;

            if update.is_tombstone() {
                let live = self
                    .visible_entry(tree, &update.version_id, &key)
                    .filter(|(entry, _, _)| !entry.row.is_tombstone())
                    .map(|(entry, _, _)| entry.row.clone());

                if let Some(live) = live {
                    marker = self.get(&update.version_id, &key).is_none();
                    if !is_pinned(&update.schema_key) {
                        let targets = children
                            .entry(update.version_id.clone())
                            .or_insert_with(|| tree.children_of(&update.version_id));
                        for child in targets.iter() {
                            let child_key = (child.clone(), key.clone());
                            if copied.contains(&child_key) || self.rows.contains_key(&child_key) {
                                continue;
                            }
                            let mut row = live.clone();
                            row.version_id = child.clone();
                            row.inherited_from_version_id = None;
                            self.rows.insert(
                                child_key.clone(),
                                CacheEntry {
                                    row: row.clone(),
                                    inheritance_delete_marker: false,
                                },
                            );
                            copied.insert(child_key);
                            copy_downs.push(row);
                        }
                    }
                }
            }

            if let Some(existing) = self.rows.get(&own_key) {
                if !existing.row.is_tombstone() {
                    update.created_at = existing.row.created_at;
                }
            }
            self.rows.insert(
                own_key,
                CacheEntry {
                    row: update,
                    inheritance_delete_marker: marker,
                },
            );
        }

        copy_downs
    }
}
