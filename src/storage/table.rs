//! Journaled in-memory table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeBounds;

/// Ordered table with an undo journal.
///
/// While a journal is open every mutation records the previous value of the
/// key, so a rollback restores the exact pre-transaction rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Serialize, V: Serialize",
    deserialize = "K: Ord + Deserialize<'de>, V: Deserialize<'de>"
))]
pub struct Table<K: Ord, V> {
    rows: BTreeMap<K, V>,
    #[serde(skip)]
    journal: Option<Vec<(K, Option<V>)>>,
}

impl<K: Ord, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            journal: None,
        }
    }
}

impl<K: Ord + Clone, V: Clone> Table<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.rows.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.rows.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.rows.values()
    }

    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl Iterator<Item = (&K, &V)> {
        self.rows.range(range)
    }

    /// Insert or replace a row, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.rows.insert(key.clone(), value);
        if let Some(journal) = self.journal.as_mut() {
            journal.push((key, previous.clone()));
        }
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.rows.remove(key);
        if previous.is_some() {
            if let Some(journal) = self.journal.as_mut() {
                journal.push((key.clone(), previous.clone()));
            }
        }
        previous
    }

    /// Remove every row. Journaled like individual removes.
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.rows.keys().cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    pub fn begin(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    /// Keys written since `begin` that still hold a row.
    pub fn touched_keys(&self) -> Vec<K> {
        let Some(journal) = self.journal.as_ref() else {
            return Vec::new();
        };
        let mut keys: Vec<K> = journal
            .iter()
            .map(|(key, _)| key.clone())
            .filter(|key| self.rows.contains_key(key))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Close the journal, keeping all writes.
    pub fn commit(&mut self) {
        self.journal = None;
    }

    /// Undo every write since `begin`, newest first.
    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (key, previous) in journal.into_iter().rev() {
            match previous {
                Some(value) => {
                    self.rows.insert(key, value);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
    }
}
