//! Content-addressed snapshot storage.

use crate::error::{LixError, Result};
use crate::storage::database::Database;
use crate::types::{Snapshot, SnapshotId};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Snapshot store over the `snapshot` table.
///
/// Rows hold canonical JSON text addressed by its SHA-256. Parsed contents
/// of recently read snapshots are kept in an LRU cache.
pub struct SnapshotStore {
    cache: Mutex<LruCache<SnapshotId, Arc<Value>>>,
}

impl SnapshotStore {
    pub fn new(cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Make sure the `no-content` singleton row exists.
    pub fn ensure_no_content(db: &mut Database) {
        let id = SnapshotId::no_content();
        if !db.snapshots.contains_key(&id) {
            db.snapshots.insert(id.clone(), Snapshot { id, content: None });
        }
    }

    /// Store content, returning its id.
    ///
    /// `None` maps to the `no-content` singleton and never creates a row.
    /// Existing content is deduplicated.
    pub fn put(&self, db: &mut Database, content: Option<&Value>) -> Result<SnapshotId> {
        let Some(content) = content else {
            return Ok(SnapshotId::no_content());
        };

        if !content.is_object() {
            return Err(LixError::SchemaValidation {
                schema_key: "snapshot".to_string(),
                message: format!("snapshot content must be a JSON object, got {}", kind_of(content)),
            });
        }

        let canonical = serde_json::to_string(content)?;
        let id = SnapshotId::for_content(&canonical);

        if !db.snapshots.contains_key(&id) {
            db.snapshots.insert(
                id.clone(),
                Snapshot {
                    id: id.clone(),
                    content: Some(canonical),
                },
            );
        }

        self.cache.lock().put(id.clone(), Arc::new(content.clone()));
        Ok(id)
    }

    /// Parsed content of a snapshot. `Ok(None)` for the tombstone.
    pub fn get(&self, db: &Database, id: &SnapshotId) -> Result<Option<Arc<Value>>> {
        if id.is_no_content() {
            return Ok(None);
        }

        if let Some(cached) = self.cache.lock().get(id).cloned() {
            return Ok(Some(cached));
        }

        let row = db
            .snapshots
            .get(id)
            .ok_or_else(|| LixError::Deserialization(format!("missing snapshot {id}")))?;

        let Some(text) = row.content.as_ref() else {
            return Ok(None);
        };

        let value: Value = serde_json::from_str(text)
            .map_err(|e| LixError::Deserialization(e.to_string()))?;
        let value = Arc::new(value);
        self.cache.lock().put(id.clone(), Arc::clone(&value));
        Ok(Some(value))
    }

    /// Owned copy of the content.
    pub fn content(&self, db: &Database, id: &SnapshotId) -> Result<Option<Value>> {
        Ok(self.get(db, id)?.map(|value| (*value).clone()))
    }

    /// Drop cached parses (after a rollback may have removed rows).
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_store_and_retrieve() {
        let mut db = Database::new();
        let store = SnapshotStore::new(10);

        let id = store.put(&mut db, Some(&json!({"a": 1}))).unwrap();
        store.clear_cache();
        let content = store.get(&db, &id).unwrap().unwrap();
        assert_eq!(*content, json!({"a": 1}));
    }

    #[test]
    fn test_deduplication() {
        let mut db = Database::new();
        let store = SnapshotStore::new(10);

        let a = store.put(&mut db, Some(&json!({"x": "y", "n": 2}))).unwrap();
        let b = store.put(&mut db, Some(&json!({"n": 2, "x": "y"}))).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.snapshots.len(), 1);
    }

    #[test]
    fn test_tombstone_is_singleton() {
        let mut db = Database::new();
        SnapshotStore::ensure_no_content(&mut db);
        let store = SnapshotStore::new(10);

        for _ in 0..5 {
            let id = store.put(&mut db, None).unwrap();
            assert!(id.is_no_content());
        }
        SnapshotStore::ensure_no_content(&mut db);

        let nulls = db.snapshots.values().filter(|s| s.content.is_none()).count();
        assert_eq!(nulls, 1);
        assert!(store.get(&db, &SnapshotId::no_content()).unwrap().is_none());
    }

    #[test]
    fn test_rejects_non_object_content() {
        let mut db = Database::new();
        let store = SnapshotStore::new(10);

        for bad in [json!("{\"a\":1}"), json!([1, 2]), json!(3)] {
            let err = store.put(&mut db, Some(&bad)).unwrap_err();
            assert!(matches!(err, LixError::SchemaValidation { .. }));
        }
        assert!(db.snapshots.is_empty());
    }
}
