//! The single-writer core.
//!
//! `Engine` owns the persistent tables, the snapshot cache, the state
//! cache and the deterministic state. Every mutation runs inside
//! [`Engine::transaction`]; nested calls fold into the open transaction.

use crate::deterministic::{Deterministic, DeterministicConfig, LIX_ID_KEY};
use crate::error::{LixError, Result};
use crate::hooks::{ChangeSummary, HookManager};
use crate::lix::LixConfig;
use crate::plugin::{Plugin, PluginRegistry};
use crate::schema::{builtin_schemas, LixSchema, SchemaRegistry, GLOBAL_VERSION_ID};
use crate::state::StateCache;
use crate::storage::{Database, SnapshotStore};
use crate::types::{StateRow, StoreStats, Timestamp, VersionId};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Untracked key holding the active version id.
pub const ACTIVE_VERSION_KEY: &str = "lix_active_version";

/// Id of the version created at bootstrap and active by default.
pub const MAIN_VERSION_ID: &str = "main";

pub struct Engine {
    pub(crate) db: Database,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) cache: StateCache,
    pub(crate) deterministic: Deterministic,
    pub(crate) plugins: PluginRegistry,
    pub(crate) hooks: Arc<HookManager>,
    /// State rows written in the open transaction, applied to the cache as one batch.
    pending_cache: Vec<StateRow>,
    pending_events: Vec<ChangeSummary>,
}

impl Engine {
    /// Wrap a loaded database, bootstrapping it if empty.
    pub fn open(db: Database, config: &LixConfig) -> Result<Self> {
        let mut engine = Self {
            db,
            snapshots: SnapshotStore::new(config.snapshot_cache_size),
            cache: StateCache::new(),
            deterministic: Deterministic::new(),
            plugins: PluginRegistry::new(),
            hooks: Arc::new(HookManager::new()),
            pending_cache: Vec::new(),
            pending_events: Vec::new(),
        };

        if engine.db.versions.is_empty() {
            engine.bootstrap(config)?;
        } else if let Some(mode) = &config.deterministic {
            let mode = mode.clone();
            engine.transaction(|engine| {
                engine.deterministic.set_mode(&mut engine.db, mode);
                Ok(())
            })?;
        }

        Ok(engine)
    }

    /// An engine over a fresh in-memory database.
    pub fn in_memory(config: &LixConfig) -> Result<Self> {
        Self::open(Database::new(), config)
    }

    fn bootstrap(&mut self, config: &LixConfig) -> Result<()> {
        self.transaction(|engine| {
            SnapshotStore::ensure_no_content(&mut engine.db);

            if let Some(mode) = &config.deterministic {
                engine
                    .deterministic
                    .set_mode(&mut engine.db, mode.clone());
            }

            let lix_id = match &config.lix_id {
                Some(id) => id.clone(),
                None => engine.uuid(),
            };
            engine
                .db
                .key_value
                .insert(LIX_ID_KEY.to_string(), Value::String(lix_id.clone()));

            engine.create_label_internal(crate::commit::CHECKPOINT_LABEL)?;

            let root_set = engine.new_change_set(true);
            let root = engine.new_commit(&root_set.id, &[])?;
            engine.label_commit_as_checkpoint(&root.id)?;

            engine.create_root_version(VersionId::from(GLOBAL_VERSION_ID), "global", &root.id, None)?;
            engine.create_root_version(
                VersionId::from(MAIN_VERSION_ID),
                "main",
                &root.id,
                Some(VersionId::from(GLOBAL_VERSION_ID)),
            )?;

            engine.set_untracked(ACTIVE_VERSION_KEY, json!(MAIN_VERSION_ID));
            info!(lix_id = %lix_id, "bootstrapped store");
            Ok(())
        })
    }

    // --- Transactions ---

    /// Run `f` inside a transaction.
    ///
    /// If a transaction is already open, `f` joins it and the outermost call
    /// decides commit or rollback. Any error rolls back every write.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        if self.db.transaction_open() {
            return f(self);
        }

        self.begin_transaction();
        let outcome = self.ensure_cache_fresh().and_then(|_| f(self));
        match outcome {
            Ok(value) => match self.commit_transaction() {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.rollback_transaction();
                    Err(e)
                }
            },
            Err(e) => {
                self.rollback_transaction();
                Err(e)
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.db.transaction_open()
    }

    fn begin_transaction(&mut self) {
        self.db.begin();
        self.cache.begin();
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.flush_cache_batch()?;
        self.deterministic.flush(&mut self.db);
        self.db.validate_deferred()?;

        self.cache.commit();
        self.db.commit();

        let events = std::mem::take(&mut self.pending_events);
        debug!(changes = events.len(), "transaction committed");
        if !events.is_empty() {
            self.hooks.emit_state_commit(events);
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) {
        self.db.rollback();
        self.cache.rollback();
        self.pending_cache.clear();
        self.pending_events.clear();
        self.deterministic.invalidate();
        self.snapshots.clear_cache();
        debug!("transaction rolled back");
    }

    // --- State staging ---

    /// Queue a written row for the cache batch and the commit event.
    pub(crate) fn stage_state(&mut self, row: StateRow) {
        self.pending_events.push(ChangeSummary::from_row(&row));
        self.pending_cache.push(row);
    }

    /// Apply the queued rows to the cache, copying deleted parent state
    /// down into inheriting versions.
    pub(crate) fn flush_cache_batch(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.pending_cache);
        if batch.is_empty() || !self.cache.is_fresh() {
            return Ok(());
        }

        let tree = crate::version::VersionTree::from_db(&self.db);
        let pinned: Vec<String> = self
            .known_schemas()
            .into_iter()
            .filter(|schema| schema.pinned_version().is_some())
            .map(|schema| schema.key)
            .collect();
        let copy_downs = self
            .cache
            .apply_batch(batch, &tree, |schema_key| pinned.iter().any(|p| p == schema_key));

        if !copy_downs.is_empty() {
            debug!(rows = copy_downs.len(), "copied deleted state into inheriting versions");
        }
        for row in copy_downs {
            let version = self.version(&row.version_id)?;
            let change = self
                .db
                .changes
                .get(&row.change_id)
                .cloned()
                .ok_or_else(|| LixError::ChangeNotFound(row.change_id.to_string()))?;
            self.attach_to_working(&version, &change)?;
        }
        Ok(())
    }

    /// Rebuild the cache from the change log if it is stale.
    pub(crate) fn ensure_cache_fresh(&mut self) -> Result<()> {
        if self.cache.is_fresh() {
            return self.flush_cache_batch();
        }
        self.pending_cache.clear();
        let materialized = crate::state::materialize(&self.db, &self.snapshots)?;
        self.cache.rebuild(&materialized);
        Ok(())
    }

    /// Force the next read to rebuild the cache.
    pub(crate) fn invalidate_cache(&mut self) -> Result<()> {
        self.flush_cache_batch()?;
        self.cache.mark_stale();
        Ok(())
    }

    // --- Deterministic values ---

    /// Next timestamp (logical in deterministic mode).
    pub fn timestamp(&mut self) -> Timestamp {
        self.deterministic.timestamp(&self.db)
    }

    /// Next id (counter-derived in deterministic mode, UUIDv7 otherwise).
    pub fn uuid(&mut self) -> String {
        self.deterministic.uuid(&self.db)
    }

    /// Next random float in [0, 1).
    pub fn random(&mut self) -> f64 {
        self.deterministic.random(&self.db)
    }

    pub fn set_deterministic_mode(&mut self, config: DeterministicConfig) -> Result<()> {
        self.transaction(|engine| {
            engine.deterministic.set_mode(&mut engine.db, config);
            Ok(())
        })
    }

    pub fn deterministic_mode(&mut self) -> bool {
        self.deterministic.is_enabled(&self.db)
    }

    /// Persist dirty deterministic state.
    pub fn close(&mut self) -> Result<()> {
        if !self.deterministic.is_dirty() {
            return Ok(());
        }
        self.transaction(|_| Ok(()))
    }

    // --- Untracked key-values ---

    pub fn get_untracked(&self, key: &str) -> Option<&Value> {
        self.db.key_value.get(&key.to_string())
    }

    pub(crate) fn set_untracked(&mut self, key: &str, value: Value) {
        self.db.key_value.insert(key.to_string(), value);
    }

    /// The store's unique id.
    pub fn lix_id(&self) -> Option<&str> {
        self.get_untracked(LIX_ID_KEY).and_then(Value::as_str)
    }

    // --- Plugins and schemas ---

    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        for definition in plugin.schemas() {
            LixSchema::from_definition(definition)?;
        }
        info!(plugin = plugin.key(), "registered plugin");
        self.plugins.register(plugin);
        Ok(())
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Builtin and plugin schemas. Stored schemas are not included.
    pub(crate) fn known_schemas(&self) -> Vec<LixSchema> {
        let mut schemas = builtin_schemas();
        schemas.extend(
            self.plugins
                .iter()
                .flat_map(|plugin| plugin.schemas())
                .filter_map(|definition| LixSchema::from_definition(definition).ok()),
        );
        schemas
    }

    /// Every schema visible to the active version, read fresh.
    pub fn schema_registry(&mut self) -> Result<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        for schema in self.known_schemas() {
            registry.insert(schema);
        }
        for schema in self.stored_schemas()? {
            registry.insert(schema);
        }
        Ok(registry)
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            change_count: self.db.changes.len(),
            snapshot_count: self.db.snapshots.len(),
            change_set_count: self.db.change_sets.len(),
            commit_count: self.db.commits.len(),
            version_count: self.db.versions.len(),
            cache_row_count: self.cache.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewChange;

    fn engine() -> Engine {
        Engine::in_memory(&LixConfig::default()).unwrap()
    }

    #[test]
    fn test_bootstrap_creates_global_and_main() {
        let engine = engine();
        assert!(engine.db.versions.contains_key(&VersionId::from("global")));
        let main = engine.db.versions.get(&VersionId::from("main")).unwrap();
        assert_eq!(main.inherits_from_version_id, Some(VersionId::from("global")));
        assert!(engine.lix_id().is_some());
        assert_eq!(
            engine.get_untracked(ACTIVE_VERSION_KEY),
            Some(&json!("main"))
        );
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let mut engine = engine();
        let before = engine.db.changes.len();
        let result: Result<()> = engine.transaction(|engine| {
            engine.create_change(NewChange::entity("a", "lix_key_value", Some(json!({"key": "a", "value": 1}))))?;
            Err(LixError::InvalidOperation("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(engine.db.changes.len(), before);
        assert!(engine.pending_events.is_empty());
    }

    #[test]
    fn test_nested_transactions_fold() {
        let mut engine = engine();
        engine
            .transaction(|engine| {
                assert!(engine.in_transaction());
                engine.transaction(|inner| {
                    inner.create_change(NewChange::entity(
                        "x",
                        "lix_key_value",
                        Some(json!({"key": "x", "value": true})),
                    ))
                })?;
                assert!(engine.in_transaction());
                Ok(())
            })
            .unwrap();
        assert!(!engine.in_transaction());
    }

    #[test]
    fn test_deterministic_bootstrap_is_reproducible() {
        let config = LixConfig {
            deterministic: Some(DeterministicConfig::seeded("fixed")),
            lix_id: Some("store-1".into()),
            ..LixConfig::default()
        };
        let a = Engine::in_memory(&config).unwrap();
        let b = Engine::in_memory(&config).unwrap();
        let ids_a: Vec<_> = a.db.commits.keys().cloned().collect();
        let ids_b: Vec<_> = b.db.commits.keys().cloned().collect();
        assert_eq!(ids_a, ids_b);
    }
}
