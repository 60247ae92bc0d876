//! `Lix`: an engine behind a lock, optionally backed by an image file.

use crate::deterministic::DeterministicConfig;
use crate::engine::Engine;
use crate::error::{LixError, Result};
use crate::file::FileDescriptor;
use crate::hooks::HookManager;
use crate::merge::MergeReport;
use crate::sql::QueryResult;
use crate::storage::{load_image, save_image, Database};
use crate::types::{Commit, CommitId, StoreStats, Version, VersionId};
use fs2::FileExt;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct LixConfig {
    /// Image file. `None` keeps the store in memory.
    pub path: Option<PathBuf>,

    /// Snapshot cache size (number of decoded snapshots).
    pub snapshot_cache_size: usize,

    /// Whether to create the image if it doesn't exist.
    pub create_if_missing: bool,

    /// Deterministic mode to apply on open.
    pub deterministic: Option<DeterministicConfig>,

    /// Id for a newly created store. Random when unset.
    pub lix_id: Option<String>,
}

impl Default for LixConfig {
    fn default() -> Self {
        Self {
            path: None,
            snapshot_cache_size: 1000,
            create_if_missing: true,
            deterministic: None,
            lix_id: None,
        }
    }
}

impl LixConfig {
    /// Default configuration backed by `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

/// A change-control store.
///
/// All access goes through one [`Engine`] guarded by a mutex. A file-backed
/// store holds an exclusive lock file next to its image for as long as it
/// is open, and is saved on [`close`](Lix::close) or drop.
pub struct Lix {
    config: LixConfig,

    engine: Mutex<Engine>,

    hooks: Arc<HookManager>,

    /// Lock file for exclusive access.
    _lock_file: Option<File>,

    closed: bool,
}

impl Lix {
    /// Open the store described by `config`.
    pub fn open(config: LixConfig) -> Result<Self> {
        let Some(path) = config.path.clone() else {
            let engine = Engine::in_memory(&config)?;
            return Ok(Self::wrap(config, engine, None));
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                if !config.create_if_missing {
                    return Err(LixError::NotInitialized);
                }
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists();
        if !exists && !config.create_if_missing {
            return Err(LixError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&path)?;
        let db = if exists { load_image(&path)? } else { Database::new() };
        let engine = Engine::open(db, &config)?;
        if !exists {
            save_image(&path, &engine.db)?;
        }
        info!(path = %path.display(), created = !exists, "opened store");

        Ok(Self::wrap(config, engine, Some(lock_file)))
    }

    /// A fresh in-memory store.
    pub fn in_memory() -> Result<Self> {
        Self::open(LixConfig::default())
    }

    fn wrap(config: LixConfig, engine: Engine, lock_file: Option<File>) -> Self {
        let hooks = engine.hooks().clone();
        Self {
            config,
            engine: Mutex::new(engine),
            hooks,
            _lock_file: lock_file,
            closed: false,
        }
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_file = File::create(PathBuf::from(lock_path))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| LixError::Locked)?;

        Ok(lock_file)
    }

    pub fn path(&self) -> Option<&Path> {
        self.config.path.as_deref()
    }

    pub fn config(&self) -> &LixConfig {
        &self.config
    }

    /// Exclusive access to the engine.
    pub fn engine(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock()
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    /// Run several operations in one transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        self.engine.lock().transaction(f)
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.engine.lock().execute(sql, params)
    }

    pub fn create_checkpoint(&self) -> Result<Commit> {
        self.engine.lock().create_checkpoint()
    }

    pub fn transition(&self, to: &CommitId) -> Result<Commit> {
        self.engine.lock().transition(to)
    }

    pub fn active_version(&self) -> Result<Version> {
        self.engine.lock().active_version()
    }

    pub fn switch_version(&self, version_id: &VersionId) -> Result<()> {
        self.engine.lock().switch_version(version_id)
    }

    pub fn write_file(&self, path: &str, data: &[u8], metadata: Option<Value>) -> Result<FileDescriptor> {
        self.engine.lock().write_file(path, data, metadata)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.engine.lock().read_file(path)
    }

    pub fn stats(&self) -> StoreStats {
        self.engine.lock().stats()
    }

    /// An independent copy of this store, opened with `config`.
    ///
    /// A file-backed copy needs a path of its own.
    pub fn fork(&self, config: LixConfig) -> Result<Lix> {
        if config.path.is_some() && config.path == self.config.path {
            return Err(LixError::InvalidOperation(
                "a fork cannot share the image file of its source".to_string(),
            ));
        }
        let engine = self.engine.lock().fork(&config)?;
        let lock_file = match &config.path {
            Some(path) => {
                let lock = Self::acquire_lock(path)?;
                save_image(path, &engine.db)?;
                Some(lock)
            }
            None => None,
        };
        Ok(Self::wrap(config, engine, lock_file))
    }

    /// Merge `source`'s active version into this store's active version.
    pub fn merge_from(&self, source: &Lix) -> Result<MergeReport> {
        if std::ptr::eq(self, source) {
            return Err(LixError::InvalidOperation(
                "a store cannot be merged into itself".to_string(),
            ));
        }
        let source = source.engine.lock();
        self.engine.lock().merge_from(&source)
    }

    /// Write the store image. A no-op for in-memory stores.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config.path else {
            return Ok(());
        };
        let engine = self.engine.lock();
        save_image(path, &engine.db)?;
        info!(path = %path.display(), changes = engine.db.changes.len(), "saved store");
        Ok(())
    }

    /// Flush deterministic state and save.
    pub fn close(mut self) -> Result<()> {
        self.engine.lock().close()?;
        self.save()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for Lix {
    fn drop(&mut self) {
        if self.closed || self.config.path.is_none() {
            return;
        }
        // Best-effort save on drop
        let flushed = self.engine.lock().close();
        if let Err(e) = flushed.and_then(|_| self.save()) {
            warn!(error = %e, "failed to save store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> LixConfig {
        LixConfig::at(dir.path().join("store.lix"))
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let lix_id;
        {
            let lix = Lix::open(config_in(&dir)).unwrap();
            lix.execute("INSERT INTO lix_key_value (key, value) VALUES ('k', 'v')", &[])
                .unwrap();
            lix_id = lix.engine().lix_id().map(str::to_string);
            lix.close().unwrap();
        }

        let lix = Lix::open(config_in(&dir)).unwrap();
        assert_eq!(lix.engine().lix_id().map(str::to_string), lix_id);
        let result = lix.execute("SELECT value FROM lix_key_value WHERE key = 'k'", &[]).unwrap();
        assert_eq!(result.rows, vec![vec![json!("v")]]);
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let _lix = Lix::open(config_in(&dir)).unwrap();

        let result = Lix::open(config_in(&dir));
        assert!(matches!(result, Err(LixError::Locked)));
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let config = LixConfig {
            create_if_missing: false,
            ..config_in(&dir)
        };
        assert!(matches!(Lix::open(config), Err(LixError::NotInitialized)));
    }

    #[test]
    fn test_drop_saves() {
        let dir = TempDir::new().unwrap();
        {
            let lix = Lix::open(config_in(&dir)).unwrap();
            lix.execute("INSERT INTO lix_key_value (key, value) VALUES ('k', 1)", &[])
                .unwrap();
        }
        let lix = Lix::open(config_in(&dir)).unwrap();
        let result = lix.execute("SELECT count(*) AS n FROM lix_key_value", &[]).unwrap();
        assert_eq!(result.get(0, "n"), Some(&json!(1)));
    }

    #[test]
    fn test_merge_into_self_rejected() {
        let lix = Lix::in_memory().unwrap();
        assert!(matches!(lix.merge_from(&lix), Err(LixError::InvalidOperation(_))));
    }
}
