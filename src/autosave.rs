//! Background persistence driven by state commits.
//!
//! Every committed transaction requests a save. Requests land in a channel
//! with room for one: while a save is running, any number of further
//! commits collapse into a single follow-up save.

use crate::error::{LixError, Result};
use crate::hooks::HookId;
use crate::lix::Lix;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Counters from an autosave worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoSaveStats {
    /// Saves that completed.
    pub saves: usize,
    /// Saves that returned an error.
    pub failed: usize,
}

/// Handle to an autosave worker. Drop or call `stop()` to shut down.
///
/// Shutting down performs one last save if a request is still pending.
pub struct AutoSave {
    lix: Arc<Lix>,
    hook: HookId,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<AutoSaveStats>>,
}

impl AutoSave {
    /// Start saving `lix` after every committed transaction.
    pub fn start(lix: Arc<Lix>) -> Result<Self> {
        if lix.path().is_none() {
            return Err(LixError::InvalidOperation(
                "autosave needs a file-backed store".to_string(),
            ));
        }

        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let hook = lix.hooks().on_state_commit(move |_| {
            // Full means a save is already pending and will see this commit.
            let _ = trigger_tx.try_send(());
        });

        let worker = lix.clone();
        let handle = std::thread::Builder::new()
            .name("lix-autosave".to_string())
            .spawn(move || run(&worker, &trigger_rx, &stop_rx))?;

        Ok(Self {
            lix,
            hook,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for it to finish. Returns stats.
    pub fn stop(mut self) -> AutoSaveStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> AutoSaveStats {
        self.lix.hooks().remove_hook(self.hook);
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => AutoSaveStats::default(),
        }
    }
}

impl Drop for AutoSave {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn run(lix: &Lix, trigger_rx: &Receiver<()>, stop_rx: &Receiver<()>) -> AutoSaveStats {
    let mut stats = AutoSaveStats::default();
    loop {
        select! {
            recv(trigger_rx) -> msg => {
                if msg.is_err() {
                    break;
                }
                save(lix, &mut stats);
            }
            recv(stop_rx) -> _ => {
                if trigger_rx.try_recv().is_ok() {
                    save(lix, &mut stats);
                }
                break;
            }
        }
    }
    debug!(saves = stats.saves, failed = stats.failed, "autosave stopped");
    stats
}

fn save(lix: &Lix, stats: &mut AutoSaveStats) {
    match lix.save() {
        Ok(()) => stats.saves += 1,
        Err(e) => {
            stats.failed += 1;
            warn!(error = %e, "autosave failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lix::LixConfig;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_autosave_requires_path() {
        let lix = Arc::new(Lix::in_memory().unwrap());
        assert!(matches!(AutoSave::start(lix), Err(LixError::InvalidOperation(_))));
    }

    #[test]
    fn test_commits_coalesce_into_fewer_saves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auto.lix");
        let lix = Arc::new(Lix::open(LixConfig::at(&path)).unwrap());
        let autosave = AutoSave::start(lix.clone()).unwrap();

        for i in 0..50 {
            lix.execute(
                "INSERT INTO lix_key_value (key, value) VALUES (?, ?)",
                &[json!(format!("k{i}")), json!(i)],
            )
            .unwrap();
        }

        let stats = autosave.stop();
        assert!(stats.saves >= 1);
        assert!(stats.saves <= 50);
        assert_eq!(stats.failed, 0);
        assert_eq!(lix.hooks().hook_count(), 0);

        // The image on disk already holds every write.
        let saved = crate::storage::load_image(&path).unwrap();
        assert_eq!(saved.changes.len(), lix.engine().database().changes.len());
    }
}
