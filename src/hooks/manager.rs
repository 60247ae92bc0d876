//! Dispatch of commit events to callbacks and channel subscribers.

use super::types::{
    ChangeSummary, DropReason, HookId, LixEvent, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId,
};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type StateCommitHook = Arc<dyn Fn(&[ChangeSummary]) + Send + Sync>;

struct Subscription {
    config: SubscriptionConfig,
    sender: Sender<LixEvent>,
}

impl Subscription {
    /// False when the buffer is full or the receiver is gone.
    fn try_send(&self, event: LixEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Registered hooks and subscriptions.
///
/// Events are emitted after a transaction has landed, never for rolled
/// back work.
pub struct HookManager {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    hooks: RwLock<HashMap<HookId, StateCommitHook>>,
    next_id: AtomicU64,
}

impl HookManager {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            hooks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a bounded channel of commit events.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);
        self.subscriptions
            .write()
            .insert(id, Subscription { config, sender });
        SubscriptionHandle { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(sub) = self.subscriptions.write().remove(&id) {
            let _ = sub.sender.try_send(LixEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Run `hook` after every committed transaction that changed state.
    pub fn on_state_commit(&self, hook: impl Fn(&[ChangeSummary]) + Send + Sync + 'static) -> HookId {
        let id = HookId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.hooks.write().insert(id, Arc::new(hook));
        id
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        self.hooks.write().remove(&id).is_some()
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.read().len()
    }

    pub(crate) fn emit_state_commit(&self, changes: Vec<ChangeSummary>) {
        // Snapshot the callbacks so a hook may register or remove hooks.
        let hooks: Vec<StateCommitHook> = self.hooks.read().values().cloned().collect();
        for hook in hooks {
            hook(&changes);
        }

        let mut to_remove = Vec::new();
        {
            let subs = self.subscriptions.read();
            for (id, sub) in subs.iter() {
                let matching: Vec<ChangeSummary> = changes
                    .iter()
                    .filter(|change| sub.config.filter.matches(change))
                    .cloned()
                    .collect();
                if matching.is_empty() {
                    continue;
                }
                if !sub.try_send(LixEvent::StateCommit { changes: matching }) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                if let Some(sub) = subs.remove(&id) {
                    debug!(subscription = id.0, "dropping slow subscriber");
                    let _ = sub.sender.try_send(LixEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::SubscriptionFilter;
    use crate::types::{ChangeId, VersionId};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn summary(schema: &str) -> ChangeSummary {
        ChangeSummary {
            change_id: ChangeId::from("c"),
            entity_id: "e".into(),
            schema_key: schema.into(),
            file_id: "lix".into(),
            version_id: VersionId::from("main"),
            deleted: false,
        }
    }

    #[test]
    fn test_hooks_run_and_can_be_removed() {
        let manager = HookManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = manager.on_state_commit(move |changes| {
            counter.fetch_add(changes.len(), Ordering::SeqCst);
        });

        manager.emit_state_commit(vec![summary("a"), summary("b")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(manager.remove_hook(id));
        manager.emit_state_commit(vec![summary("a")]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_filter_by_schema() {
        let manager = HookManager::new();
        let handle = manager.subscribe(SubscriptionConfig {
            filter: SubscriptionFilter::schemas(vec!["wanted".into()]),
            ..Default::default()
        });

        manager.emit_state_commit(vec![summary("other")]);
        assert!(handle.recv_timeout(Duration::from_millis(20)).is_err());

        manager.emit_state_commit(vec![summary("wanted"), summary("other")]);
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            LixEvent::StateCommit { changes } => assert_eq!(changes.len(), 1),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = HookManager::new();
        let handle = manager.subscribe(SubscriptionConfig {
            buffer_size: 2,
            ..Default::default()
        });
        for _ in 0..10 {
            manager.emit_state_commit(vec![summary("a")]);
        }
        assert_eq!(manager.subscription_count(), 0);
        drop(handle);
    }

    #[test]
    fn test_unsubscribe_notifies() {
        let manager = HookManager::new();
        let handle = manager.subscribe(SubscriptionConfig::default());
        manager.unsubscribe(handle.id);
        match handle.try_recv().unwrap() {
            LixEvent::Dropped { reason } => assert_eq!(reason, DropReason::Unsubscribed),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
