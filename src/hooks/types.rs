//! Hook and subscription types.

use crate::types::{ChangeId, StateRow, VersionId};
use serde::{Deserialize, Serialize};

/// Configuration for a channel subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before the subscriber is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

/// Which committed changes a subscriber sees.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only these schemas (None = all).
    pub schema_keys: Option<Vec<String>>,

    /// Only changes written to these versions (None = all).
    pub version_ids: Option<Vec<VersionId>>,
}

impl SubscriptionFilter {
    pub fn schemas(schema_keys: Vec<String>) -> Self {
        Self {
            schema_keys: Some(schema_keys),
            ..Default::default()
        }
    }

    pub fn versions(version_ids: Vec<VersionId>) -> Self {
        Self {
            version_ids: Some(version_ids),
            ..Default::default()
        }
    }

    pub(crate) fn matches(&self, change: &ChangeSummary) -> bool {
        if let Some(keys) = &self.schema_keys {
            if !keys.iter().any(|key| *key == change.schema_key) {
                return false;
            }
        }
        if let Some(versions) = &self.version_ids {
            if !versions.contains(&change.version_id) {
                return false;
            }
        }
        true
    }
}

/// Events delivered to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LixEvent {
    /// A transaction committed these state changes.
    StateCommit { changes: Vec<ChangeSummary> },

    /// The subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// One committed state change, without its content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub deleted: bool,
}

impl ChangeSummary {
    pub fn from_row(row: &StateRow) -> Self {
        Self {
            change_id: row.change_id.clone(),
            entity_id: row.entity_id.clone(),
            schema_key: row.schema_key.clone(),
            file_id: row.file_id.clone(),
            version_id: row.version_id.clone(),
            deleted: row.is_tombstone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle of a registered `on_state_commit` callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HookId(pub u64);

/// Receiving end of a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<LixEvent>,
}

impl SubscriptionHandle {
    pub fn recv(&self) -> Result<LixEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<LixEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<LixEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
