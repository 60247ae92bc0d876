//! Post-commit hooks and event subscriptions.
//!
//! Two ways to observe committed state:
//! - `on_state_commit` callbacks, run synchronously on the committing thread
//! - channel subscriptions with bounded buffers; a subscriber that falls
//!   behind is dropped with [`DropReason::BufferOverflow`]
//!
//! # Example
//!
//! ```ignore
//! let handle = lix.hooks().subscribe(SubscriptionConfig::default());
//! while let Ok(LixEvent::StateCommit { changes }) = handle.recv() {
//!     println!("{} changes landed", changes.len());
//! }
//! ```

mod manager;
mod types;

pub use manager::HookManager;
pub use types::{
    ChangeSummary, DropReason, HookId, LixEvent, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId,
};
