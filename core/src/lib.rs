//! Queued synchronizers: a FIFO wait queue with pluggable acquire policies,
//! condition variables and a reentrant lock built on top of them.

mod condition;
mod config;
mod config_option;
mod error;
mod reentrant_lock;
mod synchronizer;

pub use condition::ConditionObject;
pub use config::Config;
pub use config_option::ConfigOption;
pub use error::{SyncError, SyncResult};
pub use reentrant_lock::{Condition, Fairness, ReentrantLock, ReentrantLockGuard, ReentrantPolicy};
pub use synchronizer::{AcquireMode, QueuedSynchronizer, SharedAcquire, SyncCore, SyncPolicy, SyncState, WaitStatus};

pub use qsync_utils_rs::{Deadline, ThreadParker, ThreadToken};
