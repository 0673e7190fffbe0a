use qsync_utils_rs::ThreadToken;
use strum::Display;

use super::sync_state::SyncState;
use super::wait_queue::WaitQueue;
use crate::error::{SyncError, SyncResult};

/// Result of a shared-mode acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SharedAcquire {
  Failed,
  /// Acquired, but no further shared acquire can succeed right now.
  Acquired,
  /// Acquired, and subsequent shared waiters may succeed as well.
  AcquiredWithSurplus,
}

impl SharedAcquire {
  #[inline]
  pub fn is_acquired(self) -> bool {
    self != SharedAcquire::Failed
  }
}

/// State and queue a policy decides over.
pub struct SyncCore {
  state: SyncState,
  queue: WaitQueue,
}

impl SyncCore {
  pub(crate) fn new() -> Self {
    Self {
      state: SyncState::new(),
      queue: WaitQueue::new(),
    }
  }

  #[inline]
  pub fn state(&self) -> &SyncState {
    &self.state
  }

  #[inline]
  pub(crate) fn queue(&self) -> &WaitQueue {
    &self.queue
  }

  /// Whether another thread has been queued longer than the calling thread.
  ///
  /// Fair policies consult this before claiming a free state.
  pub fn has_queued_predecessors(&self) -> bool {
    self.queue.has_queued_predecessors(ThreadToken::current())
  }

  pub fn has_queued_threads(&self) -> bool {
    self.queue.has_queued_threads()
  }
}

/// Acquire/release predicates plugged into a
/// [`QueuedSynchronizer`](super::QueuedSynchronizer).
///
/// A policy only decides whether the state may change; queuing, parking and
/// waking are handled by the synchronizer. Exclusive policies implement
/// `try_acquire`/`try_release`, shared ones `try_acquire_shared`/`try_release_shared`.
/// The unimplemented mode reports [`SyncError::Unsupported`].
pub trait SyncPolicy: Send + Sync {
  fn try_acquire(&self, _core: &SyncCore, _amount: u32) -> SyncResult<bool> {
    Err(SyncError::of_unsupported("try_acquire"))
  }

  /// Returns `true` once the state is fully released and waiters may proceed.
  fn try_release(&self, _core: &SyncCore, _amount: u32) -> SyncResult<bool> {
    Err(SyncError::of_unsupported("try_release"))
  }

  fn try_acquire_shared(&self, _core: &SyncCore, _amount: u32) -> SyncResult<SharedAcquire> {
    Err(SyncError::of_unsupported("try_acquire_shared"))
  }

  fn try_release_shared(&self, _core: &SyncCore, _amount: u32) -> SyncResult<bool> {
    Err(SyncError::of_unsupported("try_release_shared"))
  }

  /// Whether the calling thread holds the state exclusively. Conditions require it.
  fn is_held_exclusively(&self, core: &SyncCore) -> bool {
    core.state().exclusive_owner() == Some(ThreadToken::current())
  }
}
