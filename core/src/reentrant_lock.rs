use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use qsync_utils_rs::{Deadline, ThreadToken};
use static_assertions::{assert_impl_all, assert_not_impl_any};
use strum::Display;

use crate::condition::ConditionObject;
use crate::error::{SyncError, SyncResult};
use crate::synchronizer::{QueuedSynchronizer, SyncCore, SyncPolicy};
use crate::{Config, ConfigOption};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Fairness {
  /// Free locks go to the longest-waiting thread.
  Fair,
  /// A thread arriving while the lock is free may take it ahead of queued threads.
  NonFair,
}

/// Hold-count policy of [`ReentrantLock`].
///
/// The state is the number of nested holds of the owning thread; zero means
/// unlocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReentrantPolicy {
  fairness: Fairness,
}

impl ReentrantPolicy {
  pub fn new(fairness: Fairness) -> Self {
    Self { fairness }
  }

  pub fn fairness(&self) -> Fairness {
    self.fairness
  }

  /// Takes a free lock regardless of queued threads, or re-enters a held one.
  pub fn nonfair_try_acquire(&self, core: &SyncCore, amount: u32) -> SyncResult<bool> {
    Self::check_amount(amount)?;
    let me = ThreadToken::current();
    let (state, owner) = core.state().snapshot();
    if state == 0 {
      return Ok(core.state().compare_and_set_owned(0, amount, Some(me)));
    }
    if owner == Some(me) {
      return Self::reenter(core, state, amount).map(|_| true);
    }
    Ok(false)
  }

  fn fair_try_acquire(&self, core: &SyncCore, amount: u32) -> SyncResult<bool> {
    Self::check_amount(amount)?;
    let me = ThreadToken::current();
    let (state, owner) = core.state().snapshot();
    if state == 0 {
      return Ok(!core.has_queued_predecessors() && core.state().compare_and_set_owned(0, amount, Some(me)));
    }
    if owner == Some(me) {
      return Self::reenter(core, state, amount).map(|_| true);
    }
    Ok(false)
  }

  // A zero hold would leave the state unlocked with no owner.
  fn check_amount(amount: u32) -> SyncResult<()> {
    if amount == 0 {
      return Err(SyncError::ZeroAmount);
    }
    Ok(())
  }

  fn reenter(core: &SyncCore, state: u32, amount: u32) -> SyncResult<()> {
    match state.checked_add(amount) {
      Some(next) => {
        core.state().set_state(next);
        Ok(())
      }
      None => {
        tracing::warn!(hold_count = state, "maximum hold count exceeded");
        Err(SyncError::HoldCountOverflow)
      }
    }
  }
}

impl SyncPolicy for ReentrantPolicy {
  fn try_acquire(&self, core: &SyncCore, amount: u32) -> SyncResult<bool> {
    match self.fairness {
      Fairness::Fair => self.fair_try_acquire(core, amount),
      Fairness::NonFair => self.nonfair_try_acquire(core, amount),
    }
  }

  fn try_release(&self, core: &SyncCore, amount: u32) -> SyncResult<bool> {
    let (state, owner) = core.state().snapshot();
    if owner != Some(ThreadToken::current()) {
      return Err(SyncError::of_illegal_monitor_state("unlock"));
    }
    let remaining = state
      .checked_sub(amount)
      .ok_or(SyncError::of_illegal_monitor_state("unlock"))?;
    if remaining == 0 {
      core.state().set_owned(0, None);
      Ok(true)
    } else {
      core.state().set_state(remaining);
      Ok(false)
    }
  }
}

/// Condition variable of a [`ReentrantLock`].
pub type Condition = ConditionObject<ReentrantPolicy>;

/// Reentrant mutual-exclusion lock.
///
/// The owning thread may lock again without blocking; every `lock` must be
/// matched by an `unlock`. Clones share the same lock.
#[derive(Clone)]
pub struct ReentrantLock {
  sync: Arc<QueuedSynchronizer<ReentrantPolicy>>,
}

assert_impl_all!(ReentrantLock: Send, Sync, Clone);

impl ReentrantLock {
  /// Creates a non-fair lock.
  pub fn new() -> Self {
    Self::with_config(Config::default())
  }

  pub fn with_fairness(fairness: Fairness) -> Self {
    Self::with_config(Config::from([ConfigOption::with_fair(fairness == Fairness::Fair)]))
  }

  pub fn with_config(config: Config) -> Self {
    let fairness = if config.fair { Fairness::Fair } else { Fairness::NonFair };
    tracing::debug!(lock = %config.name, %fairness, "reentrant lock created");
    Self {
      sync: Arc::new(QueuedSynchronizer::with_config(ReentrantPolicy::new(fairness), config)),
    }
  }

  /// Acquires the lock, waiting as long as needed. Interrupts are deferred.
  pub fn lock(&self) -> SyncResult<()> {
    self.sync.acquire(1)
  }

  pub fn lock_interruptibly(&self) -> SyncResult<()> {
    self.sync.acquire_interruptibly(1)
  }

  /// Acquires the lock only if it is free or already held by the caller.
  ///
  /// Barges even on a fair lock.
  pub fn try_lock(&self) -> SyncResult<bool> {
    self.sync.policy().nonfair_try_acquire(self.sync.core(), 1)
  }

  pub fn try_lock_for(&self, timeout: Duration) -> SyncResult<bool> {
    self.sync.try_acquire_for(1, timeout)
  }

  pub fn try_lock_until(&self, deadline: impl Into<Deadline>) -> SyncResult<bool> {
    self.sync.try_acquire_until(1, deadline)
  }

  pub fn unlock(&self) -> SyncResult<()> {
    self.sync.release(1).map(|_| ())
  }

  /// Locks and returns a guard that unlocks when dropped.
  pub fn guard(&self) -> SyncResult<ReentrantLockGuard<'_>> {
    self.lock()?;
    Ok(ReentrantLockGuard {
      lock: self,
      _not_send: PhantomData,
    })
  }

  pub fn new_condition(&self) -> Condition {
    ConditionObject::new(self.sync.clone())
  }

  pub fn is_locked(&self) -> bool {
    self.sync.state() != 0
  }

  /// Number of holds of the calling thread; zero if it does not own the lock.
  pub fn hold_count(&self) -> u32 {
    match self.sync.core().state().snapshot() {
      (state, Some(owner)) if owner == ThreadToken::current() => state,
      _ => 0,
    }
  }

  pub fn is_held_by_current_thread(&self) -> bool {
    self.sync.is_held_exclusively()
  }

  pub fn is_fair(&self) -> bool {
    self.sync.policy().fairness() == Fairness::Fair
  }

  pub fn owner(&self) -> Option<ThreadToken> {
    self.sync.core().state().exclusive_owner()
  }

  pub fn has_queued_threads(&self) -> bool {
    self.sync.has_queued_threads()
  }

  pub fn has_queued_thread(&self, thread: ThreadToken) -> bool {
    self.sync.is_queued(thread)
  }

  pub fn queue_length(&self) -> usize {
    self.sync.queue_length()
  }

  pub fn queued_threads(&self) -> Vec<ThreadToken> {
    self.sync.queued_threads()
  }

  pub fn has_waiters(&self, condition: &Condition) -> SyncResult<bool> {
    self.sync.has_waiters(condition)
  }

  pub fn wait_queue_length(&self, condition: &Condition) -> SyncResult<usize> {
    self.sync.wait_queue_length(condition)
  }

  pub fn waiting_threads(&self, condition: &Condition) -> SyncResult<Vec<ThreadToken>> {
    self.sync.waiting_threads(condition)
  }

  pub fn config(&self) -> &Config {
    self.sync.config()
  }
}

impl Default for ReentrantLock {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for ReentrantLock {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReentrantLock")
      .field("name", &self.config().name)
      .field("fair", &self.is_fair())
      .field("owner", &self.owner())
      .field("hold_count", &self.sync.state())
      .finish()
  }
}

/// Scoped hold of a [`ReentrantLock`].
///
/// Must be dropped on the thread that locked, so it is not `Send`.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ReentrantLockGuard<'a> {
  lock: &'a ReentrantLock,
  _not_send: PhantomData<*const ()>,
}

assert_not_impl_any!(ReentrantLockGuard<'static>: Send);

impl ReentrantLockGuard<'_> {
  pub fn lock(&self) -> &ReentrantLock {
    self.lock
  }
}

impl Drop for ReentrantLockGuard<'_> {
  fn drop(&mut self) {
    if let Err(error) = self.lock.unlock() {
      tracing::error!(lock = %self.lock.config().name, %error, "failed to unlock on guard drop");
    }
  }
}
