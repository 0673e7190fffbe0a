use std::fmt::{self, Debug, Formatter};
use std::hint;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use qsync_utils_rs::{park, Deadline, ThreadToken};

use crate::error::{SyncError, SyncResult};
use crate::synchronizer::{AcquireMode, Granted, Interruption, Node, QueuedSynchronizer, SyncPolicy, WaitStatus};


/// How an interrupt seen during a condition wait is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptMode {
  None,
  /// Interrupted after being signalled: re-assert the flag on return.
  Reinterrupt,
  /// Interrupted before being signalled: fail with `Interrupted`.
  Throw,
}

struct ConditionInner<P> {
  sync: Arc<QueuedSynchronizer<P>>,
  first_waiter: ArcSwapOption<Node>,
  last_waiter: ArcSwapOption<Node>,
}

/// Condition variable bound to one [`QueuedSynchronizer`].
///
/// The waiter list is only touched by the thread holding the synchronizer
/// exclusively, so it needs no synchronization of its own. Waiting moves the
/// caller's node from this list to the synchronizer's queue; every wait returns
/// with the state re-acquired at the amount held before, whatever ended it.
pub struct ConditionObject<P> {
  inner: Arc<ConditionInner<P>>,
}

impl<P> Clone for ConditionObject<P> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<P: SyncPolicy> ConditionObject<P> {
  pub fn new(sync: Arc<QueuedSynchronizer<P>>) -> Self {
    Self {
      inner: Arc::new(ConditionInner {
        sync,
        first_waiter: ArcSwapOption::empty(),
        last_waiter: ArcSwapOption::empty(),
      }),
    }
  }

  pub(crate) fn synchronizer(&self) -> &Arc<QueuedSynchronizer<P>> {
    &self.inner.sync
  }

  /// Waits until signalled or interrupted.
  pub fn wait(&self) -> SyncResult<()> {
    self.timed_wait(Deadline::Never, "wait").map(|_| ())
  }

  /// Waits until signalled; interrupts are deferred and re-asserted on return.
  pub fn wait_uninterruptibly(&self) -> SyncResult<()> {
    self.ensure_held("wait_uninterruptibly")?;
    let sync = &self.inner.sync;
    let node = self.add_condition_waiter();
    let saved = sync.fully_release(&node)?;
    let mut interrupted = false;
    while !sync.is_on_sync_queue(&node) {
      park::park();
      if park::interrupted() {
        interrupted = true;
      }
    }
    let granted = sync.acquire_queued(&node, saved, Interruption::Defer, Deadline::Never)?;
    if interrupted || matches!(granted, Granted::Acquired { interrupted: true }) {
      park::self_interrupt();
    }
    Ok(())
  }

  /// Waits for at most `timeout` and returns the time that was left, zero if the
  /// wait timed out.
  pub fn wait_timeout(&self, timeout: Duration) -> SyncResult<Duration> {
    let deadline = Deadline::after(timeout);
    self.timed_wait(deadline, "wait_timeout")?;
    Ok(deadline.remaining().unwrap_or(timeout))
  }

  /// Waits for at most `timeout`; `false` if the time elapsed before a signal.
  pub fn wait_for(&self, timeout: Duration) -> SyncResult<bool> {
    self.timed_wait(Deadline::after(timeout), "wait_for")
  }

  /// Waits until `deadline`; `false` if it passed before a signal.
  pub fn wait_until(&self, deadline: Instant) -> SyncResult<bool> {
    self.timed_wait(Deadline::at(deadline), "wait_until")
  }

  /// Moves the longest-waiting thread to the synchronizer's queue.
  pub fn signal(&self) -> SyncResult<()> {
    self.ensure_held("signal")?;
    let sync = &self.inner.sync;
    let mut first = self.inner.first_waiter.load_full();
    while let Some(node) = first {
      let next = node.next_waiter.swap(None);
      self.inner.first_waiter.store(next.clone());
      if next.is_none() {
        self.inner.last_waiter.store(None);
      }
      if sync.transfer_for_signal(&node) {
        break;
      }
      first = next;
    }
    Ok(())
  }

  /// Moves every waiting thread to the synchronizer's queue.
  pub fn signal_all(&self) -> SyncResult<()> {
    self.ensure_held("signal_all")?;
    let sync = &self.inner.sync;
    self.inner.last_waiter.store(None);
    let mut first = self.inner.first_waiter.swap(None);
    while let Some(node) = first {
      first = node.next_waiter.swap(None);
      sync.transfer_for_signal(&node);
    }
    Ok(())
  }

  pub(crate) fn has_waiters(&self) -> SyncResult<bool> {
    self.ensure_held("has_waiters")?;
    Ok(self.waiting_nodes().next().is_some())
  }

  pub(crate) fn wait_queue_length(&self) -> SyncResult<usize> {
    self.ensure_held("wait_queue_length")?;
    Ok(self.waiting_nodes().count())
  }

  pub(crate) fn waiting_threads(&self) -> SyncResult<Vec<ThreadToken>> {
    self.ensure_held("waiting_threads")?;
    Ok(self.waiting_nodes().filter_map(|node| node.waiter_token()).collect())
  }

  fn timed_wait(&self, deadline: Deadline, operation: &'static str) -> SyncResult<bool> {
    self.ensure_held(operation)?;
    if park::interrupted() {
      return Err(SyncError::Interrupted);
    }
    let sync = &self.inner.sync;
    let spin_threshold = sync.config().spin_for_timeout_threshold;
    let node = self.add_condition_waiter();
    let saved = sync.fully_release(&node)?;
    let mut timed_out = false;
    let mut mode = InterruptMode::None;
    while !sync.is_on_sync_queue(&node) {
      let remaining = deadline.remaining();
      if remaining.is_some_and(|remaining| remaining.is_zero()) {
        timed_out = sync.transfer_after_cancelled_wait(&node);
        break;
      }
      match remaining {
        None => park::park(),
        Some(remaining) if remaining > spin_threshold => park::park_timeout(remaining),
        Some(_) => hint::spin_loop(),
      }
      mode = self.check_interrupt_while_waiting(&node);
      if mode != InterruptMode::None {
        break;
      }
    }
    if timed_out {
      tracing::debug!(lock = %sync.config().name, operation, "condition wait timed out");
    }
    self.reacquire(&node, saved, mode)?;
    Ok(!timed_out)
  }

  fn reacquire(&self, node: &Arc<Node>, saved: u32, mut mode: InterruptMode) -> SyncResult<()> {
    let granted = self
      .inner
      .sync
      .acquire_queued(node, saved, Interruption::Defer, Deadline::Never)?;
    if matches!(granted, Granted::Acquired { interrupted: true }) && mode != InterruptMode::Throw {
      mode = InterruptMode::Reinterrupt;
    }
    if node.next_waiter.load().is_some() {
      self.unlink_cancelled_waiters();
    }
    match mode {
      InterruptMode::None => Ok(()),
      InterruptMode::Reinterrupt => {
        park::self_interrupt();
        Ok(())
      }
      InterruptMode::Throw => Err(SyncError::Interrupted),
    }
  }

  fn check_interrupt_while_waiting(&self, node: &Arc<Node>) -> InterruptMode {
    if !park::interrupted() {
      return InterruptMode::None;
    }
    if self.inner.sync.transfer_after_cancelled_wait(node) {
      InterruptMode::Throw
    } else {
      InterruptMode::Reinterrupt
    }
  }

  fn ensure_held(&self, operation: &'static str) -> SyncResult<()> {
    if self.inner.sync.is_held_exclusively() {
      Ok(())
    } else {
      Err(SyncError::of_illegal_monitor_state(operation))
    }
  }

  fn add_condition_waiter(&self) -> Arc<Node> {
    let mut last = self.inner.last_waiter.load_full();
    if last.as_ref().is_some_and(|last| last.status() != WaitStatus::Condition) {
      self.unlink_cancelled_waiters();
      last = self.inner.last_waiter.load_full();
    }
    let node = Arc::new(Node::for_current(AcquireMode::Exclusive, WaitStatus::Condition));
    match last {
      None => self.inner.first_waiter.store(Some(node.clone())),
      Some(last) => last.next_waiter.store(Some(node.clone())),
    }
    self.inner.last_waiter.store(Some(node.clone()));
    node
  }

  /// Drops nodes whose wait was cancelled from the waiter list.
  fn unlink_cancelled_waiters(&self) {
    let mut cursor = self.inner.first_waiter.load_full();
    let mut trail: Option<Arc<Node>> = None;
    while let Some(node) = cursor {
      let next = node.next_waiter.load_full();
      if node.status() != WaitStatus::Condition {
        node.next_waiter.store(None);
        match &trail {
          None => self.inner.first_waiter.store(next.clone()),
          Some(trail) => trail.next_waiter.store(next.clone()),
        }
        if next.is_none() {
          self.inner.last_waiter.store(trail.clone());
        }
      } else {
        trail = Some(node);
      }
      cursor = next;
    }
  }

  fn waiting_nodes(&self) -> impl Iterator<Item = Arc<Node>> {
    let mut cursor = self.inner.first_waiter.load_full();
    std::iter::from_fn(move || {
      while let Some(node) = cursor.take() {
        cursor = node.next_waiter.load_full();
        if node.status() == WaitStatus::Condition {
          return Some(node);
        }
      }
      None
    })
  }
}

impl<P: SyncPolicy> Debug for ConditionObject<P> {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConditionObject")
      .field("lock", &self.inner.sync.config().name)
      .finish()
  }
}
