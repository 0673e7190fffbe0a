mod node;
mod policy;
mod sync_state;
mod wait_queue;

#[cfg(test)]
mod tests;

use std::fmt::{self, Debug, Formatter};
use std::hint;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use qsync_utils_rs::{park, Deadline, ThreadToken};
use static_assertions::assert_impl_all;

pub use self::node::{AcquireMode, WaitStatus};
pub use self::policy::{SharedAcquire, SyncCore, SyncPolicy};
pub use self::sync_state::SyncState;

pub(crate) use self::node::Node;
use self::node::{compare_and_set_link, same_node};

use crate::condition::ConditionObject;
use crate::error::{SyncError, SyncResult};
use crate::Config;

/// What a blocked acquirer does when its thread is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
  /// Keep waiting and re-assert the interrupt once acquired.
  Defer,
  /// Give up, cancel the node and report [`SyncError::Interrupted`].
  Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Granted {
  Acquired { interrupted: bool },
  TimedOut,
}

/// FIFO wait-queue synchronizer.
///
/// The synchronizer owns a permit counter with an optional exclusive owner and a
/// queue of parked threads. `P` decides whether a given acquire or release may
/// change the state; everything else (queuing, parking, cancellation and waking
/// successors) happens here, for both exclusive and shared mode.
pub struct QueuedSynchronizer<P> {
  core: SyncCore,
  policy: P,
  config: Config,
}

assert_impl_all!(QueuedSynchronizer<crate::ReentrantPolicy>: Send, Sync);

impl<P: SyncPolicy> QueuedSynchronizer<P> {
  pub fn new(policy: P) -> Self {
    Self::with_config(policy, Config::default())
  }

  pub fn with_config(policy: P, config: Config) -> Self {
    Self {
      core: SyncCore::new(),
      policy,
      config,
    }
  }

  pub fn policy(&self) -> &P {
    &self.policy
  }

  pub fn core(&self) -> &SyncCore {
    &self.core
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn state(&self) -> u32 {
    self.core.state().state()
  }

  pub fn is_held_exclusively(&self) -> bool {
    self.policy.is_held_exclusively(&self.core)
  }

  // --- exclusive mode ---

  /// Single attempt through the policy, without queuing.
  pub fn try_acquire(&self, amount: u32) -> SyncResult<bool> {
    self.policy.try_acquire(&self.core, amount)
  }

  /// Acquires in exclusive mode, ignoring interrupts.
  ///
  /// An interrupt observed while parked is re-asserted on the thread after the
  /// acquire succeeds.
  pub fn acquire(&self, amount: u32) -> SyncResult<()> {
    if self.try_acquire(amount)? {
      return Ok(());
    }
    let node = self.core.queue().add_waiter(AcquireMode::Exclusive);
    if let Granted::Acquired { interrupted: true } =
      self.acquire_queued(&node, amount, Interruption::Defer, Deadline::Never)?
    {
      park::self_interrupt();
    }
    Ok(())
  }

  /// Acquires in exclusive mode, aborting with [`SyncError::Interrupted`] if the
  /// thread is interrupted.
  pub fn acquire_interruptibly(&self, amount: u32) -> SyncResult<()> {
    if park::interrupted() {
      return Err(SyncError::Interrupted);
    }
    if self.try_acquire(amount)? {
      return Ok(());
    }
    let node = self.core.queue().add_waiter(AcquireMode::Exclusive);
    self
      .acquire_queued(&node, amount, Interruption::Abort, Deadline::Never)
      .map(|_| ())
  }

  /// Acquires in exclusive mode, giving up after `timeout`.
  pub fn try_acquire_for(&self, amount: u32, timeout: Duration) -> SyncResult<bool> {
    self.try_acquire_until(amount, Deadline::after(timeout))
  }

  pub fn try_acquire_until(&self, amount: u32, deadline: impl Into<Deadline>) -> SyncResult<bool> {
    let deadline = deadline.into();
    if park::interrupted() {
      return Err(SyncError::Interrupted);
    }
    if self.try_acquire(amount)? {
      return Ok(true);
    }
    if deadline.has_elapsed() {
      return Ok(false);
    }
    let node = self.core.queue().add_waiter(AcquireMode::Exclusive);
    let granted = self.acquire_queued(&node, amount, Interruption::Abort, deadline)?;
    Ok(matches!(granted, Granted::Acquired { .. }))
  }

  /// Releases in exclusive mode and wakes the next waiter if the state became free.
  pub fn release(&self, amount: u32) -> SyncResult<bool> {
    if !self.policy.try_release(&self.core, amount)? {
      return Ok(false);
    }
    // Pairs with the fence an acquirer issues between arming its predecessor and
    // re-reading the state.
    fence(Ordering::SeqCst);
    if let Some(head) = self.core.queue().head() {
      if head.status() != WaitStatus::Init {
        self.unpark_successor(&head);
      }
    }
    Ok(true)
  }

  // --- shared mode ---

  pub fn try_acquire_shared(&self, amount: u32) -> SyncResult<SharedAcquire> {
    self.policy.try_acquire_shared(&self.core, amount)
  }

  pub fn acquire_shared(&self, amount: u32) -> SyncResult<()> {
    if self.try_acquire_shared(amount)?.is_acquired() {
      return Ok(());
    }
    let node = self.core.queue().add_waiter(AcquireMode::Shared);
    if let Granted::Acquired { interrupted: true } =
      self.acquire_queued(&node, amount, Interruption::Defer, Deadline::Never)?
    {
      park::self_interrupt();
    }
    Ok(())
  }

  pub fn acquire_shared_interruptibly(&self, amount: u32) -> SyncResult<()> {
    if park::interrupted() {
      return Err(SyncError::Interrupted);
    }
    if self.try_acquire_shared(amount)?.is_acquired() {
      return Ok(());
    }
    let node = self.core.queue().add_waiter(AcquireMode::Shared);
    self
      .acquire_queued(&node, amount, Interruption::Abort, Deadline::Never)
      .map(|_| ())
  }

  pub fn try_acquire_shared_for(&self, amount: u32, timeout: Duration) -> SyncResult<bool> {
    self.try_acquire_shared_until(amount, Deadline::after(timeout))
  }

  pub fn try_acquire_shared_until(&self, amount: u32, deadline: impl Into<Deadline>) -> SyncResult<bool> {
    let deadline = deadline.into();
    if park::interrupted() {
      return Err(SyncError::Interrupted);
    }
    if self.try_acquire_shared(amount)?.is_acquired() {
      return Ok(true);
    }
    if deadline.has_elapsed() {
      return Ok(false);
    }
    let node = self.core.queue().add_waiter(AcquireMode::Shared);
    let granted = self.acquire_queued(&node, amount, Interruption::Abort, deadline)?;
    Ok(matches!(granted, Granted::Acquired { .. }))
  }

  pub fn release_shared(&self, amount: u32) -> SyncResult<bool> {
    if !self.policy.try_release_shared(&self.core, amount)? {
      return Ok(false);
    }
    fence(Ordering::SeqCst);
    self.release_shared_waiters();
    Ok(true)
  }

  // --- queue inspection ---

  pub fn has_queued_threads(&self) -> bool {
    self.core.queue().has_queued_threads()
  }

  /// Whether any thread ever had to queue on this synchronizer.
  pub fn has_contended(&self) -> bool {
    self.core.queue().has_contended()
  }

  pub fn has_queued_predecessors(&self) -> bool {
    self.core.has_queued_predecessors()
  }

  pub fn first_queued_thread(&self) -> Option<ThreadToken> {
    self.core.queue().first_queued_thread()
  }

  pub fn is_queued(&self, thread: ThreadToken) -> bool {
    self.core.queue().is_queued(thread)
  }

  /// Estimate of the number of queued threads.
  pub fn queue_length(&self) -> usize {
    self.core.queue().queue_length()
  }

  pub fn queued_threads(&self) -> Vec<ThreadToken> {
    self.core.queue().queued_threads(None)
  }

  pub fn exclusive_queued_threads(&self) -> Vec<ThreadToken> {
    self.core.queue().queued_threads(Some(AcquireMode::Exclusive))
  }

  pub fn shared_queued_threads(&self) -> Vec<ThreadToken> {
    self.core.queue().queued_threads(Some(AcquireMode::Shared))
  }

  // --- condition inspection ---

  /// Whether `condition` was created for this synchronizer.
  pub fn owns(&self, condition: &ConditionObject<P>) -> bool {
    std::ptr::eq(Arc::as_ptr(condition.synchronizer()), self)
  }

  pub fn has_waiters(&self, condition: &ConditionObject<P>) -> SyncResult<bool> {
    self.ensure_owns(condition)?;
    condition.has_waiters()
  }

  pub fn wait_queue_length(&self, condition: &ConditionObject<P>) -> SyncResult<usize> {
    self.ensure_owns(condition)?;
    condition.wait_queue_length()
  }

  pub fn waiting_threads(&self, condition: &ConditionObject<P>) -> SyncResult<Vec<ThreadToken>> {
    self.ensure_owns(condition)?;
    condition.waiting_threads()
  }

  fn ensure_owns(&self, condition: &ConditionObject<P>) -> SyncResult<()> {
    if self.owns(condition) {
      Ok(())
    } else {
      Err(SyncError::ForeignCondition)
    }
  }

  // --- acquire protocol ---

  /// Waits in the queue until `node` is granted, cancelling it on every other exit.
  pub(crate) fn acquire_queued(
    &self,
    node: &Arc<Node>,
    amount: u32,
    interruption: Interruption,
    deadline: Deadline,
  ) -> SyncResult<Granted> {
    let outcome = self.wait_in_queue(node, amount, interruption, deadline);
    match &outcome {
      Ok(Granted::Acquired { .. }) => {}
      Ok(Granted::TimedOut) => {
        tracing::debug!(lock = %self.config.name, mode = %node.mode(), amount, "acquire timed out");
        self.cancel_acquire(node);
      }
      Err(error) => {
        tracing::debug!(lock = %self.config.name, mode = %node.mode(), amount, %error, "acquire abandoned");
        self.cancel_acquire(node);
      }
    }
    outcome
  }

  fn wait_in_queue(
    &self,
    node: &Arc<Node>,
    amount: u32,
    interruption: Interruption,
    deadline: Deadline,
  ) -> SyncResult<Granted> {
    // The enqueue must be visible before the state is re-read.
    fence(Ordering::SeqCst);
    let mut interrupted = false;
    loop {
      let pred = node.predecessor()?;
      if self.core.queue().is_head(&pred) && self.try_claim(node, &pred, amount)? {
        return Ok(Granted::Acquired { interrupted });
      }
      let remaining = deadline.remaining();
      if remaining.is_some_and(|remaining| remaining.is_zero()) {
        return Ok(Granted::TimedOut);
      }
      if self.should_park_after_failed_acquire(&pred, node)? {
        match remaining {
          None => {
            tracing::trace!(lock = %self.config.name, mode = %node.mode(), "park");
            park::park();
          }
          Some(remaining) if remaining > self.config.spin_for_timeout_threshold => {
            tracing::trace!(lock = %self.config.name, mode = %node.mode(), ?remaining, "park");
            park::park_timeout(remaining);
          }
          Some(_) => hint::spin_loop(),
        }
        if park::interrupted() {
          match interruption {
            Interruption::Abort => return Err(SyncError::Interrupted),
            Interruption::Defer => interrupted = true,
          }
        }
      }
    }
  }

  /// Attempts the acquire for a node whose predecessor is the head, promoting it on
  /// success.
  fn try_claim(&self, node: &Arc<Node>, pred: &Arc<Node>, amount: u32) -> SyncResult<bool> {
    match node.mode() {
      AcquireMode::Exclusive => {
        if !self.policy.try_acquire(&self.core, amount)? {
          return Ok(false);
        }
        self.core.queue().set_head(node);
      }
      AcquireMode::Shared => {
        let outcome = self.policy.try_acquire_shared(&self.core, amount)?;
        if !outcome.is_acquired() {
          return Ok(false);
        }
        self.set_head_and_propagate(node, outcome == SharedAcquire::AcquiredWithSurplus);
      }
    }
    pred.next.store(None);
    tracing::trace!(lock = %self.config.name, mode = %node.mode(), amount, "granted from queue");
    Ok(true)
  }

  /// Makes sure the predecessor will signal us before we park.
  ///
  /// Returns `true` only when `pred` is already armed; otherwise the caller retries
  /// the acquire once more.
  fn should_park_after_failed_acquire(&self, pred: &Arc<Node>, node: &Arc<Node>) -> SyncResult<bool> {
    let status = pred.status();
    if status == WaitStatus::Signal {
      return Ok(true);
    }
    if status.is_cancelled() {
      let mut pred = pred.clone();
      loop {
        pred = pred.predecessor()?;
        node.prev.store(Some(pred.clone()));
        if !pred.status().is_cancelled() {
          break;
        }
      }
      pred.next.store(Some(node.clone()));
    } else {
      pred.compare_and_set_status(status, WaitStatus::Signal);
      fence(Ordering::SeqCst);
    }
    Ok(false)
  }

  /// Cancels an abandoned acquire and unlinks its node.
  ///
  /// Other threads may be walking through the node concurrently, so only the
  /// node's own links and CAS-guarded neighbour links are touched.
  fn cancel_acquire(&self, node: &Arc<Node>) {
    node.waiter.store(None);

    let Some(mut pred) = node.prev.load_full() else {
      return;
    };
    while pred.status().is_cancelled() {
      match pred.prev.load_full() {
        Some(prev) => {
          node.prev.store(Some(prev.clone()));
          pred = prev;
        }
        None => break,
      }
    }
    let pred_next = pred.next.load_full();
    node.set_status(WaitStatus::Cancelled);

    let queue = self.core.queue();
    if queue.is_tail(node) && queue.compare_and_set_tail(node, &pred) {
      compare_and_set_link(&pred.next, &pred_next, None);
      return;
    }

    let pred_armed = !queue.is_head(&pred)
      && {
        let status = pred.status();
        status == WaitStatus::Signal
          || (!status.is_cancelled() && pred.compare_and_set_status(status, WaitStatus::Signal))
      }
      && pred.waiter.load().is_some();
    if pred_armed {
      if let Some(next) = node.next.load_full() {
        if !next.status().is_cancelled() {
          compare_and_set_link(&pred.next, &pred_next, Some(next));
        }
      }
    } else {
      // The predecessor cannot be trusted to signal: wake the successor so it
      // re-links itself.
      self.unpark_successor(node);
    }
    node.next.store(None);
  }

  /// Wakes the first live waiter after `node`.
  fn unpark_successor(&self, node: &Arc<Node>) {
    let status = node.status();
    if status.is_pending() {
      node.compare_and_set_status(status, WaitStatus::Init);
    }

    let mut successor = node.next.load_full().filter(|next| !next.status().is_cancelled());
    if successor.is_none() {
      // `next` may lag behind an append or point at a cancelled node; `prev` from
      // the tail is authoritative.
      let mut cursor = self.core.queue().tail();
      while let Some(candidate) = cursor {
        if Arc::ptr_eq(&candidate, node) {
          break;
        }
        if !candidate.status().is_cancelled() {
          successor = Some(candidate.clone());
        }
        cursor = candidate.prev.load_full();
      }
    }
    if let Some(successor) = successor {
      tracing::trace!(lock = %self.config.name, waiter = ?successor.waiter_token(), "unpark successor");
      successor.unpark_waiter();
    }
  }

  /// Installs a shared node as head and keeps waking shared waiters while permits
  /// may remain.
  fn set_head_and_propagate(&self, node: &Arc<Node>, surplus: bool) {
    let queue = self.core.queue();
    let old_head = queue.head();
    queue.set_head(node);

    let pending = |head: Option<Arc<Node>>| head.map_or(true, |head| head.status().is_pending());
    if surplus || pending(old_head) || pending(queue.head()) {
      match node.next.load_full() {
        Some(next) if !next.is_shared() => {}
        _ => self.release_shared_waiters(),
      }
    }
  }

  /// Signals the head's successor in shared mode, marking the head PROPAGATE when
  /// nobody is waiting yet so a later acquire keeps propagating.
  fn release_shared_waiters(&self) {
    let queue = self.core.queue();
    loop {
      let head = queue.head();
      if let Some(h) = &head {
        if !queue.is_tail(h) {
          let status = h.status();
          if status == WaitStatus::Signal {
            if !h.compare_and_set_status(WaitStatus::Signal, WaitStatus::Init) {
              continue;
            }
            self.unpark_successor(h);
          } else if status == WaitStatus::Init && !h.compare_and_set_status(WaitStatus::Init, WaitStatus::Propagate) {
            continue;
          }
        }
      }
      if same_node(&head, &queue.head()) {
        break;
      }
    }
  }

  // --- condition support ---

  /// Releases the whole state held by the caller and returns it.
  pub(crate) fn fully_release(&self, node: &Arc<Node>) -> SyncResult<u32> {
    let saved = self.state();
    match self.release(saved) {
      Ok(true) => Ok(saved),
      Ok(false) => {
        node.set_status(WaitStatus::Cancelled);
        Err(SyncError::of_illegal_monitor_state("fully_release"))
      }
      Err(error) => {
        node.set_status(WaitStatus::Cancelled);
        Err(error)
      }
    }
  }

  /// Whether a node that started on a condition queue now sits on the sync queue.
  pub(crate) fn is_on_sync_queue(&self, node: &Arc<Node>) -> bool {
    if node.status() == WaitStatus::Condition || node.prev.load().is_none() {
      return false;
    }
    if node.next.load().is_some() {
      return true;
    }
    // `prev` is set before the tail CAS, so the node may still be mid-append.
    let mut cursor = self.core.queue().tail();
    while let Some(candidate) = cursor {
      if Arc::ptr_eq(&candidate, node) {
        return true;
      }
      cursor = candidate.prev.load_full();
    }
    false
  }

  /// Moves a signalled condition node to the sync queue.
  ///
  /// Returns `false` if the node was cancelled before the signal reached it.
  pub(crate) fn transfer_for_signal(&self, node: &Arc<Node>) -> bool {
    if !node.compare_and_set_status(WaitStatus::Condition, WaitStatus::Init) {
      return false;
    }
    let pred = self.core.queue().enqueue(node);
    let status = pred.status();
    if status.is_cancelled() || !pred.compare_and_set_status(status, WaitStatus::Signal) {
      // Nobody will signal the node in order; let it resync itself.
      node.unpark_waiter();
    }
    tracing::debug!(lock = %self.config.name, waiter = ?node.waiter_token(), "condition waiter transferred");
    true
  }

  /// Moves a condition node to the sync queue after a timeout or interrupt.
  ///
  /// Returns `true` if the cancellation won over any concurrent signal.
  pub(crate) fn transfer_after_cancelled_wait(&self, node: &Arc<Node>) -> bool {
    if node.compare_and_set_status(WaitStatus::Condition, WaitStatus::Init) {
      self.core.queue().enqueue(node);
      return true;
    }
    // A signal won the race; wait until its enqueue is complete.
    while !self.is_on_sync_queue(node) {
      thread::yield_now();
    }
    false
  }
}

impl<P> Debug for QueuedSynchronizer<P> {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let (state, owner) = self.core.state().snapshot();
    f.debug_struct("QueuedSynchronizer")
      .field("name", &self.config.name)
      .field("state", &state)
      .field("owner", &owner)
      .field("queued", &self.core.queue().has_queued_threads())
      .finish()
  }
}
