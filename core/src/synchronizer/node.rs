use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use num_enum::{FromPrimitive, IntoPrimitive};
use qsync_utils_rs::{ThreadParker, ThreadToken};
use strum::Display;

use crate::error::{SyncError, SyncResult};

/// Wait status of a queued node.
///
/// Non-positive values mean the node is still live; only
/// [`WaitStatus::Cancelled`] is positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive, Display)]
#[repr(i32)]
pub enum WaitStatus {
  Init = 0,
  #[num_enum(default)]
  Cancelled = 1,
  /// The successor is (or will be) parked and must be unparked on release.
  Signal = -1,
  /// The node sits on a condition queue.
  Condition = -2,
  /// The next shared release should propagate unconditionally.
  Propagate = -3,
}

impl WaitStatus {
  #[inline]
  pub fn is_cancelled(self) -> bool {
    i32::from(self) > 0
  }

  #[inline]
  pub(crate) fn is_pending(self) -> bool {
    i32::from(self) < 0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AcquireMode {
  Exclusive,
  Shared,
}

/// A waiter in the sync queue or in a condition queue.
///
/// `next` owns the forward chain; `prev` is only followed to walk backwards from
/// the tail and to skip cancelled predecessors. Retired nodes drop their `next`
/// link so that the reference counts unwind.
pub(crate) struct Node {
  wait_status: AtomicI32,
  pub(crate) prev: ArcSwapOption<Node>,
  pub(crate) next: ArcSwapOption<Node>,
  pub(crate) waiter: ArcSwapOption<ThreadParker>,
  pub(crate) next_waiter: ArcSwapOption<Node>,
  mode: AcquireMode,
}

impl Node {
  pub(crate) fn sentinel() -> Self {
    Self {
      wait_status: AtomicI32::new(WaitStatus::Init.into()),
      prev: ArcSwapOption::empty(),
      next: ArcSwapOption::empty(),
      waiter: ArcSwapOption::empty(),
      next_waiter: ArcSwapOption::empty(),
      mode: AcquireMode::Exclusive,
    }
  }

  /// A node bound to the calling thread.
  pub(crate) fn for_current(mode: AcquireMode, status: WaitStatus) -> Self {
    Self {
      wait_status: AtomicI32::new(status.into()),
      prev: ArcSwapOption::empty(),
      next: ArcSwapOption::empty(),
      waiter: ArcSwapOption::new(Some(ThreadParker::current())),
      next_waiter: ArcSwapOption::empty(),
      mode,
    }
  }

  #[inline]
  pub(crate) fn mode(&self) -> AcquireMode {
    self.mode
  }

  #[inline]
  pub(crate) fn is_shared(&self) -> bool {
    self.mode == AcquireMode::Shared
  }

  #[inline]
  pub(crate) fn status(&self) -> WaitStatus {
    WaitStatus::from_primitive(self.wait_status.load(Ordering::SeqCst))
  }

  #[inline]
  pub(crate) fn set_status(&self, status: WaitStatus) {
    self.wait_status.store(status.into(), Ordering::SeqCst);
  }

  #[inline]
  pub(crate) fn compare_and_set_status(&self, expect: WaitStatus, update: WaitStatus) -> bool {
    self
      .wait_status
      .compare_exchange(expect.into(), update.into(), Ordering::SeqCst, Ordering::SeqCst)
      .is_ok()
  }

  /// Predecessor of a node that is known to be enqueued.
  pub(crate) fn predecessor(&self) -> SyncResult<Arc<Node>> {
    self.prev.load_full().ok_or(SyncError::MissingPredecessor)
  }

  pub(crate) fn waiter_token(&self) -> Option<ThreadToken> {
    self.waiter.load_full().map(|waiter| waiter.token())
  }

  pub(crate) fn unpark_waiter(&self) {
    if let Some(waiter) = self.waiter.load_full() {
      waiter.unpark();
    }
  }
}

impl Debug for Node {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("Node")
      .field("wait_status", &self.status())
      .field("mode", &self.mode)
      .field("waiter", &self.waiter_token())
      .finish()
  }
}

/// Compares two optional node references by identity.
#[inline]
pub(crate) fn same_node(a: &Option<Arc<Node>>, b: &Option<Arc<Node>>) -> bool {
  match (a, b) {
    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
    (None, None) => true,
    _ => false,
  }
}

/// Compare-and-swap on a link slot, by node identity.
pub(crate) fn compare_and_set_link(
  slot: &ArcSwapOption<Node>,
  current: &Option<Arc<Node>>,
  new: Option<Arc<Node>>,
) -> bool {
  let previous = slot.compare_and_swap(current, new);
  same_node(&previous, current)
}
