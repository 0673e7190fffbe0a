use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};
use static_assertions::assert_impl_all;

use crate::thread_token::ThreadToken;

struct LocalParker {
  parker: Parker,
  handle: Arc<ThreadParker>,
}

impl LocalParker {
  fn new() -> Self {
    let parker = Parker::new();
    let handle = Arc::new(ThreadParker {
      token: ThreadToken::current(),
      unparker: parker.unparker().clone(),
      interrupted: AtomicBool::new(false),
    });
    Self { parker, handle }
  }
}

thread_local! {
  static LOCAL: LocalParker = LocalParker::new();
}

/// Shared handle used to wake or interrupt one particular thread.
///
/// Each thread owns exactly one parker. An [`unpark`](ThreadParker::unpark) issued
/// before the thread parks is remembered, so the next park returns immediately.
/// Interruption is a sticky flag that also unparks the thread; blocking operations
/// consume it through [`interrupted`].
pub struct ThreadParker {
  token: ThreadToken,
  unparker: Unparker,
  interrupted: AtomicBool,
}

assert_impl_all!(ThreadParker: Send, Sync);

impl ThreadParker {
  /// Returns the parker of the calling thread.
  pub fn current() -> Arc<ThreadParker> {
    LOCAL.with(|local| local.handle.clone())
  }

  pub fn token(&self) -> ThreadToken {
    self.token
  }

  pub fn unpark(&self) {
    tracing::trace!(thread = %self.token, "unpark");
    self.unparker.unpark();
  }

  /// Flags the thread as interrupted and wakes it if it is parked.
  pub fn interrupt(&self) {
    tracing::trace!(thread = %self.token, "interrupt");
    self.interrupted.store(true, Ordering::SeqCst);
    self.unparker.unpark();
  }

  /// Reads the interruption flag without clearing it.
  pub fn is_interrupted(&self) -> bool {
    self.interrupted.load(Ordering::SeqCst)
  }

  fn take_interrupt(&self) -> bool {
    self.interrupted.swap(false, Ordering::SeqCst)
  }
}

impl Debug for ThreadParker {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThreadParker")
      .field("token", &self.token)
      .field("interrupted", &self.is_interrupted())
      .finish()
  }
}

/// Blocks the calling thread until it is unparked or interrupted.
///
/// May return spuriously; callers re-check their wait condition.
pub fn park() {
  LOCAL.with(|local| local.parker.park());
}

/// Blocks the calling thread for at most `timeout`.
pub fn park_timeout(timeout: Duration) {
  LOCAL.with(|local| local.parker.park_timeout(timeout));
}

/// Blocks the calling thread until `deadline` at the latest.
pub fn park_until(deadline: Instant) {
  LOCAL.with(|local| local.parker.park_deadline(deadline));
}

/// Returns whether the calling thread was interrupted and clears the flag.
pub fn interrupted() -> bool {
  LOCAL.with(|local| local.handle.take_interrupt())
}

/// Re-asserts an interruption on the calling thread without waking anybody.
pub fn self_interrupt() {
  LOCAL.with(|local| local.handle.interrupted.store(true, Ordering::SeqCst));
}
