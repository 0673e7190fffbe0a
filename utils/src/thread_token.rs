use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

thread_local! {
  static CURRENT_TOKEN: ThreadToken = ThreadToken::allocate();
}

/// Process-unique identity of a thread.
///
/// Tokens are handed out lazily the first time a thread asks for one and fit in
/// 32 bits, so a synchronizer can pack the owner next to its state counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ThreadToken(NonZeroU32);

impl ThreadToken {
  /// Returns the token of the calling thread.
  pub fn current() -> Self {
    CURRENT_TOKEN.with(|token| *token)
  }

  /// Rebuilds a token from its raw form. `0` means "no thread".
  #[inline]
  pub const fn from_raw(raw: u32) -> Option<Self> {
    match NonZeroU32::new(raw) {
      Some(value) => Some(Self(value)),
      None => None,
    }
  }

  #[inline]
  pub const fn into_raw(self) -> u32 {
    self.0.get()
  }

  fn allocate() -> Self {
    match Self::next_from(&NEXT_TOKEN) {
      Some(token) => token,
      None => panic!("thread token space exhausted after {} threads", u32::MAX - 1),
    }
  }

  /// Takes the next token from `counter`, or `None` once it would wrap.
  fn next_from(counter: &AtomicU32) -> Option<Self> {
    counter
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |raw| raw.checked_add(1))
      .ok()
      .and_then(Self::from_raw)
  }
}

impl Display for ThreadToken {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "thread-{}", self.0)
  }
}
