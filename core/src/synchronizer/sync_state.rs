use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use qsync_utils_rs::ThreadToken;

const STATE_BITS: u32 = 32;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

#[inline]
fn pack(state: u32, owner: Option<ThreadToken>) -> u64 {
  let owner = owner.map_or(0, ThreadToken::into_raw) as u64;
  (owner << STATE_BITS) | state as u64
}

#[inline]
fn state_of(word: u64) -> u32 {
  (word & STATE_MASK) as u32
}

#[inline]
fn owner_of(word: u64) -> Option<ThreadToken> {
  ThreadToken::from_raw((word >> STATE_BITS) as u32)
}

/// Permit counter plus exclusive owner, packed into one atomic word.
///
/// Because both halves live in the same word, granting or fully releasing
/// ownership changes them in a single atomic step, and a state of zero always
/// carries no owner.
pub struct SyncState {
  word: AtomicU64,
}

impl SyncState {
  pub const fn new() -> Self {
    Self { word: AtomicU64::new(0) }
  }

  #[inline]
  pub fn state(&self) -> u32 {
    state_of(self.word.load(Ordering::SeqCst))
  }

  #[inline]
  pub fn exclusive_owner(&self) -> Option<ThreadToken> {
    owner_of(self.word.load(Ordering::SeqCst))
  }

  /// Returns state and owner read together.
  pub fn snapshot(&self) -> (u32, Option<ThreadToken>) {
    let word = self.word.load(Ordering::SeqCst);
    (state_of(word), owner_of(word))
  }

  /// Replaces the state, keeping the owner unless the state drops to zero.
  pub fn set_state(&self, state: u32) {
    let _ = self
      .word
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| Some(Self::with_state(word, state)));
  }

  /// Sets state and owner at once.
  pub fn set_owned(&self, state: u32, owner: Option<ThreadToken>) {
    let owner = if state == 0 { None } else { owner };
    self.word.store(pack(state, owner), Ordering::SeqCst);
  }

  /// Moves the state from `expect` to `update`, keeping the owner unless the state
  /// drops to zero.
  pub fn compare_and_set_state(&self, expect: u32, update: u32) -> bool {
    self
      .word
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
        (state_of(word) == expect).then(|| Self::with_state(word, update))
      })
      .is_ok()
  }

  /// Moves the state from `expect` to `update` and installs `owner` in the same step.
  pub fn compare_and_set_owned(&self, expect: u32, update: u32, owner: Option<ThreadToken>) -> bool {
    let owner = if update == 0 { None } else { owner };
    self
      .word
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
        (state_of(word) == expect).then(|| pack(update, owner))
      })
      .is_ok()
  }

  #[inline]
  fn with_state(word: u64, state: u32) -> u64 {
    if state == 0 {
      0
    } else {
      (word & !STATE_MASK) | state as u64
    }
  }
}

impl Default for SyncState {
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for SyncState {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    let (state, owner) = self.snapshot();
    f.debug_struct("SyncState")
      .field("state", &state)
      .field("owner", &owner)
      .finish()
  }
}
