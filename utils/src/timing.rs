use std::time::{Duration, Instant};

/// Absolute point in time a timed wait gives up at.
///
/// Durations too large to add to [`Instant::now`] collapse into [`Deadline::Never`],
/// so callers never have to deal with overflowing instants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
  At(Instant),
  Never,
}

impl Deadline {
  /// Creates a deadline `timeout` from now.
  pub fn after(timeout: Duration) -> Self {
    match Instant::now().checked_add(timeout) {
      Some(instant) => Deadline::At(instant),
      None => Deadline::Never,
    }
  }

  /// Creates a deadline at the given instant.
  #[inline]
  pub const fn at(instant: Instant) -> Self {
    Deadline::At(instant)
  }

  #[inline]
  pub const fn instant(&self) -> Option<Instant> {
    match self {
      Deadline::At(instant) => Some(*instant),
      Deadline::Never => None,
    }
  }

  /// Time left until the deadline; `None` if it never expires.
  ///
  /// Saturates at zero once the deadline has passed.
  pub fn remaining(&self) -> Option<Duration> {
    self
      .instant()
      .map(|instant| instant.saturating_duration_since(Instant::now()))
  }

  pub fn has_elapsed(&self) -> bool {
    matches!(self.remaining(), Some(remaining) if remaining.is_zero())
  }
}

impl From<Instant> for Deadline {
  #[inline]
  fn from(value: Instant) -> Self {
    Deadline::at(value)
  }
}
