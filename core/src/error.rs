use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  #[error("current thread does not hold the synchronizer exclusively: {operation}")]
  IllegalMonitorState { operation: &'static str },
  #[error("maximum hold count exceeded")]
  HoldCountOverflow,
  #[error("acquire amount must be positive")]
  ZeroAmount,
  #[error("thread interrupted while waiting")]
  Interrupted,
  #[error("operation not supported by this policy: {operation}")]
  Unsupported { operation: &'static str },
  #[error("condition is not owned by this synchronizer")]
  ForeignCondition,
  #[error("queued node lost its predecessor")]
  MissingPredecessor,
}

impl SyncError {
  pub fn of_illegal_monitor_state(operation: &'static str) -> Self {
    SyncError::IllegalMonitorState { operation }
  }

  pub fn of_unsupported(operation: &'static str) -> Self {
    SyncError::Unsupported { operation }
  }

  pub fn is_interrupted(&self) -> bool {
    matches!(self, SyncError::Interrupted)
  }

  pub fn is_illegal_monitor_state(&self) -> bool {
    matches!(self, SyncError::IllegalMonitorState { .. })
  }
}

pub type SyncResult<T> = Result<T, SyncError>;
