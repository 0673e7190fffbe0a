use crate::ConfigOption;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by a synchronizer and the lock built on top of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Label attached to every log line emitted by the synchronizer.
  pub name: String,
  /// Grants the lock in queue order instead of letting newcomers barge.
  pub fair: bool,
  /// Timed waits with less time left than this spin instead of parking.
  pub spin_for_timeout_threshold: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      name: "qsync".to_string(),
      fair: false,
      spin_for_timeout_threshold: Duration::from_nanos(1000),
    }
  }
}

impl Config {
  pub fn from(options: impl IntoIterator<Item = ConfigOption>) -> Config {
    let options = options.into_iter().collect::<Vec<_>>();
    let mut config = Config::default();
    for option in options {
      option.apply(&mut config);
    }
    config
  }
}
