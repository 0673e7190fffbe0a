use crate::Config;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum ConfigOption {
  SetName(String),
  SetFair(bool),
  SetSpinForTimeoutThreshold(Duration),
}

impl ConfigOption {
  pub(crate) fn apply(&self, config: &mut Config) {
    match self {
      ConfigOption::SetName(name) => {
        config.name = name.clone();
      }
      ConfigOption::SetFair(fair) => {
        config.fair = *fair;
      }
      ConfigOption::SetSpinForTimeoutThreshold(threshold) => {
        config.spin_for_timeout_threshold = *threshold;
      }
    }
  }

  pub fn with_name(name: impl Into<String>) -> ConfigOption {
    ConfigOption::SetName(name.into())
  }

  pub fn with_fair(fair: bool) -> ConfigOption {
    ConfigOption::SetFair(fair)
  }

  pub fn with_spin_for_timeout_threshold(threshold: Duration) -> ConfigOption {
    ConfigOption::SetSpinForTimeoutThreshold(threshold)
  }
}
