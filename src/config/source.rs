//! Where configuration comes from.

use std::path::PathBuf;

use crate::config::{ConfigError, SchedulerConfig};

/// Configuration reloaded at the start of every session and scheduler tick.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Read from a JSON file each time; missing means defaults.
    File(PathBuf),
    /// A fixed value, validated on every load.
    Fixed(SchedulerConfig),
}

impl ConfigSource {
    /// Current configuration.
    ///
    /// # Errors
    ///
    /// Read, parse or validation failures.
    pub fn load(&self) -> Result<SchedulerConfig, ConfigError> {
        match self {
            Self::File(path) => SchedulerConfig::load(path),
            Self::Fixed(cfg) => {
                cfg.validate()?;
                Ok(cfg.clone())
            }
        }
    }
}

impl From<SchedulerConfig> for ConfigSource {
    fn from(cfg: SchedulerConfig) -> Self {
        Self::Fixed(cfg)
    }
}
