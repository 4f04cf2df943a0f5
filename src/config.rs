use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const ENV_MAX_BATCH_SIZE: &str = "DATALOADER_MAX_BATCH_SIZE";
pub const ENV_BATCH_WINDOW_MS: &str = "DATALOADER_BATCH_WINDOW_MS";
pub const ENV_LIST_LIMIT: &str = "DATALOADER_LIST_LIMIT";

/// Tuning shared by every loader of a request.
///
/// ```toml
/// max_batch_size = 100
/// batch_window_ms = 2
/// list_limit = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoaderConfig {
    /// Distinct keys per batch before it is dispatched without waiting.
    pub max_batch_size: usize,
    /// How long a batch stays open after its first key.
    pub batch_window_ms: u64,
    /// Page size used by the one-to-many loaders that list by parent id.
    pub list_limit: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_window_ms: 2,
            list_limit: 1000,
        }
    }
}

impl LoaderConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `DATALOADER_*` environment variables, when set.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_MAX_BATCH_SIZE) {
            self.max_batch_size = parse_env("max_batch_size", &value)?;
        }
        if let Some(value) = lookup(ENV_BATCH_WINDOW_MS) {
            self.batch_window_ms = parse_env("batch_window_ms", &value)?;
        }
        if let Some(value) = lookup(ENV_LIST_LIMIT) {
            self.list_limit = parse_env("list_limit", &value)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.list_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "list_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// `None` only for a config that failed validation.
    pub fn max_keys(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.max_batch_size)
    }
}

fn parse_env<T>(field: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::Invalid {
            field,
            reason: format!("{:?}: {}", value, err),
        })
}
