//! Runtime configuration supplied by the composition root of each context.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ContextId;

/// Default number of owners kept in the record cache.
pub const DEFAULT_RECORD_CACHE_CAPACITY: usize = 16;
/// Default lifetime of a cached record collection.
pub const DEFAULT_RECORD_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, Error)]
/// Failures while loading a [`SyncConfig`].
pub enum ConfigError {
    /// TOML text did not parse into a config.
    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    /// JSON text did not parse into a config.
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
    /// The config parsed but holds unusable values.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Per-context settings for the synchronization layer.
///
/// Every field has a default, so an empty document is a valid config.
pub struct SyncConfig {
    /// Name of the context these settings belong to.
    pub context: ContextId,
    /// Maximum number of owners with a cached record collection.
    pub record_cache_capacity: usize,
    /// Lifetime of a cached record collection in seconds.
    pub record_cache_ttl_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            context: ContextId::background(),
            record_cache_capacity: DEFAULT_RECORD_CACHE_CAPACITY,
            record_cache_ttl_secs: DEFAULT_RECORD_CACHE_TTL_SECS,
        }
    }
}

impl SyncConfig {
    /// Returns defaults for `context`.
    pub fn for_context(context: ContextId) -> Self {
        Self {
            context,
            ..Self::default()
        }
    }

    /// Sets the record cache capacity.
    pub fn with_record_cache_capacity(mut self, capacity: usize) -> Self {
        self.record_cache_capacity = capacity;
        self
    }

    /// Sets the record cache TTL.
    pub fn with_record_cache_ttl(mut self, ttl: Duration) -> Self {
        self.record_cache_ttl_secs = ttl.as_secs();
        self
    }

    /// Returns the record cache TTL.
    pub fn record_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.record_cache_ttl_secs)
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] on parse failure or [`ConfigError::Invalid`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] on parse failure or [`ConfigError::Invalid`].
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks semantic constraints that deserialization cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a blank context name or a zero cache capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.as_str().trim().is_empty() {
            return Err(ConfigError::Invalid("context must not be empty".to_string()));
        }
        if self.record_cache_capacity == 0 {
            return Err(ConfigError::Invalid(
                "record_cache_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
