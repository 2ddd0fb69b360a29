//! Configuration types
//!
//! Configuration is loaded from environment variables with defaults
//! suitable for development, then validated before use.

use crate::{ConfigError, HorizonResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// When the aggregate is recomputed after a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InvalidationPolicy {
    /// Writes only adjust expiration markers; readers pay for recompute.
    #[default]
    Lazy,
    /// Writes recompute affected rows synchronously.
    Eager,
}

impl InvalidationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationPolicy::Lazy => "lazy",
            InvalidationPolicy::Eager => "eager",
        }
    }
}

impl fmt::Display for InvalidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvalidationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lazy" => Ok(InvalidationPolicy::Lazy),
            "eager" => Ok(InvalidationPolicy::Eager),
            _ => Err(ConfigError::InvalidValue {
                field: "policy".to_string(),
                value: s.to_string(),
                reason: "expected 'lazy' or 'eager'".to_string(),
            }),
        }
    }
}

/// Configuration for the cache engine and its storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonConfig {
    /// Invalidation policy applied by the tracker.
    pub policy: InvalidationPolicy,
    /// Number of rows fetched per batch by a full scan.
    pub scan_batch_size: usize,
    /// Directory for the LMDB row store. `None` keeps rows in memory.
    pub lmdb_path: Option<PathBuf>,
    /// LMDB map size in megabytes.
    pub lmdb_max_size_mb: usize,
    /// Log every event applied by the mutation feed at info level instead of
    /// trace.
    pub feed_log_events: bool,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            policy: InvalidationPolicy::Lazy,
            scan_batch_size: 256,
            lmdb_path: None,
            lmdb_max_size_mb: 64,
            feed_log_events: false,
        }
    }
}

impl HorizonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a HorizonConfig from environment variables.
    ///
    /// Environment variables:
    /// - `HORIZON_POLICY`: "lazy" or "eager" (default: lazy)
    /// - `HORIZON_SCAN_BATCH_SIZE`: rows per scan batch (default: 256)
    /// - `HORIZON_LMDB_PATH`: LMDB directory (default: unset, in-memory rows)
    /// - `HORIZON_LMDB_MAX_SIZE_MB`: LMDB map size (default: 64)
    /// - `HORIZON_FEED_LOG_EVENTS`: "true" or "1" to log each event (default: false)
    ///
    /// Unparseable values are reported rather than silently replaced.
    pub fn from_env() -> HorizonResult<Self> {
        let defaults = Self::default();

        let policy = match std::env::var("HORIZON_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.policy,
        };

        let scan_batch_size =
            parse_env("HORIZON_SCAN_BATCH_SIZE")?.unwrap_or(defaults.scan_batch_size);

        let lmdb_path = std::env::var("HORIZON_LMDB_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let lmdb_max_size_mb =
            parse_env("HORIZON_LMDB_MAX_SIZE_MB")?.unwrap_or(defaults.lmdb_max_size_mb);

        let feed_log_events = std::env::var("HORIZON_FEED_LOG_EVENTS")
            .map(|s| s == "true" || s == "1")
            .unwrap_or(defaults.feed_log_events);

        let config = Self {
            policy,
            scan_batch_size,
            lmdb_path,
            lmdb_max_size_mb,
            feed_log_events,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_policy(mut self, policy: InvalidationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    pub fn with_lmdb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lmdb_path = Some(path.into());
        self
    }

    pub fn with_lmdb_max_size_mb(mut self, size_mb: usize) -> Self {
        self.lmdb_max_size_mb = size_mb;
        self
    }

    pub fn with_feed_log_events(mut self, enabled: bool) -> Self {
        self.feed_log_events = enabled;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - scan_batch_size > 0
    /// - lmdb_max_size_mb > 0
    pub fn validate(&self) -> HorizonResult<()> {
        if self.scan_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan_batch_size".to_string(),
                value: self.scan_batch_size.to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        if self.lmdb_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_max_size_mb".to_string(),
                value: self.lmdb_max_size_mb.to_string(),
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: "not a valid number".to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HorizonError;

    #[test]
    fn test_default_config_is_valid() {
        let config = HorizonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy, InvalidationPolicy::Lazy);
        assert!(config.lmdb_path.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = HorizonConfig::new()
            .with_policy(InvalidationPolicy::Eager)
            .with_scan_batch_size(8)
            .with_lmdb_path("/tmp/horizon")
            .with_lmdb_max_size_mb(16)
            .with_feed_log_events(true);

        assert_eq!(config.policy, InvalidationPolicy::Eager);
        assert_eq!(config.scan_batch_size, 8);
        assert_eq!(config.lmdb_path, Some(PathBuf::from("/tmp/horizon")));
        assert_eq!(config.lmdb_max_size_mb, 16);
        assert!(config.feed_log_events);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = HorizonConfig::new()
            .with_scan_batch_size(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            HorizonError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "scan_batch_size"
        ));
    }

    #[test]
    fn test_zero_map_size_rejected() {
        let result = HorizonConfig::new().with_lmdb_max_size_mb(0).validate();
        assert!(result.is_err());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("lazy".parse::<InvalidationPolicy>().unwrap(), InvalidationPolicy::Lazy);
        assert_eq!(" Eager ".parse::<InvalidationPolicy>().unwrap(), InvalidationPolicy::Eager);
        assert!("snapshot".parse::<InvalidationPolicy>().is_err());
        assert_eq!(InvalidationPolicy::Eager.to_string(), "eager");
    }
}
