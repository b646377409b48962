//! Pool configuration and its override layers
//!
//! Effective options are built in a fixed order: defaults, then the
//! environment override, then the process-wide override, then per-call values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{PgmuxError, Result};

/// Environment variable holding a JSON [`PoolOptionsOverride`]
pub const POOL_OPTIONS_ENV: &str = "PGMUX_POOL_OPTIONS";

/// Application name reported to the backend when none is given
pub const DEFAULT_APPLICATION_NAME: &str = "transactor";

/// Options used to build one physical pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Minimum number of connections to keep
    pub min_size: usize,
    /// Maximum number of connections
    pub max_size: usize,
    /// Idle connections older than this are closed; `None` keeps them forever
    pub idle_timeout_ms: Option<u64>,
    /// Timeout for opening one physical connection
    pub connect_timeout_ms: u64,
    /// Timeout for waiting on a free connection
    pub acquire_timeout_ms: u64,
    /// Grace period for in-flight work when the pool is torn down
    pub drain_timeout_ms: u64,
    /// Tag identifying this application to the backend
    pub application_name: String,
    /// Database name overriding the one in the connection string
    pub database: Option<String>,
    /// Whether drivers should use named prepared statements
    pub prepare: bool,
}

impl PoolOptions {
    /// Get the idle timeout as a Duration if set
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    /// Get the connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get the acquire timeout as a Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Get the drain timeout as a Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Check sizing constraints
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(PgmuxError::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PgmuxError::Configuration(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }

    /// Stable text form used to key shared pools
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

impl Default for PoolOptions {
    /// Defaults:
    /// - min_size: 2
    /// - max_size: 10
    /// - idle_timeout: never
    /// - connect_timeout: 30 seconds
    /// - acquire_timeout: 30 seconds
    /// - drain_timeout: 1 second
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            idle_timeout_ms: None,
            connect_timeout_ms: 30_000,
            acquire_timeout_ms: 30_000,
            drain_timeout_ms: 1_000,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
            database: None,
            prepare: false,
        }
    }
}

/// Partial [`PoolOptions`]; every set field replaces the base value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolOptionsOverride {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub application_name: Option<String>,
    pub database: Option<String>,
    pub prepare: Option<bool>,
}

impl PoolOptionsOverride {
    /// Parse an override from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| PgmuxError::Configuration(format!("invalid pool options: {}", e)))
    }

    /// Read the override from [`POOL_OPTIONS_ENV`], if set
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var(POOL_OPTIONS_ENV) {
            Ok(text) if !text.trim().is_empty() => Self::from_json(&text).map(Some),
            _ => Ok(None),
        }
    }

    /// Override for the per-call values of an acquisition
    pub fn per_call(database: Option<&str>, application_name: Option<&str>) -> Self {
        Self {
            database: database.map(str::to_string),
            application_name: application_name.map(str::to_string),
            ..Self::default()
        }
    }

    /// Write every set field into `options`
    pub fn apply_to(&self, options: &mut PoolOptions) {
        if let Some(v) = self.min_size {
            options.min_size = v;
        }
        if let Some(v) = self.max_size {
            options.max_size = v;
        }
        if let Some(v) = self.idle_timeout_ms {
            options.idle_timeout_ms = Some(v);
        }
        if let Some(v) = self.connect_timeout_ms {
            options.connect_timeout_ms = v;
        }
        if let Some(v) = self.acquire_timeout_ms {
            options.acquire_timeout_ms = v;
        }
        if let Some(v) = self.drain_timeout_ms {
            options.drain_timeout_ms = v;
        }
        if let Some(v) = &self.application_name {
            options.application_name = v.clone();
        }
        if let Some(v) = &self.database {
            options.database = Some(v.clone());
        }
        if let Some(v) = self.prepare {
            options.prepare = v;
        }
    }
}

/// Merge override layers over the defaults, lowest precedence first
pub fn merge_options<'a>(layers: impl IntoIterator<Item = &'a PoolOptionsOverride>) -> PoolOptions {
    let mut options = PoolOptions::default();
    for layer in layers {
        layer.apply_to(&mut options);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let options = PoolOptions::default();
        assert_eq!(options.min_size, 2);
        assert_eq!(options.max_size, 10);
        assert_eq!(options.idle_timeout(), None);
        assert_eq!(options.connect_timeout(), Duration::from_secs(30));
        assert_eq!(options.drain_timeout(), Duration::from_secs(1));
        assert_eq!(options.application_name, "transactor");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_later_layers_win() {
        let process = PoolOptionsOverride {
            max_size: Some(20),
            application_name: Some("worker".into()),
            ..Default::default()
        };
        let call = PoolOptionsOverride::per_call(Some("tenant"), Some("indexer"));

        let options = merge_options([&process, &call]);
        assert_eq!(options.max_size, 20);
        assert_eq!(options.application_name, "indexer");
        assert_eq!(options.database.as_deref(), Some("tenant"));
        assert_eq!(options.min_size, 2);
    }

    #[test]
    fn test_per_call_none_keeps_process_value() {
        let process = PoolOptionsOverride {
            application_name: Some("worker".into()),
            ..Default::default()
        };
        let call = PoolOptionsOverride::per_call(None, None);
        let options = merge_options([&process, &call]);
        assert_eq!(options.application_name, "worker");
    }

    #[test]
    fn test_from_json() {
        let parsed = PoolOptionsOverride::from_json(r#"{"max_size": 4, "prepare": true}"#).unwrap();
        assert_eq!(parsed.max_size, Some(4));
        assert_eq!(parsed.prepare, Some(true));
        assert!(PoolOptionsOverride::from_json(r#"{"max": 4}"#).is_err());
    }

    #[test]
    fn test_validate_sizes() {
        let options = PoolOptions {
            min_size: 5,
            max_size: 2,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(PgmuxError::Configuration(_))));

        let options = PoolOptions {
            max_size: 0,
            min_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_options() {
        let a = PoolOptions::default();
        let b = PoolOptions {
            database: Some("other".into()),
            ..Default::default()
        };
        assert_eq!(a.fingerprint(), PoolOptions::default().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
