//! Connection pool properties
//!
//! Property names, defaults and parsing for the pool's string-keyed
//! configuration surface. Every property is optional; numeric values must be
//! positive integers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Global pool capacity
pub const MAX_CONNECTIONS: &str = "ConnectionPool.MaximumConnections";

/// Per-identity sub-limit
pub const MAX_CONNECTIONS_PER_IDENTITY: &str = "ConnectionPool.MaximumConnectionsForEachID";

/// Idle eviction threshold (seconds)
pub const LIVE_AND_UNUSED_TIME: &str = "ConnectionPool.LiveAndUnusedTime";

/// `obtain` wait timeout (milliseconds)
pub const WAIT_FOR_SOURCE_TIME: &str = "ConnectionPool.WaitForSourceTime";

/// Sweep period (seconds)
pub const CLEANING_INTERVAL: &str = "ConnectionPool.CleaningInterval";

/// Toggles the idle eviction sweep
pub const ENABLE_SHRINKING: &str = "ConnectionPool.EnableShrinking";

/// Minimum gap between health-check obtains (seconds)
pub const SOURCE_CONNECTION_TEST_INTERVAL: &str = "SourceConnectionTestInterval";

pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub const DEFAULT_MAX_CONNECTIONS_PER_IDENTITY: usize = 5;
pub const DEFAULT_LIVE_AND_UNUSED_TIME_SECS: u64 = 60;
pub const DEFAULT_WAIT_FOR_SOURCE_TIME_MS: u64 = 120_000;
pub const DEFAULT_CLEANING_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_ENABLE_SHRINKING: bool = true;
pub const DEFAULT_SOURCE_CONNECTION_TEST_INTERVAL_SECS: u64 = 600;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for property '{name}': {reason}")]
    InvalidProperty {
        name: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    /// Create an invalid property error
    pub fn invalid_property(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidProperty {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Parsed connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub max_connections_per_identity: usize,
    #[serde(rename = "live_and_unused_time_secs", with = "duration_secs")]
    pub live_and_unused_time: Duration,
    #[serde(rename = "wait_for_source_time_ms", with = "duration_millis")]
    pub wait_for_source_time: Duration,
    #[serde(rename = "cleaning_interval_secs", with = "duration_secs")]
    pub cleaning_interval: Duration,
    pub enable_shrinking: bool,
    #[serde(rename = "source_connection_test_interval_secs", with = "duration_secs")]
    pub source_connection_test_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_connections_per_identity: DEFAULT_MAX_CONNECTIONS_PER_IDENTITY,
            live_and_unused_time: Duration::from_secs(DEFAULT_LIVE_AND_UNUSED_TIME_SECS),
            wait_for_source_time: Duration::from_millis(DEFAULT_WAIT_FOR_SOURCE_TIME_MS),
            cleaning_interval: Duration::from_secs(DEFAULT_CLEANING_INTERVAL_SECS),
            enable_shrinking: DEFAULT_ENABLE_SHRINKING,
            source_connection_test_interval: Duration::from_secs(
                DEFAULT_SOURCE_CONNECTION_TEST_INTERVAL_SECS,
            ),
        }
    }
}

impl PoolSettings {
    /// Parse settings from a string property map, falling back to defaults
    /// for any property that is absent.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let settings = Self {
            max_connections: positive(props, MAX_CONNECTIONS)?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_connections),
            max_connections_per_identity: positive(props, MAX_CONNECTIONS_PER_IDENTITY)?
                .map(|v| v as usize)
                .unwrap_or(defaults.max_connections_per_identity),
            live_and_unused_time: positive(props, LIVE_AND_UNUSED_TIME)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.live_and_unused_time),
            wait_for_source_time: positive(props, WAIT_FOR_SOURCE_TIME)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.wait_for_source_time),
            cleaning_interval: positive(props, CLEANING_INTERVAL)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleaning_interval),
            enable_shrinking: boolean(props, ENABLE_SHRINKING)?
                .unwrap_or(defaults.enable_shrinking),
            source_connection_test_interval: positive(props, SOURCE_CONNECTION_TEST_INTERVAL)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.source_connection_test_interval),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Reject zero limits and zero durations
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, u128); 6] = [
            (MAX_CONNECTIONS, self.max_connections as u128),
            (MAX_CONNECTIONS_PER_IDENTITY, self.max_connections_per_identity as u128),
            (LIVE_AND_UNUSED_TIME, self.live_and_unused_time.as_millis()),
            (WAIT_FOR_SOURCE_TIME, self.wait_for_source_time.as_millis()),
            (CLEANING_INTERVAL, self.cleaning_interval.as_millis()),
            (
                SOURCE_CONNECTION_TEST_INTERVAL,
                self.source_connection_test_interval.as_millis(),
            ),
        ];

        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::invalid_property(name, "0", "must be positive"));
            }
        }
        Ok(())
    }

    /// Whether a dedicated per-identity limiter is needed. The global limiter
    /// already covers the case where the sub-limit is not lower.
    pub fn limits_per_identity(&self) -> bool {
        self.max_connections_per_identity < self.max_connections
    }
}

fn positive(props: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = props.get(name) else {
        return Ok(None);
    };

    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid_property(name, raw, "not an integer"))?;

    if value <= 0 {
        return Err(ConfigError::invalid_property(name, raw, "must be positive"));
    }
    Ok(Some(value as u64))
}

fn boolean(props: &HashMap<String, String>, name: &str) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = props.get(name) else {
        return Ok(None);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(Some(true)),
        "false" => Ok(Some(false)),
        _ => Err(ConfigError::invalid_property(name, raw, "expected true or false")),
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
