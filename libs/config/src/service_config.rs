//! Cluster Configuration Module
//!
//! Provides configuration loading for processes joining the cluster.
//! Supports loading from TOML files with environment-specific overrides.

use crate::properties::{duration_millis, duration_secs, PoolSettings};
use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Main cluster configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Identity of this process within the cluster
    pub node: NodeSettings,

    /// Connection pool settings
    pub pool: PoolSettings,

    /// Health monitor schedules
    pub monitor: MonitorSettings,

    /// Proxy retry behaviour
    pub proxy: ProxySettings,
}

/// Identity of the local host and process
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct NodeSettings {
    pub host_name: String,
    pub process_name: String,
    /// Arbitrary host properties published with the host binding
    pub properties: HashMap<String, String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            process_name: "process-1".to_string(),
            properties: HashMap::new(),
        }
    }
}

/// Health monitor schedules
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorSettings {
    #[serde(rename = "process_poll_interval_secs", with = "duration_secs")]
    pub process_poll_interval: Duration,
    #[serde(rename = "service_poll_interval_secs", with = "duration_secs")]
    pub service_poll_interval: Duration,
    #[serde(rename = "ping_timeout_ms", with = "duration_millis")]
    pub ping_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            process_poll_interval: Duration::from_secs(15),
            service_poll_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Proxy retry behaviour
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProxySettings {
    /// Attempts per instance on communication failures
    pub retry_limit: u32,
    #[serde(rename = "retry_delay_ms", with = "duration_millis")]
    pub retry_delay: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl ClusterConfig {
    /// Load configuration from files with environment overrides
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new("config/cluster.toml"));

        let mut builder = Config::builder().add_source(File::from(base).required(false));

        // Add environment-specific overrides if specified
        if let Some(env) = environment {
            let env_file = PathBuf::from("config/environments").join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        // Override with environment variables (CLUSTER__ prefix)
        builder = builder.add_source(
            Environment::with_prefix("CLUSTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config
            .pool
            .validate()
            .context("Invalid connection pool settings")?;

        debug!(
            host = %config.node.host_name,
            process = %config.node.process_name,
            "Cluster configuration loaded"
        );
        Ok(config)
    }

    /// Expand environment variables in node identity values
    pub fn expand_env_vars(&mut self) -> Result<()> {
        let host = shellexpand::env(&self.node.host_name).context("Failed to expand host name")?;
        self.node.host_name = host.to_string();

        let process =
            shellexpand::env(&self.node.process_name).context("Failed to expand process name")?;
        self.node.process_name = process.to_string();

        Ok(())
    }
}

/// Convenience function to load configuration with defaults
pub fn load_config(path: Option<&Path>, environment: Option<&str>) -> Result<ClusterConfig> {
    let mut config = ClusterConfig::load(path, environment)?;
    config.expand_env_vars()?;
    Ok(config)
}
