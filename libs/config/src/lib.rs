//! # Cluster Configuration
//!
//! Centralized property names, defaults and settings loading for every
//! process that participates in the cluster.
//!
//! ## Features
//!
//! - **Pool Properties**: the string property surface understood by the
//!   connection pool, with the documented defaults
//! - **Cluster Settings**: node identity, health monitor intervals and proxy
//!   retry behaviour, loaded from TOML with environment overrides
//!
//! ## Usage
//!
//! ```rust
//! use cluster_config::{properties, PoolSettings};
//! use std::collections::HashMap;
//!
//! let mut props = HashMap::new();
//! props.insert(properties::MAX_CONNECTIONS.to_string(), "10".to_string());
//!
//! let settings = PoolSettings::from_properties(&props).unwrap();
//! assert_eq!(settings.max_connections, 10);
//! assert_eq!(settings.max_connections_per_identity, properties::DEFAULT_MAX_CONNECTIONS_PER_IDENTITY);
//! ```

pub mod properties;
pub mod service_config;

// Re-export commonly used types
pub use properties::{ConfigError, PoolSettings};
pub use service_config::{
    load_config, ClusterConfig, MonitorSettings, NodeSettings, ProxySettings,
};
