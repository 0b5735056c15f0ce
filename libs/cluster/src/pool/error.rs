//! Connection pool errors

use crate::error::BoxError;
use cluster_config::ConfigError;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PoolError>;

/// Which capacity permit could not be acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLimit {
    /// Pool-wide maximum
    Global,
    /// Per-identity sub-limit
    PerIdentity,
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityLimit::Global => write!(f, "global"),
            CapacityLimit::PerIdentity => write!(f, "per-identity"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    /// No permit became available within the wait budget
    #[error("Capacity exceeded for identity '{identity}': {limit} limit of {max} connections reached after waiting {waited_ms}ms")]
    CapacityExceeded {
        identity: String,
        limit: CapacityLimit,
        max: usize,
        waited_ms: u64,
    },

    /// The connection factory failed to produce a connection
    #[error("Failed to create connection for identity '{identity}': {source}")]
    ConnectionCreation {
        identity: String,
        #[source]
        source: BoxError,
    },

    #[error("Connection pool is shutting down")]
    ShuttingDown,

    #[error("Cannot derive connector identity: {message}")]
    Identity { message: String },

    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl PoolError {
    /// Create a capacity exceeded error
    pub fn capacity_exceeded(
        identity: impl ToString,
        limit: CapacityLimit,
        max: usize,
        waited_ms: u64,
    ) -> Self {
        Self::CapacityExceeded {
            identity: identity.to_string(),
            limit,
            max,
            waited_ms,
        }
    }

    /// Create a connection creation error
    pub fn connection_creation(identity: impl ToString, source: BoxError) -> Self {
        Self::ConnectionCreation {
            identity: identity.to_string(),
            source,
        }
    }

    /// Create an identity error
    pub fn identity(message: impl Into<String>) -> Self {
        Self::Identity {
            message: message.into(),
        }
    }

    /// Whether this error is a capacity/timeout error
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
