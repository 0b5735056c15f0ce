//! Cluster Error Types
//!
//! Each subsystem owns a typed error; [`ClusterError`] gathers them for
//! callers that drive more than one subsystem.

use thiserror::Error;

pub use crate::pool::PoolError;
pub use crate::proxy::InvocationError;
pub use crate::registry::RegistryError;
pub use crate::selection::SelectionError;
pub use cluster_config::ConfigError;

/// Boxed error used for externally supplied failure sources
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Umbrella error for the whole crate
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type alias for cross-subsystem operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Failure of the remote call layer itself: the target could not be reached
/// or the call did not complete. The only failure kind that is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Communication error with {target}: {message}")]
pub struct CommunicationError {
    pub target: String,
    pub message: String,
}

impl CommunicationError {
    /// Create a communication error
    pub fn new(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            message: message.into(),
        }
    }
}
