//! Error types for the registry

use crate::error::CommunicationError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Tree cache primitive failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("No node at '{path}'")]
    NoSuchNode { path: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The host, process or service does not exist (or is not alive)
    #[error("'{path}' is not bound in the registry")]
    NotBound { path: String },

    /// A live binding already exists under this identifier
    #[error("'{path}' is already bound in the registry")]
    AlreadyBound { path: String },

    #[error("Registry cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Cannot resolve handle: {0}")]
    Resolve(#[from] CommunicationError),
}

impl RegistryError {
    pub fn not_bound(path: impl ToString) -> Self {
        Self::NotBound {
            path: path.to_string(),
        }
    }

    pub fn already_bound(path: impl ToString) -> Self {
        Self::AlreadyBound {
            path: path.to_string(),
        }
    }

    pub fn is_not_bound(&self) -> bool {
        matches!(self, Self::NotBound { .. })
    }

    pub fn is_already_bound(&self) -> bool {
        matches!(self, Self::AlreadyBound { .. })
    }
}
