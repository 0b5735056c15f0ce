//! Errors surfaced through service proxies

use crate::error::CommunicationError;
use crate::registry::RegistryError;
use crate::selection::SelectionError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, InvocationError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// The call did not reach the instance or did not complete. Retried.
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    /// The instance itself is broken; the binding is marked bad
    #[error("Service {service} failed: {message}")]
    ServiceFailure { service: String, message: String },

    /// Business error from a healthy instance. Never retried.
    #[error("{message}")]
    Application { message: String },

    /// Every instance has been tried
    #[error(transparent)]
    ServiceNotFound(#[from] SelectionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl InvocationError {
    pub fn communication(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication(CommunicationError::new(target, message))
    }

    pub fn service_failure(service: impl ToString, message: impl Into<String>) -> Self {
        Self::ServiceFailure {
            service: service.to_string(),
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Communication(_))
    }

    /// Failures that disqualify the instance that produced them
    pub fn marks_bad(&self) -> bool {
        matches!(self, Self::Communication(_) | Self::ServiceFailure { .. })
    }

    pub fn is_service_not_found(&self) -> bool {
        matches!(self, Self::ServiceNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let comm = InvocationError::communication("h1/p1", "reset");
        assert!(comm.is_retryable());
        assert!(comm.marks_bad());

        let failure = InvocationError::service_failure("svc", "corrupt state");
        assert!(!failure.is_retryable());
        assert!(failure.marks_bad());

        let business = InvocationError::application("no such table");
        assert!(!business.is_retryable());
        assert!(!business.marks_bad());
        assert_eq!(business.to_string(), "no such table");
    }
}
