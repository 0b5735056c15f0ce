//! Connector identities
//!
//! An identity answers "who is connecting" and partitions the pool. The
//! embedding application decides, through an [`IdentityFactory`], whether
//! connections are shared by everyone or pooled per caller.

use super::error::{PoolError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Caller context handed to [`super::ConnectionPool::obtain`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub user_name: Option<String>,
    pub session_id: Option<String>,
    pub properties: HashMap<String, String>,
}

impl SecurityContext {
    /// Context for a named user
    pub fn for_user(user_name: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Opaque pool partition key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorIdentity(Arc<str>);

impl ConnectorIdentity {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives connector identities from caller contexts
pub trait IdentityFactory: Send + Sync {
    fn create_identity(&self, context: &SecurityContext) -> Result<ConnectorIdentity>;

    /// True when every caller shares one identity
    fn is_single_identity(&self) -> bool;
}

/// Every caller shares the same connections
#[derive(Debug, Clone)]
pub struct SingleIdentityFactory {
    identity: ConnectorIdentity,
}

impl SingleIdentityFactory {
    pub const SHARED: &'static str = "shared";

    pub fn new() -> Self {
        Self {
            identity: ConnectorIdentity::new(Self::SHARED),
        }
    }
}

impl Default for SingleIdentityFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityFactory for SingleIdentityFactory {
    fn create_identity(&self, _context: &SecurityContext) -> Result<ConnectorIdentity> {
        Ok(self.identity.clone())
    }

    fn is_single_identity(&self) -> bool {
        true
    }
}

/// Connections are pooled per calling user
#[derive(Debug, Clone, Default)]
pub struct UserIdentityFactory;

impl IdentityFactory for UserIdentityFactory {
    fn create_identity(&self, context: &SecurityContext) -> Result<ConnectorIdentity> {
        match context.user_name.as_deref() {
            Some(user) if !user.is_empty() => Ok(ConnectorIdentity::new(user)),
            _ => Err(PoolError::identity("security context carries no user name")),
        }
    }

    fn is_single_identity(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_identity_ignores_context() {
        let factory = SingleIdentityFactory::new();
        let a = factory.create_identity(&SecurityContext::for_user("alice")).unwrap();
        let b = factory.create_identity(&SecurityContext::default()).unwrap();
        assert_eq!(a, b);
        assert!(factory.is_single_identity());
    }

    #[test]
    fn test_user_identity_per_user() {
        let factory = UserIdentityFactory;
        let alice = factory.create_identity(&SecurityContext::for_user("alice")).unwrap();
        let bob = factory
            .create_identity(&SecurityContext::for_user("bob").with_session("s-1"))
            .unwrap();
        assert_ne!(alice, bob);
        assert_eq!(alice.as_str(), "alice");
        assert!(!factory.is_single_identity());

        let err = factory.create_identity(&SecurityContext::default()).unwrap_err();
        assert!(matches!(err, PoolError::Identity { .. }));
    }
}
