//! Service Selection Policies
//!
//! A policy holds two candidate lists for one service type, the instances
//! local to this process and the remote ones, and answers "which instance
//! next" and "all instances, in policy order". Lists are replaced wholesale
//! by [`SelectionPolicy::update_services`] whenever the registry changes.
//!
//! Policies are pure in-memory algorithms: every read is a short critical
//! section on the policy itself and never waits on I/O.

mod random;
mod round_robin;

pub use random::RandomPolicy;
pub use round_robin::RoundRobinPolicy;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// Both candidate lists are empty
    #[error("No instance of service '{service_type}' is available")]
    ServiceNotFound { service_type: String },
}

impl SelectionError {
    pub fn service_not_found(service_type: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service_type: service_type.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SelectionError>;

/// Instance selection over a local and a remote candidate list
pub trait SelectionPolicy<T>: Send + Sync {
    /// The next instance to try
    fn next_instance(&self) -> Result<T>;

    /// Every instance, in the order this policy would try them
    fn instances(&self) -> Result<Vec<T>>;

    /// Atomically replace both candidate lists
    fn update_services(&self, local: Vec<T>, remote: Vec<T>);

    fn kind(&self) -> PolicyKind;
}

/// Available policy types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    RoundRobin,
    RoundRobinLocal,
    Random,
    RandomLocal,
}

impl PolicyKind {
    pub fn prefers_local(self) -> bool {
        matches!(self, PolicyKind::RoundRobinLocal | PolicyKind::RandomLocal)
    }

    /// Build an empty policy of this kind
    pub fn create<T>(self, service_type: &str) -> Arc<dyn SelectionPolicy<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        match self {
            PolicyKind::RoundRobin | PolicyKind::RoundRobinLocal => {
                Arc::new(RoundRobinPolicy::new(service_type, self.prefers_local()))
            }
            PolicyKind::Random | PolicyKind::RandomLocal => {
                Arc::new(RandomPolicy::new(service_type, self.prefers_local()))
            }
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyKind::RoundRobin => "round-robin",
            PolicyKind::RoundRobinLocal => "round-robin-local",
            PolicyKind::Random => "random",
            PolicyKind::RandomLocal => "random-local",
        };
        f.write_str(name)
    }
}

impl FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" => Ok(PolicyKind::RoundRobin),
            "round-robin-local" | "roundrobinlocal" => Ok(PolicyKind::RoundRobinLocal),
            "random" => Ok(PolicyKind::Random),
            "random-local" | "randomlocal" => Ok(PolicyKind::RandomLocal),
            other => Err(format!("unknown selection policy '{other}'")),
        }
    }
}

/// One live policy exists per key for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceSelectionPolicyKey {
    pub service_type: String,
    pub kind: PolicyKind,
}

impl ServiceSelectionPolicyKey {
    pub fn new(service_type: impl Into<String>, kind: PolicyKind) -> Self {
        Self {
            service_type: service_type.into(),
            kind,
        }
    }
}

impl fmt::Display for ServiceSelectionPolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.service_type, self.kind)
    }
}
