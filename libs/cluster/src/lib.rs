//! Cluster Infrastructure
//!
//! Clustering and resource-management substrate for a federated query
//! engine. Three subsystems live here:
//!
//! - [`registry`]: replicated host → process → service tree with liveness
//!   state and change notification, plus the [`monitor`] tasks that keep it
//!   current
//! - [`pool`]: bounded, identity-keyed pool of expensive source connections
//! - [`selection`] and [`proxy`]: pick a live instance of a multiply-deployed
//!   service, retry and fail over transparently, and mark bad instances
//!
//! Data flows one way: monitors mutate the registry, the registry notifies
//! listeners, the [`proxy::ProxyManager`] refreshes its selection policies,
//! and proxies report failed instances back to the registry. The pool is
//! independent of cluster topology.

pub mod error;

pub mod monitor;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod selection;

// Re-export commonly used types
pub use error::{ClusterError, CommunicationError, Result};
pub use monitor::HealthMonitor;
pub use pool::{ConnectionPool, ConnectorIdentity, PoolStatus, PooledConnection, SecurityContext};
pub use proxy::{ClusterService, InvocationMode, ProxyManager, ServiceRequest, ServiceResponse};
pub use registry::{
    ClusterRegistry, HostBinding, MemoryTreeCache, ProcessBinding, ServiceId, ServiceRegistryBinding,
    ServiceState, TreeCache,
};
pub use selection::{PolicyKind, SelectionPolicy, ServiceSelectionPolicyKey};

pub use cluster_config::{ClusterConfig, PoolSettings};
