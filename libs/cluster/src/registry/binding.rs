//! Registry bindings: the values stored at host, process and service nodes

use super::handle::{Management, RemoteHandle};
use crate::error::CommunicationError;
use crate::proxy::ClusterService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// A deployed service instance as seen through its binding
#[async_trait]
pub trait ServiceInstance: ClusterService {
    /// Current lifecycle state as reported by the instance itself
    async fn check_state(&self) -> Result<ServiceState, CommunicationError>;
}

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    NotInitialized,
    Open,
    DataSourceUnavailable,
    Failed,
    Closed,
    InitFailed,
}

impl ServiceState {
    /// Eligible for selection
    pub fn is_active(self) -> bool {
        matches!(self, ServiceState::Open | ServiceState::DataSourceUnavailable)
    }

    /// Terminal for this binding; a restart registers a new one
    pub fn is_bad(self) -> bool {
        matches!(
            self,
            ServiceState::Failed | ServiceState::Closed | ServiceState::InitFailed
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::NotInitialized => "not-initialized",
            ServiceState::Open => "open",
            ServiceState::DataSourceUnavailable => "data-source-unavailable",
            ServiceState::Failed => "failed",
            ServiceState::Closed => "closed",
            ServiceState::InitFailed => "init-failed",
        };
        f.write_str(name)
    }
}

/// Globally unique service identifier. Carries the owning host and process
/// so a binding can be located without a search.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub host_name: String,
    pub process_name: String,
    pub id: Uuid,
}

impl ServiceId {
    pub fn new(host_name: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            process_name: process_name.into(),
            id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.host_name, self.process_name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostBinding {
    pub host_name: String,
    pub properties: HashMap<String, String>,
    pub management: RemoteHandle<dyn Management>,
}

impl HostBinding {
    pub fn new(host_name: impl Into<String>, management: RemoteHandle<dyn Management>) -> Self {
        Self {
            host_name: host_name.into(),
            properties: HashMap::new(),
            management,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessBinding {
    pub host_name: String,
    pub process_name: String,
    pub alive: bool,
    pub management: RemoteHandle<dyn Management>,
}

impl ProcessBinding {
    /// New bindings start alive
    pub fn new(
        host_name: impl Into<String>,
        process_name: impl Into<String>,
        management: RemoteHandle<dyn Management>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            process_name: process_name.into(),
            alive: true,
            management,
        }
    }

    pub fn with_alive(mut self, alive: bool) -> Self {
        self.alive = alive;
        self
    }
}

/// Binding for one deployed service instance
#[derive(Debug, Clone)]
pub struct ServiceRegistryBinding {
    service_id: ServiceId,
    service_type: String,
    instance_name: String,
    handle: RemoteHandle<dyn ServiceInstance>,
    state: ServiceState,
    state_changed_at: DateTime<Utc>,
    dirty: bool,
    essential: bool,
}

impl ServiceRegistryBinding {
    pub fn new(
        service_id: ServiceId,
        service_type: impl Into<String>,
        instance_name: impl Into<String>,
        handle: RemoteHandle<dyn ServiceInstance>,
    ) -> Self {
        Self {
            service_id,
            service_type: service_type.into(),
            instance_name: instance_name.into(),
            handle,
            state: ServiceState::NotInitialized,
            state_changed_at: Utc::now(),
            dirty: false,
            essential: false,
        }
    }

    pub fn with_state(mut self, state: ServiceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn host_name(&self) -> &str {
        &self.service_id.host_name
    }

    pub fn process_name(&self) -> &str {
        &self.service_id.process_name
    }

    pub fn handle(&self) -> &RemoteHandle<dyn ServiceInstance> {
        &self.handle
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn state_changed_at(&self) -> DateTime<Utc> {
        self.state_changed_at
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_bad(&self) -> bool {
        self.state.is_bad()
    }

    pub fn is_essential(&self) -> bool {
        self.essential
    }

    /// Changed since the registry last saw it
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Record a new state; marks the binding dirty when it differs
    pub fn set_state(&mut self, state: ServiceState) {
        if self.state != state {
            self.state = state;
            self.state_changed_at = Utc::now();
            self.dirty = true;
        }
    }

    /// Poll the instance for its state. An unreachable instance is failed.
    pub async fn check_state(&mut self) -> ServiceState {
        let polled = match self.handle.resolve() {
            Ok(instance) => instance.check_state().await,
            Err(e) => Err(e),
        };
        match polled {
            Ok(state) => self.set_state(state),
            Err(_) => {
                self.handle.invalidate();
                self.set_state(ServiceState::Failed);
            }
        }
        self.state
    }
}

/// Bindings are the same binding when id, type, name, handle and state match
impl PartialEq for ServiceRegistryBinding {
    fn eq(&self, other: &Self) -> bool {
        self.service_id == other.service_id
            && self.service_type == other.service_type
            && self.instance_name == other.instance_name
            && self.handle == other.handle
            && self.state == other.state
            && self.essential == other.essential
    }
}
