//! Cluster Registry
//!
//! Hierarchical catalogue of the cluster: hosts contain processes, processes
//! contain a `Services` collection, and that collection holds one binding
//! per deployed service instance. All state lives in a [`TreeCache`]; the
//! registry keeps no private copy and reads always go to the cache.
//!
//! Structural invariants:
//! - a process exists only under an existing host
//! - a service binding exists only under an existing process
//! - removing a host or process removes everything beneath it
//!
//! Lookups treat processes marked not-alive as absent. Every committed
//! mutation is reported to registered [`RegistryListener`]s.

pub mod binding;
pub mod cache;
pub mod error;
pub mod handle;


pub use binding::{
    HostBinding, ProcessBinding, ServiceId, ServiceInstance, ServiceRegistryBinding, ServiceState,
};
pub use cache::{
    CacheEvent, CacheEventKind, CacheListener, ListenerId, MemoryTreeCache, NodePath, RegistryNode,
    TreeCache,
};
pub use error::{CacheError, RegistryError, Result};
pub use handle::{HandleResolver, Management, RemoteHandle};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the collection node holding a process's service bindings
pub const SERVICES_NODE: &str = "Services";

/// Observer of registry mutations
pub trait RegistryListener: Send + Sync {
    /// Called after every committed mutation anywhere in the tree
    fn registry_changed(&self, event: &CacheEvent);

    /// Called once when the registry shuts down
    fn registry_shutdown(&self) {}
}

/// Filter for [`ClusterRegistry::get_service_bindings`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceQuery {
    pub host_name: Option<String>,
    pub process_name: Option<String>,
    pub service_type: Option<String>,
    pub active_only: bool,
}

impl ServiceQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn on_host(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn in_process(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = Some(process_name.into());
        self
    }

    pub fn of_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }

    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }
}

type Listeners = Arc<RwLock<Vec<Arc<dyn RegistryListener>>>>;

/// Forwards tree cache events to registry listeners
struct ListenerBridge {
    listeners: Listeners,
}

impl CacheListener for ListenerBridge {
    fn node_changed(&self, event: &CacheEvent) {
        let listeners: Vec<Arc<dyn RegistryListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.registry_changed(event);
        }
    }
}

pub struct ClusterRegistry {
    cache: Arc<dyn TreeCache>,
    listeners: Listeners,
    bridge_id: Mutex<Option<ListenerId>>,
    /// Serializes read-modify-write sequences per subtree
    subtree_locks: DashMap<NodePath, Arc<Mutex<()>>>,
    shut_down: AtomicBool,
}

impl ClusterRegistry {
    pub fn new(cache: Arc<dyn TreeCache>) -> Self {
        let listeners: Listeners = Arc::new(RwLock::new(Vec::new()));
        let bridge_id = cache.add_listener(Arc::new(ListenerBridge {
            listeners: Arc::clone(&listeners),
        }));

        Self {
            cache,
            listeners,
            bridge_id: Mutex::new(Some(bridge_id)),
            subtree_locks: DashMap::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<dyn TreeCache> {
        &self.cache
    }

    fn host_path(host_name: &str) -> NodePath {
        NodePath::root().child(host_name)
    }

    fn process_path(host_name: &str, process_name: &str) -> NodePath {
        Self::host_path(host_name).child(process_name)
    }

    fn services_path(host_name: &str, process_name: &str) -> NodePath {
        Self::process_path(host_name, process_name).child(SERVICES_NODE)
    }

    fn subtree_lock(&self, path: &NodePath) -> Arc<Mutex<()>> {
        self.subtree_locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Hosts

    /// Add a host, or replace the binding of an existing host while keeping
    /// its processes
    pub fn add_host(&self, binding: HostBinding) -> Result<()> {
        let root = NodePath::root();
        let lock = self.subtree_lock(&root);
        let _guard = lock.lock();

        let host_name = binding.host_name.clone();
        if !self
            .cache
            .add_child(&root, &host_name, RegistryNode::Host(binding.clone()))?
        {
            self.cache
                .put(&Self::host_path(&host_name), RegistryNode::Host(binding))?;
            debug!(host = %host_name, "Host binding replaced");
        } else {
            info!(host = %host_name, "Host added to registry");
        }
        Ok(())
    }

    /// Remove a host and everything beneath it
    pub fn remove_host(&self, host_name: &str) -> Result<()> {
        let root = NodePath::root();
        let host_path = Self::host_path(host_name);
        // root before host, the same order add_host and add_process imply
        let root_lock = self.subtree_lock(&root);
        let _root_guard = root_lock.lock();
        let host_lock = self.subtree_lock(&host_path);
        let _host_guard = host_lock.lock();

        if !self.cache.remove_child(&root, host_name) {
            return Err(RegistryError::not_bound(host_path));
        }
        self.forget_locks(&host_path);
        info!(host = %host_name, "Host removed from registry");
        Ok(())
    }

    pub fn get_hosts(&self) -> Vec<HostBinding> {
        self.cache
            .children(&NodePath::root())
            .into_iter()
            .filter_map(|name| self.cache.get(&Self::host_path(&name)))
            .filter_map(RegistryNode::into_host)
            .collect()
    }

    pub fn get_host(&self, host_name: &str) -> Result<HostBinding> {
        let path = Self::host_path(host_name);
        self.cache
            .get(&path)
            .and_then(RegistryNode::into_host)
            .ok_or_else(|| RegistryError::not_bound(path))
    }

    // Processes

    /// Add a process under an existing host, replacing the binding if the
    /// process is already known
    pub fn add_process(&self, binding: ProcessBinding) -> Result<()> {
        let host_path = Self::host_path(&binding.host_name);
        let lock = self.subtree_lock(&host_path);
        let _guard = lock.lock();

        if self.cache.get(&host_path).is_none() {
            return Err(RegistryError::not_bound(host_path));
        }

        let process_path = host_path.child(&binding.process_name);
        let host_name = binding.host_name.clone();
        let process_name = binding.process_name.clone();
        let added = self
            .cache
            .add_child(&host_path, &process_name, RegistryNode::Process(binding.clone()))
            .map_err(|_| RegistryError::not_bound(&host_path))?;
        if !added {
            self.cache.put(&process_path, RegistryNode::Process(binding))?;
        }
        self.cache
            .add_child(&process_path, SERVICES_NODE, RegistryNode::Collection)
            .map_err(|_| RegistryError::not_bound(&process_path))?;

        info!(host = %host_name, process = %process_name, "Process added to registry");
        Ok(())
    }

    pub fn update_process(&self, binding: ProcessBinding) -> Result<()> {
        let host_path = Self::host_path(&binding.host_name);
        let lock = self.subtree_lock(&host_path);
        let _guard = lock.lock();

        let path = host_path.child(&binding.process_name);
        if self.cache.get(&path).and_then(RegistryNode::into_process).is_none() {
            return Err(RegistryError::not_bound(path));
        }
        debug!(
            host = %binding.host_name,
            process = %binding.process_name,
            alive = binding.alive,
            "Process binding updated"
        );
        self.cache.put(&path, RegistryNode::Process(binding))?;
        Ok(())
    }

    /// Remove a process and all of its service bindings
    pub fn remove_process(&self, host_name: &str, process_name: &str) -> Result<()> {
        let host_path = Self::host_path(host_name);
        let lock = self.subtree_lock(&host_path);
        let _guard = lock.lock();

        if !self.cache.remove_child(&host_path, process_name) {
            return Err(RegistryError::not_bound(host_path.child(process_name)));
        }
        self.forget_locks(&host_path.child(process_name));
        info!(host = %host_name, process = %process_name, "Process removed from registry");
        Ok(())
    }

    /// Every process binding, dead or alive, on one host or on all hosts
    pub fn list_processes(&self, host_name: Option<&str>) -> Result<Vec<ProcessBinding>> {
        let hosts = match host_name {
            Some(name) => {
                self.get_host(name)?;
                vec![name.to_string()]
            }
            None => self.cache.children(&NodePath::root()),
        };

        let mut processes = Vec::new();
        for host in hosts {
            let host_path = Self::host_path(&host);
            for name in self.cache.children(&host_path) {
                if let Some(process) = self
                    .cache
                    .get(&host_path.child(&name))
                    .and_then(RegistryNode::into_process)
                {
                    processes.push(process);
                }
            }
        }
        Ok(processes)
    }

    /// Live processes only
    pub fn get_vms(&self, host_name: Option<&str>) -> Result<Vec<ProcessBinding>> {
        Ok(self
            .list_processes(host_name)?
            .into_iter()
            .filter(|process| process.alive)
            .collect())
    }

    /// A process that is not alive is reported as not bound
    pub fn get_process_binding(&self, host_name: &str, process_name: &str) -> Result<ProcessBinding> {
        let path = Self::process_path(host_name, process_name);
        self.cache
            .get(&path)
            .and_then(RegistryNode::into_process)
            .filter(|process| process.alive)
            .ok_or_else(|| RegistryError::not_bound(path))
    }

    // Services

    /// Add a service binding under its process. Rejected when a binding with
    /// the same id exists, unless that binding is already bad.
    pub fn add_service_binding(&self, binding: ServiceRegistryBinding) -> Result<()> {
        let id = binding.service_id().clone();
        let process_path = Self::process_path(&id.host_name, &id.process_name);
        if self
            .cache
            .get(&process_path)
            .and_then(RegistryNode::into_process)
            .is_none()
        {
            return Err(RegistryError::not_bound(process_path));
        }

        let services = process_path.child(SERVICES_NODE);
        let lock = self.subtree_lock(&services);
        let _guard = lock.lock();

        let key = id.id.to_string();
        let path = services.child(&key);
        match self.cache.get(&path).and_then(RegistryNode::into_service) {
            Some(existing) if !existing.is_bad() => {
                return Err(RegistryError::already_bound(path));
            }
            Some(_) => {
                self.cache.put(&path, RegistryNode::Service(binding))?;
                debug!(service = %id, "Bad service binding replaced");
            }
            None => {
                // A concurrent remove_process may have taken the collection
                self.cache
                    .add_child(&process_path, SERVICES_NODE, RegistryNode::Collection)
                    .map_err(|_| RegistryError::not_bound(&process_path))?;
                self.cache
                    .add_child(&services, &key, RegistryNode::Service(binding))?;
            }
        }

        info!(service = %id, "Service binding added");
        Ok(())
    }

    pub fn update_service_binding(&self, binding: ServiceRegistryBinding) -> Result<()> {
        self.put_service_binding(binding, false).map(|_| ())
    }

    /// Update a binding unless the stored one has gone bad in the meantime.
    /// Returns whether the update was written.
    pub fn update_service_binding_unless_bad(&self, binding: ServiceRegistryBinding) -> Result<bool> {
        self.put_service_binding(binding, true)
    }

    fn put_service_binding(&self, binding: ServiceRegistryBinding, keep_bad: bool) -> Result<bool> {
        let id = binding.service_id();
        let services = Self::services_path(&id.host_name, &id.process_name);
        let lock = self.subtree_lock(&services);
        let _guard = lock.lock();

        let path = services.child(id.id.to_string());
        let current = self
            .cache
            .get(&path)
            .and_then(RegistryNode::into_service)
            .ok_or_else(|| RegistryError::not_bound(&path))?;
        if keep_bad && current.is_bad() {
            debug!(service = %id, state = %current.state(), "Service binding already bad, update skipped");
            return Ok(false);
        }
        debug!(service = %id, state = %binding.state(), "Service binding updated");
        self.cache.put(&path, RegistryNode::Service(binding))?;
        Ok(true)
    }

    pub fn remove_service_binding(&self, service_id: &ServiceId) -> Result<()> {
        let services = Self::services_path(&service_id.host_name, &service_id.process_name);
        let lock = self.subtree_lock(&services);
        let _guard = lock.lock();

        if !self.cache.remove_child(&services, &service_id.id.to_string()) {
            return Err(RegistryError::not_bound(services.child(service_id.id.to_string())));
        }
        info!(service = %service_id, "Service binding removed");
        Ok(())
    }

    pub fn get_service_binding(&self, service_id: &ServiceId) -> Result<ServiceRegistryBinding> {
        let path = Self::services_path(&service_id.host_name, &service_id.process_name)
            .child(service_id.id.to_string());
        self.cache
            .get(&path)
            .and_then(RegistryNode::into_service)
            .ok_or_else(|| RegistryError::not_bound(path))
    }

    /// Locate a binding from its id alone, `None` when it is gone
    pub fn find_service_binding(&self, service_id: &ServiceId) -> Option<ServiceRegistryBinding> {
        self.get_service_binding(service_id).ok()
    }

    /// Record that a service instance has gone bad. A binding that is
    /// already bad keeps its original state.
    pub fn mark_service_bad(&self, service_id: &ServiceId, state: ServiceState) -> Result<()> {
        let state = if state.is_bad() { state } else { ServiceState::Failed };

        let services = Self::services_path(&service_id.host_name, &service_id.process_name);
        let lock = self.subtree_lock(&services);
        let _guard = lock.lock();

        let path = services.child(service_id.id.to_string());
        let mut binding = self
            .cache
            .get(&path)
            .and_then(RegistryNode::into_service)
            .ok_or_else(|| RegistryError::not_bound(&path))?;
        if binding.is_bad() {
            return Ok(());
        }

        binding.set_state(state);
        binding.clear_dirty();
        self.cache.put(&path, RegistryNode::Service(binding))?;
        warn!(service = %service_id, %state, "Service marked bad");
        Ok(())
    }

    /// Service bindings matching a query. Services under dead processes are
    /// skipped when only active bindings are requested.
    pub fn get_service_bindings(&self, query: &ServiceQuery) -> Result<Vec<ServiceRegistryBinding>> {
        let hosts = match &query.host_name {
            Some(name) => {
                self.get_host(name)?;
                vec![name.clone()]
            }
            None => self.cache.children(&NodePath::root()),
        };

        let mut bindings = Vec::new();
        for host in hosts {
            let host_path = Self::host_path(&host);
            let processes = match &query.process_name {
                Some(name) if query.host_name.is_some() => {
                    if self.cache.get(&host_path.child(name)).is_none() {
                        return Err(RegistryError::not_bound(host_path.child(name)));
                    }
                    vec![name.clone()]
                }
                Some(name) => self
                    .cache
                    .children(&host_path)
                    .into_iter()
                    .filter(|candidate| candidate == name)
                    .collect(),
                None => self.cache.children(&host_path),
            };

            for process_name in processes {
                let process_path = host_path.child(&process_name);
                let alive = self
                    .cache
                    .get(&process_path)
                    .and_then(RegistryNode::into_process)
                    .map(|process| process.alive)
                    .unwrap_or(false);
                if query.active_only && !alive {
                    continue;
                }

                let services = process_path.child(SERVICES_NODE);
                for key in self.cache.children(&services) {
                    let Some(binding) = self
                        .cache
                        .get(&services.child(&key))
                        .and_then(RegistryNode::into_service)
                    else {
                        continue;
                    };
                    if query.active_only && !binding.is_active() {
                        continue;
                    }
                    if let Some(service_type) = &query.service_type {
                        if binding.service_type() != service_type {
                            continue;
                        }
                    }
                    bindings.push(binding);
                }
            }
        }
        Ok(bindings)
    }

    // Notification

    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Notify listeners and detach from the cache. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(id) = self.bridge_id.lock().take() {
            self.cache.remove_listener(id);
        }
        let listeners: Vec<Arc<dyn RegistryListener>> =
            std::mem::take(&mut *self.listeners.write());
        for listener in &listeners {
            listener.registry_shutdown();
        }
        self.subtree_locks.clear();
        info!(listeners = listeners.len(), "Registry shut down");
    }

    fn forget_locks(&self, prefix: &NodePath) {
        self.subtree_locks.retain(|path, _| !path.starts_with(prefix));
    }
}

impl Drop for ClusterRegistry {
    fn drop(&mut self) {
        if let Some(id) = self.bridge_id.lock().take() {
            self.cache.remove_listener(id);
        }
    }
}
