//! Proxy manager: policy cache and registry-driven refresh

use super::multiple::MultipleInvocationProxy;
use super::service::ClusterService;
use super::single::SingleInvocationProxy;
use super::{InvocationMode, RetryPolicy};
use crate::registry::{
    CacheEvent, ClusterRegistry, RegistryListener, ServiceQuery, ServiceRegistryBinding,
};
use crate::selection::{PolicyKind, SelectionPolicy, ServiceSelectionPolicyKey};
use cluster_config::{NodeSettings, ProxySettings};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SharedPolicy = Arc<dyn SelectionPolicy<ServiceRegistryBinding>>;

/// Wakes the refresh task. Notifications arriving while a pass runs
/// collapse into one further pass.
struct RefreshTrigger {
    signal: Arc<Notify>,
}

impl RegistryListener for RefreshTrigger {
    fn registry_changed(&self, _event: &CacheEvent) {
        self.signal.notify_one();
    }

    fn registry_shutdown(&self) {
        self.signal.notify_one();
    }
}

/// State shared between the manager and its refresh task
struct PolicyTable {
    registry: Arc<ClusterRegistry>,
    local_host: String,
    local_process: String,
    policies: DashMap<ServiceSelectionPolicyKey, SharedPolicy>,
    /// Held for the whole of a refresh pass
    refreshing: Mutex<()>,
}

impl PolicyTable {
    fn is_local(&self, binding: &ServiceRegistryBinding) -> bool {
        binding.host_name() == self.local_host && binding.process_name() == self.local_process
    }

    fn populate(&self, key: &ServiceSelectionPolicyKey, policy: &SharedPolicy) {
        let query = ServiceQuery::all().of_type(&key.service_type).active_only();
        let bindings = match self.registry.get_service_bindings(&query) {
            Ok(bindings) => bindings,
            Err(e) => {
                warn!(policy = %key, error = %e, "Cannot read service bindings");
                return;
            }
        };

        let (local, remote): (Vec<_>, Vec<_>) =
            bindings.into_iter().partition(|binding| self.is_local(binding));
        debug!(
            policy = %key,
            local = local.len(),
            remote = remote.len(),
            "Selection policy refreshed"
        );
        policy.update_services(local, remote);
    }

    fn refresh_one(&self, key: &ServiceSelectionPolicyKey, policy: &SharedPolicy) {
        let _pass = self.refreshing.lock();
        self.populate(key, policy);
    }

    fn refresh_all(&self) {
        let _pass = self.refreshing.lock();
        let entries: Vec<(ServiceSelectionPolicyKey, SharedPolicy)> = self
            .policies
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (key, policy) in &entries {
            self.populate(key, policy);
        }
    }
}

pub struct ProxyManager {
    table: Arc<PolicyTable>,
    retry: RetryPolicy,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyManager {
    /// Create the manager and its refresh task. Must be called within a
    /// tokio runtime.
    pub fn start(
        registry: Arc<ClusterRegistry>,
        node: &NodeSettings,
        settings: &ProxySettings,
    ) -> Arc<Self> {
        let table = Arc::new(PolicyTable {
            registry: Arc::clone(&registry),
            local_host: node.host_name.clone(),
            local_process: node.process_name.clone(),
            policies: DashMap::new(),
            refreshing: Mutex::new(()),
        });

        let signal = Arc::new(Notify::new());
        registry.add_listener(Arc::new(RefreshTrigger {
            signal: Arc::clone(&signal),
        }));

        let refresh_table = Arc::clone(&table);
        let refresher = tokio::spawn(async move {
            loop {
                signal.notified().await;
                if refresh_table.registry.is_shut_down() {
                    break;
                }
                refresh_table.refresh_all();
            }
        });

        info!(
            host = %node.host_name,
            process = %node.process_name,
            "Proxy manager started"
        );

        Arc::new(Self {
            table,
            retry: RetryPolicy::from(settings),
            refresher: Mutex::new(Some(refresher)),
        })
    }

    /// The cached policy for a key, created and populated on first use
    pub fn policy(&self, service_type: &str, kind: PolicyKind) -> SharedPolicy {
        let key = ServiceSelectionPolicyKey::new(service_type, kind);
        if let Some(existing) = self.table.policies.get(&key) {
            return Arc::clone(existing.value());
        }

        let fresh = kind.create::<ServiceRegistryBinding>(service_type);
        self.table.populate(&key, &fresh);

        let (policy, created) = match self.table.policies.entry(key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&fresh));
                (fresh, true)
            }
        };

        // A change landing before the insert was missed by refresh passes
        if created {
            self.table.refresh_one(&key, &policy);
            debug!(policy = %key, "Selection policy created");
        }
        policy
    }

    /// A new proxy of the requested mode over the cached policy
    pub fn find_or_create_proxy(
        &self,
        service_type: &str,
        kind: PolicyKind,
        mode: InvocationMode,
    ) -> Arc<dyn ClusterService> {
        let policy = self.policy(service_type, kind);
        let registry = Arc::clone(&self.table.registry);

        match mode {
            InvocationMode::Single | InvocationMode::Sticky => Arc::new(SingleInvocationProxy::new(
                service_type,
                policy,
                registry,
                self.retry,
                mode == InvocationMode::Sticky,
            )),
            InvocationMode::Multiple => Arc::new(MultipleInvocationProxy::new(
                service_type,
                policy,
                registry,
                self.retry,
            )),
        }
    }

    /// Refresh every cached policy on the calling thread. Waits for a pass
    /// already in progress.
    pub fn refresh_now(&self) {
        self.table.refresh_all();
    }

    pub fn policy_count(&self) -> usize {
        self.table.policies.len()
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
            info!("Proxy manager shut down");
        }
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        if let Some(task) = self.refresher.get_mut().take() {
            task.abort();
        }
    }
}
