//! Tests for proxies and the proxy manager

use super::*;
use crate::error::CommunicationError;
use crate::registry::{
    HostBinding, Management, MemoryTreeCache, ProcessBinding, RemoteHandle, ServiceId,
    ServiceInstance, ServiceState,
};
use crate::selection::{PolicyKind, RoundRobinPolicy, SelectionPolicy};
use async_trait::async_trait;
use cluster_config::NodeSettings;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
enum Behavior {
    Answer(ServiceResponse),
    Unreachable,
    Broken,
    Reject,
}

struct FakeService {
    name: &'static str,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl FakeService {
    fn new(name: &'static str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name,
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        })
    }

    fn answering(name: &'static str) -> Arc<Self> {
        Self::new(name, Behavior::Answer(ServiceResponse::Value(json!(name))))
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }
}

#[async_trait]
impl ClusterService for FakeService {
    async fn invoke(&self, _request: ServiceRequest) -> Result<ServiceResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Answer(response) => Ok(response),
            Behavior::Unreachable => Err(InvocationError::communication(self.name, "connection reset")),
            Behavior::Broken => Err(InvocationError::service_failure(self.name, "corrupt state")),
            Behavior::Reject => Err(InvocationError::application("no such table")),
        }
    }
}

#[async_trait]
impl ServiceInstance for FakeService {
    async fn check_state(&self) -> std::result::Result<ServiceState, CommunicationError> {
        Ok(ServiceState::Open)
    }
}

struct FakeManagement;

#[async_trait]
impl Management for FakeManagement {
    async fn ping(&self) -> std::result::Result<(), CommunicationError> {
        Ok(())
    }
}

fn management() -> RemoteHandle<dyn Management> {
    RemoteHandle::local(Arc::new(FakeManagement) as Arc<dyn Management>)
}

/// Hosts h1 and h2, each with process p1
fn cluster() -> Arc<ClusterRegistry> {
    let registry = Arc::new(ClusterRegistry::new(Arc::new(MemoryTreeCache::new())));
    for host in ["h1", "h2"] {
        registry.add_host(HostBinding::new(host, management())).unwrap();
        registry
            .add_process(ProcessBinding::new(host, "p1", management()))
            .unwrap();
    }
    registry
}

fn deploy(registry: &ClusterRegistry, host: &str, service: &Arc<FakeService>) -> ServiceRegistryBinding {
    let binding = ServiceRegistryBinding::new(
        ServiceId::new(host, "p1"),
        "Query",
        service.name,
        RemoteHandle::local(Arc::clone(service) as Arc<dyn ServiceInstance>),
    )
    .with_state(ServiceState::Open);
    registry.add_service_binding(binding.clone()).unwrap();
    binding
}

fn state_of(registry: &ClusterRegistry, binding: &ServiceRegistryBinding) -> ServiceState {
    registry.get_service_binding(binding.service_id()).unwrap().state()
}

fn retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(100))
}

fn ordered_policy(bindings: Vec<ServiceRegistryBinding>) -> Arc<dyn SelectionPolicy<ServiceRegistryBinding>> {
    let policy = RoundRobinPolicy::new("Query", false);
    policy.update_services(bindings, Vec::new());
    Arc::new(policy)
}

fn single(
    registry: &Arc<ClusterRegistry>,
    bindings: Vec<ServiceRegistryBinding>,
    sticky: bool,
) -> SingleInvocationProxy {
    SingleInvocationProxy::new("Query", ordered_policy(bindings), Arc::clone(registry), retry(), sticky)
}

mod single_invocation {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fails_over_after_retries() {
        let registry = cluster();
        let down = FakeService::new("down", Behavior::Unreachable);
        let up = FakeService::answering("up");
        let down_binding = deploy(&registry, "h1", &down);
        let up_binding = deploy(&registry, "h2", &up);

        let proxy = single(&registry, vec![down_binding.clone(), up_binding.clone()], false);
        let response = proxy.invoke(ServiceRequest::new("execute")).await.unwrap();

        assert_eq!(response, ServiceResponse::Value(json!("up")));
        assert_eq!(down.calls(), 3);
        assert_eq!(up.calls(), 1);
        assert_eq!(state_of(&registry, &down_binding), ServiceState::Failed);
        assert_eq!(state_of(&registry, &up_binding), ServiceState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_instances_down_is_service_not_found() {
        let registry = cluster();
        let a = FakeService::new("a", Behavior::Unreachable);
        let b = FakeService::new("b", Behavior::Unreachable);
        let bindings = vec![deploy(&registry, "h1", &a), deploy(&registry, "h2", &b)];

        let proxy = single(&registry, bindings.clone(), false);
        let err = proxy.invoke(ServiceRequest::new("execute")).await.unwrap_err();

        assert!(err.is_service_not_found());
        for binding in &bindings {
            assert!(state_of(&registry, binding).is_bad());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_is_not_retried() {
        let registry = cluster();
        let service = FakeService::new("picky", Behavior::Reject);
        let binding = deploy(&registry, "h1", &service);

        let proxy = single(&registry, vec![binding.clone()], false);
        let err = proxy.invoke(ServiceRequest::new("execute")).await.unwrap_err();

        assert!(matches!(err, InvocationError::Application { .. }));
        assert_eq!(service.calls(), 1);
        assert_eq!(state_of(&registry, &binding), ServiceState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_failure_marks_bad_and_propagates() {
        let registry = cluster();
        let broken = FakeService::new("broken", Behavior::Broken);
        let healthy = FakeService::answering("healthy");
        let broken_binding = deploy(&registry, "h1", &broken);
        let healthy_binding = deploy(&registry, "h2", &healthy);

        let proxy = single(&registry, vec![broken_binding.clone(), healthy_binding], false);
        let err = proxy.invoke(ServiceRequest::new("execute")).await.unwrap_err();

        assert!(matches!(err, InvocationError::ServiceFailure { .. }));
        assert_eq!(broken.calls(), 1);
        assert_eq!(healthy.calls(), 0);
        assert_eq!(state_of(&registry, &broken_binding), ServiceState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_retry_limit() {
        let registry = cluster();
        let flaky = FakeService::new("flaky", Behavior::Unreachable);
        let binding = deploy(&registry, "h1", &flaky);
        let proxy = single(&registry, vec![binding.clone()], false);

        let healer = {
            let flaky = Arc::clone(&flaky);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                flaky.set(Behavior::Answer(ServiceResponse::Unit));
            })
        };

        let response = proxy.invoke(ServiceRequest::new("execute")).await.unwrap();
        healer.await.unwrap();

        assert_eq!(response, ServiceResponse::Unit);
        assert_eq!(flaky.calls(), 3);
        assert_eq!(state_of(&registry, &binding), ServiceState::Open);
    }
}

mod sticky {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sticks_to_first_successful_instance() {
        let registry = cluster();
        let a = FakeService::answering("a");
        let b = FakeService::answering("b");
        let a_binding = deploy(&registry, "h1", &a);
        let b_binding = deploy(&registry, "h2", &b);

        let proxy = single(&registry, vec![a_binding.clone(), b_binding], true);
        for _ in 0..4 {
            proxy.invoke(ServiceRequest::new("execute")).await.unwrap();
        }

        assert_eq!(a.calls(), 4);
        assert_eq!(b.calls(), 0);
        assert_eq!(proxy.bound_instance(), Some(a_binding.service_id().clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_committed_instance_failure_propagates() {
        let registry = cluster();
        let a = FakeService::answering("a");
        let b = FakeService::answering("b");
        let a_binding = deploy(&registry, "h1", &a);
        let b_binding = deploy(&registry, "h2", &b);

        let proxy = single(&registry, vec![a_binding.clone(), b_binding], true);
        proxy.invoke(ServiceRequest::new("execute")).await.unwrap();

        a.set(Behavior::Unreachable);
        let err = proxy.invoke(ServiceRequest::new("execute")).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(b.calls(), 0);
        assert_eq!(state_of(&registry, &a_binding), ServiceState::Failed);
        assert_eq!(proxy.bound_instance(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncommitted_sticky_proxy_fails_over() {
        let registry = cluster();
        let down = FakeService::new("down", Behavior::Unreachable);
        let up = FakeService::answering("up");
        let down_binding = deploy(&registry, "h1", &down);
        let up_binding = deploy(&registry, "h2", &up);

        let proxy = single(&registry, vec![down_binding, up_binding.clone()], true);
        proxy.invoke(ServiceRequest::new("execute")).await.unwrap();

        assert_eq!(proxy.bound_instance(), Some(up_binding.service_id().clone()));
    }
}

mod fan_out {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_collections_concatenate_in_instance_order() {
        let registry = cluster();
        let a = FakeService::new(
            "a",
            Behavior::Answer(ServiceResponse::Collection(vec![json!(1), json!(2)])),
        );
        let down = FakeService::new("down", Behavior::Unreachable);
        let b = FakeService::new("b", Behavior::Answer(ServiceResponse::Collection(vec![json!(3)])));
        let bindings = vec![
            deploy(&registry, "h1", &a),
            deploy(&registry, "h2", &down),
            deploy(&registry, "h1", &b),
        ];

        let proxy = MultipleInvocationProxy::new(
            "Query",
            ordered_policy(bindings.clone()),
            Arc::clone(&registry),
            retry(),
        );
        let response = proxy
            .invoke(ServiceRequest::collecting("listTables"))
            .await
            .unwrap();

        assert_eq!(
            response,
            ServiceResponse::Collection(vec![json!(1), json!(2), json!(3)])
        );
        assert_eq!(down.calls(), 3);
        assert_eq!(state_of(&registry, &bindings[1]), ServiceState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_collection_result_is_discarded() {
        let registry = cluster();
        let a = FakeService::answering("a");
        let b = FakeService::answering("b");
        let bindings = vec![deploy(&registry, "h1", &a), deploy(&registry, "h2", &b)];

        let proxy =
            MultipleInvocationProxy::new("Query", ordered_policy(bindings), Arc::clone(&registry), retry());
        let response = proxy.invoke(ServiceRequest::new("flushCache")).await.unwrap();

        assert_eq!(response, ServiceResponse::Unit);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_instances_is_an_empty_result() {
        let registry = cluster();
        let proxy =
            MultipleInvocationProxy::new("Query", ordered_policy(Vec::new()), registry, retry());

        assert_eq!(
            proxy.invoke(ServiceRequest::collecting("listTables")).await.unwrap(),
            ServiceResponse::Collection(Vec::new())
        );
        assert_eq!(
            proxy.invoke(ServiceRequest::new("flushCache")).await.unwrap(),
            ServiceResponse::Unit
        );
    }
}

mod manager {
    use super::*;
    use crate::registry::{
        CacheError, CacheListener, ListenerId, NodePath, RegistryNode, TreeCache, SERVICES_NODE,
    };

    type Hook = Box<dyn FnOnce() + Send>;

    /// Memory cache that runs a one-shot hook right after listing the
    /// children of one node
    struct HookedCache {
        inner: MemoryTreeCache,
        trigger: NodePath,
        hook: Mutex<Option<Hook>>,
    }

    impl HookedCache {
        fn new(trigger: NodePath) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryTreeCache::new(),
                trigger,
                hook: Mutex::new(None),
            })
        }
    }

    impl TreeCache for HookedCache {
        fn get(&self, path: &NodePath) -> Option<RegistryNode> {
            self.inner.get(path)
        }

        fn put(&self, path: &NodePath, node: RegistryNode) -> std::result::Result<(), CacheError> {
            self.inner.put(path, node)
        }

        fn add_child(
            &self,
            parent: &NodePath,
            name: &str,
            node: RegistryNode,
        ) -> std::result::Result<bool, CacheError> {
            self.inner.add_child(parent, name, node)
        }

        fn remove_child(&self, parent: &NodePath, name: &str) -> bool {
            self.inner.remove_child(parent, name)
        }

        fn children(&self, path: &NodePath) -> Vec<String> {
            let names = self.inner.children(path);
            if *path == self.trigger {
                let hook = self.hook.lock().take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            names
        }

        fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
            self.inner.add_listener(listener)
        }

        fn remove_listener(&self, id: ListenerId) {
            self.inner.remove_listener(id)
        }
    }

    fn node() -> NodeSettings {
        NodeSettings {
            host_name: "h1".to_string(),
            process_name: "p1".to_string(),
            ..NodeSettings::default()
        }
    }

    /// Let the refresh task run
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_policy_per_key() {
        let registry = cluster();
        let manager = ProxyManager::start(Arc::clone(&registry), &node(), &ProxySettings::default());

        let first = manager.policy("Query", PolicyKind::RoundRobin);
        let second = manager.policy("Query", PolicyKind::RoundRobin);
        manager.policy("Query", PolicyKind::Random);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.policy_count(), 2);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_policies_follow_registry_changes() {
        let registry = cluster();
        let manager = ProxyManager::start(Arc::clone(&registry), &node(), &ProxySettings::default());
        let proxy = manager.find_or_create_proxy("Query", PolicyKind::RoundRobin, InvocationMode::Single);

        let err = proxy.invoke(ServiceRequest::new("execute")).await.unwrap_err();
        assert!(err.is_service_not_found());

        let service = FakeService::answering("late");
        let binding = deploy(&registry, "h2", &service);
        settle().await;

        proxy.invoke(ServiceRequest::new("execute")).await.unwrap();
        assert_eq!(service.calls(), 1);

        registry
            .mark_service_bad(binding.service_id(), ServiceState::Closed)
            .unwrap();
        settle().await;

        assert!(manager
            .policy("Query", PolicyKind::RoundRobin)
            .instances()
            .is_err());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_instances_preferred() {
        let registry = cluster();
        let local = FakeService::answering("local");
        let remote = FakeService::answering("remote");
        deploy(&registry, "h1", &local);
        deploy(&registry, "h2", &remote);

        let manager = ProxyManager::start(Arc::clone(&registry), &node(), &ProxySettings::default());
        let proxy =
            manager.find_or_create_proxy("Query", PolicyKind::RoundRobinLocal, InvocationMode::Single);
        for _ in 0..3 {
            proxy.invoke(ServiceRequest::new("execute")).await.unwrap();
        }
        assert_eq!(local.calls(), 3);
        assert_eq!(remote.calls(), 0);

        let fan_out =
            manager.find_or_create_proxy("Query", PolicyKind::RoundRobinLocal, InvocationMode::Multiple);
        fan_out.invoke(ServiceRequest::new("flushCache")).await.unwrap();
        assert_eq!(remote.calls(), 1);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_process_services_leave_policies() {
        let registry = cluster();
        let remote = FakeService::answering("remote");
        deploy(&registry, "h2", &remote);

        let manager = ProxyManager::start(Arc::clone(&registry), &node(), &ProxySettings::default());
        let policy = manager.policy("Query", PolicyKind::Random);
        assert_eq!(policy.instances().unwrap().len(), 1);

        registry
            .update_process(ProcessBinding::new("h2", "p1", management()).with_alive(false))
            .unwrap();
        settle().await;

        assert!(policy.instances().is_err());
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_during_policy_creation_is_not_lost() {
        // h1's services are read before h2's, so a binding added to h1 while
        // h2 is being listed is missed by that read
        let cache = HookedCache::new(NodePath::root().child("h2").child("p1").child(SERVICES_NODE));
        let registry = Arc::new(ClusterRegistry::new(Arc::clone(&cache) as Arc<dyn TreeCache>));
        for host in ["h1", "h2"] {
            registry.add_host(HostBinding::new(host, management())).unwrap();
            registry
                .add_process(ProcessBinding::new(host, "p1", management()))
                .unwrap();
        }
        deploy(&registry, "h2", &FakeService::answering("early"));
        let manager = ProxyManager::start(Arc::clone(&registry), &node(), &ProxySettings::default());

        let late = FakeService::answering("late");
        let weak = Arc::downgrade(&registry);
        *cache.hook.lock() = Some(Box::new(move || {
            if let Some(registry) = weak.upgrade() {
                deploy(&registry, "h1", &late);
            }
        }));

        // No yield: the refresh task has not had a chance to run
        let policy = manager.policy("Query", PolicyKind::RoundRobin);
        assert!(cache.hook.lock().is_none());
        assert_eq!(policy.instances().unwrap().len(), 2);

        settle().await;
        assert_eq!(policy.instances().unwrap().len(), 2);
        manager.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_alongside_background_pass() {
        let registry = cluster();
        let manager = ProxyManager::start(Arc::clone(&registry), &node(), &ProxySettings::default());
        let policy = manager.policy("Query", PolicyKind::Random);
        assert!(policy.instances().is_err());

        deploy(&registry, "h1", &FakeService::answering("a"));
        manager.refresh_now();
        assert_eq!(policy.instances().unwrap().len(), 1);

        deploy(&registry, "h2", &FakeService::answering("b"));
        settle().await;
        manager.refresh_now();
        assert_eq!(policy.instances().unwrap().len(), 2);
        manager.shutdown();
    }
}
