//! Single-instance invocation with fail-over

use super::error::{InvocationError, Result};
use super::service::{ClusterService, ServiceRequest, ServiceResponse};
use super::{invoke_with_retry, report_bad, RetryPolicy};
use crate::registry::{ClusterRegistry, ServiceId, ServiceRegistryBinding};
use crate::selection::{SelectionError, SelectionPolicy};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct SingleInvocationProxy {
    service_type: String,
    policy: Arc<dyn SelectionPolicy<ServiceRegistryBinding>>,
    registry: Arc<ClusterRegistry>,
    retry: RetryPolicy,
    sticky: bool,
    /// Instance committed to by a successful sticky call
    bound: Mutex<Option<ServiceRegistryBinding>>,
}

impl SingleInvocationProxy {
    pub fn new(
        service_type: impl Into<String>,
        policy: Arc<dyn SelectionPolicy<ServiceRegistryBinding>>,
        registry: Arc<ClusterRegistry>,
        retry: RetryPolicy,
        sticky: bool,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            policy,
            registry,
            retry,
            sticky,
            bound: Mutex::new(None),
        }
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// The committed sticky instance, if any
    pub fn bound_instance(&self) -> Option<ServiceId> {
        self.bound
            .lock()
            .as_ref()
            .map(|binding| binding.service_id().clone())
    }

    /// Next instance not yet tried by this call. The policy may still list
    /// instances this call already gave up on until the next refresh.
    fn next_untried(&self, tried: &HashSet<ServiceId>) -> Result<ServiceRegistryBinding> {
        let candidate = self.policy.next_instance()?;
        if !tried.contains(candidate.service_id()) {
            return Ok(candidate);
        }
        self.policy
            .instances()?
            .into_iter()
            .find(|binding| !tried.contains(binding.service_id()))
            .ok_or_else(|| SelectionError::service_not_found(&self.service_type).into())
    }
}

#[async_trait]
impl ClusterService for SingleInvocationProxy {
    async fn invoke(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let mut tried = HashSet::new();

        loop {
            let committed = if self.sticky {
                self.bound.lock().clone()
            } else {
                None
            };
            let is_committed = committed.is_some();
            let binding = match committed {
                Some(binding) => binding,
                None => self.next_untried(&tried)?,
            };

            match invoke_with_retry(&binding, &request, self.retry).await {
                Ok(response) => {
                    if self.sticky && !is_committed {
                        info!(
                            service_id = %binding.service_id(),
                            service_type = %self.service_type,
                            "Sticky proxy bound to instance"
                        );
                        *self.bound.lock() = Some(binding);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    report_bad(&self.registry, &binding, &e);
                    if is_committed {
                        self.bound.lock().take();
                        return Err(e);
                    }
                    debug!(
                        service_id = %binding.service_id(),
                        operation = %request.operation,
                        "Failing over to next instance"
                    );
                    tried.insert(binding.service_id().clone());
                }
                Err(e @ InvocationError::ServiceFailure { .. }) => {
                    report_bad(&self.registry, &binding, &e);
                    if is_committed {
                        self.bound.lock().take();
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
