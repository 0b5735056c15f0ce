//! Fan-out invocation across every listed instance

use super::error::Result;
use super::service::{ClusterService, ServiceRequest, ServiceResponse};
use super::{invoke_with_retry, report_bad, RetryPolicy};
use crate::registry::{ClusterRegistry, ServiceRegistryBinding};
use crate::selection::SelectionPolicy;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MultipleInvocationProxy {
    service_type: String,
    policy: Arc<dyn SelectionPolicy<ServiceRegistryBinding>>,
    registry: Arc<ClusterRegistry>,
    retry: RetryPolicy,
}

impl MultipleInvocationProxy {
    pub fn new(
        service_type: impl Into<String>,
        policy: Arc<dyn SelectionPolicy<ServiceRegistryBinding>>,
        registry: Arc<ClusterRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service_type: service_type.into(),
            policy,
            registry,
            retry,
        }
    }
}

#[async_trait]
impl ClusterService for MultipleInvocationProxy {
    /// Failing instances are skipped. Collection requests return the
    /// concatenated results in instance order; anything else returns unit.
    async fn invoke(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let instances = match self.policy.instances() {
            Ok(instances) => instances,
            Err(e) => {
                debug!(service_type = %self.service_type, error = %e, "Fan-out with no instances");
                Vec::new()
            }
        };

        let calls = instances
            .iter()
            .map(|binding| invoke_with_retry(binding, &request, self.retry));
        let outcomes = join_all(calls).await;

        let mut items = Vec::new();
        for (binding, outcome) in instances.iter().zip(outcomes) {
            match outcome {
                Ok(response) => items.extend(response.into_items()),
                Err(e) if e.marks_bad() => report_bad(&self.registry, binding, &e),
                Err(e) => {
                    warn!(
                        service_id = %binding.service_id(),
                        operation = %request.operation,
                        error = %e,
                        "Instance rejected fan-out call"
                    );
                }
            }
        }

        Ok(if request.collect {
            ServiceResponse::Collection(items)
        } else {
            ServiceResponse::Unit
        })
    }
}
