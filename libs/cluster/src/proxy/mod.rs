//! Service Proxies
//!
//! A proxy implements [`ClusterService`] on behalf of every deployed instance
//! of one service type. Callers invoke it like a single service; the proxy
//! asks its selection policy for instances, retries communication failures
//! with a fixed back-off, fails over, and reports broken instances to the
//! registry so they stop being offered.
//!
//! Invocation modes:
//! - [`InvocationMode::Single`]: one instance per call, failing over until
//!   one answers or none are left
//! - [`InvocationMode::Sticky`]: like single, but the first instance that
//!   answers is reused for every later call
//! - [`InvocationMode::Multiple`]: every listed instance, results of
//!   collection operations concatenated in instance order
//!
//! [`ProxyManager`] owns one selection policy per (service type, policy
//! kind) and keeps it in step with the registry.

mod error;
mod manager;
mod multiple;
mod service;
mod single;

#[cfg(test)]
mod tests;

pub use error::{InvocationError, Result};
pub use manager::ProxyManager;
pub use multiple::MultipleInvocationProxy;
pub use service::{ClusterService, ServiceRequest, ServiceResponse};
pub use single::SingleInvocationProxy;

use crate::registry::{ClusterRegistry, ServiceRegistryBinding, ServiceState};
use cluster_config::ProxySettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationMode {
    Single,
    Sticky,
    Multiple,
}

/// Fixed back-off retry of communication failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub limit: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, delay: Duration) -> Self {
        Self { limit, delay }
    }
}

impl From<&ProxySettings> for RetryPolicy {
    fn from(settings: &ProxySettings) -> Self {
        Self::new(settings.retry_limit, settings.retry_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ProxySettings::default())
    }
}

/// Invoke one instance, retrying communication failures. Other failures
/// return immediately.
pub(crate) async fn invoke_with_retry(
    binding: &ServiceRegistryBinding,
    request: &ServiceRequest,
    retry: RetryPolicy,
) -> Result<ServiceResponse> {
    let mut attempt = 0;
    loop {
        let result = match binding.handle().resolve() {
            Ok(instance) => instance.invoke(request.clone()).await,
            Err(e) => Err(e.into()),
        };

        match result {
            Err(e) if e.is_retryable() && attempt < retry.limit => {
                attempt += 1;
                binding.handle().invalidate();
                debug!(
                    service_id = %binding.service_id(),
                    operation = %request.operation,
                    attempt,
                    error = %e,
                    "Retrying service call"
                );
                tokio::time::sleep(retry.delay).await;
            }
            other => return other,
        }
    }
}

/// Mark an instance bad after a disqualifying failure. A binding that has
/// already left the registry needs no marking.
pub(crate) fn report_bad(
    registry: &ClusterRegistry,
    binding: &ServiceRegistryBinding,
    cause: &InvocationError,
) {
    binding.handle().invalidate();
    warn!(
        service_id = %binding.service_id(),
        service_type = binding.service_type(),
        error = %cause,
        "Service instance failed, marking bad"
    );
    if let Err(e) = registry.mark_service_bad(binding.service_id(), ServiceState::Failed) {
        debug!(service_id = %binding.service_id(), error = %e, "Could not mark service bad");
    }
}
