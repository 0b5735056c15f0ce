//! Local service state poll

use crate::registry::{ClusterRegistry, ServiceQuery};
use std::sync::Arc;
use tracing::{debug, info};

/// Asks each service of this process for its state and pushes changes into
/// the registry
pub struct ServiceMonitor {
    registry: Arc<ClusterRegistry>,
    host_name: String,
    process_name: String,
}

impl ServiceMonitor {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        host_name: impl Into<String>,
        process_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            host_name: host_name.into(),
            process_name: process_name.into(),
        }
    }

    /// One pass over the local bindings. Returns the number of updates.
    pub async fn poll_once(&self) -> usize {
        let query = ServiceQuery::all()
            .on_host(&self.host_name)
            .in_process(&self.process_name);
        let bindings = match self.registry.get_service_bindings(&query) {
            Ok(bindings) => bindings,
            Err(e) => {
                debug!(
                    host = %self.host_name,
                    process = %self.process_name,
                    error = %e,
                    "Local process not registered"
                );
                return 0;
            }
        };

        let mut updates = 0;
        for mut binding in bindings.into_iter().filter(|b| !b.is_bad()) {
            let previous = binding.state();
            binding.check_state().await;
            if !binding.is_dirty() {
                continue;
            }
            binding.clear_dirty();

            // A proxy may have marked it bad meanwhile; bad is final
            let service_id = binding.service_id().clone();
            let state = binding.state();
            match self.registry.update_service_binding_unless_bad(binding) {
                Ok(true) => {
                    updates += 1;
                    info!(service_id = %service_id, from = %previous, to = %state, "Service state changed");
                }
                Ok(false) => {}
                Err(e) => {
                    debug!(service_id = %service_id, error = %e, "Service binding vanished during poll");
                }
            }
        }
        updates
    }
}
