//! Cluster-wide process liveness poll

use crate::registry::{ClusterRegistry, ProcessBinding};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pings every known process and records liveness transitions
pub struct ProcessMonitor {
    registry: Arc<ClusterRegistry>,
    ping_timeout: Duration,
}

impl ProcessMonitor {
    pub fn new(registry: Arc<ClusterRegistry>, ping_timeout: Duration) -> Self {
        Self {
            registry,
            ping_timeout,
        }
    }

    async fn ping(&self, process: &ProcessBinding) -> bool {
        let management = match process.management.resolve() {
            Ok(management) => management,
            Err(e) => {
                debug!(
                    host = %process.host_name,
                    process = %process.process_name,
                    error = %e,
                    "Cannot resolve process handle"
                );
                return false;
            }
        };

        match tokio::time::timeout(self.ping_timeout, management.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(
                    host = %process.host_name,
                    process = %process.process_name,
                    error = %e,
                    "Process ping failed"
                );
                false
            }
            Err(_) => {
                warn!(
                    host = %process.host_name,
                    process = %process.process_name,
                    timeout_ms = self.ping_timeout.as_millis() as u64,
                    "Process ping timed out"
                );
                false
            }
        }
    }

    /// One pass over every process. Returns the number of transitions.
    pub async fn poll_once(&self) -> usize {
        let processes = match self.registry.list_processes(None) {
            Ok(processes) => processes,
            Err(e) => {
                warn!(error = %e, "Cannot list processes");
                return 0;
            }
        };

        let results = join_all(processes.iter().map(|process| self.ping(process))).await;

        let mut transitions = 0;
        for (process, alive) in processes.into_iter().zip(results) {
            if !alive {
                process.management.invalidate();
            }
            if process.alive == alive {
                continue;
            }

            let host = process.host_name.clone();
            let name = process.process_name.clone();
            match self.registry.update_process(process.with_alive(alive)) {
                Ok(()) => {
                    transitions += 1;
                    info!(host = %host, process = %name, alive, "Process liveness changed");
                }
                // Removed while we were pinging
                Err(e) => debug!(host = %host, process = %name, error = %e, "Liveness update skipped"),
            }
        }
        transitions
    }
}
