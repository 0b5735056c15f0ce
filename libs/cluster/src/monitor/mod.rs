//! Health Monitors
//!
//! Two periodic tasks per process, each on its own interval:
//! - [`ProcessMonitor`] pings every process in the cluster and flips its
//!   liveness flag; it never removes nodes
//! - [`ServiceMonitor`] polls the services of this process and pushes state
//!   changes into the registry
//!
//! Both go through the registry's public mutation methods only.

mod process;
mod service;


pub use process::ProcessMonitor;
pub use service::ServiceMonitor;

use crate::registry::ClusterRegistry;
use cluster_config::{MonitorSettings, NodeSettings};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::info;

/// Owns the two monitor tasks of this process
pub struct HealthMonitor {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Spawn both monitors. Must be called within a tokio runtime.
    pub fn start(
        registry: Arc<ClusterRegistry>,
        node: &NodeSettings,
        settings: &MonitorSettings,
    ) -> Self {
        let processes = ProcessMonitor::new(Arc::clone(&registry), settings.ping_timeout);
        let services = ServiceMonitor::new(registry, &node.host_name, &node.process_name);

        let mut process_ticker = ticker(settings.process_poll_interval);
        let process_task = tokio::spawn(async move {
            loop {
                process_ticker.tick().await;
                processes.poll_once().await;
            }
        });

        let mut service_ticker = ticker(settings.service_poll_interval);
        let service_task = tokio::spawn(async move {
            loop {
                service_ticker.tick().await;
                services.poll_once().await;
            }
        });

        info!(
            host = %node.host_name,
            process = %node.process_name,
            process_poll_ms = settings.process_poll_interval.as_millis() as u64,
            service_poll_ms = settings.service_poll_interval.as_millis() as u64,
            "Health monitors started"
        );

        Self {
            tasks: Mutex::new(vec![process_task, service_task]),
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            task.abort();
        }
        info!("Health monitors stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// First tick one period from now
fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
