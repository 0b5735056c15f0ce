//! Cluster node binary
//!
//! Usage:
//!   cluster-node --config config/cluster.toml
//!   cluster-node --config config/cluster.toml --environment production --json-logs

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use cluster::registry::{Management, RemoteHandle};
use cluster::{
    ClusterRegistry, CommunicationError, HealthMonitor, HostBinding, MemoryTreeCache,
    ProcessBinding, ProxyManager, TreeCache,
};
use cluster_config::load_config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cluster-node")]
#[command(about = "Federated query cluster node")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment overlay (config/environments/<name>.toml)
    #[arg(short, long)]
    environment: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

/// Management surface of this process
struct LocalManagement;

#[async_trait]
impl Management for LocalManagement {
    async fn ping(&self) -> Result<(), CommunicationError> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let config = load_config(args.config.as_deref(), args.environment.as_deref())
        .context("Failed to load configuration")?;
    let node = config.node.clone();
    info!(
        host = %node.host_name,
        process = %node.process_name,
        max_connections = config.pool.max_connections,
        "Starting cluster node"
    );

    let cache: Arc<dyn TreeCache> = Arc::new(MemoryTreeCache::new());
    let registry = Arc::new(ClusterRegistry::new(cache));

    let management: RemoteHandle<dyn Management> = RemoteHandle::local(Arc::new(LocalManagement));
    let mut host = HostBinding::new(&node.host_name, management.clone());
    host.properties = node.properties.clone();
    registry.add_host(host)?;
    registry.add_process(ProcessBinding::new(
        &node.host_name,
        &node.process_name,
        management,
    ))?;

    let monitors = HealthMonitor::start(Arc::clone(&registry), &node, &config.monitor);
    let proxies = ProxyManager::start(Arc::clone(&registry), &node, &config.proxy);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl-C handler")?;
    info!("Received shutdown signal");

    monitors.shutdown();
    proxies.shutdown();
    if let Err(e) = registry.remove_process(&node.host_name, &node.process_name) {
        warn!(error = %e, "Process already gone from registry");
    }
    registry.shutdown();

    info!("Cluster node stopped");
    Ok(())
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.to_lowercase()));

    if args.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
