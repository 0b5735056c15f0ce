//! Connection Pool for Source Connection Reuse
//!
//! Bounded, identity-keyed pool of expensive connections to one external
//! resource. Capacity is enforced by two counting permits acquired in a
//! fixed order:
//!
//! 1. **Global** permit: bounds checked-out connections across all identities
//! 2. **Per-identity** permit: only created when the per-identity maximum is
//!    lower than the global maximum
//!
//! Permits travel with the checked-out connection and are returned on
//! [`ConnectionPool::release`] / [`ConnectionPool::error`], so an early
//! return anywhere in [`ConnectionPool::obtain`] can never leak one.
//!
//! Idle connections are reused most-recently-returned first and evicted by a
//! periodic sweep once they exceed the idle timeout or stop answering the
//! liveness probe.

pub mod connection;
pub mod error;
pub mod identity;


pub use connection::{ConnectionFactory, ConnectionId, PooledConnection, SourceConnection};
pub use error::{CapacityLimit, PoolError, Result};
pub use identity::{
    ConnectorIdentity, IdentityFactory, SecurityContext, SingleIdentityFactory,
    UserIdentityFactory,
};

use chrono::{DateTime, Utc};
use cluster_config::PoolSettings;
use connection::ConnectionsForId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Reported health of the pool's resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Alive,
    Dead,
    Unknown,
}

/// Most recent connection creation failure
#[derive(Debug, Clone)]
pub struct FailedAttempt {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub total_connections: usize,
    pub used_connections: usize,
    pub idle_connections: usize,
    pub identities: usize,
    pub max_connections: usize,
    pub max_connections_per_identity: usize,
}

/// Identity-keyed connection pool
pub struct ConnectionPool {
    settings: PoolSettings,
    connection_factory: Arc<dyn ConnectionFactory>,
    identity_factory: Arc<dyn IdentityFactory>,

    /// Per-identity bookkeeping, created lazily and kept for the pool's lifetime
    identities: DashMap<ConnectorIdentity, Arc<ConnectionsForId>>,

    /// Bounds checked-out connections across all identities
    global_limiter: Arc<Semaphore>,

    /// Live physical connections, used and idle
    total_connections: AtomicUsize,
    next_connection_id: AtomicU64,
    next_lease: AtomicU64,
    shutting_down: AtomicBool,

    last_failed_attempt: Mutex<Option<FailedAttempt>>,
    last_status_test: Mutex<Option<(Instant, PoolStatus)>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Parse the pool's string properties and start the pool
    pub fn initialize(
        properties: &HashMap<String, String>,
        connection_factory: Arc<dyn ConnectionFactory>,
        identity_factory: Arc<dyn IdentityFactory>,
    ) -> Result<Arc<Self>> {
        let settings = PoolSettings::from_properties(properties)?;
        Self::with_settings(settings, connection_factory, identity_factory)
    }

    /// Start a pool from already parsed settings. Spawns the idle sweep when
    /// shrinking is enabled, so it must be called inside a tokio runtime.
    pub fn with_settings(
        settings: PoolSettings,
        connection_factory: Arc<dyn ConnectionFactory>,
        identity_factory: Arc<dyn IdentityFactory>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let pool = Arc::new(Self {
            global_limiter: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            connection_factory,
            identity_factory,
            identities: DashMap::new(),
            total_connections: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
            next_lease: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            last_failed_attempt: Mutex::new(None),
            last_status_test: Mutex::new(None),
            sweeper: Mutex::new(None),
        });

        if pool.settings.enable_shrinking {
            let handle = Self::spawn_sweeper(Arc::downgrade(&pool), pool.settings.cleaning_interval);
            *pool.sweeper.lock() = Some(handle);
        }

        info!(
            max_connections = pool.settings.max_connections,
            max_per_identity = pool.settings.max_connections_per_identity,
            shrinking = pool.settings.enable_shrinking,
            "Connection pool initialized"
        );
        Ok(pool)
    }

    fn spawn_sweeper(pool: Weak<Self>, period: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_shutting_down() {
                    break;
                }
                pool.clean_up(false).await;
            }
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Check out a connection for the caller's identity, reusing an idle one
    /// when possible. Waits at most the configured wait-for-source time for
    /// capacity.
    pub async fn obtain(&self, context: &SecurityContext) -> Result<PooledConnection> {
        self.ensure_running()?;

        let identity = self.identity_factory.create_identity(context)?;
        let started = Instant::now();
        let deadline = started + self.settings.wait_for_source_time;

        let global = self
            .acquire_permit(
                &self.global_limiter,
                deadline,
                started,
                &identity,
                CapacityLimit::Global,
                self.settings.max_connections,
            )
            .await?;

        let connections = self.connections_for(&identity);
        let per_identity = match connections.limiter() {
            Some(limiter) => Some(
                self.acquire_permit(
                    limiter,
                    deadline,
                    started,
                    &identity,
                    CapacityLimit::PerIdentity,
                    self.settings.max_connections_per_identity,
                )
                .await?,
            ),
            None => None,
        };

        // Shutdown may have started while we were waiting
        self.ensure_running()?;

        let handle = loop {
            match connections.take_idle() {
                Some(idle) => {
                    if idle.is_alive().await {
                        debug!(identity = %identity, connection = %idle.id(), "Reusing idle connection");
                        break idle;
                    }
                    debug!(identity = %identity, connection = %idle.id(), "Discarding dead idle connection");
                    self.close_connection(&idle).await;
                }
                None => break self.create_connection(&identity).await?,
            }
        };

        let handle = handle.leased(self.next_lease.fetch_add(1, Ordering::Relaxed));
        connections.check_out(handle.clone(), global, per_identity);
        Ok(handle)
    }

    /// Return a connection for reuse. Releasing a handle whose checkout is
    /// over is a no-op, even if the connection was since handed out again.
    pub async fn release(&self, connection: &PooledConnection) {
        let Some(connections) = self.lookup(connection.identity()) else {
            return;
        };

        if self.is_shutting_down() {
            if connections.remove_used(connection).is_some() {
                self.close_connection(connection).await;
            }
            return;
        }

        match connections.check_in(connection) {
            // permits in `used` drop here, after the connection is reusable
            Some(used) => {
                drop(used);
                debug!(identity = %connection.identity(), connection = %connection.id(), "Connection released");
            }
            None => {
                debug!(connection = %connection.id(), "Ignoring release of connection that is not checked out");
            }
        }
    }

    /// Return a connection the caller found unhealthy; it is closed rather
    /// than pooled.
    pub async fn error(&self, connection: &PooledConnection) {
        let Some(connections) = self.lookup(connection.identity()) else {
            return;
        };

        if let Some(used) = connections.remove_used(connection) {
            warn!(identity = %connection.identity(), connection = %connection.id(), "Closing connection reported in error");
            self.close_connection(connection).await;
            drop(used);
        }
    }

    /// Health of the underlying resource
    pub async fn status(&self) -> PoolStatus {
        if self.has_live_connection().await {
            return PoolStatus::Alive;
        }

        // A single bad caller must not mark a per-caller pool dead
        if !self.identity_factory.is_single_identity() || self.is_shutting_down() {
            return PoolStatus::Unknown;
        }

        if let Some((tested_at, status)) = *self.last_status_test.lock() {
            if tested_at.elapsed() < self.settings.source_connection_test_interval {
                return status;
            }
        }

        let status = match self.obtain(&SecurityContext::default()).await {
            Ok(connection) => {
                let alive = connection.is_alive().await;
                if alive {
                    self.release(&connection).await;
                    PoolStatus::Alive
                } else {
                    self.error(&connection).await;
                    PoolStatus::Dead
                }
            }
            Err(e) => {
                warn!(error = %e, "Connection test failed");
                PoolStatus::Dead
            }
        };

        *self.last_status_test.lock() = Some((Instant::now(), status));
        status
    }

    async fn has_live_connection(&self) -> bool {
        for connections in self.snapshot() {
            if connections.used_count() > 0 {
                return true;
            }
            for idle in connections.idle_handles() {
                if idle.is_alive().await {
                    return true;
                }
            }
        }
        false
    }

    /// Stop the sweep, fail future obtains and close every pooled connection
    pub async fn shut_down(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        // wake waiters so they fail fast
        self.global_limiter.close();

        for connections in self.snapshot() {
            for connection in connections.drain_all() {
                self.close_connection(&connection).await;
            }
        }

        info!("Connection pool shut down");
    }

    /// Sweep idle connections: close those idle longer than the idle timeout
    /// or no longer alive. With `force`, close every idle connection.
    pub async fn clean_up(&self, force: bool) {
        for connections in self.snapshot() {
            let expired = connections.drain_expired(self.settings.live_and_unused_time, force);
            for connection in &expired {
                self.close_connection(connection).await;
            }
            if !expired.is_empty() {
                debug!(identity = %connections.identity(), closed = expired.len(), "Evicted idle connections");
            }

            let mut dead = Vec::new();
            for idle in connections.idle_handles() {
                if !idle.is_alive().await {
                    dead.push(idle.id());
                }
            }
            for connection in connections.remove_idle(&dead) {
                self.close_connection(&connection).await;
            }
        }
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        let (used, idle) = self.snapshot().iter().fold((0, 0), |(used, idle), c| {
            (used + c.used_count(), idle + c.unused_count())
        });

        PoolStats {
            total_connections: self.total_connections.load(Ordering::Acquire),
            used_connections: used,
            idle_connections: idle,
            identities: self.identities.len(),
            max_connections: self.settings.max_connections,
            max_connections_per_identity: self.settings.max_connections_per_identity,
        }
    }

    pub fn last_failed_attempt(&self) -> Option<FailedAttempt> {
        self.last_failed_attempt.lock().clone()
    }

    /// Connections checked out for one identity
    pub fn used_count(&self, identity: &ConnectorIdentity) -> usize {
        self.lookup(identity).map(|c| c.used_count()).unwrap_or(0)
    }

    /// Idle connections held for one identity
    pub fn unused_count(&self, identity: &ConnectorIdentity) -> usize {
        self.lookup(identity).map(|c| c.unused_count()).unwrap_or(0)
    }

    async fn acquire_permit(
        &self,
        limiter: &Arc<Semaphore>,
        deadline: Instant,
        started: Instant,
        identity: &ConnectorIdentity,
        limit: CapacityLimit,
        max: usize,
    ) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout_at(deadline, Arc::clone(limiter).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // closed semaphore means shutdown
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(identity = %identity, %limit, max, waited_ms, "Connection pool capacity exceeded");
                Err(PoolError::capacity_exceeded(identity, limit, max, waited_ms))
            }
        }
    }

    async fn create_connection(&self, identity: &ConnectorIdentity) -> Result<PooledConnection> {
        let inner = match self.connection_factory.create_connection(identity).await {
            Ok(inner) => inner,
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to create source connection");
                *self.last_failed_attempt.lock() = Some(FailedAttempt {
                    message: e.to_string(),
                    at: Utc::now(),
                });
                return Err(PoolError::connection_creation(identity, e));
            }
        };

        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let total = self.total_connections.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(identity = %identity, connection = %id, total, "Created source connection");

        if total > self.settings.max_connections {
            self.rebalance(identity).await;
        }

        Ok(PooledConnection::new(id, identity.clone(), inner))
    }

    /// Best effort: close one idle connection of some other identity
    async fn rebalance(&self, requester: &ConnectorIdentity) {
        for connections in self.snapshot() {
            if connections.identity() == requester {
                continue;
            }
            if let Some(victim) = connections.take_idle() {
                debug!(
                    victim = %connections.identity(),
                    requester = %requester,
                    "Closing idle connection to stay within pool capacity"
                );
                self.close_connection(&victim).await;
                return;
            }
        }
    }

    async fn close_connection(&self, connection: &PooledConnection) {
        connection.close().await;
        // saturating: shutdown may race a concurrent close
        let _ = self
            .total_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(PoolError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn connections_for(&self, identity: &ConnectorIdentity) -> Arc<ConnectionsForId> {
        let per_identity_max = self
            .settings
            .limits_per_identity()
            .then_some(self.settings.max_connections_per_identity);

        Arc::clone(
            self.identities
                .entry(identity.clone())
                .or_insert_with(|| Arc::new(ConnectionsForId::new(identity.clone(), per_identity_max)))
                .value(),
        )
    }

    fn lookup(&self, identity: &ConnectorIdentity) -> Option<Arc<ConnectionsForId>> {
        self.identities.get(identity).map(|entry| Arc::clone(entry.value()))
    }

    /// Clone out the per-identity entries so no map lock is held across awaits
    fn snapshot(&self) -> Vec<Arc<ConnectionsForId>> {
        self.identities
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}
