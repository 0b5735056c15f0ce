//! Pooled connections and per-identity bookkeeping

use super::identity::ConnectorIdentity;
use crate::error::BoxError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// One live connection to an external resource
#[async_trait]
pub trait SourceConnection: Send + Sync {
    /// Cheap liveness probe
    async fn is_alive(&self) -> bool;

    /// Physically close the connection
    async fn close(&self);
}

/// Produces physical connections; the pool never builds one itself
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(
        &self,
        identity: &ConnectorIdentity,
    ) -> Result<Arc<dyn SourceConnection>, BoxError>;
}

/// Pool-assigned connection id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle to a connection owned by the pool. Cloning the handle does not
/// clone the connection.
///
/// Every checkout carries a fresh lease; a handle from an earlier checkout of
/// the same connection cannot release or fail the current one.
#[derive(Clone)]
pub struct PooledConnection {
    id: ConnectionId,
    lease: u64,
    identity: ConnectorIdentity,
    inner: Arc<dyn SourceConnection>,
}

impl PooledConnection {
    pub(crate) fn new(
        id: ConnectionId,
        identity: ConnectorIdentity,
        inner: Arc<dyn SourceConnection>,
    ) -> Self {
        Self {
            id,
            lease: 0,
            identity,
            inner,
        }
    }

    /// Same connection under a new checkout
    pub(crate) fn leased(mut self, lease: u64) -> Self {
        self.lease = lease;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Checkout this handle belongs to
    pub fn lease(&self) -> u64 {
        self.lease
    }

    fn same_checkout(&self, other: &PooledConnection) -> bool {
        self.id == other.id && self.lease == other.lease
    }

    pub fn identity(&self) -> &ConnectorIdentity {
        &self.identity
    }

    /// The underlying physical connection
    pub fn connection(&self) -> &Arc<dyn SourceConnection> {
        &self.inner
    }

    pub async fn is_alive(&self) -> bool {
        self.inner.is_alive().await
    }

    pub(crate) async fn close(&self) {
        self.inner.close().await
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("lease", &self.lease)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Checked-out connection together with the permits it holds
pub(crate) struct UsedConnection {
    pub handle: PooledConnection,
    _global: OwnedSemaphorePermit,
    _per_identity: Option<OwnedSemaphorePermit>,
}

/// Idle connection tagged with the time it was returned
pub(crate) struct IdleConnection {
    pub handle: PooledConnection,
    pub returned_at: Instant,
}

#[derive(Default)]
struct IdentityConnections {
    used: Vec<UsedConnection>,
    unused: VecDeque<IdleConnection>,
}

/// Bookkeeping for one identity. The lock is scoped to this identity so
/// different identities never contend.
pub(crate) struct ConnectionsForId {
    identity: ConnectorIdentity,
    state: Mutex<IdentityConnections>,
    limiter: Option<Arc<Semaphore>>,
}

impl ConnectionsForId {
    pub fn new(identity: ConnectorIdentity, per_identity_max: Option<usize>) -> Self {
        Self {
            identity,
            state: Mutex::new(IdentityConnections::default()),
            limiter: per_identity_max.map(|max| Arc::new(Semaphore::new(max))),
        }
    }

    pub fn identity(&self) -> &ConnectorIdentity {
        &self.identity
    }

    pub fn limiter(&self) -> Option<&Arc<Semaphore>> {
        self.limiter.as_ref()
    }

    /// Most recently returned idle connection, if any
    pub fn take_idle(&self) -> Option<PooledConnection> {
        self.state.lock().unused.pop_back().map(|idle| idle.handle)
    }

    pub fn check_out(
        &self,
        handle: PooledConnection,
        global: OwnedSemaphorePermit,
        per_identity: Option<OwnedSemaphorePermit>,
    ) {
        self.state.lock().used.push(UsedConnection {
            handle,
            _global: global,
            _per_identity: per_identity,
        });
    }

    /// Move a connection from used to unused. Returns the used entry so the
    /// caller drops its permits only after the connection is reusable, or
    /// `None` when this checkout is no longer outstanding.
    pub fn check_in(&self, handle: &PooledConnection) -> Option<UsedConnection> {
        let mut state = self.state.lock();
        let position = state.used.iter().position(|u| u.handle.same_checkout(handle))?;
        let used = state.used.remove(position);
        state.unused.push_back(IdleConnection {
            handle: used.handle.clone(),
            returned_at: Instant::now(),
        });
        Some(used)
    }

    /// Remove a connection from used without pooling it
    pub fn remove_used(&self, handle: &PooledConnection) -> Option<UsedConnection> {
        let mut state = self.state.lock();
        let position = state.used.iter().position(|u| u.handle.same_checkout(handle))?;
        Some(state.used.remove(position))
    }

    /// Remove specific idle connections that are still idle
    pub fn remove_idle(&self, ids: &[ConnectionId]) -> Vec<PooledConnection> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        state.unused.retain(|idle| {
            if ids.contains(&idle.handle.id()) {
                removed.push(idle.handle.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove idle connections older than `max_idle`, all of them when
    /// `force` is set
    pub fn drain_expired(&self, max_idle: Duration, force: bool) -> Vec<PooledConnection> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        state.unused.retain(|idle| {
            if force || now.duration_since(idle.returned_at) > max_idle {
                expired.push(idle.handle.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove everything, used and unused
    pub fn drain_all(&self) -> Vec<PooledConnection> {
        let mut state = self.state.lock();
        let mut all: Vec<PooledConnection> = state.used.drain(..).map(|u| u.handle).collect();
        all.extend(state.unused.drain(..).map(|idle| idle.handle));
        all
    }

    pub fn idle_handles(&self) -> Vec<PooledConnection> {
        self.state.lock().unused.iter().map(|idle| idle.handle.clone()).collect()
    }

    pub fn used_count(&self) -> usize {
        self.state.lock().used.len()
    }

    pub fn unused_count(&self) -> usize {
        self.state.lock().unused.len()
    }
}
