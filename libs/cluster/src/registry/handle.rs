//! Local-or-remote handles to cluster objects
//!
//! A binding in the registry carries a handle to the thing it describes.
//! Inside the owning process the handle is a direct reference; everywhere
//! else it is a locator that a [`HandleResolver`] turns into a proxy on
//! demand. Resolved proxies are cached until [`RemoteHandle::invalidate`]
//! is called, typically after a communication failure.

use crate::error::CommunicationError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Management surface of a host or process. Used by the process monitor.
#[async_trait]
pub trait Management: Send + Sync {
    async fn ping(&self) -> Result<(), CommunicationError>;
}

/// Turns a locator into a usable reference
pub trait HandleResolver<T: ?Sized>: Send + Sync {
    fn resolve(&self, locator: &str) -> Result<Arc<T>, CommunicationError>;
}

pub enum RemoteHandle<T: ?Sized> {
    /// Direct in-process reference
    Local(Arc<T>),
    /// Locator resolved lazily through a resolver
    Remote {
        locator: String,
        resolver: Arc<dyn HandleResolver<T>>,
        cached: Arc<RwLock<Option<Arc<T>>>>,
    },
}

impl<T: ?Sized> RemoteHandle<T> {
    pub fn local(target: Arc<T>) -> Self {
        RemoteHandle::Local(target)
    }

    pub fn remote(locator: impl Into<String>, resolver: Arc<dyn HandleResolver<T>>) -> Self {
        RemoteHandle::Remote {
            locator: locator.into(),
            resolver,
            cached: Arc::new(RwLock::new(None)),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RemoteHandle::Local(_))
    }

    pub fn locator(&self) -> Option<&str> {
        match self {
            RemoteHandle::Local(_) => None,
            RemoteHandle::Remote { locator, .. } => Some(locator),
        }
    }

    pub fn resolve(&self) -> Result<Arc<T>, CommunicationError> {
        match self {
            RemoteHandle::Local(target) => Ok(Arc::clone(target)),
            RemoteHandle::Remote {
                locator,
                resolver,
                cached,
            } => {
                if let Some(target) = cached.read().as_ref() {
                    return Ok(Arc::clone(target));
                }
                let target = resolver.resolve(locator)?;
                *cached.write() = Some(Arc::clone(&target));
                Ok(target)
            }
        }
    }

    /// Drop a cached remote reference so the next resolve starts fresh
    pub fn invalidate(&self) {
        if let RemoteHandle::Remote { cached, .. } = self {
            cached.write().take();
        }
    }
}

impl<T: ?Sized> Clone for RemoteHandle<T> {
    fn clone(&self) -> Self {
        match self {
            RemoteHandle::Local(target) => RemoteHandle::Local(Arc::clone(target)),
            RemoteHandle::Remote {
                locator,
                resolver,
                cached,
            } => RemoteHandle::Remote {
                locator: locator.clone(),
                resolver: Arc::clone(resolver),
                cached: Arc::clone(cached),
            },
        }
    }
}

/// Local handles are equal when they point at the same object, remote
/// handles when they share a locator
impl<T: ?Sized> PartialEq for RemoteHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RemoteHandle::Local(a), RemoteHandle::Local(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (
                RemoteHandle::Remote { locator: a, .. },
                RemoteHandle::Remote { locator: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

impl<T: ?Sized> fmt::Debug for RemoteHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteHandle::Local(_) => f.write_str("Local"),
            RemoteHandle::Remote { locator, .. } => write!(f, "Remote({locator})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Pinger;

    #[async_trait]
    impl Management for Pinger {
        async fn ping(&self) -> Result<(), CommunicationError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingResolver {
        resolutions: AtomicUsize,
    }

    impl HandleResolver<dyn Management> for CountingResolver {
        fn resolve(&self, locator: &str) -> Result<Arc<dyn Management>, CommunicationError> {
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            if locator.starts_with("unreachable") {
                return Err(CommunicationError::new(locator, "no route"));
            }
            Ok(Arc::new(Pinger))
        }
    }

    #[tokio::test]
    async fn test_local_handle_resolves_directly() {
        let handle: RemoteHandle<dyn Management> = RemoteHandle::local(Arc::new(Pinger));
        assert!(handle.is_local());
        assert!(handle.resolve().unwrap().ping().await.is_ok());
    }

    #[test]
    fn test_remote_resolution_is_cached_until_invalidated() {
        let resolver = Arc::new(CountingResolver::default());
        let handle: RemoteHandle<dyn Management> =
            RemoteHandle::remote("h1/p1", Arc::clone(&resolver) as Arc<dyn HandleResolver<dyn Management>>);
        let copy = handle.clone();

        handle.resolve().unwrap();
        copy.resolve().unwrap();
        assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 1);

        copy.invalidate();
        handle.resolve().unwrap();
        assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failed_resolution_is_not_cached() {
        let resolver = Arc::new(CountingResolver::default());
        let handle: RemoteHandle<dyn Management> =
            RemoteHandle::remote("unreachable", Arc::clone(&resolver) as Arc<dyn HandleResolver<dyn Management>>);

        assert!(handle.resolve().is_err());
        assert!(handle.resolve().is_err());
        assert_eq!(resolver.resolutions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_equality() {
        let target: Arc<dyn Management> = Arc::new(Pinger);
        let a = RemoteHandle::local(Arc::clone(&target));
        let b = RemoteHandle::local(target);
        let c: RemoteHandle<dyn Management> = RemoteHandle::local(Arc::new(Pinger));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
