//! Tree cache primitive
//!
//! The registry stores its state in a tree-shaped cache that is assumed to
//! be replicated across the cluster by someone else. [`TreeCache`] is the
//! whole contract the registry relies on; [`MemoryTreeCache`] implements it
//! for a single process and for tests. A distributed store can be dropped in
//! behind the same trait.

use super::binding::{HostBinding, ProcessBinding, ServiceRegistryBinding};
use super::error::CacheError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Structured key of a node: host / process / "Services" / service id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodePath(Vec<String>);

impl NodePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True for `self` and every descendant of `self`
    pub fn starts_with(&self, prefix: &NodePath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

/// Value stored at a node
#[derive(Debug, Clone)]
pub enum RegistryNode {
    Host(HostBinding),
    Process(ProcessBinding),
    /// Grouping node without a value of its own
    Collection,
    Service(ServiceRegistryBinding),
}

impl RegistryNode {
    pub fn as_host(&self) -> Option<&HostBinding> {
        match self {
            RegistryNode::Host(host) => Some(host),
            _ => None,
        }
    }

    pub fn as_process(&self) -> Option<&ProcessBinding> {
        match self {
            RegistryNode::Process(process) => Some(process),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceRegistryBinding> {
        match self {
            RegistryNode::Service(service) => Some(service),
            _ => None,
        }
    }

    pub fn into_host(self) -> Option<HostBinding> {
        match self {
            RegistryNode::Host(host) => Some(host),
            _ => None,
        }
    }

    pub fn into_process(self) -> Option<ProcessBinding> {
        match self {
            RegistryNode::Process(process) => Some(process),
            _ => None,
        }
    }

    pub fn into_service(self) -> Option<ServiceRegistryBinding> {
        match self {
            RegistryNode::Service(service) => Some(service),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    Created,
    Modified,
    Removed,
}

/// A committed mutation somewhere in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub path: NodePath,
    pub kind: CacheEventKind,
}

/// Observer of every mutation anywhere in the tree (no path filtering)
pub trait CacheListener: Send + Sync {
    fn node_changed(&self, event: &CacheEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Replicated tree-cache primitive consumed by the registry
pub trait TreeCache: Send + Sync {
    fn get(&self, path: &NodePath) -> Option<RegistryNode>;

    /// Replace the value of an existing node, keeping its children
    fn put(&self, path: &NodePath, node: RegistryNode) -> CacheResult<()>;

    /// Create a child under an existing parent. Returns `false`, leaving the
    /// existing value untouched, when the child already exists.
    fn add_child(&self, parent: &NodePath, name: &str, node: RegistryNode) -> CacheResult<bool>;

    fn get_child(&self, parent: &NodePath, name: &str) -> Option<RegistryNode> {
        self.get(&parent.child(name))
    }

    /// Remove a child and all of its descendants. Returns `false` when the
    /// child did not exist.
    fn remove_child(&self, parent: &NodePath, name: &str) -> bool;

    /// Names of the direct children of a node
    fn children(&self, path: &NodePath) -> Vec<String>;

    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);
}

/// In-process tree cache: ordered map from path to node
pub struct MemoryTreeCache {
    nodes: RwLock<BTreeMap<NodePath, RegistryNode>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CacheListener>)>>,
    next_listener_id: AtomicU64,
}

impl MemoryTreeCache {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    fn exists(nodes: &BTreeMap<NodePath, RegistryNode>, path: &NodePath) -> bool {
        path.is_root() || nodes.contains_key(path)
    }

    /// Called with no lock held
    fn fire(&self, path: NodePath, kind: CacheEventKind) {
        let event = CacheEvent { path, kind };
        trace!(path = %event.path, kind = ?event.kind, "Tree cache mutation");

        let listeners: Vec<Arc<dyn CacheListener>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener.node_changed(&event);
        }
    }
}

impl Default for MemoryTreeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeCache for MemoryTreeCache {
    fn get(&self, path: &NodePath) -> Option<RegistryNode> {
        self.nodes.read().get(path).cloned()
    }

    fn put(&self, path: &NodePath, node: RegistryNode) -> CacheResult<()> {
        {
            let mut nodes = self.nodes.write();
            let slot = nodes.get_mut(path).ok_or_else(|| CacheError::NoSuchNode {
                path: path.to_string(),
            })?;
            *slot = node;
        }
        self.fire(path.clone(), CacheEventKind::Modified);
        Ok(())
    }

    fn add_child(&self, parent: &NodePath, name: &str, node: RegistryNode) -> CacheResult<bool> {
        let path = parent.child(name);
        {
            let mut nodes = self.nodes.write();
            if !Self::exists(&nodes, parent) {
                return Err(CacheError::NoSuchNode {
                    path: parent.to_string(),
                });
            }
            if nodes.contains_key(&path) {
                return Ok(false);
            }
            nodes.insert(path.clone(), node);
        }
        self.fire(path, CacheEventKind::Created);
        Ok(true)
    }

    fn remove_child(&self, parent: &NodePath, name: &str) -> bool {
        let path = parent.child(name);
        {
            let mut nodes = self.nodes.write();
            if !nodes.contains_key(&path) {
                return false;
            }
            let doomed: Vec<NodePath> = nodes
                .range(path.clone()..)
                .take_while(|(key, _)| key.starts_with(&path))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                nodes.remove(&key);
            }
        }
        self.fire(path, CacheEventKind::Removed);
        true
    }

    fn children(&self, path: &NodePath) -> Vec<String> {
        let depth = path.depth() + 1;
        self.nodes
            .read()
            .range(path.clone()..)
            .take_while(|(key, _)| key.starts_with(path))
            .filter(|(key, _)| key.depth() == depth)
            .filter_map(|(key, _)| key.name().map(str::to_string))
            .collect()
    }

    fn add_listener(&self, listener: Arc<dyn CacheListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|(existing, _)| *existing != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<CacheEvent>>,
    }

    impl CacheListener for Recorder {
        fn node_changed(&self, event: &CacheEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn path(segments: &[&str]) -> NodePath {
        segments.iter().fold(NodePath::root(), |p, s| p.child(*s))
    }

    #[test]
    fn test_add_child_requires_parent() {
        let cache = MemoryTreeCache::new();
        let err = cache
            .add_child(&path(&["h1"]), "p1", RegistryNode::Collection)
            .unwrap_err();
        assert!(matches!(err, CacheError::NoSuchNode { .. }));

        assert!(cache.add_child(&NodePath::root(), "h1", RegistryNode::Collection).unwrap());
        assert!(!cache.add_child(&NodePath::root(), "h1", RegistryNode::Collection).unwrap());
        assert!(cache.add_child(&path(&["h1"]), "p1", RegistryNode::Collection).unwrap());
    }

    #[test]
    fn test_children_are_direct_only() {
        let cache = MemoryTreeCache::new();
        cache.add_child(&NodePath::root(), "a", RegistryNode::Collection).unwrap();
        cache.add_child(&NodePath::root(), "a0", RegistryNode::Collection).unwrap();
        cache.add_child(&path(&["a"]), "x", RegistryNode::Collection).unwrap();
        cache.add_child(&path(&["a", "x"]), "deep", RegistryNode::Collection).unwrap();
        cache.add_child(&path(&["a"]), "y", RegistryNode::Collection).unwrap();

        assert_eq!(cache.children(&NodePath::root()), vec!["a", "a0"]);
        assert_eq!(cache.children(&path(&["a"])), vec!["x", "y"]);
        assert!(cache.children(&path(&["a0"])).is_empty());
    }

    #[test]
    fn test_remove_is_recursive() {
        let cache = MemoryTreeCache::new();
        cache.add_child(&NodePath::root(), "a", RegistryNode::Collection).unwrap();
        cache.add_child(&NodePath::root(), "a0", RegistryNode::Collection).unwrap();
        cache.add_child(&path(&["a"]), "x", RegistryNode::Collection).unwrap();
        cache.add_child(&path(&["a", "x"]), "deep", RegistryNode::Collection).unwrap();

        assert!(cache.remove_child(&NodePath::root(), "a"));
        assert!(cache.get(&path(&["a", "x", "deep"])).is_none());
        assert!(cache.get(&path(&["a0"])).is_some());
        assert_eq!(cache.len(), 1);
        assert!(!cache.remove_child(&NodePath::root(), "a"));
    }

    #[test]
    fn test_put_requires_existing_node() {
        let cache = MemoryTreeCache::new();
        assert!(cache.put(&path(&["missing"]), RegistryNode::Collection).is_err());
    }

    #[test]
    fn test_listeners_see_every_mutation() {
        let cache = MemoryTreeCache::new();
        let recorder = Arc::new(Recorder::default());
        let id = cache.add_listener(Arc::clone(&recorder) as Arc<dyn CacheListener>);

        cache.add_child(&NodePath::root(), "a", RegistryNode::Collection).unwrap();
        cache.put(&path(&["a"]), RegistryNode::Collection).unwrap();
        cache.remove_child(&NodePath::root(), "a");

        let kinds: Vec<CacheEventKind> = recorder.events.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![CacheEventKind::Created, CacheEventKind::Modified, CacheEventKind::Removed]
        );

        cache.remove_listener(id);
        cache.add_child(&NodePath::root(), "b", RegistryNode::Collection).unwrap();
        assert_eq!(recorder.events.lock().len(), 3);
    }

    #[test]
    fn test_path_display() {
        assert_eq!(path(&["h", "p"]).to_string(), "/h/p");
        assert_eq!(path(&["h", "p"]).parent(), Some(path(&["h"])));
        assert_eq!(NodePath::root().parent(), None);
    }
}
