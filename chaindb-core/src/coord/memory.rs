use super::{ChildWatch, Coordinator, WatchEvent};
use crate::error::{CoordError, CoordResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

type SessionId = u64;

#[derive(Debug)]
struct Znode {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
    /// Next sequence number handed to a sequential child
    next_sequence: u64,
}

impl Znode {
    fn persistent() -> Self {
        Self {
            data: Vec::new(),
            ephemeral_owner: None,
            next_sequence: 0,
        }
    }
}

struct Watcher {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Znode>,
    child_watches: HashMap<String, Vec<Watcher>>,
    next_session: SessionId,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self::default();
        tree.nodes.insert("/".to_string(), Znode::persistent());
        tree
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .filter_map(|(name, _)| {
                let rest = &name[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_child_watches(&mut self, path: &str) {
        if let Some(watchers) = self.child_watches.remove(path) {
            debug!("Firing {} child watch(es) on {}", watchers.len(), path);
            for watcher in watchers {
                let _ = watcher.tx.send(WatchEvent::ChildrenChanged {
                    path: path.to_string(),
                });
            }
        }
    }

    fn close_session(&mut self, session: SessionId) {
        for watchers in self.child_watches.values_mut() {
            let (own, others): (Vec<_>, Vec<_>) =
                watchers.drain(..).partition(|w| w.session == session);
            *watchers = others;
            for watcher in own {
                let _ = watcher.tx.send(WatchEvent::SessionClosed);
            }
        }
        self.child_watches.retain(|_, watchers| !watchers.is_empty());

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();

        for path in &owned {
            self.nodes.remove(path);
            debug!("Removed ephemeral node {} of session {}", path, session);
        }
        for path in &owned {
            self.fire_child_watches(parent_of(path));
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate_path(path: &str) -> CoordResult<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(CoordError::NoNode(format!("invalid path {:?}", path)));
    }
    Ok(())
}

/// In-process coordination tree shared by any number of sessions
#[derive(Clone)]
pub struct MemoryCoordinator {
    tree: Arc<Mutex<Tree>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
        }
    }

    /// Open a new session. Dropping it closes it.
    pub fn session(&self) -> MemorySession {
        let mut tree = self.tree.lock();
        tree.next_session += 1;
        MemorySession {
            tree: Arc::clone(&self.tree),
            id: tree.next_session,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a node exists at `path`
    pub fn exists(&self, path: &str) -> bool {
        self.tree.lock().nodes.contains_key(path)
    }

    /// Child names of `path` without arming a watch
    pub fn children(&self, path: &str) -> Vec<String> {
        self.tree.lock().children(path)
    }
}

pub struct MemorySession {
    tree: Arc<Mutex<Tree>>,
    id: SessionId,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_open(&self) -> CoordResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoordError::SessionExpired)
        } else {
            Ok(())
        }
    }

    pub fn ensure_exists(&self, path: &str) -> CoordResult<()> {
        self.check_open()?;
        validate_path(path)?;
        let mut tree = self.tree.lock();

        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let parent = if current.is_empty() { "/".to_string() } else { current.clone() };
            current.push('/');
            current.push_str(component);

            if tree.nodes.contains_key(&current) {
                continue;
            }
            if tree
                .nodes
                .get(&parent)
                .is_some_and(|node| node.ephemeral_owner.is_some())
            {
                return Err(CoordError::NoChildrenForEphemerals(parent));
            }
            tree.nodes.insert(current.clone(), Znode::persistent());
            debug!("Created node {}", current);
            tree.fire_child_watches(&parent);
        }
        Ok(())
    }

    pub fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> CoordResult<String> {
        self.check_open()?;
        validate_path(prefix)?;
        let parent = parent_of(prefix).to_string();
        let mut tree = self.tree.lock();

        let parent_node = tree
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| CoordError::NoNode(parent.clone()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(CoordError::NoChildrenForEphemerals(parent));
        }
        let sequence = parent_node.next_sequence;
        parent_node.next_sequence += 1;

        let path = format!("{}{:010}", prefix, sequence);
        if tree.nodes.contains_key(&path) {
            return Err(CoordError::NodeExists(path));
        }
        tree.nodes.insert(
            path.clone(),
            Znode {
                data: data.to_vec(),
                ephemeral_owner: Some(self.id),
                next_sequence: 0,
            },
        );
        debug!("Session {} created ephemeral node {}", self.id, path);
        tree.fire_child_watches(&parent);
        Ok(path)
    }

    pub fn children_and_watch(&self, path: &str) -> CoordResult<(Vec<String>, ChildWatch)> {
        self.check_open()?;
        let mut tree = self.tree.lock();
        if !tree.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let children = tree.children(path);
        let (tx, rx) = oneshot::channel();
        tree.child_watches
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session: self.id, tx });
        Ok((children, ChildWatch::new(rx)))
    }

    pub fn read_data(&self, path: &str) -> CoordResult<Vec<u8>> {
        self.check_open()?;
        self.tree
            .lock()
            .nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| CoordError::NoNode(path.to_string()))
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closing coordination session {}", self.id);
            self.tree.lock().close_session(self.id);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    async fn ensure_exists(&self, path: &str) -> CoordResult<()> {
        MemorySession::ensure_exists(self, path)
    }

    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> CoordResult<String> {
        MemorySession::create_ephemeral_sequential(self, prefix, data)
    }

    async fn children_and_watch(&self, path: &str) -> CoordResult<(Vec<String>, ChildWatch)> {
        MemorySession::children_and_watch(self, path)
    }

    async fn read_data(&self, path: &str) -> CoordResult<Vec<u8>> {
        MemorySession::read_data(self, path)
    }

    async fn close(&self) -> CoordResult<()> {
        MemorySession::close(self);
        Ok(())
    }
}
