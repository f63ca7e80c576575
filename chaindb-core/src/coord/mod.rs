//! Coordination service
//!
//! Chain membership needs a small slice of a ZooKeeper-style service:
//! idempotent path creation, ephemeral sequential children, a child
//! listing that arms a one-shot watch in the same step, and node data
//! reads. `Coordinator` is that slice.
//!
//! Two implementations are provided. `MemoryCoordinator` keeps the tree
//! in process and hands out sessions; `CoordServer` exposes a
//! `MemoryCoordinator` over TCP, one session per connection, and
//! `RemoteCoordinator` is its client.

mod memory;
mod remote;

pub use memory::{MemoryCoordinator, MemorySession};
pub use remote::{CoordServer, RemoteCoordinator};

use crate::backoff;
use crate::config::CoordinationSettings;
use crate::error::CoordResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::info;

/// Notification delivered to a one-shot watch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEvent {
    /// A child was added under or removed from `path`
    ChildrenChanged { path: String },
    /// The session that armed the watch is gone
    SessionClosed,
}

/// One-shot watch armed by [`Coordinator::children_and_watch`]
#[derive(Debug)]
pub struct ChildWatch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl ChildWatch {
    pub(crate) fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the watch to fire. A dropped session reads as `SessionClosed`.
    pub async fn fired(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::SessionClosed)
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create `path` and any missing ancestors; existing nodes are left alone
    async fn ensure_exists(&self, path: &str) -> CoordResult<()>;

    /// Create an ephemeral node named `prefix` plus a 10-digit sequence
    /// number, returning the full path
    async fn create_ephemeral_sequential(&self, prefix: &str, data: &[u8]) -> CoordResult<String>;

    /// Child names of `path`, plus a watch armed against that same snapshot
    async fn children_and_watch(&self, path: &str) -> CoordResult<(Vec<String>, ChildWatch)>;

    async fn read_data(&self, path: &str) -> CoordResult<Vec<u8>>;

    /// End the session, deleting its ephemeral nodes
    async fn close(&self) -> CoordResult<()>;
}

/// Join a parent path and a child name
pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Open a session as described by `settings`.
///
/// `memory` gives a private in-process coordinator, which only makes
/// sense for a single node. Anything else is dialled as a `CoordServer`
/// address, retrying with exponential backoff.
pub async fn connect_coordinator(
    settings: &CoordinationSettings,
) -> CoordResult<Arc<dyn Coordinator>> {
    if settings.is_memory() {
        info!("Using in-process coordination service");
        return Ok(Arc::new(MemoryCoordinator::new().session()));
    }

    let address = settings.connect.clone();
    let timeout = settings.connect_timeout();
    let coordinator = backoff::retry(
        "Coordination service connect",
        settings.backoff(),
        settings.max_attempts,
        || RemoteCoordinator::connect(address.clone(), timeout),
    )
    .await?;

    info!("Connected to coordination service at {}", settings.connect);
    Ok(Arc::new(coordinator))
}
