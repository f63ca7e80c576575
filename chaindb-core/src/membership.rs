//! Chain membership
//!
//! Each server registers an ephemeral sequential node under the chain
//! path, with its `host:port` as the node data. Sorting the children
//! gives the chain order: the first child is the head, the last is the
//! tail, and a node forwards writes to the child right after it.
//!
//! On join the node copies its predecessor's table once. From then on
//! every child-list change recomputes the successor and rewires the
//! replica handle of the distributed database. Watches are one-shot, so
//! each reconfiguration re-arms the next one in the same call that takes
//! the fresh snapshot.

use crate::client::RemoteTable;
use crate::config::NetworkSettings;
use crate::coord::{child_path, ChildWatch, Coordinator, WatchEvent};
use crate::distributed::DistributedDatabase;
use crate::error::{CoordError, DbError, DbResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name prefix of the sequential member nodes
pub const NODE_PREFIX: &str = "node";

/// Sequential names are zero-padded, so lexicographic order is join order
pub fn sorted_children(mut children: Vec<String>) -> Vec<String> {
    children.sort();
    children
}

pub fn find_successor<'a>(sorted: &'a [String], own: &str) -> Option<&'a str> {
    let idx = sorted.iter().position(|child| child == own)?;
    sorted.get(idx + 1).map(String::as_str)
}

pub fn find_predecessor<'a>(sorted: &'a [String], own: &str) -> Option<&'a str> {
    let idx = sorted.iter().position(|child| child == own)?;
    idx.checked_sub(1)
        .and_then(|prev| sorted.get(prev))
        .map(String::as_str)
}

pub fn head_of(sorted: &[String]) -> Option<&str> {
    sorted.first().map(String::as_str)
}

pub fn tail_of(sorted: &[String]) -> Option<&str> {
    sorted.last().map(String::as_str)
}

/// Resolve a member's advertised address and connect to it
pub async fn connect_member(
    coordinator: &dyn Coordinator,
    chain_path: &str,
    member: &str,
    network: NetworkSettings,
) -> DbResult<RemoteTable> {
    let data = coordinator.read_data(&child_path(chain_path, member)).await?;
    let address = String::from_utf8(data).map_err(|_| {
        CoordError::Codec(format!("member {} has a non-UTF-8 address", member))
    })?;
    Ok(RemoteTable::connect_to(address, network).await?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Unregistered,
    Registering,
    /// `successor` is `None` while this node is the tail
    Registered { successor: Option<String> },
}

pub struct ChainMembership {
    coordinator: Arc<dyn Coordinator>,
    ddb: Arc<DistributedDatabase>,
    chain_path: String,
    advertise_addr: String,
    network: NetworkSettings,
    /// Own child name, set once registration succeeds
    own_node: Mutex<Option<String>>,
    state: Mutex<MembershipState>,
    /// Serialises successor changes; holds the current successor name
    successor: tokio::sync::Mutex<Option<String>>,
}

impl ChainMembership {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        ddb: Arc<DistributedDatabase>,
        chain_path: impl Into<String>,
        advertise_addr: impl Into<String>,
        network: NetworkSettings,
    ) -> Self {
        Self {
            coordinator,
            ddb,
            chain_path: chain_path.into(),
            advertise_addr: advertise_addr.into(),
            network,
            own_node: Mutex::new(None),
            state: Mutex::new(MembershipState::Unregistered),
            successor: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> MembershipState {
        self.state.lock().clone()
    }

    /// Own child name under the chain path
    pub fn own_node(&self) -> Option<String> {
        self.own_node.lock().clone()
    }

    pub fn own_path(&self) -> Option<String> {
        self.own_node()
            .map(|node| child_path(&self.chain_path, &node))
    }

    pub fn chain_path(&self) -> &str {
        &self.chain_path
    }

    /// Register, wire the successor and seed the table from the
    /// predecessor. Returns the watch for the next membership change.
    ///
    /// Registration failures are fatal; a failed migration is logged and
    /// the node continues with whatever it has.
    pub async fn join(&self) -> DbResult<ChildWatch> {
        *self.state.lock() = MembershipState::Registering;

        let registered = self.register().await;
        let own = match registered {
            Ok(own) => own,
            Err(e) => {
                error!("Failed to register in {}: {}", self.chain_path, e);
                *self.state.lock() = MembershipState::Unregistered;
                return Err(e);
            }
        };

        let (children, watch) = self.coordinator.children_and_watch(&self.chain_path).await?;
        let sorted = sorted_children(children);
        let successor = find_successor(&sorted, &own).map(str::to_string);
        let predecessor = find_predecessor(&sorted, &own).map(str::to_string);
        info!(
            "Joined chain as {} ({} members, predecessor {:?}, successor {:?})",
            own,
            sorted.len(),
            predecessor,
            successor
        );

        self.apply_successor(successor).await;

        if let Some(predecessor) = predecessor {
            match self.migrate_from_member(&predecessor).await {
                Ok(count) => info!("Migrated {} entries from predecessor {}", count, predecessor),
                Err(e) => warn!(
                    "Migration from predecessor {} failed, continuing with local table: {}",
                    predecessor, e
                ),
            }
        }

        Ok(watch)
    }

    async fn register(&self) -> DbResult<String> {
        self.coordinator.ensure_exists(&self.chain_path).await?;
        let prefix = child_path(&self.chain_path, NODE_PREFIX);
        let path = self
            .coordinator
            .create_ephemeral_sequential(&prefix, self.advertise_addr.as_bytes())
            .await?;

        let own = path
            .rsplit('/')
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        info!("Registered {} for {}", path, self.advertise_addr);
        *self.own_node.lock() = Some(own.clone());
        Ok(own)
    }

    async fn migrate_from_member(&self, member: &str) -> DbResult<usize> {
        let mut source =
            connect_member(self.coordinator.as_ref(), &self.chain_path, member, self.network)
                .await?;
        let migrated = self.ddb.migrate_from(&mut source).await;
        source.disconnect();
        migrated
    }

    /// Point the replica at `next`, or clear it when this node is the tail.
    ///
    /// A successor that cannot be reached is still recorded, with no
    /// replica set; the next membership change retries the connect. Does
    /// nothing once the node has left.
    pub async fn apply_successor(&self, next: Option<String>) {
        let mut successor = self.successor.lock().await;
        if self.state() == MembershipState::Unregistered {
            debug!("Ignoring successor {:?}: not registered", next);
            return;
        }

        let unchanged = *successor == next;
        if unchanged && (next.is_none() || self.ddb.has_replica().await) {
            debug!("Successor unchanged ({:?})", next);
            self.mark_registered(next);
            return;
        }

        match &next {
            None => {
                if successor.is_some() {
                    info!("Successor {:?} left; this node is now the tail", *successor);
                }
                self.ddb.set_replica(None).await;
            }
            Some(member) => {
                info!("Successor changed from {:?} to {}", *successor, member);
                match connect_member(self.coordinator.as_ref(), &self.chain_path, member, self.network)
                    .await
                {
                    Ok(table) => {
                        if self.state() == MembershipState::Unregistered {
                            debug!("Left the chain while connecting to {}", member);
                            return;
                        }
                        self.ddb.set_replica(Some(table)).await;
                    }
                    Err(e) => {
                        warn!("Cannot connect to successor {}: {}", member, e);
                        self.ddb.set_replica(None).await;
                    }
                }
            }
        }

        *successor = next.clone();
        self.mark_registered(next);
    }

    fn mark_registered(&self, successor: Option<String>) {
        let mut state = self.state.lock();
        if *state != MembershipState::Unregistered {
            *state = MembershipState::Registered { successor };
        }
    }

    /// Follow membership changes until the session ends.
    ///
    /// Returns `Ok` after [`leave`](Self::leave), an error if the session
    /// was lost or a watch could not be re-armed.
    pub async fn run(&self, mut watch: ChildWatch) -> DbResult<()> {
        let own = self.own_node().ok_or(DbError::Coord(CoordError::SessionExpired))?;

        loop {
            match watch.fired().await {
                WatchEvent::ChildrenChanged { path } => {
                    debug!("Membership change under {}", path);
                }
                WatchEvent::SessionClosed => {
                    if self.state() == MembershipState::Unregistered {
                        info!("Membership watcher stopped");
                        return Ok(());
                    }
                    error!("Coordination session lost; leaving the chain");
                    return Err(CoordError::SessionExpired.into());
                }
            }

            let (children, next_watch) = match self
                .coordinator
                .children_and_watch(&self.chain_path)
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!("Failed to re-arm membership watch: {}", e);
                    return Err(e.into());
                }
            };
            watch = next_watch;

            let sorted = sorted_children(children);
            if !sorted.contains(&own) {
                error!("Own node {} is no longer registered", own);
                return Err(CoordError::SessionExpired.into());
            }
            let next = find_successor(&sorted, &own).map(str::to_string);
            self.apply_successor(next).await;
        }
    }

    /// Deregister and stop forwarding
    pub async fn leave(&self) -> DbResult<()> {
        *self.state.lock() = MembershipState::Unregistered;
        // Waits out any successor change in flight
        let mut successor = self.successor.lock().await;
        self.ddb.set_replica(None).await;
        *successor = None;
        drop(successor);
        self.coordinator.close().await?;
        info!("Left chain {}", self.chain_path);
        Ok(())
    }
}
