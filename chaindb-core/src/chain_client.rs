//! Client for a whole chain
//!
//! Writes go to the head and reads to the tail. The chain ends are
//! looked up in the coordination service and kept current by a
//! background task following the same child watch the servers use.

use crate::client::RemoteTable;
use crate::config::NetworkSettings;
use crate::coord::{ChildWatch, Coordinator, WatchEvent};
use crate::error::{DbError, DbResult};
use crate::kv::Entry;
use crate::membership::{connect_member, head_of, sorted_children, tail_of};
use crate::stats::StatsSnapshot;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ChainEnd {
    member: Option<String>,
    table: Option<RemoteTable>,
}

#[derive(Default)]
struct ChainEnds {
    head: ChainEnd,
    tail: ChainEnd,
}

struct Topology {
    coordinator: Arc<dyn Coordinator>,
    chain_path: String,
    network: NetworkSettings,
    ends: Mutex<ChainEnds>,
}

impl Topology {
    async fn refresh(&self, children: Vec<String>) {
        let sorted = sorted_children(children);
        let head = head_of(&sorted).map(str::to_string);
        let tail = tail_of(&sorted).map(str::to_string);

        let mut ends = self.ends.lock().await;
        self.update_end("head", &mut ends.head, head).await;
        self.update_end("tail", &mut ends.tail, tail).await;
    }

    async fn update_end(&self, role: &str, end: &mut ChainEnd, member: Option<String>) {
        if end.member == member && (member.is_none() || end.table.is_some()) {
            return;
        }

        if let Some(mut old) = end.table.take() {
            old.disconnect();
        }
        end.table = match &member {
            Some(name) => {
                match connect_member(self.coordinator.as_ref(), &self.chain_path, name, self.network)
                    .await
                {
                    Ok(table) => {
                        info!("Chain {} is {} at {}", role, name, table.address());
                        Some(table)
                    }
                    Err(e) => {
                        warn!("Cannot connect to chain {} {}: {}", role, name, e);
                        None
                    }
                }
            }
            None => {
                info!("Chain has no {}", role);
                None
            }
        };
        end.member = member;
    }

    async fn follow(self: Arc<Self>, mut watch: ChildWatch) {
        loop {
            if let WatchEvent::SessionClosed = watch.fired().await {
                debug!("Chain client session closed; no longer following {}", self.chain_path);
                return;
            }
            match self.coordinator.children_and_watch(&self.chain_path).await {
                Ok((children, next)) => {
                    watch = next;
                    self.refresh(children).await;
                }
                Err(e) => {
                    warn!("Chain client lost its watch on {}: {}", self.chain_path, e);
                    return;
                }
            }
        }
    }
}

pub struct ChainClient {
    topology: Arc<Topology>,
    follower: JoinHandle<()>,
}

impl ChainClient {
    pub async fn connect(
        coordinator: Arc<dyn Coordinator>,
        chain_path: impl Into<String>,
        network: NetworkSettings,
    ) -> DbResult<Self> {
        let topology = Arc::new(Topology {
            coordinator,
            chain_path: chain_path.into(),
            network,
            ends: Mutex::new(ChainEnds::default()),
        });

        let (children, watch) = topology
            .coordinator
            .children_and_watch(&topology.chain_path)
            .await?;
        topology.refresh(children).await;

        let follower = tokio::spawn(Arc::clone(&topology).follow(watch));
        Ok(Self { topology, follower })
    }

    pub async fn head(&self) -> Option<String> {
        self.topology.ends.lock().await.head.member.clone()
    }

    pub async fn tail(&self) -> Option<String> {
        self.topology.ends.lock().await.tail.member.clone()
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> DbResult<()> {
        let mut ends = self.topology.ends.lock().await;
        let head = ends.head.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(head.put(key, value).await?)
    }

    pub async fn del(&self, key: &str) -> DbResult<()> {
        let mut ends = self.topology.ends.lock().await;
        let head = ends.head.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(head.del(key).await?)
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<Vec<u8>>> {
        let mut ends = self.topology.ends.lock().await;
        let tail = ends.tail.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(tail.get(key).await?)
    }

    pub async fn size(&self) -> DbResult<usize> {
        let mut ends = self.topology.ends.lock().await;
        let tail = ends.tail.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(tail.size().await?)
    }

    pub async fn keys(&self) -> DbResult<Vec<String>> {
        let mut ends = self.topology.ends.lock().await;
        let tail = ends.tail.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(tail.keys().await?)
    }

    pub async fn get_table(&self) -> DbResult<Vec<Entry>> {
        let mut ends = self.topology.ends.lock().await;
        let tail = ends.tail.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(tail.get_table().await?)
    }

    pub async fn stats(&self) -> DbResult<StatsSnapshot> {
        let mut ends = self.topology.ends.lock().await;
        let tail = ends.tail.table.as_mut().ok_or(DbError::NoChain)?;
        Ok(tail.stats().await?)
    }
}

impl Drop for ChainClient {
    fn drop(&mut self) {
        self.follower.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;

    #[tokio::test]
    async fn test_empty_chain() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.ensure_exists("/chain").unwrap();

        let client = ChainClient::connect(Arc::new(session), "/chain", NetworkSettings::default())
            .await
            .unwrap();
        assert_eq!(client.head().await, None);
        assert!(matches!(client.put("k", b"v").await, Err(DbError::NoChain)));
        assert!(matches!(client.get("k").await, Err(DbError::NoChain)));
        assert!(matches!(client.size().await, Err(DbError::NoChain)));
    }

    #[tokio::test]
    async fn test_missing_chain_path() {
        let coordinator = MemoryCoordinator::new();
        let result =
            ChainClient::connect(Arc::new(coordinator.session()), "/chain", NetworkSettings::default())
                .await;
        assert!(matches!(result, Err(DbError::Coord(_))));
    }
}
