//! Chain write-forwarding on top of the local database
//!
//! A successful local PUT or DEL is forwarded to the replica (the next
//! node in the chain) when one is set. Reads are always local. A failed
//! forward is reported to the caller but the local write stays.

use crate::client::RemoteTable;
use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::kv::{Entry, InsertStatus};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct DistributedDatabase {
    db: Database,
    /// Successor handle, `None` on the tail. Shared between the request
    /// path and the membership watcher.
    replica: Mutex<Option<RemoteTable>>,
}

impl DistributedDatabase {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            replica: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn put(&self, key: &str, value: &[u8]) -> DbResult<InsertStatus> {
        let status = self.db.put(key, value)?;

        let mut replica = self.replica.lock().await;
        if let Some(next) = replica.as_mut() {
            debug!("Forwarding PUT '{}' to {}", key, next.address());
            next.put(key, value)
                .await
                .map_err(|source| forward_failed(key, next.address(), source))?;
        }
        Ok(status)
    }

    pub async fn remove(&self, key: &str) -> DbResult<()> {
        self.db.remove(key)?;

        let mut replica = self.replica.lock().await;
        if let Some(next) = replica.as_mut() {
            debug!("Forwarding DEL '{}' to {}", key, next.address());
            next.del(key)
                .await
                .map_err(|source| forward_failed(key, next.address(), source))?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> DbResult<Vec<u8>> {
        Ok(self.db.get(key)?)
    }

    pub fn size(&self) -> usize {
        self.db.size()
    }

    pub fn keys(&self) -> Vec<String> {
        self.db.keys()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.db.entries()
    }

    /// Install a new successor handle, or clear it with `None`.
    ///
    /// The previous handle is disconnected before the swap.
    pub async fn set_replica(&self, next: Option<RemoteTable>) {
        let mut replica = self.replica.lock().await;
        if let Some(mut old) = replica.take() {
            old.disconnect();
        }
        match &next {
            Some(table) => info!("Forwarding writes to {}", table.address()),
            None => info!("No successor; writes are no longer forwarded"),
        }
        *replica = next;
    }

    pub async fn has_replica(&self) -> bool {
        self.replica.lock().await.is_some()
    }

    pub async fn replica_address(&self) -> Option<String> {
        self.replica
            .lock()
            .await
            .as_ref()
            .map(|table| table.address().to_string())
    }

    /// Seed the local table from `source` (normally the predecessor)
    pub async fn migrate_from(&self, source: &mut RemoteTable) -> DbResult<usize> {
        self.db.migrate_from(source).await
    }
}

fn forward_failed(key: &str, address: &str, source: crate::error::ClientError) -> DbError {
    warn!("Forward of '{}' to {} failed: {}", key, address, source);
    DbError::ForwardFailed {
        key: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSettings;
    use crate::error::{ClientError, KvError};
    use tokio::net::TcpListener;

    fn ddb() -> DistributedDatabase {
        DistributedDatabase::new(Database::new(4).unwrap())
    }

    #[tokio::test]
    async fn test_local_only_without_replica() {
        let ddb = ddb();
        assert!(!ddb.has_replica().await);

        assert_eq!(ddb.put("a", b"1").await.unwrap(), InsertStatus::Added);
        assert_eq!(ddb.put("a", b"2").await.unwrap(), InsertStatus::Replaced);
        assert_eq!(ddb.get("a").unwrap(), b"2");
        assert_eq!(ddb.size(), 1);

        ddb.remove("a").await.unwrap();
        assert_eq!(ddb.size(), 0);
    }

    #[tokio::test]
    async fn test_failed_local_remove_is_not_forwarded() {
        let ddb = ddb();
        // Unreachable replica: a forward attempt would fail with a client error
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        ddb.set_replica(Some(RemoteTable::new(addr, NetworkSettings::default()).unwrap()))
            .await;

        let err = ddb.remove("missing").await.unwrap_err();
        assert!(matches!(err, DbError::Kv(KvError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_forward_keeps_local_write() {
        let ddb = ddb();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        ddb.set_replica(Some(RemoteTable::new(addr, NetworkSettings::default()).unwrap()))
            .await;

        let err = ddb.put("k", b"v").await.unwrap_err();
        assert!(matches!(
            err,
            DbError::ForwardFailed {
                source: ClientError::Io(_),
                ..
            }
        ));
        assert_eq!(ddb.get("k").unwrap(), b"v");
    }

    #[tokio::test]
    async fn test_set_replica_replaces_and_clears() {
        let ddb = ddb();
        let first = RemoteTable::new("127.0.0.1:7001", NetworkSettings::default()).unwrap();
        let second = RemoteTable::new("127.0.0.1:7002", NetworkSettings::default()).unwrap();

        ddb.set_replica(Some(first)).await;
        assert_eq!(ddb.replica_address().await.as_deref(), Some("127.0.0.1:7001"));

        ddb.set_replica(Some(second)).await;
        assert_eq!(ddb.replica_address().await.as_deref(), Some("127.0.0.1:7002"));

        ddb.set_replica(None).await;
        assert!(!ddb.has_replica().await);
    }
}
