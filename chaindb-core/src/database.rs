//! Local database: the table behind one lock, plus statistics
//!
//! Every table operation takes the table lock, measures how long the
//! table call itself ran, releases the lock and only then folds the
//! elapsed time into the statistics. The operation counter is left to
//! the dispatch layer, which knows whether a request completed.

use crate::client::RemoteTable;
use crate::error::{DbResult, KvResult};
use crate::kv::{Entry, InsertStatus, Table};
use crate::stats::{Statistics, StatsSnapshot};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DEFAULT_SLOW_OP_THRESHOLD: Duration = Duration::from_millis(100);

pub struct Database {
    table: Mutex<Table>,
    stats: Statistics,
    slow_op_threshold: Duration,
}

impl Database {
    pub fn new(n_lists: usize) -> KvResult<Self> {
        Ok(Self {
            table: Mutex::new(Table::new(n_lists)?),
            stats: Statistics::new(),
            slow_op_threshold: DEFAULT_SLOW_OP_THRESHOLD,
        })
    }

    /// Operations running longer than `threshold` are logged as slow
    pub fn with_slow_op_threshold(mut self, threshold: Duration) -> Self {
        self.slow_op_threshold = threshold;
        self
    }

    fn timed<R>(&self, op: &'static str, f: impl FnOnce(&mut Table) -> R) -> R {
        let mut table = self.table.lock();
        let start = Instant::now();
        let result = f(&mut table);
        let elapsed = start.elapsed();
        drop(table);

        self.stats.add_computed_time(elapsed.as_micros() as u64);
        if elapsed >= self.slow_op_threshold {
            warn!("Slow {} took {}us", op, elapsed.as_micros());
        }
        result
    }

    pub fn put(&self, key: &str, value: &[u8]) -> KvResult<InsertStatus> {
        self.timed("put", |table| table.put(key, value))
    }

    pub fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        self.timed("get", |table| table.get(key))
    }

    pub fn remove(&self, key: &str) -> KvResult<()> {
        self.timed("remove", |table| table.remove(key))
    }

    pub fn size(&self) -> usize {
        self.timed("size", |table| table.size())
    }

    pub fn keys(&self) -> Vec<String> {
        self.timed("keys", |table| table.keys())
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.timed("entries", |table| table.entries())
    }

    pub fn n_lists(&self) -> usize {
        self.table.lock().n_lists()
    }

    pub fn increment_op_counter(&self) {
        self.stats.increment_op_counter();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Count a connected client until the returned guard is dropped
    pub fn client_session(&self) -> ClientSession<'_> {
        self.stats.increment_active_clients();
        ClientSession { db: self }
    }

    /// Put every entry locally, one at a time.
    ///
    /// Not atomic against concurrent writers: whichever put for a key
    /// lands last wins.
    pub fn import_entries(&self, entries: Vec<Entry>) -> KvResult<usize> {
        let mut imported = 0;
        for entry in entries {
            debug!("Migrating key '{}' ({} bytes)", entry.key(), entry.value().len());
            self.put(entry.key(), entry.value())?;
            imported += 1;
        }
        Ok(imported)
    }

    /// Copy the whole table of `source` into this database
    pub async fn migrate_from(&self, source: &mut RemoteTable) -> DbResult<usize> {
        info!("Fetching table from {} for migration", source.address());
        let entries = source.get_table().await?;
        let total = entries.len();
        let imported = self.import_entries(entries)?;
        info!("Migrated {}/{} entries from {}", imported, total, source.address());
        Ok(imported)
    }
}

/// RAII marker for one connected client
pub struct ClientSession<'a> {
    db: &'a Database,
}

impl Drop for ClientSession<'_> {
    fn drop(&mut self) {
        self.db.stats.decrement_active_clients();
    }
}
