//! Fixed-size hash table of sorted bucket lists

use super::{BucketList, Entry, InsertStatus, RemoveStatus};
use crate::error::{KvError, KvResult};

/// Bucket index for `key` in a table of `n` buckets.
///
/// Sum of the key's byte values plus its length, modulo `n`. Not a
/// quality hash; collisions land in the same sorted bucket list.
pub fn hash_code(key: &str, n: usize) -> usize {
    let sum = key
        .bytes()
        .fold(0usize, |acc, byte| acc.wrapping_add(byte as usize));
    sum.wrapping_add(key.len()) % n
}

/// Hash table with `n` buckets, `n` fixed at creation
pub struct Table {
    buckets: Vec<BucketList>,
}

impl Table {
    pub fn new(n_lists: usize) -> KvResult<Self> {
        if n_lists == 0 {
            return Err(KvError::InvalidSize(n_lists));
        }

        let buckets = (0..n_lists).map(|_| BucketList::new()).collect();
        Ok(Self { buckets })
    }

    pub fn n_lists(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, key: &str) -> usize {
        hash_code(key, self.buckets.len())
    }

    /// Store a copy of `key` and `value`, replacing any previous value
    pub fn put(&mut self, key: &str, value: &[u8]) -> KvResult<InsertStatus> {
        validate_key(key)?;
        let index = self.bucket_index(key);
        Ok(self.buckets[index].insert_sorted(Entry::new(key, value)))
    }

    /// Copy of the stored value
    pub fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        validate_key(key)?;
        self.buckets[self.bucket_index(key)]
            .get(key)
            .map(|entry| entry.value().to_vec())
            .ok_or_else(|| KvError::NotFound(key.to_string()))
    }

    pub fn remove(&mut self, key: &str) -> KvResult<()> {
        validate_key(key)?;
        let index = self.bucket_index(key);
        match self.buckets[index].remove(key) {
            RemoveStatus::Removed => Ok(()),
            RemoveStatus::NotFound => Err(KvError::NotFound(key.to_string())),
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.iter().map(BucketList::size).sum()
    }

    /// Keys in bucket-index order, ascending within each bucket
    pub fn keys(&self) -> Vec<String> {
        self.buckets.iter().flat_map(BucketList::keys).collect()
    }

    /// Copies of every entry, in the same order as [`Table::keys`]
    pub fn entries(&self) -> Vec<Entry> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().cloned())
            .collect()
    }
}

fn validate_key(key: &str) -> KvResult<()> {
    if key.is_empty() {
        return Err(KvError::InvalidKey);
    }
    Ok(())
}
