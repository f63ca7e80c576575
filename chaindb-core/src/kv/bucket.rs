//! Sorted singly-linked bucket list
//!
//! Every hash bucket is a list of entries kept in ascending byte-wise key
//! order. Keeping the order lets `get` and `remove` stop as soon as they
//! pass the position where the key would have been.

use super::Entry;
use std::cmp::Ordering;

type Link = Option<Box<Node>>;

struct Node {
    entry: Entry,
    next: Link,
}

/// Outcome of [`BucketList::insert_sorted`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// A new node was linked in
    Added,
    /// An existing key had its value replaced in place
    Replaced,
}

/// Outcome of [`BucketList::remove`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    Removed,
    NotFound,
}

/// Ordered list of entries for one hash bucket.
///
/// Invariants: keys are strictly ascending from `head`, and `size` equals
/// the number of reachable nodes.
#[derive(Default)]
pub struct BucketList {
    head: Link,
    size: usize,
}

impl BucketList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the list sorted; an equal key replaces the value.
    pub fn insert_sorted(&mut self, entry: Entry) -> InsertStatus {
        let mut cursor = &mut self.head;
        while cursor
            .as_ref()
            .map_or(false, |node| node.entry.key() < entry.key())
        {
            if let Some(node) = cursor {
                cursor = &mut node.next;
            }
        }

        if let Some(node) = cursor {
            if node.entry.key() == entry.key() {
                node.entry.replace_value(entry.into_value());
                return InsertStatus::Replaced;
            }
        }

        let next = cursor.take();
        *cursor = Some(Box::new(Node { entry, next }));
        self.size += 1;
        InsertStatus::Added
    }

    /// Unlink the entry for `key`
    pub fn remove(&mut self, key: &str) -> RemoveStatus {
        let mut cursor = &mut self.head;
        while cursor.as_ref().map_or(false, |node| node.entry.key() < key) {
            if let Some(node) = cursor {
                cursor = &mut node.next;
            }
        }

        match cursor.take() {
            Some(node) if node.entry.key() == key => {
                *cursor = node.next;
                self.size -= 1;
                RemoveStatus::Removed
            }
            other => {
                *cursor = other;
                RemoveStatus::NotFound
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        let mut cursor = self.head.as_deref();
        while let Some(node) = cursor {
            match node.entry.key().cmp(key) {
                Ordering::Less => cursor = node.next.as_deref(),
                Ordering::Equal => return Some(&node.entry),
                Ordering::Greater => return None,
            }
        }
        None
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Copies of every key, in list order
    pub fn keys(&self) -> Vec<String> {
        self.iter().map(|entry| entry.key().to_string()).collect()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head.as_deref(),
        }
    }
}

impl Drop for BucketList {
    fn drop(&mut self) {
        // unlink iteratively so long buckets don't recurse through Box drops
        let mut link = self.head.take();
        while let Some(mut node) = link {
            link = node.next.take();
        }
    }
}

/// Borrowing iterator over a bucket's entries
pub struct Iter<'a> {
    next: Option<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Entry;

    fn next(&mut self) -> Option<Self::Item> {
        self.next.map(|node| {
            self.next = node.next.as_deref();
            &node.entry
        })
    }
}
