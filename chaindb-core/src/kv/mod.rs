//! In-memory storage engine
//!
//! A fixed number of buckets, each a sorted singly-linked list of owned
//! entries. The table itself is not synchronized; `Database` wraps it in
//! a single lock.

pub mod bucket;
pub mod entry;
pub mod table;

pub use bucket::{BucketList, InsertStatus, RemoveStatus};
pub use entry::Entry;
pub use table::{hash_code, Table};
