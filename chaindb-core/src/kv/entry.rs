//! Key/value entry stored in a bucket list

use serde::{Deserialize, Serialize};

/// An owned key/value pair.
///
/// Both fields are owned copies; an entry never aliases caller memory.
/// The value can only change through [`Entry::replace_value`], which the
/// bucket list uses when a put hits an existing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    key: String,
    value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    pub fn into_parts(self) -> (String, Vec<u8>) {
        (self.key, self.value)
    }

    /// Swap in a new value, returning the previous one
    pub(crate) fn replace_value(&mut self, value: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut self.value, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_owns_copies() {
        let mut buffer = b"value".to_vec();
        let entry = Entry::new("key", buffer.as_slice());
        buffer[0] = b'X';

        assert_eq!(entry.key(), "key");
        assert_eq!(entry.value(), b"value");
    }

    #[test]
    fn test_replace_value_returns_old() {
        let mut entry = Entry::new("k", b"one".to_vec());
        let old = entry.replace_value(b"two".to_vec());

        assert_eq!(old, b"one");
        assert_eq!(entry.value(), b"two");
    }

    #[test]
    fn test_into_parts() {
        let (key, value) = Entry::new("k", b"v".to_vec()).into_parts();
        assert_eq!(key, "k");
        assert_eq!(value, b"v");
    }
}
