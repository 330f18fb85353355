//! Key-value datastore trait definition.
//!
//! The `Datastore` trait is the contract both backends implement: an opaque
//! byte-key to byte-value mapping with prefix queries and batched writes.
//! Implementations are not required to be thread-safe; `StorageHandle`
//! serializes access to them.

use crate::error::Result;

/// A single write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered set of writes applied atomically on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Storage backend interface.
///
/// All implementations must ensure:
/// - Keys and values are stored byte-for-byte
/// - `put` on an existing key replaces its value
/// - `delete` of a missing key is not an error
/// - `commit` applies every operation of a batch or none of them
pub trait Datastore: Send {
    /// Get the value stored under `key`.
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(value))` if found, `Ok(None)` if not found.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Check whether `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace the value under `key`.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key` if present.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// List all pairs whose key starts with `prefix`, ordered by key.
    fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch of writes atomically.
    fn commit(&mut self, batch: Batch) -> Result<()>;
}
