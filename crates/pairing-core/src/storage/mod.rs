//! Account storage backends.
//!
//! `open_storage` picks a backend from a directory argument:
//!
//! - the `":memory:"` sentinel gives a transient in-process map
//! - any other directory gives a SQLite file at
//!   `<dir>/account0/datastore.sqlite`
//!
//! Either way the backend is wrapped in a [`StorageHandle`], which serializes
//! every operation behind one lock. The protocol service touches the store
//! from many tasks at once and the handshake's write volume is low, so a
//! single coarse lock is enough.

mod memory;
mod sqlite;
mod traits;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::error::{PairingError, Result};
use crate::fs::create_private_dir_all;

pub use memory::MemoryDatastore;
pub use sqlite::SqliteDatastore;
pub use traits::{Batch, BatchOp, Datastore};

/// Directory sentinel selecting the transient backend.
pub const IN_MEMORY_DIR: &str = ":memory:";

/// Per-account storage subdirectory; reserved for multi-account layouts.
pub const STORAGE_SUBDIR: &str = "account0";

/// Durable datastore file name inside the storage subdirectory.
pub const DATASTORE_FILENAME: &str = "datastore.sqlite";

/// Messenger database file name inside the storage subdirectory.
pub const MESSENGER_DATABASE_FILENAME: &str = "messenger.sqlite";

/// Where an account's storage lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    InMemory,
    Directory(PathBuf),
}

impl StorageLocation {
    /// Classify a directory argument without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns `PairingError::InvalidDirectory` if `dir` is empty.
    pub fn parse(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            return Err(PairingError::InvalidDirectory(
                "storage directory is empty".to_string(),
            ));
        }
        if dir == Path::new(IN_MEMORY_DIR) {
            return Ok(StorageLocation::InMemory);
        }
        Ok(StorageLocation::Directory(dir.to_path_buf()))
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, StorageLocation::InMemory)
    }
}

/// Resolve the account storage directory for `dir`, creating it if missing.
///
/// The sentinel resolves to [`StorageLocation::InMemory`] and creates nothing.
pub fn datastore_dir(dir: impl AsRef<Path>) -> Result<StorageLocation> {
    match StorageLocation::parse(dir)? {
        StorageLocation::InMemory => Ok(StorageLocation::InMemory),
        StorageLocation::Directory(base) => {
            let resolved = base.join(STORAGE_SUBDIR);
            match std::fs::metadata(&resolved) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(PairingError::InvalidDirectory(format!(
                        "{} is not a directory",
                        resolved.display()
                    )))
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    create_private_dir_all(&resolved).map_err(|e| {
                        PairingError::StorageOpenFailed(format!(
                            "create {}: {}",
                            resolved.display(),
                            e
                        ))
                    })?;
                }
                Err(err) => {
                    return Err(PairingError::StorageOpenFailed(format!(
                        "{}: {}",
                        resolved.display(),
                        err
                    )))
                }
            }
            Ok(StorageLocation::Directory(resolved))
        }
    }
}

/// Open the account datastore selected by `dir`.
///
/// # Errors
///
/// - `PairingError::InvalidDirectory` if `dir` is empty
/// - `PairingError::StorageOpenFailed` if the directory, file or table cannot be created
pub fn open_storage(dir: impl AsRef<Path>) -> Result<StorageHandle> {
    let handle = match datastore_dir(dir)? {
        StorageLocation::InMemory => StorageHandle::new(MemoryDatastore::new(), BackendKind::Transient),
        StorageLocation::Directory(resolved) => {
            let store = SqliteDatastore::open(&resolved.join(DATASTORE_FILENAME))?;
            StorageHandle::new(store, BackendKind::Durable)
        }
    };
    tracing::debug!(backend = %handle.kind(), "storage ready");
    Ok(handle)
}

/// Open the messenger database that sits next to the datastore.
pub fn open_messenger_db(location: &StorageLocation) -> Result<Connection> {
    let conn = match location {
        StorageLocation::InMemory => Connection::open_in_memory(),
        StorageLocation::Directory(dir) => Connection::open(dir.join(MESSENGER_DATABASE_FILENAME)),
    }
    .map_err(|e| PairingError::StorageOpenFailed(format!("messenger database: {}", e)))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Which backend a handle wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Transient,
    Durable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Transient => write!(f, "transient"),
            BackendKind::Durable => write!(f, "durable"),
        }
    }
}

/// Shared, mutually exclusive access to a datastore.
///
/// Cloning is cheap; all clones point at the same backend.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<Mutex<Box<dyn Datastore>>>,
    kind: BackendKind,
}

impl StorageHandle {
    pub fn new(store: impl Datastore + 'static, kind: BackendKind) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
            kind,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Lock the backend, returning an error if the mutex is poisoned.
    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn Datastore>>> {
        self.inner
            .lock()
            .map_err(|_| PairingError::Storage("datastore lock poisoned".to_string()))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.lock()?.get(key)
    }

    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.lock()?.has(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.lock()?.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.lock()?.delete(key)
    }

    pub fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.lock()?.query(prefix)
    }

    /// Apply `batch` atomically; an empty batch does not take the lock.
    pub fn commit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.lock()?.commit(batch)
    }
}

impl fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageHandle")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
