//! Durable SQLite-backed datastore.
//!
//! A single `blocks` table maps opaque keys to opaque values. The schema is
//! created with `IF NOT EXISTS`, so opening an existing file is a no-op
//! beyond connecting.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{PairingError, Result};
use crate::storage::traits::{Batch, BatchOp, Datastore};

const TABLE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS blocks (
        key BLOB PRIMARY KEY,
        data BLOB NOT NULL
    ) WITHOUT ROWID;
"#;

/// SQLite datastore over one database file.
pub struct SqliteDatastore {
    path: PathBuf,
    conn: Connection,
}

impl SqliteDatastore {
    /// Open or create the database at `path` and ensure the table exists.
    ///
    /// # Errors
    ///
    /// Returns `PairingError::StorageOpenFailed` if the file cannot be opened
    /// or the table cannot be created.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            PairingError::StorageOpenFailed(format!("{}: {}", path.display(), e))
        })?;
        conn.execute_batch(TABLE_SCHEMA).map_err(|e| {
            PairingError::StorageOpenFailed(format!("{}: create table: {}", path.display(), e))
        })?;

        tracing::debug!(path = %path.display(), "opened sqlite datastore");
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Datastore for SqliteDatastore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT data FROM blocks WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO blocks (key, data) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.conn
            .execute("DELETE FROM blocks WHERE key = ?1", [key])?;
        Ok(())
    }

    fn query(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        // BLOBs compare with memcmp, so every key sharing `prefix` sorts at
        // or after it; stop at the first key that no longer matches.
        let mut stmt = self
            .conn
            .prepare("SELECT key, data FROM blocks WHERE key >= ?1 ORDER BY key")?;
        let mut rows = stmt.query([prefix])?;

        let mut found = Vec::new();
        while let Some(row) = rows.next()? {
            let key: Vec<u8> = row.get(0)?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push((key, row.get(1)?));
        }
        Ok(found)
    }

    fn commit(&mut self, batch: Batch) -> Result<()> {
        let tx = self.conn.transaction()?;
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO blocks (key, data) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                BatchOp::Delete { key } => {
                    tx.execute("DELETE FROM blocks WHERE key = ?1", [key])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("datastore.sqlite");

        {
            let mut store = SqliteDatastore::open(&path).unwrap();
            store.put(&[0x00, 0xff], &[1, 2, 3]).unwrap();
        }

        let store = SqliteDatastore::open(&path).unwrap();
        assert_eq!(store.get(&[0x00, 0xff]).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.get(b"missing").unwrap(), None);
    }

    #[test]
    fn test_put_replaces_and_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = SqliteDatastore::open(&dir.path().join("ds.sqlite")).unwrap();

        store.put(b"k", b"v1").unwrap();
        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));

        store.delete(b"k").unwrap();
        store.delete(b"k").unwrap();
        assert!(!store.has(b"k").unwrap());
    }

    #[test]
    fn test_prefix_query() {
        let dir = tempdir().unwrap();
        let mut store = SqliteDatastore::open(&dir.path().join("ds.sqlite")).unwrap();
        store.put(b"/groups/a", b"1").unwrap();
        store.put(b"/groups/b", b"2").unwrap();
        store.put(b"/keys/a", b"3").unwrap();

        let found = store.query(b"/groups/").unwrap();
        let keys: Vec<_> = found.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"/groups/a"[..], &b"/groups/b"[..]]);
    }

    #[test]
    fn test_batch_commit() {
        let dir = tempdir().unwrap();
        let mut store = SqliteDatastore::open(&dir.path().join("ds.sqlite")).unwrap();
        store.put(b"old", b"x").unwrap();

        let mut batch = Batch::new();
        batch
            .put(b"a".to_vec(), b"1".to_vec())
            .put(b"b".to_vec(), b"2".to_vec())
            .delete(b"old".to_vec());
        store.commit(batch).unwrap();

        assert_eq!(store.query(b"").unwrap().len(), 2);
        assert!(!store.has(b"old").unwrap());
    }

    #[test]
    fn test_open_in_missing_directory_fails() {
        let dir = tempdir().unwrap();
        let result = SqliteDatastore::open(&dir.path().join("nope").join("ds.sqlite"));
        assert!(matches!(result, Err(PairingError::StorageOpenFailed(_))));
    }
}
