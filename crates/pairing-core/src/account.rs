//! On-disk account registry.
//!
//! Accounts live one per subdirectory of a root directory:
//!
//! ```text
//! <root>/<account_id>/account_meta           JSON metadata
//! <root>/<account_id>/account0/datastore.sqlite
//! ```
//!
//! This layer only reads metadata; accounts are provisioned elsewhere.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PairingError, Result};
use crate::fs::{create_private_dir_all, write_private_atomic};

/// Fixed name of the metadata file inside an account directory.
pub const ACCOUNT_METAFILE_NAME: &str = "account_meta";

/// Metadata for one account.
///
/// `account_id` comes from the directory name and `error` is only set when
/// loading failed; neither is stored in the metadata file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountMetadata {
    #[serde(skip)]
    pub account_id: String,

    /// Display name chosen at provisioning time
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_cid: Option<String>,

    /// Account public key, Base58-encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_date: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_opened: Option<DateTime<Utc>>,

    #[serde(skip)]
    pub error: Option<String>,
}

impl AccountMetadata {
    pub fn new(account_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            name: name.into(),
            creation_date: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Placeholder record for an account whose metadata failed to load.
    pub fn failed(account_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Path of the directory for `account_id` under `root_dir`.
pub fn account_dir(root_dir: &Path, account_id: &str) -> PathBuf {
    root_dir.join(account_id)
}

/// List every account under `root_dir`, sorted by account id.
///
/// A missing root is an empty registry. Accounts whose metadata cannot be
/// loaded are still returned, with `error` describing the failure.
pub fn list_accounts(root_dir: &Path) -> Result<Vec<AccountMetadata>> {
    match fs::metadata(root_dir) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(PairingError::AccountFs(format!(
                "{}: {}",
                root_dir.display(),
                err
            )))
        }
    }

    let entries = fs::read_dir(root_dir)
        .map_err(|e| PairingError::AccountFs(format!("{}: {}", root_dir.display(), e)))?;

    let mut ids = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| PairingError::AccountFs(format!("{}: {}", root_dir.display(), e)))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| PairingError::AccountFs(format!("{}: {}", root_dir.display(), e)))?
            .is_dir();
        if !is_dir {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(id) => ids.push(id),
            Err(name) => {
                tracing::warn!(name = ?name, "skipping account directory with non UTF-8 name")
            }
        }
    }
    ids.sort();

    let accounts = ids
        .into_iter()
        .map(|id| match get_account_metadata(root_dir, &id) {
            Ok(meta) => meta,
            Err(err) => AccountMetadata::failed(id, err.to_string()),
        })
        .collect();

    Ok(accounts)
}

/// Load the metadata file for a single account.
///
/// # Errors
///
/// - `PairingError::AccountNotFound` if the metadata file does not exist
/// - `PairingError::AccountFs` if it exists but cannot be read
/// - `PairingError::MetadataCorrupt` if it cannot be parsed
pub fn get_account_metadata(root_dir: &Path, account_id: &str) -> Result<AccountMetadata> {
    let path = account_dir(root_dir, account_id).join(ACCOUNT_METAFILE_NAME);

    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(PairingError::AccountNotFound(account_id.to_string()))
        }
        Err(err) => {
            tracing::warn!(account_id, error = %err, "unable to read account metadata");
            return Err(PairingError::AccountFs(format!(
                "unable to read account metadata: {}",
                err
            )));
        }
    };

    let mut meta: AccountMetadata =
        serde_json::from_slice(&bytes).map_err(|e| PairingError::MetadataCorrupt {
            account_id: account_id.to_string(),
            reason: e.to_string(),
        })?;
    meta.account_id = account_id.to_string();

    Ok(meta)
}

/// Write `meta` into its account directory, creating the directory if needed.
pub fn write_account_metadata(root_dir: &Path, meta: &AccountMetadata) -> Result<()> {
    if meta.account_id.is_empty() {
        return Err(PairingError::MissingInput("account id".to_string()));
    }

    let dir = account_dir(root_dir, &meta.account_id);
    create_private_dir_all(&dir)
        .map_err(|e| PairingError::io(format!("Failed to create {}", dir.display()), e))?;

    let contents = serde_json::to_vec_pretty(meta)?;
    let path = dir.join(ACCOUNT_METAFILE_NAME);
    write_private_atomic(&path, &contents)
        .map_err(|e| PairingError::io(format!("Failed to write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let accounts = list_accounts(&dir.path().join("does-not-exist")).unwrap();
        assert!(accounts.is_empty());
    }

    #[test]
    fn test_corrupt_metadata_is_reported_not_dropped() {
        let dir = tempdir().unwrap();
        let account = dir.path().join("alice");
        fs::create_dir_all(&account).unwrap();
        fs::write(account.join(ACCOUNT_METAFILE_NAME), b"\x00not json").unwrap();

        let accounts = list_accounts(dir.path()).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].account_id, "alice");
        let error = accounts[0].error.as_deref().unwrap();
        assert!(!error.is_empty());
        assert!(error.contains("corrupt"));
    }

    #[test]
    fn test_directory_without_metadata_is_not_found() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bob")).unwrap();

        let err = get_account_metadata(dir.path(), "bob").unwrap_err();
        assert!(matches!(err, PairingError::AccountNotFound(ref id) if id == "bob"));

        let accounts = list_accounts(dir.path()).unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(!accounts[0].is_ok());
    }

    #[test]
    fn test_round_trip_and_files_are_skipped() {
        let dir = tempdir().unwrap();
        let mut meta = AccountMetadata::new("carol", "Carol");
        meta.public_key = Some("3yZe7d".to_string());
        write_account_metadata(dir.path(), &meta).unwrap();
        write_account_metadata(dir.path(), &AccountMetadata::new("alice", "Alice")).unwrap();
        fs::write(dir.path().join("stray.txt"), b"ignored").unwrap();

        let accounts = list_accounts(dir.path()).unwrap();
        let ids: Vec<_> = accounts.iter().map(|a| a.account_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "carol"]);
        assert_eq!(accounts[1], meta);
    }

    #[test]
    fn test_metadata_file_omits_directory_fields() {
        let dir = tempdir().unwrap();
        let meta = AccountMetadata::new("dave", "Dave");
        write_account_metadata(dir.path(), &meta).unwrap();

        let raw = fs::read_to_string(dir.path().join("dave").join(ACCOUNT_METAFILE_NAME)).unwrap();
        assert!(!raw.contains("account_id"));
        assert!(!raw.contains("error"));
    }
}
