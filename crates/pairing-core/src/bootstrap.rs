//! Startup wiring for one account.
//!
//! Opens everything the protocol and messenger services need before a
//! pairing flow can run: the datastore, the messenger database and the push
//! device key.

use std::path::Path;

use rusqlite::Connection;

use crate::account::account_dir;
use crate::config::PairingConfig;
use crate::error::{PairingError, Result};
use crate::keystore::{get_or_create_device_key_pair, DeviceKeyPair};
use crate::storage::{datastore_dir, open_messenger_db, open_storage, StorageHandle, IN_MEMORY_DIR};

pub struct AccountResources {
    pub account_id: String,
    pub storage: StorageHandle,
    pub messenger_db: Connection,
    pub push_keys: DeviceKeyPair,
}

impl AccountResources {
    /// Open (creating if needed) the resources of `account_id`.
    ///
    /// With `root_dir = ":memory:"` both databases are transient; the push
    /// key is always file-backed.
    pub fn open(config: &PairingConfig, account_id: &str) -> Result<Self> {
        if account_id.trim().is_empty() {
            return Err(PairingError::MissingInput("account id".to_string()));
        }
        if config.keys.push_key_path.trim().is_empty() {
            return Err(PairingError::MissingInput("push key path".to_string()));
        }

        let root = config.storage.root_dir.as_str();
        let dir = if root == IN_MEMORY_DIR {
            Path::new(IN_MEMORY_DIR).to_path_buf()
        } else {
            if root.trim().is_empty() {
                return Err(PairingError::InvalidDirectory(
                    "accounts root directory is empty".to_string(),
                ));
            }
            account_dir(Path::new(root), account_id)
        };

        let storage = open_storage(&dir)?;
        let messenger_db = open_messenger_db(&datastore_dir(&dir)?)?;
        let push_keys = get_or_create_device_key_pair(Path::new(&config.keys.push_key_path), true)?;

        tracing::info!(account = account_id, backend = %storage.kind(), "account resources open");
        Ok(Self {
            account_id: account_id.to_string(),
            storage,
            messenger_db,
            push_keys,
        })
    }
}

impl std::fmt::Debug for AccountResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountResources")
            .field("account_id", &self.account_id)
            .field("storage", &self.storage)
            .field("push_keys", &self.push_keys)
            .finish_non_exhaustive()
    }
}
