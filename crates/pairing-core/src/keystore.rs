//! Device key storage.
//!
//! Each device owns a long-lived X25519 keypair used to encrypt push
//! notifications. It is persisted as a single blob of `2 * KEY_SIZE` bytes,
//! public half first, with no header or checksum.

use std::fs;
use std::io;
use std::path::Path;

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{PairingError, Result};
use crate::fs::{create_private_dir_all, write_private_new};

/// Size in bytes of each half of a device keypair.
pub const KEY_SIZE: usize = 32;

/// Default file name for the push key inside an account directory.
pub const DEFAULT_PUSH_KEY_FILENAME: &str = "push.key";

/// A device keypair; the private half is zeroized on drop.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct DeviceKeyPair {
    public_key: [u8; KEY_SIZE],
    private_key: [u8; KEY_SIZE],
}

impl DeviceKeyPair {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public_key: public.to_bytes(),
            private_key: secret.to_bytes(),
        }
    }

    pub fn public_key(&self) -> &[u8; KEY_SIZE] {
        &self.public_key
    }

    /// Raw private key bytes. Avoid storing or logging this value.
    pub fn private_key(&self) -> &[u8; KEY_SIZE] {
        &self.private_key
    }

    /// Serialize as `public ‖ private`.
    pub fn to_bytes(&self) -> [u8; KEY_SIZE * 2] {
        let mut out = [0u8; KEY_SIZE * 2];
        out[..KEY_SIZE].copy_from_slice(&self.public_key);
        out[KEY_SIZE..].copy_from_slice(&self.private_key);
        out
    }

    /// Split a `public ‖ private` blob; `None` if the length is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_SIZE * 2 {
            return None;
        }
        let mut public_key = [0u8; KEY_SIZE];
        let mut private_key = [0u8; KEY_SIZE];
        public_key.copy_from_slice(&bytes[..KEY_SIZE]);
        private_key.copy_from_slice(&bytes[KEY_SIZE..]);
        Some(Self {
            public_key,
            private_key,
        })
    }
}

impl std::fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("public_key", &short_hex(&self.public_key))
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

fn short_hex(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Read the device keypair at `path`, generating it first if allowed.
///
/// # Errors
///
/// - `PairingError::CorruptKeyFile` if the file is not exactly `2 * KEY_SIZE` bytes
/// - `PairingError::KeyNotFound` if the file is missing and `create_if_missing` is false
/// - `PairingError::Io` for any other filesystem failure
pub fn get_or_create_device_key_pair(path: &Path, create_if_missing: bool) -> Result<DeviceKeyPair> {
    match fs::read(path) {
        Ok(mut contents) => {
            let pair = DeviceKeyPair::from_bytes(&contents);
            let actual = contents.len();
            contents.zeroize();
            pair.ok_or_else(|| PairingError::CorruptKeyFile {
                path: path.to_path_buf(),
                expected: KEY_SIZE * 2,
                actual,
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            if !create_if_missing {
                return Err(PairingError::KeyNotFound(path.to_path_buf()));
            }
            create_key_file(path)
        }
        Err(err) => Err(PairingError::io(
            format!("Failed to read device key {}", path.display()),
            err,
        )),
    }
}

fn create_key_file(path: &Path) -> Result<DeviceKeyPair> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_private_dir_all(parent).map_err(|e| {
            PairingError::io(
                format!("Failed to create key directory {}", parent.display()),
                e,
            )
        })?;
    }

    let pair = DeviceKeyPair::generate();
    let mut contents = pair.to_bytes();
    let written = write_private_new(path, &contents);
    contents.zeroize();
    match written {
        Ok(()) => {
            tracing::info!(path = %path.display(), "generated device key");
            Ok(pair)
        }
        // Another caller created it first; theirs is the key on disk.
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            tracing::debug!(path = %path.display(), "device key created concurrently");
            get_or_create_device_key_pair(path, false)
        }
        Err(err) => Err(PairingError::io(
            format!("Failed to write device key {}", path.display()),
            err,
        )),
    }
}
