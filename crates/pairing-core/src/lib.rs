//! # Pairing Core
//!
//! Contact pairing and account persistence for a peer-to-peer messenger.
//!
//! Two peers with no shared channel meet through a published rendezvous
//! token, exchange a one-time contact request and end up in a shared group
//! where the first message is delivered. Group cryptography, membership and
//! transport belong to the protocol service behind
//! [`service::ProtocolService`]; this crate drives the handshake and owns the
//! account state the service runs on.
//!
//! ## Architecture
//!
//! - **keystore**: device push keypair file
//! - **account**: on-disk account enumeration and metadata
//! - **storage**: transient or SQLite key-value store behind one lock
//! - **contact**: shareable contact and its Base58 token
//! - **service**: protocol-service boundary and an in-memory network
//! - **pairing**: sharer and requester flows
//! - **bootstrap**: open one account's resources from configuration
//! - **config** / **telemetry**: TOML configuration and log setup

pub mod account;
pub mod bootstrap;
pub mod config;
pub mod contact;
pub mod error;
pub mod fs;
pub mod keystore;
pub mod pairing;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use contact::ShareableContact;
pub use error::{PairingError, Result, ServiceError};
pub use keystore::{get_or_create_device_key_pair, DeviceKeyPair};
pub use pairing::{Outcome, PairingContext, Requester, Sharer};
pub use service::ProtocolService;
pub use storage::{open_storage, StorageHandle};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
