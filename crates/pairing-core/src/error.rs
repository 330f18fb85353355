//! Error types for pairing core operations.
//!
//! Two layers: `ServiceError` is what the protocol service reports back at
//! the RPC/stream boundary, and `PairingError` is everything this crate
//! surfaces. Handshake failures carry the role and stage they happened in so
//! callers can print a message without further context.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::pairing::{Role, Stage};

/// Result type alias for pairing operations.
pub type Result<T> = std::result::Result<T, PairingError>;

/// Failure reported by the protocol service for a single RPC or stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Request/response call failed
    #[error("RPC failed: {0}")]
    Rpc(String),

    /// Referenced group, contact or rendezvous point does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Server-streaming call broke mid-stream
    #[error("Stream error: {0}")]
    Stream(String),

    /// The service connection is gone
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Core error type for pairing and account persistence.
#[derive(Debug, Error)]
pub enum PairingError {
    /// Device key file is absent and creation was not requested
    #[error("Device key not found: {}", .0.display())]
    KeyNotFound(PathBuf),

    /// Device key file exists but has the wrong length
    #[error("Corrupt key file {}: expected {expected} bytes, found {actual}", path.display())]
    CorruptKeyFile {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    /// Account directory has no metadata file
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Account metadata file could not be parsed
    #[error("Account metadata corrupt for {account_id}: {reason}")]
    MetadataCorrupt { account_id: String, reason: String },

    /// Filesystem error while reading the account tree
    #[error("Account filesystem error: {0}")]
    AccountFs(String),

    /// Storage directory argument is unusable
    #[error("Invalid directory: {0}")]
    InvalidDirectory(String),

    /// Backing store file or table could not be opened
    #[error("Storage open failed: {0}")]
    StorageOpenFailed(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite-specific storage error
    #[error("SQLite error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },

    /// Filesystem I/O error with the operation that triggered it
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A required collaborator or argument was not provided
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// Out-of-band contact token could not be decoded
    #[error("Invalid contact token: {0}")]
    InvalidContactToken(String),

    /// An event carried a payload that does not match its type
    #[error("Invalid event payload: {0}")]
    InvalidEventPayload(String),

    /// A handshake step ran before the step that provides its input
    #[error("{role} {stage}: missing {what}")]
    StepMissingInput {
        role: Role,
        stage: Stage,
        what: String,
    },

    #[error("requester {}: invalid contact token: {reason}", Stage::DecodeContact)]
    TokenRejected { reason: String },

    #[error("sharer {}: invalid contact request: {reason}", Stage::AwaitContactRequest)]
    RequestPayloadRejected { reason: String },

    #[error("sharer {}: {source}", Stage::RendezvousSetup)]
    PairingSetupFailed {
        #[source]
        source: ServiceError,
    },

    #[error("sharer {}: {source}", Stage::AcceptContact)]
    PairingAcceptFailed {
        #[source]
        source: ServiceError,
    },

    #[error("requester {}: {source}", Stage::SendContactRequest)]
    ContactRequestFailed {
        #[source]
        source: ServiceError,
    },

    #[error("{role} {}: {source}", Stage::ActivateGroup)]
    GroupActivationFailed {
        role: Role,
        #[source]
        source: ServiceError,
    },

    #[error("requester {}: {source}", Stage::SendMessage)]
    MessageSendFailed {
        #[source]
        source: ServiceError,
    },

    /// Event subscription failed to open or broke while waiting
    #[error("{role} {stage}: subscription failed: {source}")]
    Subscription {
        role: Role,
        stage: Stage,
        #[source]
        source: ServiceError,
    },

    /// The pairing context was cancelled while the flow was in progress
    #[error("{role} {stage}: cancelled")]
    Cancelled { role: Role, stage: Stage },

    /// A subscription waited longer than the configured limit
    #[error("{role} {stage}: timed out after {after:?}")]
    Timeout {
        role: Role,
        stage: Stage,
        after: Duration,
    },
}

impl PairingError {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PairingError::Io {
            context: context.into(),
            source,
        }
    }

    /// True when the error came from cancelling the pairing context.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PairingError::Cancelled { .. })
    }
}

impl From<std::io::Error> for PairingError {
    fn from(err: std::io::Error) -> Self {
        PairingError::io("I/O error", err)
    }
}

impl From<serde_json::Error> for PairingError {
    fn from(err: serde_json::Error) -> Self {
        PairingError::Storage(format!("JSON error: {}", err))
    }
}
