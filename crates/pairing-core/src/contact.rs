//! Shareable contact and its out-of-band token.
//!
//! The sharer hands the requester a short text token, typically printed and
//! copy-pasted. The token is the `postcard` encoding of [`ShareableContact`]
//! rendered in Base58 (Bitcoin alphabet): printable, no padding, and no
//! easily confused characters such as `0`, `O`, `I` or `l`.

use serde::{Deserialize, Serialize};

use crate::error::{PairingError, Result};

/// How to reach an account to request contact.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareableContact {
    /// Public key of the sharing account
    pub public_key: Vec<u8>,

    /// Seed of the sharer's current rendezvous point
    pub rendezvous_seed: Vec<u8>,

    /// Optional metadata the sharer chose to publish (e.g. display name)
    #[serde(default)]
    pub metadata: Vec<u8>,
}

impl ShareableContact {
    pub fn new(public_key: impl Into<Vec<u8>>, rendezvous_seed: impl Into<Vec<u8>>) -> Self {
        Self {
            public_key: public_key.into(),
            rendezvous_seed: rendezvous_seed.into(),
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.public_key.is_empty() {
            return Err(PairingError::InvalidContactToken(
                "contact has no public key".to_string(),
            ));
        }
        if self.rendezvous_seed.is_empty() {
            return Err(PairingError::InvalidContactToken(
                "contact has no rendezvous seed".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to the binary form carried inside the token.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        postcard::to_allocvec(self)
            .map_err(|e| PairingError::InvalidContactToken(format!("encode failed: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let contact: ShareableContact = postcard::from_bytes(bytes)
            .map_err(|e| PairingError::InvalidContactToken(format!("decode failed: {}", e)))?;
        contact.validate()?;
        Ok(contact)
    }

    /// Encode as a copy-paste safe token.
    pub fn to_token(&self) -> Result<String> {
        Ok(bs58::encode(self.to_bytes()?).into_string())
    }

    /// Decode a token produced by [`ShareableContact::to_token`].
    ///
    /// Surrounding whitespace is ignored, since tokens are usually pasted.
    ///
    /// # Errors
    ///
    /// Returns `PairingError::InvalidContactToken` if the text is not Base58,
    /// the bytes do not decode, or a required field is empty.
    pub fn from_token(token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(PairingError::InvalidContactToken("token is empty".to_string()));
        }
        let bytes = bs58::decode(token)
            .into_vec()
            .map_err(|e| PairingError::InvalidContactToken(format!("not base58: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for ShareableContact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareableContact")
            .field("public_key", &short_id(&self.public_key))
            .field("rendezvous_seed", &format!("{} bytes", self.rendezvous_seed.len()))
            .field("metadata", &format!("{} bytes", self.metadata.len()))
            .finish()
    }
}

/// Short, log-friendly rendering of a public key.
pub fn short_id(public_key: &[u8]) -> String {
    let encoded = bs58::encode(public_key).into_string();
    let start = encoded.len().saturating_sub(8);
    encoded[start..].to_string()
}
