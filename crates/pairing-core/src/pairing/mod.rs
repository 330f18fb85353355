//! Contact-pairing handshake.
//!
//! Two roles run independently against their own protocol-service
//! connection and only meet through the service's rendezvous point and the
//! contact group it creates:
//!
//! ```text
//! Sharer                                   Requester
//! ------                                   ---------
//! enable rendezvous, print token  ----->   decode token
//! wait for incoming request       <-----   send contact request
//! accept, activate contact group           activate contact group
//! wait for first message          <-----   send message
//! ```
//!
//! The sharer's rendezvous point must be enabled before the requester sends;
//! nothing here synchronizes the two starts. A requester that races ahead
//! fails with `ContactRequestFailed` carrying the service's error.

mod context;
mod requester;
mod sharer;

use std::fmt;

pub use context::PairingContext;
pub use requester::{Requester, RequesterOutcome};
pub use sharer::{Sharer, SharerOutcome};

/// Which side of the handshake a flow is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sharer,
    Requester,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sharer => write!(f, "sharer"),
            Role::Requester => write!(f, "requester"),
        }
    }
}

/// Step of the handshake an error or log line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RendezvousSetup,
    AwaitContactRequest,
    AcceptContact,
    DecodeContact,
    SendContactRequest,
    ActivateGroup,
    SendMessage,
    AwaitMessage,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::RendezvousSetup => "rendezvous-setup",
            Stage::AwaitContactRequest => "await-contact-request",
            Stage::AcceptContact => "accept-contact",
            Stage::DecodeContact => "decode-contact",
            Stage::SendContactRequest => "send-contact-request",
            Stage::ActivateGroup => "activate-group",
            Stage::SendMessage => "send-message",
            Stage::AwaitMessage => "await-message",
        };
        f.write_str(name)
    }
}

/// Result of waiting on a subscription.
///
/// `NotReceived` means the service closed the stream before anything
/// matching arrived. It is a normal terminal result, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Received(T),
    NotReceived,
}

impl<T> Outcome<T> {
    pub fn is_received(&self) -> bool {
        matches!(self, Outcome::Received(_))
    }

    pub fn received(self) -> Option<T> {
        match self {
            Outcome::Received(value) => Some(value),
            Outcome::NotReceived => None,
        }
    }
}

/// Sharer progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharerState {
    Idle,
    RendezvousReady,
    AwaitingRequest,
    Accepting,
    GroupActive,
    AwaitingMessage,
    Done,
}

/// Requester progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    Idle,
    ContactDecoded,
    RequestSent,
    GroupActive,
    Done,
}
