//! Protocol service boundary.
//!
//! The protocol service owns group cryptography, membership and transport.
//! This crate only talks to it through [`ProtocolService`]: request/response
//! calls plus two server-streaming subscriptions whose events are tagged
//! records with an [`EventType`] and an opaque payload.
//!
//! [`memory::MemoryNetwork`] is a process-local implementation used to run
//! the handshake without a real service.

pub mod memory;
mod subscription;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::contact::ShareableContact;
use crate::error::{PairingError, Result, ServiceError};

pub use subscription::{Subscription, SubscriptionError};

/// Result of a single protocol-service call.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Server-streaming reply; `None` from the stream means the server closed it.
pub type EventStream<T> = BoxStream<'static, ServiceResult<T>>;

/// Identity of the local account as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfiguration {
    pub account_pk: Vec<u8>,
    pub account_group_pk: Vec<u8>,
    pub device_pk: Vec<u8>,
}

/// Current state of the account's rendezvous point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactRequestReference {
    pub rendezvous_seed: Vec<u8>,
    pub enabled: bool,
}

impl ContactRequestReference {
    /// True when another party can address a contact request to us.
    pub fn is_usable(&self) -> bool {
        self.enabled && !self.rendezvous_seed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Account,
    Contact,
    MultiMember,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub public_key: Vec<u8>,
    pub group_type: GroupType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub group: Group,
    pub member_pk: Vec<u8>,
    pub device_pk: Vec<u8>,
}

/// How to look up a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupQuery {
    ByGroupPk(Vec<u8>),
    ByContactPk(Vec<u8>),
}

/// Discriminator of a metadata event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    AccountGroupJoined,
    AccountContactRequestEnabled,
    AccountContactRequestReferenceReset,
    AccountContactRequestOutgoingSent,
    AccountContactRequestIncomingReceived,
    AccountContactRequestIncomingAccepted,
    GroupMemberDeviceAdded,
}

/// An event from a group's metadata log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEvent {
    pub event_type: EventType,
    pub payload: Vec<u8>,
}

/// An application message from a group's message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: Vec<u8>,
    pub device_pk: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Payload of an `AccountContactRequestIncomingReceived` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequest {
    pub contact_public_key: Vec<u8>,
    #[serde(default)]
    pub contact_metadata: Vec<u8>,
}

impl ContactRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| PairingError::InvalidEventPayload(format!("contact request: {}", e)))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let request: ContactRequest = postcard::from_bytes(payload).map_err(|e| {
            PairingError::InvalidEventPayload(format!("contact request: {}", e))
        })?;
        if request.contact_public_key.is_empty() {
            return Err(PairingError::InvalidEventPayload(
                "contact request without public key".to_string(),
            ));
        }
        Ok(request)
    }
}

/// Client side of the protocol service.
#[async_trait]
pub trait ProtocolService: Send + Sync {
    async fn service_configuration(&self) -> ServiceResult<ServiceConfiguration>;

    async fn contact_request_reference(&self) -> ServiceResult<ContactRequestReference>;

    /// Rotate the rendezvous seed; the old seed stops resolving.
    async fn contact_request_reset_reference(&self) -> ServiceResult<Vec<u8>>;

    /// Publish the rendezvous point so contact requests can reach us.
    async fn contact_request_enable(&self) -> ServiceResult<Vec<u8>>;

    async fn contact_request_send(
        &self,
        contact: &ShareableContact,
        own_metadata: &[u8],
    ) -> ServiceResult<()>;

    async fn contact_request_accept(&self, contact_pk: &[u8]) -> ServiceResult<()>;

    async fn group_info(&self, query: GroupQuery) -> ServiceResult<GroupInfo>;

    async fn activate_group(&self, group_pk: &[u8], local_only: bool) -> ServiceResult<()>;

    /// Send an application message; resolves once the service has accepted
    /// it for dispatch and returns the message id.
    async fn app_message_send(&self, group_pk: &[u8], payload: &[u8]) -> ServiceResult<Vec<u8>>;

    /// Subscribe to a group's metadata log from the beginning.
    async fn group_metadata_list(&self, group_pk: &[u8]) -> ServiceResult<EventStream<MetadataEvent>>;

    /// Subscribe to a group's message log from the beginning.
    async fn group_message_list(&self, group_pk: &[u8]) -> ServiceResult<EventStream<MessageEvent>>;
}
