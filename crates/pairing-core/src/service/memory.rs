//! Process-local protocol network.
//!
//! Every node joined to the same [`MemoryNetwork`] shares one rendezvous
//! registry and one set of group logs, which is all the handshake needs to
//! run end-to-end inside a test. Subscriptions replay a group's log from the
//! start and then follow it live, like the real service.
//!
//! Faults can be injected per node with [`MemoryNode::fail_next`],
//! [`MemoryNode::close_subscriptions`] and [`MemoryNode::break_subscriptions`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::contact::{short_id, ShareableContact};
use crate::error::ServiceError;
use crate::service::{
    ContactRequest, ContactRequestReference, EventStream, EventType, Group, GroupInfo, GroupQuery,
    GroupType, MessageEvent, MetadataEvent, ProtocolService, ServiceConfiguration, ServiceResult,
};

/// Service operations that can be made to fail with [`MemoryNode::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ServiceConfiguration,
    ContactRequestReference,
    ContactRequestResetReference,
    ContactRequestEnable,
    ContactRequestSend,
    ContactRequestAccept,
    GroupInfo,
    ActivateGroup,
    AppMessageSend,
    GroupMetadataList,
    GroupMessageList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContactState {
    OutgoingSent,
    IncomingReceived,
    Accepted,
}

struct Subscriber<T> {
    owner: Vec<u8>,
    sender: mpsc::UnboundedSender<ServiceResult<T>>,
}

struct GroupLog {
    group_type: GroupType,
    members: HashSet<Vec<u8>>,
    metadata: Vec<MetadataEvent>,
    messages: Vec<MessageEvent>,
    metadata_subscribers: Vec<Subscriber<MetadataEvent>>,
    message_subscribers: Vec<Subscriber<MessageEvent>>,
}

impl GroupLog {
    fn new(group_type: GroupType) -> Self {
        Self {
            group_type,
            members: HashSet::new(),
            metadata: Vec::new(),
            messages: Vec::new(),
            metadata_subscribers: Vec::new(),
            message_subscribers: Vec::new(),
        }
    }

    fn append_metadata(&mut self, event: MetadataEvent) {
        self.metadata_subscribers
            .retain(|sub| sub.sender.send(Ok(event.clone())).is_ok());
        self.metadata.push(event);
    }

    fn append_message(&mut self, event: MessageEvent) {
        self.message_subscribers
            .retain(|sub| sub.sender.send(Ok(event.clone())).is_ok());
        self.messages.push(event);
    }
}

struct AccountState {
    config: ServiceConfiguration,
    rendezvous_seed: Option<Vec<u8>>,
    enabled: bool,
    contacts: HashMap<Vec<u8>, ContactState>,
    active_groups: HashSet<Vec<u8>>,
    failures: HashMap<Operation, ServiceError>,
}

#[derive(Default)]
struct NetworkState {
    rendezvous: HashMap<Vec<u8>, Vec<u8>>,
    accounts: HashMap<Vec<u8>, AccountState>,
    groups: HashMap<Vec<u8>, GroupLog>,
}

impl NetworkState {
    fn account(&self, account_pk: &[u8]) -> ServiceResult<&AccountState> {
        self.accounts
            .get(account_pk)
            .ok_or_else(|| ServiceError::Unavailable("node has left the network".to_string()))
    }

    fn account_mut(&mut self, account_pk: &[u8]) -> ServiceResult<&mut AccountState> {
        self.accounts
            .get_mut(account_pk)
            .ok_or_else(|| ServiceError::Unavailable("node has left the network".to_string()))
    }

    fn take_failure(&mut self, account_pk: &[u8], op: Operation) -> ServiceResult<()> {
        match self.account_mut(account_pk)?.failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn push_account_event(&mut self, account_pk: &[u8], event_type: EventType, payload: Vec<u8>) {
        let Some(group_pk) = self
            .accounts
            .get(account_pk)
            .map(|account| account.config.account_group_pk.clone())
        else {
            return;
        };
        if let Some(log) = self.groups.get_mut(&group_pk) {
            log.append_metadata(MetadataEvent {
                event_type,
                payload,
            });
        }
    }

    fn member_group(&mut self, account_pk: &[u8], group_pk: &[u8]) -> ServiceResult<&mut GroupLog> {
        let log = self
            .groups
            .get_mut(group_pk)
            .ok_or_else(|| ServiceError::NotFound(format!("group {}", short_id(group_pk))))?;
        if !log.members.contains(account_pk) {
            return Err(ServiceError::NotFound(format!(
                "not a member of group {}",
                short_id(group_pk)
            )));
        }
        Ok(log)
    }
}

fn random_key() -> Vec<u8> {
    rand::random::<[u8; 32]>().to_vec()
}

fn derive_key(domain: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

/// Both sides derive the same contact group key regardless of who asked.
fn contact_group_pk(a: &[u8], b: &[u8]) -> Vec<u8> {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    derive_key(b"contact-group", &[low, high])
}

fn live_stream<T: Send + 'static>(
    replay: Vec<T>,
    receiver: mpsc::UnboundedReceiver<ServiceResult<T>>,
) -> EventStream<T> {
    let live = stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    });
    stream::iter(replay.into_iter().map(Ok)).chain(live).boxed()
}

/// A shared in-process protocol network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fresh account to the network and return its client.
    pub fn join(&self) -> ServiceResult<MemoryNode> {
        let account_pk = random_key();
        let account_group_pk = derive_key(b"account-group", &[account_pk.as_slice()]);
        let config = ServiceConfiguration {
            account_pk: account_pk.clone(),
            account_group_pk: account_group_pk.clone(),
            device_pk: random_key(),
        };

        let mut log = GroupLog::new(GroupType::Account);
        log.members.insert(account_pk.clone());
        log.metadata.push(MetadataEvent {
            event_type: EventType::AccountGroupJoined,
            payload: account_group_pk.clone(),
        });

        let node = MemoryNode {
            state: Arc::clone(&self.state),
            account_pk: account_pk.clone(),
        };
        let mut state = node.lock()?;
        state.groups.insert(account_group_pk, log);
        state.accounts.insert(
            account_pk,
            AccountState {
                config,
                rendezvous_seed: None,
                enabled: false,
                contacts: HashMap::new(),
                active_groups: HashSet::new(),
                failures: HashMap::new(),
            },
        );
        drop(state);
        Ok(node)
    }
}

/// One account's connection to a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryNode {
    state: Arc<Mutex<NetworkState>>,
    account_pk: Vec<u8>,
}

impl MemoryNode {
    pub fn account_pk(&self) -> &[u8] {
        &self.account_pk
    }

    fn lock(&self) -> ServiceResult<MutexGuard<'_, NetworkState>> {
        self.state
            .lock()
            .map_err(|_| ServiceError::Unavailable("network state poisoned".to_string()))
    }

    /// Lock the network and consume a pending injected failure for `op`.
    fn begin(&self, op: Operation) -> ServiceResult<MutexGuard<'_, NetworkState>> {
        let mut state = self.lock()?;
        state.take_failure(&self.account_pk, op)?;
        Ok(state)
    }

    /// Make the next call of `op` on this node fail with `error`.
    pub fn fail_next(&self, op: Operation, error: ServiceError) -> ServiceResult<()> {
        let mut state = self.lock()?;
        state.account_mut(&self.account_pk)?.failures.insert(op, error);
        Ok(())
    }

    /// End every open subscription of this node as a clean end-of-stream.
    pub fn close_subscriptions(&self) -> ServiceResult<()> {
        let mut state = self.lock()?;
        for log in state.groups.values_mut() {
            log.metadata_subscribers.retain(|sub| sub.owner != self.account_pk);
            log.message_subscribers.retain(|sub| sub.owner != self.account_pk);
        }
        Ok(())
    }

    /// Fail every open subscription of this node with `error`, then close it.
    pub fn break_subscriptions(&self, error: ServiceError) -> ServiceResult<()> {
        let mut state = self.lock()?;
        for log in state.groups.values_mut() {
            log.metadata_subscribers.retain(|sub| {
                if sub.owner == self.account_pk {
                    let _ = sub.sender.send(Err(error.clone()));
                    false
                } else {
                    true
                }
            });
            log.message_subscribers.retain(|sub| {
                if sub.owner == self.account_pk {
                    let _ = sub.sender.send(Err(error.clone()));
                    false
                } else {
                    true
                }
            });
        }
        Ok(())
    }

    /// Append a raw event to a group this node belongs to, bypassing the
    /// operations that normally produce it.
    pub fn append_metadata(&self, group_pk: &[u8], event: MetadataEvent) -> ServiceResult<()> {
        let mut state = self.lock()?;
        state.member_group(&self.account_pk, group_pk)?.append_metadata(event);
        Ok(())
    }

    fn group_info_for(&self, state: &NetworkState, group_pk: &[u8]) -> ServiceResult<GroupInfo> {
        let account = state.account(&self.account_pk)?;
        let log = state
            .groups
            .get(group_pk)
            .filter(|log| log.members.contains(&self.account_pk))
            .ok_or_else(|| ServiceError::NotFound(format!("group {}", short_id(group_pk))))?;
        Ok(GroupInfo {
            group: Group {
                public_key: group_pk.to_vec(),
                group_type: log.group_type,
            },
            member_pk: self.account_pk.clone(),
            device_pk: account.config.device_pk.clone(),
        })
    }
}

#[async_trait]
impl ProtocolService for MemoryNode {
    async fn service_configuration(&self) -> ServiceResult<ServiceConfiguration> {
        let state = self.begin(Operation::ServiceConfiguration)?;
        Ok(state.account(&self.account_pk)?.config.clone())
    }

    async fn contact_request_reference(&self) -> ServiceResult<ContactRequestReference> {
        let state = self.begin(Operation::ContactRequestReference)?;
        let account = state.account(&self.account_pk)?;
        Ok(ContactRequestReference {
            rendezvous_seed: account.rendezvous_seed.clone().unwrap_or_default(),
            enabled: account.enabled,
        })
    }

    async fn contact_request_reset_reference(&self) -> ServiceResult<Vec<u8>> {
        let mut state = self.begin(Operation::ContactRequestResetReference)?;
        let seed = random_key();

        let account = state.account_mut(&self.account_pk)?;
        let previous = account.rendezvous_seed.replace(seed.clone());
        let enabled = account.enabled;

        if let Some(previous) = previous {
            state.rendezvous.remove(&previous);
        }
        if enabled {
            state.rendezvous.insert(seed.clone(), self.account_pk.clone());
        }
        state.push_account_event(
            &self.account_pk,
            EventType::AccountContactRequestReferenceReset,
            seed.clone(),
        );
        Ok(seed)
    }

    async fn contact_request_enable(&self) -> ServiceResult<Vec<u8>> {
        let mut state = self.begin(Operation::ContactRequestEnable)?;

        let account = state.account_mut(&self.account_pk)?;
        account.enabled = true;
        let seed = account.rendezvous_seed.get_or_insert_with(random_key).clone();

        state.rendezvous.insert(seed.clone(), self.account_pk.clone());
        state.push_account_event(
            &self.account_pk,
            EventType::AccountContactRequestEnabled,
            Vec::new(),
        );
        Ok(seed)
    }

    async fn contact_request_send(
        &self,
        contact: &ShareableContact,
        own_metadata: &[u8],
    ) -> ServiceResult<()> {
        let mut state = self.begin(Operation::ContactRequestSend)?;

        if contact.public_key == self.account_pk {
            return Err(ServiceError::Rpc("cannot send a contact request to self".to_string()));
        }
        let owner = state
            .rendezvous
            .get(&contact.rendezvous_seed)
            .filter(|owner| **owner == contact.public_key)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "no rendezvous point for {}",
                    short_id(&contact.public_key)
                ))
            })?;
        if state.account(&self.account_pk)?.contacts.contains_key(&owner) {
            return Err(ServiceError::Rpc("contact already added".to_string()));
        }

        let payload = ContactRequest {
            contact_public_key: self.account_pk.clone(),
            contact_metadata: own_metadata.to_vec(),
        }
        .encode()
        .map_err(|e| ServiceError::Rpc(e.to_string()))?;

        let group_pk = contact_group_pk(&self.account_pk, &owner);
        state
            .groups
            .entry(group_pk)
            .or_insert_with(|| GroupLog::new(GroupType::Contact))
            .members
            .insert(self.account_pk.clone());

        state
            .account_mut(&self.account_pk)?
            .contacts
            .insert(owner.clone(), ContactState::OutgoingSent);
        state.push_account_event(
            &self.account_pk,
            EventType::AccountContactRequestOutgoingSent,
            owner.clone(),
        );

        state
            .account_mut(&owner)?
            .contacts
            .insert(self.account_pk.clone(), ContactState::IncomingReceived);
        state.push_account_event(
            &owner,
            EventType::AccountContactRequestIncomingReceived,
            payload,
        );
        Ok(())
    }

    async fn contact_request_accept(&self, contact_pk: &[u8]) -> ServiceResult<()> {
        let mut state = self.begin(Operation::ContactRequestAccept)?;

        let account = state.account_mut(&self.account_pk)?;
        match account.contacts.get(contact_pk) {
            Some(ContactState::IncomingReceived) => {}
            Some(_) => {
                return Err(ServiceError::Rpc(
                    "no pending incoming request from contact".to_string(),
                ))
            }
            None => {
                return Err(ServiceError::NotFound(format!(
                    "contact {}",
                    short_id(contact_pk)
                )))
            }
        }
        account
            .contacts
            .insert(contact_pk.to_vec(), ContactState::Accepted);
        if let Ok(peer) = state.account_mut(contact_pk) {
            peer.contacts
                .insert(self.account_pk.clone(), ContactState::Accepted);
        }

        let group_pk = contact_group_pk(&self.account_pk, contact_pk);
        let log = state
            .groups
            .entry(group_pk)
            .or_insert_with(|| GroupLog::new(GroupType::Contact));
        log.members.insert(self.account_pk.clone());
        log.append_metadata(MetadataEvent {
            event_type: EventType::GroupMemberDeviceAdded,
            payload: self.account_pk.clone(),
        });

        state.push_account_event(
            &self.account_pk,
            EventType::AccountContactRequestIncomingAccepted,
            contact_pk.to_vec(),
        );
        Ok(())
    }

    async fn group_info(&self, query: GroupQuery) -> ServiceResult<GroupInfo> {
        let state = self.begin(Operation::GroupInfo)?;
        let group_pk = match query {
            GroupQuery::ByGroupPk(group_pk) => group_pk,
            GroupQuery::ByContactPk(contact_pk) => {
                if !state
                    .account(&self.account_pk)?
                    .contacts
                    .contains_key(&contact_pk)
                {
                    return Err(ServiceError::NotFound(format!(
                        "contact {}",
                        short_id(&contact_pk)
                    )));
                }
                contact_group_pk(&self.account_pk, &contact_pk)
            }
        };
        self.group_info_for(&state, &group_pk)
    }

    async fn activate_group(&self, group_pk: &[u8], _local_only: bool) -> ServiceResult<()> {
        let mut state = self.begin(Operation::ActivateGroup)?;
        state.member_group(&self.account_pk, group_pk)?;
        state
            .account_mut(&self.account_pk)?
            .active_groups
            .insert(group_pk.to_vec());
        Ok(())
    }

    async fn app_message_send(&self, group_pk: &[u8], payload: &[u8]) -> ServiceResult<Vec<u8>> {
        let mut state = self.begin(Operation::AppMessageSend)?;
        let account = state.account(&self.account_pk)?;
        if !account.active_groups.contains(group_pk) {
            return Err(ServiceError::Rpc(format!(
                "group {} is not active",
                short_id(group_pk)
            )));
        }
        let device_pk = account.config.device_pk.clone();

        let log = state.member_group(&self.account_pk, group_pk)?;
        let index = (log.messages.len() as u64).to_be_bytes();
        let id = derive_key(b"message", &[group_pk, &index[..], payload]);
        log.append_message(MessageEvent {
            id: id.clone(),
            device_pk,
            payload: payload.to_vec(),
        });
        Ok(id)
    }

    async fn group_metadata_list(&self, group_pk: &[u8]) -> ServiceResult<EventStream<MetadataEvent>> {
        let mut state = self.begin(Operation::GroupMetadataList)?;
        let log = state.member_group(&self.account_pk, group_pk)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        log.metadata_subscribers.retain(|sub| !sub.sender.is_closed());
        log.metadata_subscribers.push(Subscriber {
            owner: self.account_pk.clone(),
            sender,
        });
        Ok(live_stream(log.metadata.clone(), receiver))
    }

    async fn group_message_list(&self, group_pk: &[u8]) -> ServiceResult<EventStream<MessageEvent>> {
        let mut state = self.begin(Operation::GroupMessageList)?;
        let log = state.member_group(&self.account_pk, group_pk)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        log.message_subscribers.retain(|sub| !sub.sender.is_closed());
        log.message_subscribers.push(Subscriber {
            owner: self.account_pk.clone(),
            sender,
        });
        Ok(live_stream(log.messages.clone(), receiver))
    }
}
