use tracing::Span;

use crate::contact::{short_id, ShareableContact};
use crate::error::{PairingError, Result, ServiceError};
use crate::pairing::context::subscription_failed;
use crate::pairing::{Outcome, PairingContext, Role, SharerState, Stage};
use crate::service::{
    ContactRequest, EventType, GroupInfo, GroupQuery, MessageEvent, ProtocolService,
};

const ROLE: Role = Role::Sharer;

/// How a sharer flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharerOutcome {
    /// The metadata stream closed before any contact request arrived.
    NoContactRequest,

    /// Contact accepted, but the message stream closed before a message.
    NoMessage {
        request: ContactRequest,
        group: GroupInfo,
    },

    /// Handshake complete with the first message delivered.
    Paired {
        request: ContactRequest,
        group: GroupInfo,
        message: MessageEvent,
    },
}

/// The side that publishes a rendezvous token and accepts the request.
pub struct Sharer<S> {
    service: S,
    ctx: PairingContext,
    span: Span,
    state: SharerState,
    account_group_pk: Option<Vec<u8>>,
    group: Option<GroupInfo>,
}

impl<S: ProtocolService> Sharer<S> {
    pub fn new(service: S, ctx: PairingContext) -> Self {
        let span = tracing::info_span!(
            parent: ctx.span(),
            "pairing",
            role = %ROLE,
            account = tracing::field::Empty
        );
        Self {
            service,
            ctx,
            span,
            state: SharerState::Idle,
            account_group_pk: None,
            group: None,
        }
    }

    pub fn state(&self) -> SharerState {
        self.state
    }

    /// Group activated by [`accept`](Sharer::accept), once it has run.
    pub fn group(&self) -> Option<&GroupInfo> {
        self.group.as_ref()
    }

    fn transition(&mut self, next: SharerState) {
        tracing::debug!(parent: &self.span, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }

    /// Make sure the rendezvous point is live and describe how to reach it.
    ///
    /// A missing or disabled rendezvous point is reset and enabled first.
    ///
    /// # Errors
    ///
    /// Any service failure is reported as `PairingError::PairingSetupFailed`.
    pub async fn share_contact(&mut self) -> Result<ShareableContact> {
        let stage = Stage::RendezvousSetup;
        let setup_failed = |source: ServiceError| PairingError::PairingSetupFailed { source };

        let mut reference = self
            .ctx
            .call(ROLE, stage, self.service.contact_request_reference(), setup_failed)
            .await?;
        if !reference.is_usable() {
            tracing::debug!(parent: &self.span, "rendezvous point not usable, resetting");
            self.ctx
                .call(ROLE, stage, self.service.contact_request_reset_reference(), setup_failed)
                .await?;
            self.ctx
                .call(ROLE, stage, self.service.contact_request_enable(), setup_failed)
                .await?;
            reference = self
                .ctx
                .call(ROLE, stage, self.service.contact_request_reference(), setup_failed)
                .await?;
            if !reference.is_usable() {
                return Err(setup_failed(ServiceError::Rpc(
                    "rendezvous point still disabled after enabling".to_string(),
                )));
            }
        }

        let config = self
            .ctx
            .call(ROLE, stage, self.service.service_configuration(), setup_failed)
            .await?;
        self.span.record("account", short_id(&config.account_pk).as_str());
        self.account_group_pk = Some(config.account_group_pk);

        let contact = ShareableContact::new(config.account_pk, reference.rendezvous_seed);
        self.transition(SharerState::RendezvousReady);
        tracing::info!(parent: &self.span, "rendezvous point ready");
        Ok(contact)
    }

    /// Wait for the first incoming contact request on the account group.
    ///
    /// Other account events are skipped. The stream ending first gives
    /// `Outcome::NotReceived`.
    pub async fn await_contact_request(&mut self) -> Result<Outcome<ContactRequest>> {
        let stage = Stage::AwaitContactRequest;
        let account_group_pk =
            self.account_group_pk
                .clone()
                .ok_or_else(|| PairingError::StepMissingInput {
                    role: ROLE,
                    stage,
                    what: "shared contact".to_string(),
                })?;

        self.transition(SharerState::AwaitingRequest);
        let stream = self
            .ctx
            .call(
                ROLE,
                stage,
                self.service.group_metadata_list(&account_group_pk),
                |source| PairingError::Subscription {
                    role: ROLE,
                    stage,
                    source,
                },
            )
            .await?;

        let event = self
            .ctx
            .subscribe(stream)
            .next_matching(|event| event.event_type == EventType::AccountContactRequestIncomingReceived)
            .await
            .map_err(|err| subscription_failed(ROLE, stage, err))?;

        match event {
            Some(event) => {
                let request = ContactRequest::decode(&event.payload).map_err(|err| match err {
                    PairingError::InvalidEventPayload(reason) => {
                        PairingError::RequestPayloadRejected { reason }
                    }
                    other => other,
                })?;
                tracing::info!(
                    parent: &self.span,
                    contact = %short_id(&request.contact_public_key),
                    "contact request received"
                );
                Ok(Outcome::Received(request))
            }
            None => {
                tracing::info!(parent: &self.span, "metadata stream closed without a contact request");
                Ok(Outcome::NotReceived)
            }
        }
    }

    /// Accept `request` and activate the resulting contact group.
    ///
    /// # Errors
    ///
    /// Any service failure is reported as `PairingError::PairingAcceptFailed`.
    pub async fn accept(&mut self, request: &ContactRequest) -> Result<GroupInfo> {
        let accept_failed = |source: ServiceError| PairingError::PairingAcceptFailed { source };
        let contact_pk = &request.contact_public_key;

        self.transition(SharerState::Accepting);
        self.ctx
            .call(
                ROLE,
                Stage::AcceptContact,
                self.service.contact_request_accept(contact_pk),
                accept_failed,
            )
            .await?;
        let group = self
            .ctx
            .call(
                ROLE,
                Stage::AcceptContact,
                self.service.group_info(GroupQuery::ByContactPk(contact_pk.clone())),
                accept_failed,
            )
            .await?;
        self.ctx
            .call(
                ROLE,
                Stage::ActivateGroup,
                self.service.activate_group(&group.group.public_key, false),
                accept_failed,
            )
            .await?;

        self.transition(SharerState::GroupActive);
        tracing::info!(
            parent: &self.span,
            group = %short_id(&group.group.public_key),
            "contact group active"
        );
        self.group = Some(group.clone());
        Ok(group)
    }

    /// Wait for the first message in the contact group.
    pub async fn await_message(&mut self) -> Result<Outcome<MessageEvent>> {
        let stage = Stage::AwaitMessage;
        let group_pk = self
            .group
            .as_ref()
            .map(|info| info.group.public_key.clone())
            .ok_or_else(|| PairingError::StepMissingInput {
                role: ROLE,
                stage,
                what: "activated contact group".to_string(),
            })?;

        self.transition(SharerState::AwaitingMessage);
        let stream = self
            .ctx
            .call(ROLE, stage, self.service.group_message_list(&group_pk), |source| {
                PairingError::Subscription {
                    role: ROLE,
                    stage,
                    source,
                }
            })
            .await?;

        let message = self
            .ctx
            .subscribe(stream)
            .next()
            .await
            .map_err(|err| subscription_failed(ROLE, stage, err))?;

        self.transition(SharerState::Done);
        match message {
            Some(message) => {
                tracing::info!(parent: &self.span, bytes = message.payload.len(), "message received");
                Ok(Outcome::Received(message))
            }
            None => {
                tracing::info!(parent: &self.span, "message stream closed without a message");
                Ok(Outcome::NotReceived)
            }
        }
    }

    /// Run the whole sharer flow.
    ///
    /// `on_token` is called once with the out-of-band token as soon as the
    /// rendezvous point is ready; hand it to the requester from there.
    pub async fn run<F>(mut self, on_token: F) -> Result<SharerOutcome>
    where
        F: FnOnce(&str),
    {
        let token = self.share_contact().await?.to_token()?;
        on_token(&token);

        let request = match self.await_contact_request().await? {
            Outcome::Received(request) => request,
            Outcome::NotReceived => return Ok(SharerOutcome::NoContactRequest),
        };
        let group = self.accept(&request).await?;

        Ok(match self.await_message().await? {
            Outcome::Received(message) => SharerOutcome::Paired {
                request,
                group,
                message,
            },
            Outcome::NotReceived => SharerOutcome::NoMessage { request, group },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::{MemoryNetwork, Operation};
    use crate::service::MetadataEvent;

    #[tokio::test]
    async fn test_share_contact_enables_rendezvous() {
        let network = MemoryNetwork::new();
        let node = network.join().unwrap();
        let mut sharer = Sharer::new(node.clone(), PairingContext::new());

        let contact = sharer.share_contact().await.unwrap();
        assert_eq!(sharer.state(), SharerState::RendezvousReady);
        assert_eq!(contact.public_key, node.account_pk());

        let reference = node.contact_request_reference().await.unwrap();
        assert!(reference.is_usable());
        assert_eq!(reference.rendezvous_seed, contact.rendezvous_seed);
    }

    #[tokio::test]
    async fn test_share_contact_reuses_enabled_rendezvous() {
        let network = MemoryNetwork::new();
        let node = network.join().unwrap();
        let seed = node.contact_request_enable().await.unwrap();

        let mut sharer = Sharer::new(node, PairingContext::new());
        assert_eq!(sharer.share_contact().await.unwrap().rendezvous_seed, seed);
    }

    #[tokio::test]
    async fn test_setup_failure_is_tagged() {
        let network = MemoryNetwork::new();
        let node = network.join().unwrap();
        node.fail_next(
            Operation::ContactRequestEnable,
            ServiceError::Unavailable("offline".to_string()),
        )
        .unwrap();

        let mut sharer = Sharer::new(node, PairingContext::new());
        let err = sharer.share_contact().await.unwrap_err();
        assert!(matches!(err, PairingError::PairingSetupFailed { .. }));
        assert!(err.to_string().starts_with("sharer rendezvous-setup:"));
        assert_eq!(sharer.state(), SharerState::Idle);
    }

    #[tokio::test]
    async fn test_steps_out_of_order_are_tagged() {
        let network = MemoryNetwork::new();
        let mut sharer = Sharer::new(network.join().unwrap(), PairingContext::new());

        let err = sharer.await_contact_request().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "sharer await-contact-request: missing shared contact"
        );
        let err = sharer.await_message().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "sharer await-message: missing activated contact group"
        );
    }

    #[tokio::test]
    async fn test_unreadable_request_payload_is_tagged() {
        let network = MemoryNetwork::new();
        let node = network.join().unwrap();
        let mut sharer = Sharer::new(node.clone(), PairingContext::new());
        sharer.share_contact().await.unwrap();

        let config = node.service_configuration().await.unwrap();
        node.append_metadata(
            &config.account_group_pk,
            MetadataEvent {
                event_type: EventType::AccountContactRequestIncomingReceived,
                payload: vec![0xff, 0xff],
            },
        )
        .unwrap();

        let err = sharer.await_contact_request().await.unwrap_err();
        assert!(matches!(err, PairingError::RequestPayloadRejected { .. }));
        assert!(err
            .to_string()
            .starts_with("sharer await-contact-request: invalid contact request: "));
    }

    #[tokio::test]
    async fn test_closed_metadata_stream_is_not_received() {
        let network = MemoryNetwork::new();
        let node = network.join().unwrap();
        let mut sharer = Sharer::new(node.clone(), PairingContext::new());
        sharer.share_contact().await.unwrap();

        let closer = node.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            closer.close_subscriptions().unwrap();
        });

        assert_eq!(
            sharer.await_contact_request().await.unwrap(),
            Outcome::NotReceived
        );
    }
}
