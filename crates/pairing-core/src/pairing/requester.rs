use tracing::Span;

use crate::contact::{short_id, ShareableContact};
use crate::error::{PairingError, Result, ServiceError};
use crate::pairing::{PairingContext, RequesterState, Role, Stage};
use crate::service::{GroupInfo, GroupQuery, ProtocolService};

const ROLE: Role = Role::Requester;

/// What a completed requester flow produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterOutcome {
    pub contact: ShareableContact,
    pub group: GroupInfo,
    pub message_id: Vec<u8>,
}

/// The side that redeems a token and sends the first message.
pub struct Requester<S> {
    service: S,
    ctx: PairingContext,
    span: Span,
    state: RequesterState,
    contact: Option<ShareableContact>,
    group: Option<GroupInfo>,
}

impl<S: ProtocolService> Requester<S> {
    pub fn new(service: S, ctx: PairingContext) -> Self {
        let span = tracing::info_span!(
            parent: ctx.span(),
            "pairing",
            role = %ROLE,
            contact = tracing::field::Empty
        );
        Self {
            service,
            ctx,
            span,
            state: RequesterState::Idle,
            contact: None,
            group: None,
        }
    }

    pub fn state(&self) -> RequesterState {
        self.state
    }

    fn transition(&mut self, next: RequesterState) {
        tracing::debug!(parent: &self.span, from = ?self.state, to = ?next, "state change");
        self.state = next;
    }

    fn contact(&self, stage: Stage) -> Result<&ShareableContact> {
        self.contact
            .as_ref()
            .ok_or_else(|| PairingError::StepMissingInput {
                role: ROLE,
                stage,
                what: "decoded contact token".to_string(),
            })
    }

    /// Decode the sharer's out-of-band token.
    ///
    /// # Errors
    ///
    /// - `PairingError::StepMissingInput` if the token is blank
    /// - `PairingError::TokenRejected` if it does not decode
    pub fn decode_contact(&mut self, token: &str) -> Result<ShareableContact> {
        if token.trim().is_empty() {
            return Err(PairingError::StepMissingInput {
                role: ROLE,
                stage: Stage::DecodeContact,
                what: "contact token".to_string(),
            });
        }
        let contact = ShareableContact::from_token(token).map_err(|err| match err {
            PairingError::InvalidContactToken(reason) => PairingError::TokenRejected { reason },
            other => other,
        })?;
        self.span
            .record("contact", short_id(&contact.public_key).as_str());
        self.contact = Some(contact.clone());
        self.transition(RequesterState::ContactDecoded);
        Ok(contact)
    }

    /// Address a contact request to the decoded rendezvous point.
    ///
    /// Fails with `PairingError::ContactRequestFailed` if the sharer's
    /// rendezvous point is not enabled yet.
    pub async fn send_request(&mut self, own_metadata: &[u8]) -> Result<()> {
        let contact = self.contact(Stage::SendContactRequest)?;
        self.ctx
            .call(
                ROLE,
                Stage::SendContactRequest,
                self.service.contact_request_send(contact, own_metadata),
                |source: ServiceError| PairingError::ContactRequestFailed { source },
            )
            .await?;
        self.transition(RequesterState::RequestSent);
        tracing::info!(parent: &self.span, "contact request sent");
        Ok(())
    }

    /// Resolve and activate the contact group shared with the sharer.
    pub async fn activate_group(&mut self) -> Result<GroupInfo> {
        let contact_pk = self.contact(Stage::ActivateGroup)?.public_key.clone();
        let activation_failed =
            |source: ServiceError| PairingError::GroupActivationFailed { role: ROLE, source };

        let group = self
            .ctx
            .call(
                ROLE,
                Stage::ActivateGroup,
                self.service.group_info(GroupQuery::ByContactPk(contact_pk)),
                activation_failed,
            )
            .await?;
        self.ctx
            .call(
                ROLE,
                Stage::ActivateGroup,
                self.service.activate_group(&group.group.public_key, false),
                activation_failed,
            )
            .await?;

        self.transition(RequesterState::GroupActive);
        tracing::info!(
            parent: &self.span,
            group = %short_id(&group.group.public_key),
            "contact group active"
        );
        self.group = Some(group.clone());
        Ok(group)
    }

    /// Send `payload` to the contact group and return its message id.
    ///
    /// Returns once the service has acknowledged the message for dispatch,
    /// then waits out the context's send grace period, if one is set.
    pub async fn send_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let group_pk = self
            .group
            .as_ref()
            .map(|info| info.group.public_key.clone())
            .ok_or_else(|| PairingError::StepMissingInput {
                role: ROLE,
                stage: Stage::SendMessage,
                what: "activated contact group".to_string(),
            })?;

        let message_id = self
            .ctx
            .call(
                ROLE,
                Stage::SendMessage,
                self.service.app_message_send(&group_pk, payload),
                |source: ServiceError| PairingError::MessageSendFailed { source },
            )
            .await?;
        tracing::info!(parent: &self.span, id = %short_id(&message_id), "message acknowledged");

        self.ctx.grace(ROLE, Stage::SendMessage).await?;
        self.transition(RequesterState::Done);
        Ok(message_id)
    }

    /// Run the whole requester flow: decode, request, activate, send.
    pub async fn run(mut self, token: &str, payload: &[u8]) -> Result<RequesterOutcome> {
        let contact = self.decode_contact(token)?;
        self.send_request(&[]).await?;
        let group = self.activate_group().await?;
        let message_id = self.send_message(payload).await?;
        Ok(RequesterOutcome {
            contact,
            group,
            message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::memory::{MemoryNetwork, Operation};

    #[test]
    fn test_bad_tokens_are_tagged() {
        let network = MemoryNetwork::new();
        let mut requester = Requester::new(network.join().unwrap(), PairingContext::new());

        let err = requester.decode_contact(" \n").unwrap_err();
        assert_eq!(err.to_string(), "requester decode-contact: missing contact token");

        let err = requester.decode_contact("0OIl").unwrap_err();
        assert!(matches!(err, PairingError::TokenRejected { .. }));
        assert!(err
            .to_string()
            .starts_with("requester decode-contact: invalid contact token: not base58"));

        // Valid base58 that is too short to be a contact.
        let err = requester.decode_contact("3mJr7AoUXx2Wqd").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("requester decode-contact: invalid contact token: decode failed"));
        assert_eq!(requester.state(), RequesterState::Idle);
    }

    #[tokio::test]
    async fn test_request_before_rendezvous_enabled() {
        let network = MemoryNetwork::new();
        let sharer = network.join().unwrap();
        let seed = sharer.contact_request_reset_reference().await.unwrap();
        let token = ShareableContact::new(sharer.account_pk().to_vec(), seed)
            .to_token()
            .unwrap();

        let mut requester = Requester::new(network.join().unwrap(), PairingContext::new());
        requester.decode_contact(&token).unwrap();
        let err = requester.send_request(&[]).await.unwrap_err();
        assert!(matches!(err, PairingError::ContactRequestFailed { .. }));
        assert!(err.to_string().starts_with("requester send-contact-request:"));
        assert_eq!(requester.state(), RequesterState::ContactDecoded);
    }

    #[tokio::test]
    async fn test_send_failure_is_tagged() {
        let network = MemoryNetwork::new();
        let sharer = network.join().unwrap();
        let seed = sharer.contact_request_enable().await.unwrap();
        let token = ShareableContact::new(sharer.account_pk().to_vec(), seed)
            .to_token()
            .unwrap();

        let node = network.join().unwrap();
        node.fail_next(
            Operation::AppMessageSend,
            ServiceError::Rpc("queue full".to_string()),
        )
        .unwrap();
        let mut requester = Requester::new(node, PairingContext::new());
        requester.decode_contact(&token).unwrap();
        requester.send_request(b"").await.unwrap();
        requester.activate_group().await.unwrap();

        let err = requester.send_message(b"Hello").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "requester send-message: RPC failed: queue full"
        );
        assert_eq!(requester.state(), RequesterState::GroupActive);
    }

    #[tokio::test]
    async fn test_steps_out_of_order_are_tagged() {
        let network = MemoryNetwork::new();
        let mut requester = Requester::new(network.join().unwrap(), PairingContext::new());

        let err = requester.send_message(b"Hello").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "requester send-message: missing activated contact group"
        );
        let err = requester.send_request(b"").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "requester send-contact-request: missing decoded contact token"
        );
        let err = requester.activate_group().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "requester activate-group: missing decoded contact token"
        );
    }
}
