use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::config::PairingSection;
use crate::error::{PairingError, Result, ServiceError};
use crate::pairing::{Role, Stage};
use crate::service::{EventStream, ServiceResult, Subscription, SubscriptionError};

/// Per-flow context passed explicitly into each role.
///
/// Carries the cancellation token every blocking step selects against, the
/// parent span for log output, and the timing knobs from configuration.
/// Clones share the same token.
#[derive(Debug, Clone)]
pub struct PairingContext {
    cancel: CancellationToken,
    span: Span,
    subscription_timeout: Option<Duration>,
    send_grace_period: Duration,
}

impl Default for PairingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            span: Span::current(),
            subscription_timeout: None,
            send_grace_period: Duration::ZERO,
        }
    }

    pub fn from_config(section: &PairingSection) -> Self {
        Self::new()
            .with_subscription_timeout(section.subscription_timeout())
            .with_send_grace_period(section.send_grace_period())
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bound each subscription wait; `None` waits until the stream ends.
    pub fn with_subscription_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.subscription_timeout = timeout;
        self
    }

    /// Hold the requester after its send is acknowledged.
    pub fn with_send_grace_period(mut self, period: Duration) -> Self {
        self.send_grace_period = period;
        self
    }

    /// A context cancelled with this one, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn subscription_timeout(&self) -> Option<Duration> {
        self.subscription_timeout
    }

    pub fn send_grace_period(&self) -> Duration {
        self.send_grace_period
    }

    /// Run one service call, giving up if the context is cancelled first.
    pub(crate) async fn call<T, F, W>(&self, role: Role, stage: Stage, call: F, wrap: W) -> Result<T>
    where
        F: Future<Output = ServiceResult<T>>,
        W: FnOnce(ServiceError) -> PairingError,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PairingError::Cancelled { role, stage }),
            result = call => result.map_err(wrap),
        }
    }

    pub(crate) fn subscribe<T>(&self, stream: EventStream<T>) -> Subscription<T> {
        Subscription::new(stream, self.cancel.clone()).with_timeout(self.subscription_timeout)
    }

    /// Wait out the send grace period, if any.
    pub(crate) async fn grace(&self, role: Role, stage: Stage) -> Result<()> {
        if self.send_grace_period.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PairingError::Cancelled { role, stage }),
            _ = tokio::time::sleep(self.send_grace_period) => Ok(()),
        }
    }
}

/// Tag a subscription failure with where it happened.
pub(crate) fn subscription_failed(role: Role, stage: Stage, err: SubscriptionError) -> PairingError {
    match err {
        SubscriptionError::Cancelled => PairingError::Cancelled { role, stage },
        SubscriptionError::TimedOut(after) => PairingError::Timeout { role, stage, after },
        SubscriptionError::Service(source) => PairingError::Subscription {
            role,
            stage,
            source,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_maps_service_error() {
        let ctx = PairingContext::new();
        let err = ctx
            .call(
                Role::Requester,
                Stage::SendMessage,
                async { Err::<(), _>(ServiceError::Rpc("refused".to_string())) },
                |source| PairingError::MessageSendFailed { source },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "requester send-message: RPC failed: refused");
    }

    #[tokio::test]
    async fn test_cancelled_context_short_circuits_call() {
        let ctx = PairingContext::new();
        ctx.cancel();
        let err = ctx
            .call(
                Role::Sharer,
                Stage::AcceptContact,
                std::future::pending::<ServiceResult<()>>(),
                |source| PairingError::PairingAcceptFailed { source },
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_follows_parent() {
        let parent = PairingContext::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_grace_period_is_cancellable() {
        let ctx = PairingContext::new().with_send_grace_period(Duration::from_secs(60));
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = ctx.grace(Role::Requester, Stage::SendMessage).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_from_config() {
        let section = PairingSection {
            send_grace_period_ms: 250,
            subscription_timeout_ms: 0,
        };
        let ctx = PairingContext::from_config(&section);
        assert_eq!(ctx.send_grace_period(), Duration::from_millis(250));
        assert_eq!(ctx.subscription_timeout(), None);
    }
}
