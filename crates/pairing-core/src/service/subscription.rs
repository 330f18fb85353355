//! Cancellable wrapper around a server-streaming reply.

use std::time::Duration;

use futures::stream::{Fuse, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ServiceError;
use crate::service::EventStream;

/// Why a subscription stopped without yielding an event.
///
/// A clean end of stream is not an error; it is `Ok(None)` from
/// [`Subscription::next`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription cancelled")]
    Cancelled,

    #[error("no event within {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// A lazily pulled sequence of events.
///
/// Each call to [`next`](Subscription::next) resolves to exactly one of: an
/// event, the end of the stream, cancellation, a timeout, or a service error.
/// After the end has been reached every further call returns `Ok(None)`.
pub struct Subscription<T> {
    stream: Fuse<EventStream<T>>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
}

impl<T> Subscription<T> {
    pub fn new(stream: EventStream<T>, cancel: CancellationToken) -> Self {
        Self {
            stream: stream.fuse(),
            cancel,
            timeout: None,
        }
    }

    /// Bound how long each `next` call may wait; `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pull the next event.
    pub async fn next(&mut self) -> Result<Option<T>, SubscriptionError> {
        let cancel = &self.cancel;
        let stream = &mut self.stream;
        let timeout = self.timeout;

        let receive = async move {
            match timeout {
                Some(after) => tokio::time::timeout(after, stream.next())
                    .await
                    .map_err(|_| SubscriptionError::TimedOut(after)),
                None => Ok(stream.next().await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SubscriptionError::Cancelled),
            received = receive => match received? {
                Some(Ok(event)) => Ok(Some(event)),
                Some(Err(err)) => Err(SubscriptionError::Service(err)),
                None => Ok(None),
            },
        }
    }

    /// Pull events until one satisfies `accept`, skipping the rest.
    pub async fn next_matching<F>(&mut self, mut accept: F) -> Result<Option<T>, SubscriptionError>
    where
        F: FnMut(&T) -> bool,
    {
        while let Some(event) = self.next().await? {
            if accept(&event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }
}
