//! Transport abstractions.
//!
//! The routing layer never talks to a broker SDK directly. Everything it
//! needs from the outside world goes through the narrow traits defined here:
//!
//! - [`Sender`]: delivers a [`TransportEnvelope`] to one queue or topic
//! - [`Receiver`]: pulls envelopes from one queue or subscription
//! - [`LockSession`]: settles peek-locked deliveries
//! - [`TransportFactory`]: creates senders and receivers for a mapping
//! - [`EntityManager`]: inspects and creates queues, topics and subscriptions
//!
//! Sends go through a Tower-compatible wrapper, [`Transport`], so the send
//! path can be driven with the `tower::Service` API and shares a single error
//! type, [`TransportError`].
//!
//! [`InMemory`] implements every trait and is used for tests and local runs.

mod inmemory;

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tower::Service;
use tracing_error::SpanTrace;

use crate::{LockToken, MessageTypeMapping, TransportEnvelope};

pub use inmemory::InMemory;

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` wraps an underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`]
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a shared [`Sender`].
#[derive(Clone)]
pub struct Transport<S> {
    service: S,
}

impl Transport<SenderService> {
    /// Create a new transport from a sender handle.
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self {
            service: SenderService::new(sender),
        }
    }
}

impl<S> Transport<S> {
    /// Send an envelope through the transport.
    ///
    /// Errors that already are [`TransportError`]s are passed through as they
    /// are; anything else is wrapped as a sender error.
    pub async fn send(&self, envelope: TransportEnvelope) -> Result<(), TransportError>
    where
        S: Service<TransportEnvelope> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
    {
        let mut service = self.service.clone();
        service
            .call(envelope)
            .await
            .map_err(|e| TransportError::from_boxed(e.into()))?;
        Ok(())
    }
}

/// Tower `Service` implementation for `Transport`.
impl<S> Service<TransportEnvelope> for Transport<S>
where
    S: Service<TransportEnvelope> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::from_boxed(e.into()))
    }

    fn call(&mut self, req: TransportEnvelope) -> Self::Future {
        let mut service = self.service.clone();

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::from_boxed(e.into()))?;
            Ok(())
        })
    }
}

/// Tower service adapter for a [`Sender`].
#[derive(Clone)]
pub struct SenderService {
    sender: Arc<dyn Sender>,
}

impl SenderService {
    pub fn new(sender: Arc<dyn Sender>) -> Self {
        Self { sender }
    }
}

impl Service<TransportEnvelope> for SenderService {
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TransportEnvelope) -> Self::Future {
        let sender = self.sender.clone();
        Box::pin(async move { sender.send(req).await })
    }
}

/// Delivers envelopes to a single queue or topic.
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, envelope: TransportEnvelope) -> Result<(), TransportError>;

    /// Release the underlying connection.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Pulls envelopes from a single queue or subscription.
#[async_trait::async_trait]
pub trait Receiver: Send + Sync {
    /// Wait for the next envelope.
    ///
    /// `Ok(None)` means nothing arrived within the receiver's wait window;
    /// callers are expected to check [`is_closed`](Receiver::is_closed) and
    /// try again.
    async fn receive(&self) -> Result<Option<TransportEnvelope>, TransportError>;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;

    /// Settlement session for peek-locked deliveries. `None` for
    /// receive-and-delete receivers.
    fn lock_session(&self) -> Option<Arc<dyn LockSession>>;
}

/// Settles peek-locked deliveries by lock token.
#[async_trait::async_trait]
pub trait LockSession: Send + Sync {
    async fn complete(&self, token: &LockToken) -> Result<(), TransportError>;

    async fn abandon(&self, token: &LockToken) -> Result<(), TransportError>;

    async fn dead_letter(
        &self,
        token: &LockToken,
        reason_code: &str,
        description: &str,
    ) -> Result<(), TransportError>;

    async fn renew_lock(&self, token: &LockToken) -> Result<(), TransportError>;
}

/// Creates transport handles for configured mappings.
pub trait TransportFactory: Send + Sync {
    fn create_sender(&self, mapping: &MessageTypeMapping) -> Result<Arc<dyn Sender>, TransportError>;

    fn create_receiver(
        &self,
        mapping: &MessageTypeMapping,
    ) -> Result<Arc<dyn Receiver>, TransportError>;
}

/// Management operations on broker entities.
#[async_trait::async_trait]
pub trait EntityManager: Send + Sync {
    async fn queue_exists(&self, path: &str) -> Result<bool, TransportError>;

    async fn create_queue(&self, path: &str) -> Result<(), TransportError>;

    async fn topic_exists(&self, path: &str) -> Result<bool, TransportError>;

    async fn create_topic(&self, path: &str) -> Result<(), TransportError>;

    async fn subscription_exists(&self, topic: &str, name: &str) -> Result<bool, TransportError>;

    async fn create_subscription(&self, topic: &str, name: &str) -> Result<(), TransportError>;
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug, Clone)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug, Clone)]
pub enum TransportErrorKind {
    /// Errors originating from a sender.
    Sender(Arc<dyn std::error::Error + Send + Sync>),
    /// Errors originating from a receiver.
    Receiver(Arc<dyn std::error::Error + Send + Sync>),
    /// Errors settling a peek-locked delivery.
    Lock(Arc<dyn std::error::Error + Send + Sync>),
    /// Errors from entity management operations.
    Management(Arc<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Create a sender-related transport error.
    pub fn sender(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Sender(Arc::from(err.into())))
    }

    /// Create a receiver-related transport error.
    pub fn receiver(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Receiver(Arc::from(err.into())))
    }

    /// Create a lock settlement error.
    pub fn lock(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Lock(Arc::from(err.into())))
    }

    /// Create an entity management error.
    pub fn management(err: impl Into<tower::BoxError>) -> Self {
        Self::new(TransportErrorKind::Management(Arc::from(err.into())))
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn from_boxed(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::sender(err),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Receiver(err) => writeln!(f, "Receiver error: {err}"),
            TransportErrorKind::Lock(err) => writeln!(f, "Lock error: {err}"),
            TransportErrorKind::Management(err) => writeln!(f, "Management error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err)
            | TransportErrorKind::Receiver(err)
            | TransportErrorKind::Lock(err)
            | TransportErrorKind::Management(err) => Some(err.as_ref()),
        }
    }
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

/// Trait for values that can be viewed as raw bytes.
///
/// This abstraction avoids unnecessary allocations when handling payloads.
pub trait ToBytes {
    /// Convert the value into a byte slice.
    fn to_bytes(&self) -> &[u8];
}

impl ToBytes for Vec<u8> {
    fn to_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ToBytes for RawPayload {
    fn to_bytes(&self) -> &[u8] {
        self.0.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Headers;

    struct Refusing;

    #[async_trait::async_trait]
    impl Sender for Refusing {
        async fn send(&self, _envelope: TransportEnvelope) -> Result<(), TransportError> {
            Err(TransportError::sender("quota exceeded"))
        }
    }

    #[tokio::test]
    async fn transport_errors_are_not_rewrapped() {
        let transport = Transport::new(Arc::new(Refusing));
        let envelope = (Headers::default(), RawPayload::default()).into();

        let err = transport.send(envelope).await.unwrap_err();

        match err.kind() {
            TransportErrorKind::Sender(source) => assert_eq!(source.to_string(), "quota exceeded"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
