//! Outbound pipeline.
//!
//! [`Publisher::publish`] turns a message into an envelope and hands it to
//! the sender of the message's concrete runtime type:
//!
//! 1. collect the properties of every provider registered for the type
//! 2. serialize the message with the type's codec
//! 3. apply scheduling metadata attached to this instance, consuming it
//! 4. stamp correlation and session ids for requests and responses
//! 5. write the declared type name to the type tag, then the properties
//! 6. send through the cached sender of the concrete type
//!
//! Transport failures are returned unchanged; there is no local retry.

use std::{any::TypeId, marker::PhantomData, sync::Arc};

use dashmap::DashMap;
use tracing_error::SpanTrace;

use crate::{
    AsAny, Correlation, Headers, Message, MessageType,
    entity::{EntityError, EntityErrorKind, MessagingEntityFactory},
    properties::{OutgoingMetadataTable, PropertyProviders},
    transport::{RawPayload, Sender, SenderService, Transport, TransportError},
};

/// Publishes messages of the logical type `L`.
pub struct Publisher<L: ?Sized> {
    entities: MessagingEntityFactory,
    providers: Arc<PropertyProviders>,
    outgoing: Arc<OutgoingMetadataTable>,
    senders: DashMap<TypeId, CachedSender>,
    marker: PhantomData<fn(&L)>,
}

#[derive(Clone)]
struct CachedSender {
    sender: Arc<dyn Sender>,
    transport: Transport<SenderService>,
}

impl<L> Publisher<L>
where
    L: ?Sized + Message,
{
    pub(crate) fn new(
        entities: MessagingEntityFactory,
        providers: Arc<PropertyProviders>,
        outgoing: Arc<OutgoingMetadataTable>,
    ) -> Self {
        Self {
            entities,
            providers,
            outgoing,
            senders: DashMap::new(),
            marker: PhantomData,
        }
    }

    /// Publish one message.
    #[tracing::instrument(skip_all, fields(message_type = message.type_name()))]
    pub async fn publish(&self, message: &L) -> Result<(), PublishError> {
        let (properties, message_type, payload) = {
            let concrete = AsAny::as_any(message);
            let properties = self.providers.properties_for(concrete);
            let (message_type, payload) = self
                .entities
                .catalog()
                .serialize(concrete)
                .ok_or_else(|| {
                    PublishError::new(PublishErrorKind::UnregisteredMessage {
                        type_name: message.type_name(),
                    })
                })?;
            (properties, message_type, payload)
        };
        let payload = payload.map_err(|source| {
            PublishError::new(PublishErrorKind::Serialization {
                message_type,
                source,
            })
        })?;

        let mut headers = Headers::default();
        if let Some(metadata) = self.outgoing.remove(message) {
            metadata.apply(&mut headers);
        }
        apply_correlation(message.correlation(), &mut headers);
        headers.set_type_tag(message_type.name());
        headers.properties.extend(properties);

        let transport = self.transport_for(message_type)?;
        transport
            .send((headers, RawPayload::from(payload)).into())
            .await?;

        tracing::debug!("Message published");
        Ok(())
    }

    /// Close every sender created by this publisher.
    ///
    /// All senders are closed; the first failure is returned.
    pub async fn close(&self) -> Result<(), PublishError> {
        let senders: Vec<_> = self
            .senders
            .iter()
            .map(|entry| entry.value().sender.clone())
            .collect();
        self.senders.clear();

        let mut result = Ok(());
        for sender in senders {
            if let Err(err) = sender.close().await {
                tracing::error!(?err, "Failed to close sender");
                if result.is_ok() {
                    result = Err(err.into());
                }
            }
        }
        result
    }

    /// Sender of a concrete type, created on first use.
    fn transport_for(&self, message_type: MessageType) -> Result<Transport<SenderService>, PublishError> {
        if let Some(cached) = self.senders.get(&message_type.id()) {
            return Ok(cached.value().transport.clone());
        }

        let cached = self
            .senders
            .entry(message_type.id())
            .or_try_insert_with(|| {
                self.entities
                    .create_sender(message_type)
                    .map(|sender| CachedSender {
                        transport: Transport::new(sender.clone()),
                        sender,
                    })
            })?;
        Ok(cached.value().transport.clone())
    }
}

fn apply_correlation(correlation: Correlation<'_>, headers: &mut Headers) {
    let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_owned());

    match correlation {
        Correlation::None => {}
        Correlation::Request(request) => {
            headers.correlation_id = non_empty(request.request_id());
            headers.reply_to_session_id = non_empty(request.requester_id());
        }
        Correlation::Response(response) => {
            headers.correlation_id = non_empty(response.request_id());
            headers.session_id = non_empty(response.requester_id());
        }
    }
}

/// Error returned by [`Publisher::publish`].
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Publish error kinds.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The concrete type of the message has no codec.
    UnregisteredMessage { type_name: &'static str },
    /// The codec failed.
    Serialization {
        message_type: MessageType,
        source: tower::BoxError,
    },
    /// The concrete type of the message is not mapped to a queue or topic.
    UnconfiguredEntity { message_type: MessageType },
    Transport(TransportError),
}

impl PublishError {
    fn new(kind: PublishErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::UnregisteredMessage { type_name } => {
                writeln!(f, "Unregistered message: no codec for {type_name}")
            }
            PublishErrorKind::Serialization {
                message_type,
                source,
            } => writeln!(f, "Serialization error for {message_type}: {source}"),
            PublishErrorKind::UnconfiguredEntity { message_type } => {
                writeln!(f, "Unconfigured entity: no queue or topic for {message_type}")
            }
            PublishErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Serialization { source, .. } => Some(source.as_ref()),
            PublishErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for PublishError {
    fn from(err: TransportError) -> Self {
        Self::new(PublishErrorKind::Transport(err))
    }
}

impl From<EntityError> for PublishError {
    fn from(err: EntityError) -> Self {
        match err.into_kind() {
            EntityErrorKind::UnconfiguredEntity { message_type }
            | EntityErrorKind::NoDeserializers { message_type, .. } => {
                Self::new(PublishErrorKind::UnconfiguredEntity { message_type })
            }
            EntityErrorKind::Transport(err) => Self::new(PublishErrorKind::Transport(err)),
        }
    }
}
