//! Creation of transport handles for mapped message types.

use std::sync::Arc;

use tracing_error::SpanTrace;

use crate::{
    MessageType, MessageTypeMapping,
    catalog::Catalog,
    mapping::MappingRegistry,
    transport::{Receiver, Sender, TransportError, TransportFactory},
};

/// Resolves mappings and asks the transport for senders and receivers.
///
/// Shared by every publisher and source of a router. Handles are not cached
/// here: publishers keep one sender per concrete type and each source owns
/// the single receiver it was created with.
#[derive(Clone)]
pub struct MessagingEntityFactory {
    mappings: Arc<MappingRegistry>,
    catalog: Arc<Catalog>,
    transport: Arc<dyn TransportFactory>,
}

impl MessagingEntityFactory {
    pub fn new(
        mappings: Arc<MappingRegistry>,
        catalog: Arc<Catalog>,
        transport: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            mappings,
            catalog,
            transport,
        }
    }

    /// Sender for the entity a concrete message type is mapped to.
    #[tracing::instrument(skip_all, fields(message_type = %message_type))]
    pub fn create_sender(&self, message_type: MessageType) -> Result<Arc<dyn Sender>, EntityError> {
        let mapping = self
            .mappings
            .resolve_sender_mapping(message_type.id(), &self.catalog)
            .ok_or_else(|| EntityError::new(EntityErrorKind::UnconfiguredEntity { message_type }))?;

        tracing::debug!(
            path = mapping.path(),
            entity_kind = %mapping.entity_kind(),
            "Creating sender",
        );
        Ok(self.transport.create_sender(mapping)?)
    }

    /// Receiver for one source mapping.
    #[tracing::instrument(skip_all, fields(path = mapping.path()))]
    pub fn create_receiver(
        &self,
        mapping: &MessageTypeMapping,
    ) -> Result<Arc<dyn Receiver>, EntityError> {
        tracing::debug!(
            entity_kind = %mapping.entity_kind(),
            receive_mode = ?mapping.receive_mode(),
            "Creating receiver",
        );
        Ok(self.transport.create_receiver(mapping)?)
    }

    /// Queue and subscription mappings carrying the logical type.
    pub fn source_mappings(&self, logical: MessageType) -> Result<Vec<&MessageTypeMapping>, EntityError> {
        let mappings = self.mappings.resolve_source_mappings(logical.id(), &self.catalog);
        if mappings.is_empty() {
            return Err(EntityError::new(EntityErrorKind::UnconfiguredEntity {
                message_type: logical,
            }));
        }
        Ok(mappings)
    }

    pub fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }
}

/// Error raised while resolving or creating messaging entities.
#[derive(Debug)]
pub struct EntityError {
    context: SpanTrace,
    kind: EntityErrorKind,
}

/// Entity error kinds.
#[derive(Debug)]
pub enum EntityErrorKind {
    /// No mapping exists for the message type.
    UnconfiguredEntity { message_type: MessageType },
    /// No registered codec can produce messages from the entity.
    NoDeserializers {
        message_type: MessageType,
        path: String,
    },
    /// The transport could not create the handle.
    Transport(TransportError),
}

impl EntityError {
    pub(crate) fn new(kind: EntityErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &EntityErrorKind {
        &self.kind
    }

    pub(crate) fn into_kind(self) -> EntityErrorKind {
        self.kind
    }
}

impl std::fmt::Display for EntityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            EntityErrorKind::UnconfiguredEntity { message_type } => {
                writeln!(f, "Unconfigured entity: no mapping for {message_type}")
            }
            EntityErrorKind::NoDeserializers { message_type, path } => writeln!(
                f,
                "No deserializers: no registered type of {message_type} can be read from {path}"
            ),
            EntityErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for EntityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            EntityErrorKind::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for EntityError {
    fn from(err: TransportError) -> Self {
        Self::new(EntityErrorKind::Transport(err))
    }
}
