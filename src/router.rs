//! The built routing layer.

use std::sync::Arc;

use crate::{
    ConfigurationError, Message, MessageType, Publisher, SourceHook, SourceOptions,
    association::AssociationTable,
    catalog::Catalog,
    entity::{EntityError, MessagingEntityFactory},
    lock::LockControlProvider,
    mapping::MappingRegistry,
    properties::{MessageProperties, OutgoingMetadataTable, PropertyProviders},
    source::{MergedSource, MessageSource, Source},
    transport::{EntityManager, TransportFactory},
    verifier::EntityVerifier,
};

/// Validated routing configuration bound to a transport.
///
/// Created by [`RouterConfig::build`](crate::RouterConfig::build). Cloning
/// is cheap and clones share the association and metadata tables, so a
/// message received through one clone can be settled through another.
#[derive(Clone)]
pub struct Router {
    entities: MessagingEntityFactory,
    providers: Arc<PropertyProviders>,
    associations: Arc<AssociationTable>,
    outgoing: Arc<OutgoingMetadataTable>,
    source_options: SourceOptions,
    source_hook: Arc<dyn SourceHook>,
}

impl Router {
    pub(crate) fn new(
        mappings: MappingRegistry,
        catalog: Catalog,
        providers: PropertyProviders,
        source_options: SourceOptions,
        source_hook: Arc<dyn SourceHook>,
        transport: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            entities: MessagingEntityFactory::new(Arc::new(mappings), Arc::new(catalog), transport),
            providers: Arc::new(providers),
            associations: Arc::new(AssociationTable::default()),
            outgoing: Arc::new(OutgoingMetadataTable::default()),
            source_options,
            source_hook,
        }
    }

    /// Publisher for messages of the logical type `L`.
    ///
    /// Senders are created lazily, on the first publish of each concrete type.
    pub fn publisher<L>(&self) -> Publisher<L>
    where
        L: ?Sized + Message,
    {
        Publisher::new(
            self.entities.clone(),
            self.providers.clone(),
            self.outgoing.clone(),
        )
    }

    /// Source of messages of the logical type `L`.
    ///
    /// One source is created per queue or subscription mapping carrying `L`;
    /// when there are several they are merged into one stream.
    #[tracing::instrument(skip_all, fields(message_type = %MessageType::of::<L>()))]
    pub fn source<L>(&self) -> Result<Box<dyn MessageSource<L>>, EntityError>
    where
        L: ?Sized + Send + Sync + 'static,
    {
        let mappings = self.entities.source_mappings(MessageType::of::<L>())?;

        let mut sources: Vec<Box<dyn MessageSource<L>>> = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let receiver = self.entities.create_receiver(mapping)?;
            let deserializers = self
                .entities
                .catalog()
                .deserializers_for::<L>(mapping.message_type().id());

            sources.push(Box::new(Source::new(
                mapping.clone(),
                receiver,
                deserializers,
                self.associations.clone(),
                self.source_hook.clone(),
                self.source_options,
            )?));
        }

        match sources.len() {
            1 => Ok(sources.remove(0)),
            _ => Ok(Box::new(MergedSource::new(sources))),
        }
    }

    /// Lock controls of messages received from peek-lock sources.
    pub fn lock_controls(&self) -> LockControlProvider {
        LockControlProvider::new(self.associations.clone())
    }

    /// Incoming and outgoing per-message properties.
    pub fn properties(&self) -> MessageProperties {
        MessageProperties::new(self.associations.clone(), self.outgoing.clone())
    }

    pub fn mappings(&self) -> &MappingRegistry {
        self.entities.mappings()
    }

    /// Apply the creation policy of every mapping.
    pub async fn verify_entities(&self, manager: &dyn EntityManager) -> Result<(), ConfigurationError> {
        EntityVerifier::new(manager)
            .verify_all(self.entities.mappings().iter())
            .await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("mappings", self.entities.mappings())
            .field("catalog", self.entities.catalog())
            .field("source_options", &self.source_options)
            .finish_non_exhaustive()
    }
}
