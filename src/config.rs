//! Router configuration.
//!
//! [`RouterConfig`] collects everything the routing layer needs before it
//! can run: entity mappings, the codec of every concrete message type,
//! contract memberships, property providers and source tuning. Each
//! registration validates its own arguments immediately; [`RouterConfig::build`]
//! then validates the configuration as a whole, once.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use mailroute::{JsonCodec, Message, RouterConfig, transport::InMemory};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct CreateUser {
//!     name: String,
//! }
//! impl Message for CreateUser {}
//!
//! trait Command: Message {}
//! impl Command for CreateUser {}
//!
//! # fn main() -> Result<(), mailroute::ConfigurationError> {
//! let mut config = RouterConfig::new();
//! config
//!     .queue::<dyn Command>("commands")?
//!     .message::<CreateUser, _>(JsonCodec::new())?
//!     .member_of::<CreateUser, dyn Command>(|c| Arc::new(c));
//!
//! let router = config.build(Arc::new(InMemory::default()))?;
//! # let _ = router;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing_error::SpanTrace;

use crate::{
    Codec, EntityKind, Message, MessageType, MessageTypeMapping, PropertyProvider, Router,
    SourceHook, SourceOptions,
    catalog::Catalog,
    mapping::MappingRegistry,
    properties::PropertyProviders,
    source::DefaultSourceHook,
    transport::{TransportError, TransportFactory},
};

/// Mutable routing configuration.
pub struct RouterConfig {
    mappings: MappingRegistry,
    catalog: Catalog,
    providers: PropertyProviders,
    source_options: SourceOptions,
    source_hook: Arc<dyn SourceHook>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mappings: MappingRegistry::default(),
            catalog: Catalog::default(),
            providers: PropertyProviders::default(),
            source_options: SourceOptions::default(),
            source_hook: Arc::new(DefaultSourceHook),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping built by hand.
    pub fn add_mapping(
        &mut self,
        mapping: MessageTypeMapping,
    ) -> Result<&mut Self, ConfigurationError> {
        self.mappings.add(mapping)?;
        Ok(self)
    }

    /// Map `T` to a queue with default receive mode and creation policy.
    pub fn queue<T: ?Sized + 'static>(&mut self, path: &str) -> Result<&mut Self, ConfigurationError> {
        self.add_mapping(MessageTypeMapping::queue::<T>(path))
    }

    pub fn topic<T: ?Sized + 'static>(&mut self, path: &str) -> Result<&mut Self, ConfigurationError> {
        self.add_mapping(MessageTypeMapping::topic::<T>(path))
    }

    pub fn subscription<T: ?Sized + 'static>(
        &mut self,
        topic: &str,
        name: &str,
    ) -> Result<&mut Self, ConfigurationError> {
        self.add_mapping(MessageTypeMapping::subscription::<T>(topic, name))
    }

    /// Register the codec of a concrete message type.
    ///
    /// The declared name written to the type tag is the unqualified Rust
    /// type name; use [`message_named`](Self::message_named) to choose it.
    pub fn message<T, C>(&mut self, codec: C) -> Result<&mut Self, ConfigurationError>
    where
        T: Message,
        C: Codec<T> + 'static,
    {
        self.catalog.register::<T, C>(MessageType::of::<T>(), codec)?;
        Ok(self)
    }

    pub fn message_named<T, C>(
        &mut self,
        name: &'static str,
        codec: C,
    ) -> Result<&mut Self, ConfigurationError>
    where
        T: Message,
        C: Codec<T> + 'static,
    {
        self.catalog.register::<T, C>(MessageType::named::<T>(name), codec)?;
        Ok(self)
    }

    /// Declare `T` a member of the logical contract `L`.
    ///
    /// Entities mapped to `L` then carry `T`, and sources of `L` can
    /// deserialize `T`.
    pub fn member_of<T, L>(&mut self, upcast: impl Fn(T) -> Arc<L> + Send + Sync + 'static) -> &mut Self
    where
        T: Message,
        L: ?Sized + 'static,
    {
        self.catalog.add_member::<T, L>(upcast);
        self
    }

    /// Append a property provider for outgoing messages of type `T`.
    pub fn property_provider<T, P>(&mut self, provider: P) -> &mut Self
    where
        T: Message,
        P: PropertyProvider<T> + 'static,
    {
        self.providers.add::<T, P>(provider);
        self
    }

    pub fn source_options(&mut self, options: SourceOptions) -> &mut Self {
        self.source_options = options;
        self
    }

    /// Replace the hook observing every source's receive loop.
    pub fn source_hook(&mut self, hook: impl SourceHook + 'static) -> &mut Self {
        self.source_hook = Arc::new(hook);
        self
    }

    /// Validate the configuration and build the router.
    #[tracing::instrument(skip_all, fields(mappings = self.mappings.len()))]
    pub fn build(self, transport: Arc<dyn TransportFactory>) -> Result<Router, ConfigurationError> {
        self.mappings.finalize()?;

        if let Some((member, contract)) = self.catalog.members_without_codec().into_iter().next() {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::UnregisteredMember {
                    message_type: member,
                    contract,
                },
            ));
        }

        for message_type in self.catalog.concrete_types() {
            let candidates = self
                .mappings
                .sender_candidates(message_type.id(), &self.catalog);
            if candidates.len() > 1 {
                return Err(ConfigurationError::new(
                    ConfigurationErrorKind::AmbiguousMapping {
                        message_type,
                        entity_kinds: candidates.iter().map(|m| m.entity_kind()).collect(),
                    },
                ));
            }
        }

        for mapping in self.mappings.iter() {
            let carried = self
                .catalog
                .concrete_types()
                .any(|t| self.catalog.is_assignable(t.id(), mapping.message_type().id()));
            if !carried {
                tracing::warn!(
                    message_type = %mapping.message_type(),
                    path = mapping.path(),
                    "No registered message type is carried by this mapping",
                );
            }
        }

        Ok(Router::new(
            self.mappings,
            self.catalog,
            self.providers,
            self.source_options,
            self.source_hook,
            transport,
        ))
    }
}

/// Error raised while configuring or verifying the routing layer.
#[derive(Debug)]
pub struct ConfigurationError {
    context: SpanTrace,
    kind: ConfigurationErrorKind,
}

/// Configuration error kinds.
#[derive(Debug)]
pub enum ConfigurationErrorKind {
    /// A required argument is missing or empty.
    InvalidConfiguration { reason: String },
    /// No mapping was registered.
    EmptyConfiguration,
    /// The same message type is mapped twice to the same entity kind.
    DuplicateMapping {
        message_type: MessageType,
        entity_kind: EntityKind,
    },
    /// A concrete type resolves to more than one outbound entity.
    AmbiguousMapping {
        message_type: MessageType,
        entity_kinds: Vec<EntityKind>,
    },
    /// A contract member has no codec.
    UnregisteredMember {
        message_type: MessageType,
        contract: MessageType,
    },
    /// An entity required to exist is missing.
    EntityNotFound {
        path: String,
        entity_kind: EntityKind,
    },
    /// Entity management call failed.
    EntityManagement(TransportError),
}

impl ConfigurationError {
    pub(crate) fn new(kind: ConfigurationErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ConfigurationErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigurationErrorKind::InvalidConfiguration { reason } => {
                writeln!(f, "Invalid configuration: {reason}")
            }
            ConfigurationErrorKind::EmptyConfiguration => {
                writeln!(f, "Invalid configuration: no message type mappings")
            }
            ConfigurationErrorKind::DuplicateMapping {
                message_type,
                entity_kind,
            } => writeln!(
                f,
                "Duplicate mapping: {message_type} is already mapped to a {entity_kind}"
            ),
            ConfigurationErrorKind::AmbiguousMapping {
                message_type,
                entity_kinds,
            } => writeln!(
                f,
                "Ambiguous mapping: {message_type} can be sent to {} entities ({entity_kinds:?})",
                entity_kinds.len()
            ),
            ConfigurationErrorKind::UnregisteredMember {
                message_type,
                contract,
            } => writeln!(
                f,
                "Unregistered member: {message_type} is a member of {contract} but has no codec"
            ),
            ConfigurationErrorKind::EntityNotFound { path, entity_kind } => {
                writeln!(f, "Entity not found: {entity_kind} {path}")
            }
            ConfigurationErrorKind::EntityManagement(err) => {
                writeln!(f, "Entity management error: {err}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigurationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConfigurationErrorKind::EntityManagement(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransportError> for ConfigurationError {
    fn from(err: TransportError) -> Self {
        Self::new(ConfigurationErrorKind::EntityManagement(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JsonCodec, transport::InMemory};

    trait Command: Message {}

    #[derive(serde::Serialize, serde::Deserialize)]
    struct CreateUser;
    impl Message for CreateUser {}
    impl Command for CreateUser {}

    #[derive(serde::Serialize, serde::Deserialize)]
    struct DeleteUser;
    impl Message for DeleteUser {}
    impl Command for DeleteUser {}

    fn transport() -> Arc<dyn TransportFactory> {
        Arc::new(InMemory::default())
    }

    #[test]
    fn empty_configuration_fails_at_build() {
        let mut config = RouterConfig::new();
        config.message::<CreateUser, _>(JsonCodec::new()).unwrap();

        let err = config.build(transport()).unwrap_err();

        assert!(matches!(err.kind(), ConfigurationErrorKind::EmptyConfiguration));
    }

    #[test]
    fn duplicate_mapping_is_reported_eagerly() {
        let mut config = RouterConfig::new();
        config.queue::<CreateUser>("a").unwrap();

        let err = config.queue::<CreateUser>("b").err().unwrap();

        assert!(matches!(
            err.kind(),
            ConfigurationErrorKind::DuplicateMapping { entity_kind: EntityKind::Queue, .. }
        ));
        assert!(err.to_string().starts_with(
            "Duplicate mapping: CreateUser is already mapped to a queue"
        ));
    }

    #[test]
    fn queue_and_topic_for_the_same_type_are_ambiguous() {
        let mut config = RouterConfig::new();
        config
            .queue::<CreateUser>("commands")
            .unwrap()
            .topic::<CreateUser>("events")
            .unwrap()
            .message::<CreateUser, _>(JsonCodec::new())
            .unwrap();

        let err = config.build(transport()).unwrap_err();

        match err.kind() {
            ConfigurationErrorKind::AmbiguousMapping {
                message_type,
                entity_kinds,
            } => {
                assert_eq!(message_type.name(), "CreateUser");
                assert_eq!(entity_kinds, &vec![EntityKind::Queue, EntityKind::Topic]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn exact_mapping_takes_precedence_over_contract_mapping() {
        let mut config = RouterConfig::new();
        config
            .queue::<dyn Command>("commands")
            .unwrap()
            .queue::<DeleteUser>("deletes")
            .unwrap()
            .message::<CreateUser, _>(JsonCodec::new())
            .unwrap()
            .message::<DeleteUser, _>(JsonCodec::new())
            .unwrap()
            .member_of::<CreateUser, dyn Command>(|c| Arc::new(c))
            .member_of::<DeleteUser, dyn Command>(|c| Arc::new(c));

        assert!(config.build(transport()).is_ok());
    }

    #[test]
    fn members_must_have_a_codec() {
        let mut config = RouterConfig::new();
        config
            .queue::<dyn Command>("commands")
            .unwrap()
            .member_of::<CreateUser, dyn Command>(|c| Arc::new(c));

        let err = config.build(transport()).unwrap_err();

        assert!(matches!(
            err.kind(),
            ConfigurationErrorKind::UnregisteredMember { .. }
        ));
    }
}
