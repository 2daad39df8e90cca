//! Message type to messaging entity mappings.
//!
//! A [`MessageTypeMapping`] binds one message type (concrete or logical) to
//! one physical entity: a queue, a topic or a topic subscription. Mappings
//! are collected in a [`MappingRegistry`] at configuration time and are
//! immutable once the router is built.

use std::any::TypeId;

use crate::{
    MessageType,
    catalog::Catalog,
    config::{ConfigurationError, ConfigurationErrorKind},
};

/// Physical routing target type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Queue,
    Topic,
    Subscription,
}

impl EntityKind {
    /// Entities envelopes can be received from.
    pub fn is_source(self) -> bool {
        matches!(self, EntityKind::Queue | EntityKind::Subscription)
    }

    /// Entities envelopes can be sent to.
    pub fn is_destination(self) -> bool {
        matches!(self, EntityKind::Queue | EntityKind::Topic)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Queue => f.write_str("queue"),
            EntityKind::Topic => f.write_str("topic"),
            EntityKind::Subscription => f.write_str("subscription"),
        }
    }
}

/// What to do about a mapped entity before the router is used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreationPolicy {
    /// Leave the entity alone.
    #[default]
    None,
    CreateIfNotExists,
    /// Fail verification when the entity is missing.
    VerifyAlreadyExists,
}

/// Settlement mode of a receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReceiveMode {
    /// Deliveries stay locked until explicitly settled through a
    /// [`LockControl`](crate::LockControl).
    PeekLock,
    /// Deliveries are removed from the entity as they are received.
    #[default]
    ReceiveAndDelete,
}

/// Path synthesized for a topic subscription.
pub fn subscription_path(topic: &str, name: &str) -> String {
    format!("{topic}/subscriptions/{name}")
}

/// Binding of a message type to one messaging entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeMapping {
    message_type: MessageType,
    path: String,
    entity_kind: EntityKind,
    creation_policy: CreationPolicy,
    receive_mode: ReceiveMode,
}

impl MessageTypeMapping {
    pub fn new(message_type: MessageType, path: impl Into<String>, entity_kind: EntityKind) -> Self {
        Self {
            message_type,
            path: path.into(),
            entity_kind,
            creation_policy: CreationPolicy::default(),
            receive_mode: ReceiveMode::default(),
        }
    }

    pub fn queue<T: ?Sized + 'static>(path: impl Into<String>) -> Self {
        Self::new(MessageType::of::<T>(), path, EntityKind::Queue)
    }

    pub fn topic<T: ?Sized + 'static>(path: impl Into<String>) -> Self {
        Self::new(MessageType::of::<T>(), path, EntityKind::Topic)
    }

    /// Mapping to subscription `name` of `topic`.
    pub fn subscription<T: ?Sized + 'static>(topic: &str, name: &str) -> Self {
        Self::new(
            MessageType::of::<T>(),
            subscription_path(topic, name),
            EntityKind::Subscription,
        )
    }

    pub fn with_receive_mode(mut self, receive_mode: ReceiveMode) -> Self {
        self.receive_mode = receive_mode;
        self
    }

    pub fn with_creation_policy(mut self, creation_policy: CreationPolicy) -> Self {
        self.creation_policy = creation_policy;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn entity_kind(&self) -> EntityKind {
        self.entity_kind
    }

    pub fn creation_policy(&self) -> CreationPolicy {
        self.creation_policy
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.receive_mode
    }

    /// Topic path and subscription name of a subscription mapping.
    pub fn subscription_parts(&self) -> Option<(&str, &str)> {
        if self.entity_kind != EntityKind::Subscription {
            return None;
        }
        self.path.rsplit_once("/subscriptions/")
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| {
            Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidConfiguration { reason },
            ))
        };

        if self.path.trim().is_empty() {
            return invalid(format!(
                "empty {} path for {}",
                self.entity_kind, self.message_type
            ));
        }

        if self.entity_kind == EntityKind::Subscription {
            match self.subscription_parts() {
                Some((topic, name)) if !topic.trim().is_empty() && !name.trim().is_empty() => {}
                _ => {
                    return invalid(format!(
                        "subscription path {:?} for {} needs both a topic and a subscription name",
                        self.path, self.message_type
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Ordered set of mappings, unique by message type and entity kind.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    mappings: Vec<MessageTypeMapping>,
}

impl MappingRegistry {
    /// Append a mapping.
    ///
    /// Fails with `InvalidConfiguration` for empty paths and with
    /// `DuplicateMapping` when the same message type is already mapped to the
    /// same entity kind.
    pub fn add(&mut self, mapping: MessageTypeMapping) -> Result<(), ConfigurationError> {
        mapping.validate()?;

        let duplicate = self.mappings.iter().any(|m| {
            m.message_type.id() == mapping.message_type.id() && m.entity_kind == mapping.entity_kind
        });
        if duplicate {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::DuplicateMapping {
                    message_type: mapping.message_type,
                    entity_kind: mapping.entity_kind,
                },
            ));
        }

        self.mappings.push(mapping);
        Ok(())
    }

    /// Reject an empty mapping set.
    pub fn finalize(&self) -> Result<(), ConfigurationError> {
        if self.mappings.is_empty() {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::EmptyConfiguration,
            ));
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageTypeMapping> {
        self.mappings.iter()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Queue and subscription mappings whose message type is assignable to
    /// `logical`, in registration order.
    pub fn resolve_source_mappings(
        &self,
        logical: TypeId,
        catalog: &Catalog,
    ) -> Vec<&MessageTypeMapping> {
        self.mappings
            .iter()
            .filter(|m| m.entity_kind.is_source())
            .filter(|m| catalog.is_assignable(m.message_type.id(), logical))
            .collect()
    }

    /// Queue and topic mappings a concrete type can be sent through.
    ///
    /// Mappings declared for the type itself take precedence; otherwise the
    /// mappings of every contract the type is a member of are returned.
    pub fn sender_candidates(&self, concrete: TypeId, catalog: &Catalog) -> Vec<&MessageTypeMapping> {
        let destinations = || self.mappings.iter().filter(|m| m.entity_kind.is_destination());

        let exact: Vec<_> = destinations()
            .filter(|m| m.message_type.id() == concrete)
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        destinations()
            .filter(|m| catalog.is_assignable(concrete, m.message_type.id()))
            .collect()
    }

    /// The single outbound mapping for a concrete type.
    ///
    /// Ambiguous candidate sets are rejected when the router is built, so
    /// the first candidate is the only one.
    pub fn resolve_sender_mapping(
        &self,
        concrete: TypeId,
        catalog: &Catalog,
    ) -> Option<&MessageTypeMapping> {
        self.sender_candidates(concrete, catalog).into_iter().next()
    }
}
