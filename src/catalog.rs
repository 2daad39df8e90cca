//! Registry of concrete message types and the contracts they belong to.
//!
//! Rust has no runtime "is assignable to" check between a concrete type and
//! a trait object type, so the relation is declared explicitly: each concrete
//! type registers its codec under a declared name, and each contract
//! membership registers an upcast from the concrete type to the contract
//! (for example `CreateUser -> Arc<dyn Command>`).
//!
//! From these two tables the catalog derives everything the runtime needs:
//! assignability between types, the serializer for a runtime value and the
//! deserializer set of a source.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

use crate::{
    Codec, Message, MessageType,
    config::{ConfigurationError, ConfigurationErrorKind},
};

type SerializeFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>, tower::BoxError> + Send + Sync>;
type DeserializeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, tower::BoxError> + Send + Sync>;
type Upcast<L> = Arc<dyn Fn(Box<dyn Any + Send>) -> Option<Arc<L>> + Send + Sync>;

/// Turns a payload into a message viewed as the logical type `L`.
pub type Deserializer<L> = Arc<dyn Fn(&[u8]) -> Result<Arc<L>, tower::BoxError> + Send + Sync>;

struct Registration {
    message_type: MessageType,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

struct Membership {
    member: MessageType,
    contract: MessageType,
    /// An `Upcast<L>` for the contract `L`.
    upcast: Box<dyn Any + Send + Sync>,
}

/// Concrete message types with their codecs, and contract memberships.
#[derive(Default)]
pub struct Catalog {
    registrations: HashMap<TypeId, Registration>,
    /// Keyed by `(contract, member)`.
    memberships: HashMap<(TypeId, TypeId), Membership>,
}

impl Catalog {
    /// Register the codec of concrete type `T` under `message_type`'s name.
    ///
    /// The type becomes a member of itself, so sources of `T` can
    /// deserialize it without further declarations.
    pub(crate) fn register<T, C>(
        &mut self,
        message_type: MessageType,
        codec: C,
    ) -> Result<(), ConfigurationError>
    where
        T: Message,
        C: Codec<T> + 'static,
    {
        if message_type.name().trim().is_empty() {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidConfiguration {
                    reason: format!("empty declared name for {}", MessageType::of::<T>()),
                },
            ));
        }
        if self.registrations.contains_key(&message_type.id()) {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidConfiguration {
                    reason: format!("codec for {message_type} registered twice"),
                },
            ));
        }
        if let Some(existing) = self
            .registrations
            .values()
            .find(|r| r.message_type.name() == message_type.name())
        {
            return Err(ConfigurationError::new(
                ConfigurationErrorKind::InvalidConfiguration {
                    reason: format!(
                        "declared name {:?} already used by another type than {}",
                        existing.message_type.name(),
                        MessageType::of::<T>()
                    ),
                },
            ));
        }

        let codec = Arc::new(codec);
        let encoder = codec.clone();

        self.registrations.insert(
            message_type.id(),
            Registration {
                message_type,
                serialize: Arc::new(move |message: &dyn Any| match message.downcast_ref::<T>() {
                    Some(message) => encoder.serialize(message),
                    None => Err(format!("value is not a {message_type}").into()),
                }),
                deserialize: Arc::new(move |bytes: &[u8]| {
                    codec
                        .deserialize(bytes)
                        .map(|message| Box::new(message) as Box<dyn Any + Send>)
                }),
            },
        );
        self.add_member::<T, T>(Arc::new);

        Ok(())
    }

    /// Declare `T` a member of contract `L`.
    pub(crate) fn add_member<T, L>(&mut self, upcast: impl Fn(T) -> Arc<L> + Send + Sync + 'static)
    where
        T: Message,
        L: ?Sized + 'static,
    {
        let upcast: Upcast<L> = Arc::new(move |message: Box<dyn Any + Send>| {
            message.downcast::<T>().ok().map(|message| upcast(*message))
        });

        self.memberships.insert(
            (TypeId::of::<L>(), TypeId::of::<T>()),
            Membership {
                member: MessageType::of::<T>(),
                contract: MessageType::of::<L>(),
                upcast: Box::new(upcast),
            },
        );
    }

    /// Registered type information of a concrete type.
    pub fn message_type(&self, id: TypeId) -> Option<MessageType> {
        self.registrations.get(&id).map(|r| r.message_type)
    }

    pub fn concrete_types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.registrations.values().map(|r| r.message_type)
    }

    /// `from` is `to`, or was declared a member of `to`.
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        from == to || self.memberships.contains_key(&(to, from))
    }

    /// Memberships whose member type has no codec, as `(member, contract)`.
    pub(crate) fn members_without_codec(&self) -> Vec<(MessageType, MessageType)> {
        self.memberships
            .values()
            .filter(|m| !self.registrations.contains_key(&m.member.id()))
            .map(|m| (m.member, m.contract))
            .collect()
    }

    /// Serialize a runtime value with the codec of its concrete type.
    ///
    /// Returns `None` when the concrete type has no codec.
    pub(crate) fn serialize(
        &self,
        message: &dyn Any,
    ) -> Option<(MessageType, Result<Vec<u8>, tower::BoxError>)> {
        let registration = self.registrations.get(&message.type_id())?;
        Some((registration.message_type, (registration.serialize)(message)))
    }

    /// Deserializers able to produce an `L` from envelopes of an entity
    /// mapped to `mapping_type`, keyed by declared type name.
    pub fn deserializers_for<L>(&self, mapping_type: TypeId) -> HashMap<&'static str, Deserializer<L>>
    where
        L: ?Sized + 'static,
    {
        let contract = TypeId::of::<L>();

        self.registrations
            .iter()
            .filter(|(id, _)| self.is_assignable(**id, mapping_type))
            .filter_map(|(id, registration)| {
                let upcast = self
                    .memberships
                    .get(&(contract, *id))?
                    .upcast
                    .downcast_ref::<Upcast<L>>()?
                    .clone();
                let deserialize = registration.deserialize.clone();
                let message_type = registration.message_type;

                let deserializer: Deserializer<L> = Arc::new(
                    move |bytes: &[u8]| -> Result<Arc<L>, tower::BoxError> {
                        let message = deserialize(bytes)?;
                        upcast(message)
                            .ok_or_else(|| format!("decoded value is not a {message_type}").into())
                    },
                );

                Some((registration.message_type.name(), deserializer))
            })
            .collect()
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field(
                "types",
                &self.registrations.values().map(|r| r.message_type).collect::<Vec<_>>(),
            )
            .field(
                "memberships",
                &self
                    .memberships
                    .values()
                    .map(|m| (m.member, m.contract))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsAny, JsonCodec};

    trait Command: Message {
        fn target(&self) -> String;
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct CreateUser {
        name: String,
    }
    impl Message for CreateUser {}
    impl Command for CreateUser {
        fn target(&self) -> String {
            self.name.clone()
        }
    }

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Audit;
    impl Message for Audit {}

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog
            .register::<CreateUser, _>(MessageType::of::<CreateUser>(), JsonCodec::new())
            .unwrap();
        catalog
            .register::<Audit, _>(MessageType::of::<Audit>(), JsonCodec::new())
            .unwrap();
        catalog.add_member::<CreateUser, dyn Command>(|m| Arc::new(m));
        catalog
    }

    #[test]
    fn membership_defines_assignability() {
        let catalog = catalog();
        let command = TypeId::of::<dyn Command>();

        assert!(catalog.is_assignable(TypeId::of::<CreateUser>(), command));
        assert!(catalog.is_assignable(command, command));
        assert!(!catalog.is_assignable(TypeId::of::<Audit>(), command));
        assert!(!catalog.is_assignable(command, TypeId::of::<CreateUser>()));
    }

    #[test]
    fn deserializers_produce_contract_values() {
        let catalog = catalog();
        let deserializers = catalog.deserializers_for::<dyn Command>(TypeId::of::<dyn Command>());

        assert_eq!(deserializers.len(), 1);
        let command = deserializers["CreateUser"](br#"{"name":"ada"}"#.as_slice()).unwrap();
        assert_eq!(command.target(), "ada");
    }

    #[test]
    fn deserializers_are_limited_to_the_mapped_type() {
        let catalog = catalog();

        let deserializers = catalog.deserializers_for::<Audit>(TypeId::of::<CreateUser>());
        assert!(deserializers.is_empty());

        let deserializers = catalog.deserializers_for::<Audit>(TypeId::of::<Audit>());
        assert_eq!(deserializers.keys().copied().collect::<Vec<_>>(), vec!["Audit"]);
    }

    #[test]
    fn declared_names_are_unique() {
        let mut catalog = catalog();

        let err = catalog
            .register::<Audit, _>(MessageType::of::<Audit>(), JsonCodec::new())
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ConfigurationErrorKind::InvalidConfiguration { .. }
        ));
    }

    #[test]
    fn serialize_uses_the_runtime_type() {
        let catalog = catalog();
        let command: Box<dyn Command> = Box::new(CreateUser { name: "ada".into() });

        let (ty, bytes) = catalog.serialize(AsAny::as_any(command.as_ref())).unwrap();

        assert_eq!(ty.name(), "CreateUser");
        assert_eq!(bytes.unwrap(), br#"{"name":"ada"}"#);
        assert!(catalog.serialize(&42u8).is_none());
    }

    #[test]
    fn members_need_a_codec() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Orphan;
        impl Message for Orphan {}

        let mut catalog = catalog();
        catalog.add_member::<Orphan, Orphan>(Arc::new);

        let missing = catalog.members_without_codec();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0.name(), "Orphan");
    }
}
