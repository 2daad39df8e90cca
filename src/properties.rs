//! Message properties.
//!
//! Outgoing envelopes receive application properties from the
//! [`PropertyProvider`]s registered for the concrete message type, and
//! optionally scheduling metadata attached to the message instance through
//! [`MessageProperties::set_outgoing`]. Received messages expose their
//! delivery information through [`MessageProperties::incoming`].

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    Headers, Message, PropertyValue,
    association::{AssociationTable, IdentityMap},
};

/// Supplies application properties for outgoing messages of type `T`.
///
/// Implemented for closures:
///
/// ```rust
/// use mailroute::{PropertyProvider, PropertyValue};
///
/// struct OrderPlaced {
///     tenant: String,
/// }
///
/// let provider = |order: &OrderPlaced| vec![("Tenant".to_owned(), PropertyValue::from(order.tenant.clone()))];
/// let props = provider.properties(&OrderPlaced { tenant: "acme".into() });
///
/// assert_eq!(props[0].0, "Tenant");
/// ```
pub trait PropertyProvider<T: ?Sized>: Send + Sync {
    fn properties(&self, message: &T) -> Vec<(String, PropertyValue)>;
}

impl<T, F> PropertyProvider<T> for F
where
    T: ?Sized,
    F: Fn(&T) -> Vec<(String, PropertyValue)> + Send + Sync,
{
    fn properties(&self, message: &T) -> Vec<(String, PropertyValue)> {
        self(message)
    }
}

type ErasedProvider = Arc<dyn Fn(&dyn Any) -> Vec<(String, PropertyValue)> + Send + Sync>;

/// Property providers per concrete message type, in registration order.
#[derive(Default, Clone)]
pub(crate) struct PropertyProviders {
    by_type: HashMap<TypeId, Vec<ErasedProvider>>,
}

impl PropertyProviders {
    pub(crate) fn add<T, P>(&mut self, provider: P)
    where
        T: Message,
        P: PropertyProvider<T> + 'static,
    {
        let provider: ErasedProvider = Arc::new(move |message: &dyn Any| {
            message
                .downcast_ref::<T>()
                .map(|message| provider.properties(message))
                .unwrap_or_default()
        });
        self.by_type.entry(TypeId::of::<T>()).or_default().push(provider);
    }

    /// Concatenation of every provider's properties for `message`.
    ///
    /// Duplicate keys are kept.
    pub(crate) fn properties_for(&self, message: &dyn Any) -> Vec<(String, PropertyValue)> {
        self.by_type
            .get(&message.type_id())
            .map(|providers| providers.iter().flat_map(|p| p(message)).collect())
            .unwrap_or_default()
    }
}

/// Scheduling metadata applied to the next publish of one message instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutgoingMetadata {
    pub scheduled_enqueue_time: Option<DateTime<Utc>>,
    pub time_to_live: Option<Duration>,
}

impl OutgoingMetadata {
    pub fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_enqueue_time = Some(time);
        self
    }

    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub(crate) fn apply(&self, headers: &mut Headers) {
        headers.scheduled_enqueue_time = self.scheduled_enqueue_time;
        headers.time_to_live = self.time_to_live;
    }
}

pub(crate) type OutgoingMetadataTable = IdentityMap<OutgoingMetadata>;

/// Delivery information of a received message.
#[derive(Debug, Clone)]
pub struct IncomingProperties {
    envelope: Arc<crate::TransportEnvelope>,
}

impl IncomingProperties {
    /// Number of times the envelope has been delivered, this delivery included.
    pub fn delivery_count(&self) -> u32 {
        self.envelope.headers.delivery_count
    }

    pub fn headers(&self) -> &Headers {
        &self.envelope.headers
    }
}

/// Per-instance property access, handed out by the router.
///
/// ```rust,ignore
/// let message = Arc::new(OrderPlaced::new());
/// router
///     .properties()
///     .set_outgoing(&message, OutgoingMetadata::default().time_to_live(ttl));
/// publisher.publish(message.as_ref()).await?;
/// ```
#[derive(Clone)]
pub struct MessageProperties {
    associations: Arc<AssociationTable>,
    outgoing: Arc<OutgoingMetadataTable>,
}

impl MessageProperties {
    pub(crate) fn new(
        associations: Arc<AssociationTable>,
        outgoing: Arc<OutgoingMetadataTable>,
    ) -> Self {
        Self {
            associations,
            outgoing,
        }
    }

    /// Delivery information of a message produced by a source, `None` for
    /// any other instance.
    pub fn incoming<L: ?Sized>(&self, message: &L) -> Option<IncomingProperties> {
        self.associations
            .get(message)
            .map(|association| IncomingProperties {
                envelope: association.envelope,
            })
    }

    /// Attach scheduling metadata to the next publish of `message`.
    pub fn set_outgoing<L>(&self, message: &Arc<L>, metadata: OutgoingMetadata)
    where
        L: ?Sized + Send + Sync + 'static,
    {
        self.outgoing.insert(message, metadata);
    }

    /// Metadata waiting for the next publish of `message`.
    pub fn outgoing<L: ?Sized>(&self, message: &L) -> Option<OutgoingMetadata> {
        self.outgoing.get(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsAny, association::Association};

    struct OrderPlaced {
        tenant: &'static str,
    }
    impl Message for OrderPlaced {}

    fn kv(key: &str, value: &str) -> (String, PropertyValue) {
        (key.to_owned(), PropertyValue::from(value))
    }

    #[test]
    fn providers_compose_in_order_and_keep_duplicates() {
        let mut providers = PropertyProviders::default();
        providers.add::<OrderPlaced, _>(|m: &OrderPlaced| vec![kv("Tenant", m.tenant), kv("Source", "web")]);
        providers.add::<OrderPlaced, _>(|_: &OrderPlaced| vec![kv("Tenant", "override")]);

        let message = OrderPlaced { tenant: "acme" };
        let props = providers.properties_for(AsAny::as_any(&message));

        assert_eq!(
            props,
            vec![kv("Tenant", "acme"), kv("Source", "web"), kv("Tenant", "override")]
        );
    }

    #[test]
    fn types_without_providers_get_no_properties() {
        let providers = PropertyProviders::default();

        assert!(providers.properties_for(&42u32).is_empty());
    }

    #[test]
    fn incoming_properties_come_from_the_association() {
        let associations = Arc::new(AssociationTable::default());
        let properties = MessageProperties::new(associations.clone(), Default::default());
        let message = Arc::new(OrderPlaced { tenant: "acme" });

        assert!(properties.incoming(message.as_ref()).is_none());

        let mut headers = Headers::default();
        headers.delivery_count = 3;
        associations.insert(
            &message,
            Association::new((headers, Default::default()).into(), None),
        );

        let incoming = properties.incoming(message.as_ref()).unwrap();
        assert_eq!(incoming.delivery_count(), 3);
    }

    #[test]
    fn outgoing_metadata_is_per_instance() {
        let properties = MessageProperties::new(Default::default(), Default::default());
        let first = Arc::new(OrderPlaced { tenant: "a" });
        let second = Arc::new(OrderPlaced { tenant: "a" });
        let metadata = OutgoingMetadata::default().time_to_live(Duration::from_secs(30));

        properties.set_outgoing(&first, metadata);

        assert_eq!(properties.outgoing(first.as_ref()), Some(metadata));
        assert_eq!(properties.outgoing(second.as_ref()), None);
    }
}
