/// Message container used by the publish and receive pipelines.
///
/// `Envelope` bundles a message payload together with its associated headers.
/// It is intentionally generic: the routing layer itself works with
/// [`TransportEnvelope`], an envelope whose headers are [`Headers`] and whose
/// payload is the serialized message body.
///
/// ## Design
///
/// - `H` represents message metadata (property bag, correlation ids, lock
///   token, scheduling information)
/// - `M` represents the actual message payload
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use mailroute::{Envelope, Headers};
///
/// let mut headers = Headers::default();
/// headers.set_type_tag("UserCreated");
///
/// let envelope: Envelope<_, _> = (headers, b"{}".to_vec()).into();
/// assert_eq!(envelope.headers.type_tag(), Some("UserCreated"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Envelope exchanged with the transport collaborators.
pub type TransportEnvelope = Envelope<Headers, crate::transport::RawPayload>;

/// Property key carrying the sender-declared message type name.
pub const TYPE_NAME_PROPERTY: &str = "TypeName";

/// Value stored in the envelope property bag.
pub type PropertyValue = serde_json::Value;

/// Ordered, string-keyed property bag.
///
/// Duplicate keys are kept in insertion order. Lookups follow
/// last-write-wins, the way most brokers collapse duplicate application
/// properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties(Vec<(String, PropertyValue)>);

impl Properties {
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.push((key.into(), value.into()));
    }

    /// Last value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<(String, PropertyValue)> for Properties {
    fn extend<T: IntoIterator<Item = (String, PropertyValue)>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl FromIterator<(String, PropertyValue)> for Properties {
    fn from_iter<T: IntoIterator<Item = (String, PropertyValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Opaque token identifying a peek-locked delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(pub String);

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport-level headers of an envelope.
///
/// Application properties live in [`Headers::properties`]; the remaining
/// fields are assigned either by the publisher (correlation and session ids,
/// scheduling) or by the transport on delivery (delivery count, lock token).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    pub properties: Properties,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub scheduled_enqueue_time: Option<chrono::DateTime<chrono::Utc>>,
    pub time_to_live: Option<std::time::Duration>,
    pub delivery_count: u32,
    pub lock_token: Option<LockToken>,
}

impl Headers {
    /// Type name declared by the sender, if the envelope carries one.
    pub fn type_tag(&self) -> Option<&str> {
        self.properties
            .get(TYPE_NAME_PROPERTY)
            .and_then(PropertyValue::as_str)
    }

    /// Whether the envelope carries a type name property at all, string or not.
    pub fn has_type_property(&self) -> bool {
        self.properties.get(TYPE_NAME_PROPERTY).is_some()
    }

    pub fn set_type_tag(&mut self, type_name: impl Into<String>) {
        self.properties
            .push(TYPE_NAME_PROPERTY, PropertyValue::String(type_name.into()));
    }
}
