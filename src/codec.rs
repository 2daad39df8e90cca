//! Message body codecs.
//!
//! One codec is registered per concrete message type; the router uses it to
//! turn outgoing messages into envelope payloads and incoming payloads back
//! into messages.

mod json;

pub use json::JsonCodec;

/// Serializes and deserializes one message type.
pub trait Codec<T>: Send + Sync {
    fn serialize(&self, message: &T) -> Result<Vec<u8>, tower::BoxError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<T, tower::BoxError>;
}

impl<T, C> Codec<T> for std::sync::Arc<C>
where
    C: Codec<T> + ?Sized,
{
    fn serialize(&self, message: &T) -> Result<Vec<u8>, tower::BoxError> {
        (**self).serialize(message)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, tower::BoxError> {
        (**self).deserialize(bytes)
    }
}
