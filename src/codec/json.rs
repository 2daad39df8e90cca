use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};

use super::Codec;

/// JSON codec backed by `serde_json`.
///
/// ```rust
/// use mailroute::{Codec, JsonCodec};
///
/// #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
/// struct UserCreated {
///     id: u64,
/// }
///
/// let codec = JsonCodec::<UserCreated>::new();
/// let bytes = codec.serialize(&UserCreated { id: 7 }).unwrap();
///
/// assert_eq!(bytes, br#"{"id":7}"#);
/// assert_eq!(codec.deserialize(&bytes).unwrap(), UserCreated { id: 7 });
/// ```
pub struct JsonCodec<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, message: &T) -> Result<Vec<u8>, tower::BoxError> {
        serde_json::to_vec(message).map_err(Into::into)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T, tower::BoxError> {
        serde_json::from_slice(bytes).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, Debug)]
    struct Strict {
        id: u64,
    }

    #[test]
    fn malformed_payloads_are_errors() {
        let codec = JsonCodec::<Strict>::new();

        let err = codec.deserialize(b"{\"id\":\"seven\"}").unwrap_err();
        assert!(err.to_string().contains("invalid type"));
    }
}
