#![doc = include_str!("../README.md")]

mod association;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod entity;
pub mod envelope;
pub mod lock;
pub mod mapping;
pub mod message;
pub mod properties;
pub mod publisher;
mod router;
pub mod source;
pub mod transport;
pub mod verifier;

#[doc(inline)]
pub use codec::{Codec, JsonCodec};

#[doc(inline)]
pub use config::{ConfigurationError, ConfigurationErrorKind, RouterConfig};

#[doc(inline)]
pub use entity::{EntityError, EntityErrorKind};

#[doc(inline)]
pub use envelope::{
    Envelope, Headers, LockToken, Properties, PropertyValue, TYPE_NAME_PROPERTY, TransportEnvelope,
};

#[doc(inline)]
pub use lock::{LockControl, LockControlError, LockControlErrorKind, LockControlProvider};

#[doc(inline)]
pub use mapping::{CreationPolicy, EntityKind, MessageTypeMapping, ReceiveMode};

#[doc(inline)]
pub use message::{AsAny, Correlation, Message, MessageType, Request, Response};

#[doc(inline)]
pub use properties::{IncomingProperties, MessageProperties, OutgoingMetadata, PropertyProvider};

#[doc(inline)]
pub use publisher::{PublishError, PublishErrorKind, Publisher};

#[doc(inline)]
pub use router::Router;

#[doc(inline)]
pub use source::{
    DefaultSourceHook, MergedSource, MessageSource, SourceError, SourceErrorKind, SourceHook,
    SourceItem, SourceOptions, SourceState,
};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
