//! Message contracts.
//!
//! Application messages implement [`Message`]. Requests and responses
//! additionally implement [`Request`] / [`Response`] and surface that through
//! [`Message::correlation`], which is how the publisher decides which
//! correlation fields to stamp on the outgoing envelope.
//!
//! A *logical* message type is any `'static` type, typically a trait object
//! such as `dyn Command`, that several concrete messages can be routed as.
//! The relation between concrete and logical types is declared at
//! configuration time (see [`crate::RouterConfig::member_of`]).

use std::any::{Any, TypeId};

/// Access to the concrete value behind a (possibly unsized) message.
///
/// Implemented for every `'static` type; it lets the routing layer recover
/// the concrete runtime type of a message passed as a trait object.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Base contract of every routable message.
pub trait Message: AsAny + Send + Sync + 'static {
    /// Human readable name of the concrete type, used in diagnostics.
    fn type_name(&self) -> &'static str {
        short_type_name::<Self>()
    }

    /// Correlation role of this message.
    fn correlation(&self) -> Correlation<'_> {
        Correlation::None
    }
}

/// A message expecting a [`Response`].
pub trait Request: Message {
    /// Identifier shared by the request and its responses. May be empty.
    fn request_id(&self) -> &str;

    /// Identifier of the requesting party. May be empty.
    fn requester_id(&self) -> &str;
}

/// A message answering a [`Request`].
pub trait Response: Message {
    fn request_id(&self) -> &str;

    fn requester_id(&self) -> &str;
}

/// Correlation role reported by [`Message::correlation`].
#[derive(Clone, Copy)]
pub enum Correlation<'a> {
    /// Commands and events.
    None,
    Request(&'a dyn Request),
    Response(&'a dyn Response),
}

/// Identity and declared name of a message type.
///
/// A `MessageType` can describe a concrete message or a logical contract
/// such as `dyn Command`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType {
    id: TypeId,
    name: &'static str,
}

impl MessageType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: short_type_name::<T>(),
        }
    }

    /// Same type identity, explicit declared name.
    pub fn named<T: ?Sized + 'static>(name: &'static str) -> Self {
        Self {
            id: TypeId::of::<T>(),
            name,
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Unqualified type name: `my_app::cmd::CreateUser` becomes `CreateUser`,
/// `dyn my_app::Command` becomes `Command`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head_end = full.find('<').unwrap_or(full.len());
    let (head, generics) = full.split_at(head_end);

    // Generic arguments keep their full path, only the outer name is trimmed.
    if !generics.is_empty() {
        return full;
    }

    head.rsplit("::").next().unwrap_or(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;
    impl Message for Ping {}

    trait Command: Message {}
    impl Command for Ping {}

    struct Lookup {
        id: String,
    }

    impl Message for Lookup {
        fn correlation(&self) -> Correlation<'_> {
            Correlation::Request(self)
        }
    }

    impl Request for Lookup {
        fn request_id(&self) -> &str {
            &self.id
        }

        fn requester_id(&self) -> &str {
            ""
        }
    }

    #[test]
    fn names_are_unqualified() {
        assert_eq!(MessageType::of::<Ping>().name(), "Ping");
        assert_eq!(MessageType::of::<dyn Command>().name(), "Command");
        assert_eq!(MessageType::named::<Ping>("PingV2").name(), "PingV2");
    }

    #[test]
    fn runtime_type_of_trait_object_is_the_concrete_type() {
        let boxed: Box<dyn Command> = Box::new(Ping);
        let concrete = AsAny::as_any(boxed.as_ref()).type_id();

        assert_eq!(concrete, TypeId::of::<Ping>());
        assert_ne!(concrete, TypeId::of::<dyn Command>());
        assert_eq!(boxed.type_name(), "Ping");
    }

    #[test]
    fn requests_report_their_correlation() {
        let lookup = Lookup { id: "r-1".into() };

        match lookup.correlation() {
            Correlation::Request(r) => assert_eq!(r.request_id(), "r-1"),
            _ => panic!("expected request correlation"),
        }
        assert!(matches!(Ping.correlation(), Correlation::None));
    }
}
