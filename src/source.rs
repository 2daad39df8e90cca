//! Inbound pipeline.
//!
//! A [`Source`] pulls envelopes from one receiver and turns them into
//! messages of a logical type `L`:
//!
//! - envelopes whose type tag is not in the deserializer set, or is not a
//!   string, are skipped
//! - untagged envelopes use the only deserializer, or fail as ambiguous
//! - every message is associated with its envelope before it is emitted
//!
//! The receive loop is started by the first call to
//! [`messages`](MessageSource::messages) and is shared by every subscriber.
//! It runs until the source is disposed, the receiver reports closed, or
//! the transport fails.
//!
//! When a logical type is backed by several entities, the router combines
//! their sources into a [`MergedSource`].

mod merged;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_core::stream::BoxStream;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    MessageTypeMapping, TransportEnvelope,
    association::{Association, AssociationTable},
    catalog::Deserializer,
    entity::{EntityError, EntityErrorKind},
    transport::{LockSession, Receiver, ToBytes, TransportError},
};

pub use merged::MergedSource;

/// Item produced by a message stream.
pub type SourceItem<L> = Result<Arc<L>, SourceError>;

/// Stream of messages of a logical type.
pub trait MessageSource<L: ?Sized>: Send + Sync {
    /// Subscribe to the messages of this source.
    ///
    /// The first subscription starts the receive loop; later subscriptions
    /// share it and see messages from the point they subscribe. Once the
    /// source is disposed, or its loop has stopped, the returned stream is
    /// empty.
    ///
    /// Must be called from within a Tokio runtime.
    fn messages(&self) -> BoxStream<'static, SourceItem<L>>;

    /// Stop the receive loop and release the receiver.
    fn dispose(&self);
}

/// Tuning of source receive loops.
#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    /// Capacity of each subscriber's buffer.
    pub channel_capacity: usize,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
        }
    }
}

impl SourceOptions {
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// Lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Streaming,
    /// The receiver reported closed.
    Completed,
    /// The transport failed.
    Faulted,
    Cancelled,
}

/// Source of one mapped entity.
///
/// Dropping the source disposes it.
pub struct Source<L: ?Sized> {
    shared: Arc<Shared<L>>,
}

struct Shared<L: ?Sized> {
    mapping: MessageTypeMapping,
    receiver: Arc<dyn Receiver>,
    session: Option<Arc<dyn LockSession>>,
    deserializers: HashMap<&'static str, Deserializer<L>>,
    associations: Arc<AssociationTable>,
    hook: Arc<dyn SourceHook>,
    options: SourceOptions,
    cancel: CancellationToken,
    state: Mutex<SourceState>,
    subscribers: Mutex<Vec<mpsc::Sender<SourceItem<L>>>>,
    subscribed: Notify,
}

impl<L> Source<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    /// Create an idle source.
    ///
    /// Fails with `NoDeserializers` when `deserializers` is empty.
    pub(crate) fn new(
        mapping: MessageTypeMapping,
        receiver: Arc<dyn Receiver>,
        deserializers: HashMap<&'static str, Deserializer<L>>,
        associations: Arc<AssociationTable>,
        hook: Arc<dyn SourceHook>,
        options: SourceOptions,
    ) -> Result<Self, EntityError> {
        if deserializers.is_empty() {
            return Err(EntityError::new(EntityErrorKind::NoDeserializers {
                message_type: mapping.message_type(),
                path: mapping.path().to_owned(),
            }));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                session: receiver.lock_session(),
                mapping,
                receiver,
                deserializers,
                associations,
                hook,
                options,
                cancel: CancellationToken::new(),
                state: Mutex::new(SourceState::Idle),
                subscribers: Mutex::new(Vec::new()),
                subscribed: Notify::new(),
            }),
        })
    }

    pub fn state(&self) -> SourceState {
        *lock(&self.shared.state)
    }

    pub fn mapping(&self) -> &MessageTypeMapping {
        &self.shared.mapping
    }
}

impl<L> MessageSource<L> for Source<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    fn messages(&self) -> BoxStream<'static, SourceItem<L>> {
        let (tx, rx) = mpsc::channel(self.shared.options.channel_capacity.max(1));

        {
            let mut state = lock(&self.shared.state);
            match *state {
                SourceState::Idle => {
                    *state = SourceState::Streaming;
                    lock(&self.shared.subscribers).push(tx);
                    tokio::spawn(receive_loop(self.shared.clone()));
                }
                SourceState::Streaming => {
                    lock(&self.shared.subscribers).push(tx);
                    self.shared.subscribed.notify_one();
                }
                SourceState::Completed | SourceState::Faulted | SourceState::Cancelled => {
                    return Box::pin(tokio_stream::empty());
                }
            }
        }

        Box::pin(ReceiverStream::new(rx))
    }

    fn dispose(&self) {
        self.shared.shutdown();
    }
}

impl<L: ?Sized> Drop for Source<L> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<L: ?Sized> Shared<L> {
    /// Cancel the receive loop. A running loop closes the receiver when it
    /// stops; an idle source closes it here.
    fn shutdown(&self) {
        self.cancel.cancel();

        let mut state = lock(&self.state);
        if *state != SourceState::Idle {
            return;
        }
        *state = SourceState::Cancelled;
        drop(state);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let receiver = self.receiver.clone();
            let hook = self.hook.clone();
            handle.spawn(async move {
                if let Err(err) = receiver.close().await {
                    hook.on_close_error(&err);
                }
            });
        }
    }
}

#[tracing::instrument(skip_all, fields(path = shared.mapping.path()))]
async fn receive_loop<L>(shared: Arc<Shared<L>>)
where
    L: ?Sized + Send + Sync + 'static,
{
    let path = shared.mapping.path();
    shared.hook.on_startup(path);

    let outcome = loop {
        if shared.cancel.is_cancelled() {
            break SourceState::Cancelled;
        }
        if shared.receiver.is_closed() {
            shared.hook.on_receiver_closed(path);
            break SourceState::Completed;
        }
        if !shared.has_subscribers() {
            tokio::select! {
                _ = shared.cancel.cancelled() => break SourceState::Cancelled,
                _ = shared.subscribed.notified() => continue,
            }
        }

        match shared.receiver.receive().await {
            Ok(Some(envelope)) => shared.dispatch(envelope).await,
            Ok(None) => {}
            Err(err) => {
                shared.hook.on_receive_error(&err);
                shared.broadcast(Err(SourceError::transport(err))).await;
                break SourceState::Faulted;
            }
        }
    };

    shared.finish(outcome).await;
}

impl<L> Shared<L>
where
    L: ?Sized + Send + Sync + 'static,
{
    fn has_subscribers(&self) -> bool {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| !tx.is_closed());
        !subscribers.is_empty()
    }

    async fn dispatch(&self, envelope: TransportEnvelope) {
        self.hook.on_envelope_received(&envelope);

        let (type_name, deserializer) = match envelope.headers.type_tag() {
            Some(tag) => match self.deserializers.get_key_value(tag) {
                Some((name, deserializer)) => (*name, deserializer),
                None => {
                    self.hook.on_envelope_skipped(&envelope);
                    return;
                }
            },
            None if envelope.headers.has_type_property() => {
                self.hook.on_envelope_skipped(&envelope);
                return;
            }
            None if self.deserializers.len() == 1 => match self.deserializers.iter().next() {
                Some((name, deserializer)) => (*name, deserializer),
                None => return,
            },
            None => {
                let mut candidates: Vec<_> = self.deserializers.keys().copied().collect();
                candidates.sort_unstable();
                let err = SourceError::new(SourceErrorKind::AmbiguousDeserialization { candidates });
                self.hook.on_message_error(&err);
                self.broadcast(Err(err)).await;
                return;
            }
        };

        match deserializer(envelope.message.to_bytes()) {
            Ok(message) => {
                self.associations
                    .insert(&message, Association::new(envelope, self.session.clone()));
                self.broadcast(Ok(message)).await;
            }
            Err(source) => {
                let err = SourceError::new(SourceErrorKind::Deserialization {
                    type_name: type_name.to_owned(),
                    source: Arc::from(source),
                });
                self.hook.on_message_error(&err);
                self.broadcast(Err(err)).await;
            }
        }
    }

    /// Deliver one item to every current subscriber, in subscription order.
    async fn broadcast(&self, item: SourceItem<L>) {
        let subscribers = lock(&self.subscribers).clone();

        for tx in subscribers {
            tokio::select! {
                _ = tx.send(item.clone()) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    async fn finish(&self, outcome: SourceState) {
        {
            let mut state = lock(&self.state);
            *state = outcome;
            lock(&self.subscribers).clear();
        }

        if let Err(err) = self.receiver.close().await {
            self.hook.on_close_error(&err);
        }
        self.associations.purge();

        tracing::debug!(
            state = ?outcome,
            associations = self.associations.len(),
            "Receive loop stopped",
        );
        self.hook.on_shutdown(self.mapping.path());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Error emitted by a message stream.
///
/// Per-envelope errors leave the stream running; a transport error is the
/// last item of its stream.
#[derive(Debug, Clone)]
pub struct SourceError {
    context: SpanTrace,
    kind: SourceErrorKind,
}

/// Source error kinds.
#[derive(Debug, Clone)]
pub enum SourceErrorKind {
    /// An untagged envelope arrived at a source with several deserializers.
    AmbiguousDeserialization { candidates: Vec<&'static str> },
    /// The codec rejected the payload.
    Deserialization {
        type_name: String,
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    /// The receiver failed.
    Transport(TransportError),
}

impl SourceError {
    fn new(kind: SourceErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn transport(err: TransportError) -> Self {
        Self::new(SourceErrorKind::Transport(err))
    }

    pub fn kind(&self) -> &SourceErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SourceErrorKind::AmbiguousDeserialization { candidates } => writeln!(
                f,
                "Ambiguous deserialization: envelope has no type name and {} deserializers are configured ({})",
                candidates.len(),
                candidates.join(", ")
            ),
            SourceErrorKind::Deserialization { type_name, source } => {
                writeln!(f, "Deserialization error for {type_name}: {source}")
            }
            SourceErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SourceErrorKind::AmbiguousDeserialization { .. } => None,
            SourceErrorKind::Deserialization { source, .. } => Some(source.as_ref()),
            SourceErrorKind::Transport(err) => Some(err),
        }
    }
}

/// Hook trait for observing source receive loops.
///
/// Hooks are invoked synchronously from the receive loop and should avoid
/// heavy or blocking work.
pub trait SourceHook: Send + Sync {
    fn on_startup(&self, path: &str);
    fn on_shutdown(&self, path: &str);
    fn on_envelope_received(&self, envelope: &TransportEnvelope);
    /// The envelope's type name is not handled by this source.
    fn on_envelope_skipped(&self, envelope: &TransportEnvelope);
    fn on_message_error(&self, error: &SourceError);
    fn on_receive_error(&self, error: &TransportError);
    fn on_receiver_closed(&self, path: &str);
    fn on_close_error(&self, error: &TransportError);
}

/// Default source hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultSourceHook;

impl SourceHook for DefaultSourceHook {
    fn on_startup(&self, path: &str) {
        tracing::info!(path, "Source is starting up");
    }

    fn on_shutdown(&self, path: &str) {
        tracing::info!(path, "Source is shutting down");
    }

    fn on_envelope_received(&self, envelope: &TransportEnvelope) {
        tracing::debug!(
            type_name = envelope.headers.type_tag(),
            delivery_count = envelope.headers.delivery_count,
            "Envelope received",
        );
    }

    fn on_envelope_skipped(&self, envelope: &TransportEnvelope) {
        tracing::debug!(
            type_name = envelope.headers.type_tag(),
            "Envelope skipped, no deserializer for its type",
        );
    }

    fn on_message_error(&self, error: &SourceError) {
        tracing::error!(?error, "Error processing envelope");
    }

    fn on_receive_error(&self, error: &TransportError) {
        tracing::error!(?error, "Error receiving envelope");
    }

    fn on_receiver_closed(&self, path: &str) {
        tracing::info!(path, "Receiver closed");
    }

    fn on_close_error(&self, error: &TransportError) {
        tracing::error!(?error, "Failed to close receiver");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{
        Headers, ReceiveMode,
        transport::{InMemory, RawPayload, TransportFactory},
    };

    #[derive(Debug, PartialEq)]
    pub(crate) struct Tick(pub(crate) u32);

    pub(crate) fn envelope(tag: Option<&str>, body: &str) -> TransportEnvelope {
        let mut headers = Headers::default();
        if let Some(tag) = tag {
            headers.set_type_tag(tag);
        }
        (headers, RawPayload::from(body.as_bytes().to_vec())).into()
    }

    pub(crate) fn tick_deserializer(calls: Arc<AtomicUsize>) -> Deserializer<Tick> {
        Arc::new(move |bytes: &[u8]| -> Result<Arc<Tick>, tower::BoxError> {
            calls.fetch_add(1, Ordering::SeqCst);
            let value = std::str::from_utf8(bytes)?.parse()?;
            Ok(Arc::new(Tick(value)))
        })
    }

    pub(crate) fn broker() -> InMemory {
        InMemory::with_receive_wait(Duration::from_millis(10))
    }

    fn source(
        broker: &InMemory,
        deserializers: HashMap<&'static str, Deserializer<Tick>>,
    ) -> Source<Tick> {
        let mapping = MessageTypeMapping::queue::<Tick>("ticks")
            .with_receive_mode(ReceiveMode::PeekLock);
        let receiver = broker.create_receiver(&mapping).unwrap();

        Source::new(
            mapping,
            receiver,
            deserializers,
            Arc::new(AssociationTable::default()),
            Arc::new(DefaultSourceHook),
            SourceOptions::default(),
        )
        .unwrap()
    }

    async fn next<S>(stream: &mut S) -> Option<S::Item>
    where
        S: tokio_stream::Stream + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("stream stalled")
    }

    #[tokio::test]
    async fn delivers_envelopes_in_receipt_order() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls.clone()))]));

        for i in 0..5 {
            broker.send_raw("ticks", envelope(Some("Tick"), &i.to_string())).await;
        }

        let mut stream = source.messages();
        let mut values = Vec::new();
        for _ in 0..5 {
            values.push(next(&mut stream).await.unwrap().unwrap().0);
        }

        assert_eq!(values, vec![0, 1, 2, 3, 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(source.state(), SourceState::Streaming);
    }

    #[tokio::test]
    async fn unrecognized_type_names_are_skipped_without_deserializing() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls.clone()))]));

        broker.send_raw("ticks", envelope(Some("Tock"), "1")).await;
        broker.send_raw("ticks", envelope(Some("Tick"), "2")).await;

        let mut stream = source.messages();

        assert_eq!(next(&mut stream).await.unwrap().unwrap().0, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_string_type_names_are_skipped() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls.clone()))]));

        let mut malformed = envelope(None, "1");
        malformed.headers.properties.push(crate::TYPE_NAME_PROPERTY, 42);
        broker.send_raw("ticks", malformed).await;
        broker.send_raw("ticks", envelope(Some("Tick"), "2")).await;

        let mut stream = source.messages();

        assert_eq!(next(&mut stream).await.unwrap().unwrap().0, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn untagged_envelopes_use_the_only_deserializer() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls))]));

        broker.send_raw("ticks", envelope(None, "9")).await;

        let mut stream = source.messages();

        assert_eq!(next(&mut stream).await.unwrap().unwrap().0, 9);
    }

    #[tokio::test]
    async fn untagged_envelopes_are_ambiguous_with_several_deserializers() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(
            &broker,
            HashMap::from([
                ("Tick", tick_deserializer(calls.clone())),
                ("TickV2", tick_deserializer(calls.clone())),
            ]),
        );

        broker.send_raw("ticks", envelope(None, "1")).await;
        broker.send_raw("ticks", envelope(Some("TickV2"), "2")).await;

        let mut stream = source.messages();

        let err = next(&mut stream).await.unwrap().unwrap_err();
        match err.kind() {
            SourceErrorKind::AmbiguousDeserialization { candidates } => {
                assert_eq!(candidates, &vec!["Tick", "TickV2"]);
            }
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(next(&mut stream).await.unwrap().unwrap().0, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deserialization_errors_do_not_end_the_stream() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls))]));

        broker.send_raw("ticks", envelope(Some("Tick"), "not a number")).await;
        broker.send_raw("ticks", envelope(Some("Tick"), "3")).await;

        let mut stream = source.messages();

        assert!(matches!(
            next(&mut stream).await.unwrap().unwrap_err().kind(),
            SourceErrorKind::Deserialization { .. }
        ));
        assert_eq!(next(&mut stream).await.unwrap().unwrap().0, 3);
    }

    #[tokio::test]
    async fn subscribers_share_one_receive_loop() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls.clone()))]));

        let mut first = source.messages();
        let mut second = source.messages();

        broker.send_raw("ticks", envelope(Some("Tick"), "1")).await;

        let a = next(&mut first).await.unwrap().unwrap();
        let b = next(&mut second).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(source.shared.associations.get(a.as_ref()).is_some());
    }

    #[tokio::test]
    async fn disposed_sources_are_cold() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls))]));

        let mut stream = source.messages();
        source.dispose();

        assert!(next(&mut stream).await.is_none());
        assert_eq!(source.state(), SourceState::Cancelled);

        broker.send_raw("ticks", envelope(Some("Tick"), "1")).await;
        let mut again = source.messages();
        assert!(next(&mut again).await.is_none());
    }

    #[tokio::test]
    async fn closed_receiver_completes_the_stream() {
        let broker = broker();
        let calls = Arc::new(AtomicUsize::new(0));
        let source = source(&broker, HashMap::from([("Tick", tick_deserializer(calls))]));

        let mut stream = source.messages();
        broker.close_entity("ticks");

        assert!(next(&mut stream).await.is_none());
        assert_eq!(source.state(), SourceState::Completed);
    }

    struct Failing;

    #[async_trait::async_trait]
    impl Receiver for Failing {
        async fn receive(&self) -> Result<Option<TransportEnvelope>, TransportError> {
            Err(TransportError::receiver("connection lost"))
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn lock_session(&self) -> Option<Arc<dyn LockSession>> {
            None
        }
    }

    #[tokio::test]
    async fn transport_failure_faults_the_stream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let source = Source::new(
            MessageTypeMapping::queue::<Tick>("ticks"),
            Arc::new(Failing),
            HashMap::from([("Tick", tick_deserializer(calls))]),
            Arc::new(AssociationTable::default()),
            Arc::new(DefaultSourceHook),
            SourceOptions::default(),
        )
        .unwrap();

        let mut stream = source.messages();

        assert!(matches!(
            next(&mut stream).await.unwrap().unwrap_err().kind(),
            SourceErrorKind::Transport(_)
        ));
        assert!(next(&mut stream).await.is_none());
        assert_eq!(source.state(), SourceState::Faulted);
    }

    /// Receiver that never yields, counting receive and close calls.
    #[derive(Default)]
    struct Counting {
        receives: AtomicUsize,
        closes: AtomicUsize,
    }

    impl Counting {
        fn receives(&self) -> usize {
            self.receives.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Receiver for Counting {
        async fn receive(&self) -> Result<Option<TransportEnvelope>, TransportError> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(None)
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn lock_session(&self) -> Option<Arc<dyn LockSession>> {
            None
        }
    }

    fn counting_source(receiver: &Arc<Counting>) -> Source<Tick> {
        Source::new(
            MessageTypeMapping::queue::<Tick>("ticks"),
            receiver.clone(),
            HashMap::from([("Tick", tick_deserializer(Arc::new(AtomicUsize::new(0))))]),
            Arc::new(AssociationTable::default()),
            Arc::new(DefaultSourceHook),
            SourceOptions::default(),
        )
        .unwrap()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn receive_loop_idles_without_subscribers() {
        let receiver = Arc::new(Counting::default());
        let source = counting_source(&receiver);

        let stream = source.messages();
        settle().await;
        assert!(receiver.receives() > 0);

        drop(stream);
        settle().await;
        let idle_from = receiver.receives();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(receiver.receives(), idle_from);
        assert_eq!(source.state(), SourceState::Streaming);

        let _again = source.messages();
        settle().await;
        assert!(receiver.receives() > idle_from);
    }

    #[tokio::test]
    async fn disposing_an_idle_source_closes_the_receiver_once() {
        let receiver = Arc::new(Counting::default());
        let source = counting_source(&receiver);

        source.dispose();
        settle().await;
        drop(source);
        settle().await;

        assert_eq!(receiver.receives(), 0);
        assert_eq!(receiver.closes(), 1);
    }

    #[tokio::test]
    async fn disposing_a_streaming_source_closes_the_receiver_once() {
        let receiver = Arc::new(Counting::default());
        let source = counting_source(&receiver);

        let mut stream = source.messages();
        settle().await;
        source.dispose();

        assert!(next(&mut stream).await.is_none());
        assert_eq!(source.state(), SourceState::Cancelled);
        drop(source);
        settle().await;

        assert_eq!(receiver.closes(), 1);
    }

    #[tokio::test]
    async fn dropping_an_idle_source_closes_the_receiver() {
        let receiver = Arc::new(Counting::default());
        drop(counting_source(&receiver));
        settle().await;

        assert_eq!(receiver.closes(), 1);
    }

    #[test]
    fn sources_need_a_deserializer() {
        let broker = broker();
        let mapping = MessageTypeMapping::queue::<Tick>("ticks");
        let receiver = broker.create_receiver(&mapping).unwrap();

        let result = Source::<Tick>::new(
            mapping,
            receiver,
            HashMap::new(),
            Arc::new(AssociationTable::default()),
            Arc::new(DefaultSourceHook),
            SourceOptions::default(),
        );

        assert!(matches!(
            result.err().unwrap().kind(),
            EntityErrorKind::NoDeserializers { .. }
        ));
    }
}
