use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        Arc, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, Notify};

use crate::{
    EntityKind, LockToken, MessageTypeMapping, ReceiveMode, TransportEnvelope,
    mapping::subscription_path,
    transport::{EntityManager, LockSession, Receiver, Sender, TransportError, TransportFactory},
};

/// In-memory broker for testing or local pipelines.
///
/// Models the entity kinds the routing layer targets:
///
/// - queues, consumed by a single receiver pool
/// - topics, which copy every message into each of their subscriptions
/// - subscriptions, addressed as `topic/subscriptions/name`
///
/// Receivers honour [`ReceiveMode`]: peek-locked deliveries stay locked
/// until they are completed, abandoned (and redelivered) or dead-lettered.
///
/// Cloning is cheap; clones share the same broker state.
#[derive(Clone)]
pub struct InMemory {
    broker: Arc<Broker>,
}

struct Broker {
    entities: std::sync::Mutex<Entities>,
    receive_wait: Duration,
    next_lock: AtomicU64,
}

#[derive(Default)]
struct Entities {
    /// Queues and subscriptions, keyed by full path.
    queues: HashMap<String, Arc<EntityQueue>>,
    /// Topic path to subscription names.
    topics: HashMap<String, BTreeSet<String>>,
    /// Every envelope sent to a path, in order.
    sent: HashMap<String, Vec<TransportEnvelope>>,
}

#[derive(Default)]
struct EntityQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<TransportEnvelope>,
    locked: HashMap<LockToken, TransportEnvelope>,
    dead_letters: Vec<TransportEnvelope>,
}

impl Default for InMemory {
    /// Create a new empty broker with a one second receive wait window.
    fn default() -> Self {
        Self::with_receive_wait(Duration::from_secs(1))
    }
}

impl InMemory {
    /// Create a broker whose receivers wait at most `wait` for a message
    /// before returning an empty receive.
    pub fn with_receive_wait(wait: Duration) -> Self {
        Self {
            broker: Arc::new(Broker {
                entities: std::sync::Mutex::new(Entities::default()),
                receive_wait: wait,
                next_lock: AtomicU64::new(1),
            }),
        }
    }

    /// Deliver an envelope to a queue or topic as an external producer would.
    pub async fn send_raw(&self, path: &str, envelope: TransportEnvelope) {
        self.deliver(path, envelope).await;
    }

    /// All envelopes sent to `path` so far.
    pub fn sent_messages(&self, path: &str) -> Vec<TransportEnvelope> {
        self.entities().sent.get(path).cloned().unwrap_or_default()
    }

    /// Number of envelopes waiting to be received from a queue or subscription.
    pub async fn pending(&self, path: &str) -> usize {
        self.queue(path).state.lock().await.ready.len()
    }

    /// Dead-lettered envelopes of a queue or subscription.
    pub async fn dead_letters(&self, path: &str) -> Vec<TransportEnvelope> {
        self.queue(path).state.lock().await.dead_letters.clone()
    }

    /// Close a queue or subscription; its receivers report closed.
    pub fn close_entity(&self, path: &str) {
        let queue = self.queue(path);
        queue.closed.store(true, Ordering::SeqCst);
        queue.notify.notify_waiters();
    }

    fn entities(&self) -> std::sync::MutexGuard<'_, Entities> {
        self.broker
            .entities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, path: &str) -> Arc<EntityQueue> {
        self.entities()
            .queues
            .entry(path.to_owned())
            .or_default()
            .clone()
    }

    fn register_subscription(&self, topic: &str, name: &str) -> Arc<EntityQueue> {
        let mut entities = self.entities();
        entities
            .topics
            .entry(topic.to_owned())
            .or_default()
            .insert(name.to_owned());
        entities
            .queues
            .entry(subscription_path(topic, name))
            .or_default()
            .clone()
    }

    async fn deliver(&self, path: &str, envelope: TransportEnvelope) {
        let targets: Vec<Arc<EntityQueue>> = {
            let mut entities = self.entities();
            entities
                .sent
                .entry(path.to_owned())
                .or_default()
                .push(envelope.clone());

            let subscriptions: Option<Vec<String>> = entities.topics.get(path).map(|names| {
                names
                    .iter()
                    .map(|name| subscription_path(path, name))
                    .collect()
            });

            match subscriptions {
                Some(paths) => paths
                    .into_iter()
                    .map(|sub| entities.queues.entry(sub).or_default().clone())
                    .collect(),
                None => vec![entities.queues.entry(path.to_owned()).or_default().clone()],
            }
        };

        for queue in targets {
            queue.state.lock().await.ready.push_back(envelope.clone());
            queue.notify.notify_waiters();
        }
    }
}

impl TransportFactory for InMemory {
    fn create_sender(&self, mapping: &MessageTypeMapping) -> Result<Arc<dyn Sender>, TransportError> {
        match mapping.entity_kind() {
            EntityKind::Queue => {
                self.queue(mapping.path());
            }
            EntityKind::Topic => {
                self.entities()
                    .topics
                    .entry(mapping.path().to_owned())
                    .or_default();
            }
            EntityKind::Subscription => {
                return Err(TransportError::sender(format!(
                    "cannot send to subscription {}",
                    mapping.path()
                )));
            }
        }

        Ok(Arc::new(InMemorySender {
            broker: self.clone(),
            path: mapping.path().to_owned(),
        }))
    }

    fn create_receiver(
        &self,
        mapping: &MessageTypeMapping,
    ) -> Result<Arc<dyn Receiver>, TransportError> {
        let queue = match mapping.entity_kind() {
            EntityKind::Queue => self.queue(mapping.path()),
            EntityKind::Subscription => {
                let Some((topic, name)) = mapping.subscription_parts() else {
                    return Err(TransportError::receiver(format!(
                        "malformed subscription path {}",
                        mapping.path()
                    )));
                };
                self.register_subscription(topic, name)
            }
            EntityKind::Topic => {
                return Err(TransportError::receiver(format!(
                    "cannot receive from topic {}; use a subscription",
                    mapping.path()
                )));
            }
        };

        Ok(Arc::new(InMemoryReceiver {
            broker: self.clone(),
            queue,
            mode: mapping.receive_mode(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait::async_trait]
impl EntityManager for InMemory {
    async fn queue_exists(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self.entities().queues.contains_key(path))
    }

    async fn create_queue(&self, path: &str) -> Result<(), TransportError> {
        self.queue(path);
        Ok(())
    }

    async fn topic_exists(&self, path: &str) -> Result<bool, TransportError> {
        Ok(self.entities().topics.contains_key(path))
    }

    async fn create_topic(&self, path: &str) -> Result<(), TransportError> {
        self.entities().topics.entry(path.to_owned()).or_default();
        Ok(())
    }

    async fn subscription_exists(&self, topic: &str, name: &str) -> Result<bool, TransportError> {
        Ok(self
            .entities()
            .topics
            .get(topic)
            .is_some_and(|subs| subs.contains(name)))
    }

    async fn create_subscription(&self, topic: &str, name: &str) -> Result<(), TransportError> {
        self.register_subscription(topic, name);
        Ok(())
    }
}

struct InMemorySender {
    broker: InMemory,
    path: String,
}

#[async_trait::async_trait]
impl Sender for InMemorySender {
    /// "Send" a message by appending it to the target entity.
    #[tracing::instrument(skip_all, fields(path = %self.path))]
    async fn send(&self, envelope: TransportEnvelope) -> Result<(), TransportError> {
        tracing::info!(
            headers = ?envelope.headers,
            "Message sent to in-memory entity",
        );
        self.broker.deliver(&self.path, envelope).await;
        Ok(())
    }
}

struct InMemoryReceiver {
    broker: InMemory,
    queue: Arc<EntityQueue>,
    mode: ReceiveMode,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Receiver for InMemoryReceiver {
    async fn receive(&self) -> Result<Option<TransportEnvelope>, TransportError> {
        let deadline = tokio::time::Instant::now() + self.broker.broker.receive_wait;

        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(envelope) = self.take().await {
                return Ok(Some(envelope));
            }
            if self.is_closed() {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.queue.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn lock_session(&self) -> Option<Arc<dyn LockSession>> {
        match self.mode {
            ReceiveMode::PeekLock => Some(Arc::new(InMemoryLockSession {
                queue: self.queue.clone(),
            })),
            ReceiveMode::ReceiveAndDelete => None,
        }
    }
}

impl InMemoryReceiver {
    async fn take(&self) -> Option<TransportEnvelope> {
        let mut state = self.queue.state.lock().await;
        let mut envelope = state.ready.pop_front()?;
        envelope.headers.delivery_count += 1;

        if self.mode == ReceiveMode::PeekLock {
            let id = self.broker.broker.next_lock.fetch_add(1, Ordering::Relaxed);
            let token = LockToken(format!("lock-{id}"));
            envelope.headers.lock_token = Some(token.clone());
            state.locked.insert(token, envelope.clone());
        }

        Some(envelope)
    }
}

struct InMemoryLockSession {
    queue: Arc<EntityQueue>,
}

impl InMemoryLockSession {
    async fn release(&self, token: &LockToken) -> Result<TransportEnvelope, TransportError> {
        self.queue
            .state
            .lock()
            .await
            .locked
            .remove(token)
            .ok_or_else(|| TransportError::lock(format!("lock {token} is not held")))
    }
}

#[async_trait::async_trait]
impl LockSession for InMemoryLockSession {
    async fn complete(&self, token: &LockToken) -> Result<(), TransportError> {
        self.release(token).await.map(|_| ())
    }

    async fn abandon(&self, token: &LockToken) -> Result<(), TransportError> {
        let mut envelope = self.release(token).await?;
        envelope.headers.lock_token = None;
        self.queue.state.lock().await.ready.push_front(envelope);
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        token: &LockToken,
        reason_code: &str,
        description: &str,
    ) -> Result<(), TransportError> {
        let mut envelope = self.release(token).await?;
        envelope.headers.lock_token = None;
        envelope.headers.properties.push("DeadLetterReason", reason_code);
        envelope
            .headers
            .properties
            .push("DeadLetterErrorDescription", description);
        self.queue.state.lock().await.dead_letters.push(envelope);
        Ok(())
    }

    async fn renew_lock(&self, token: &LockToken) -> Result<(), TransportError> {
        if self.queue.state.lock().await.locked.contains_key(token) {
            Ok(())
        } else {
            Err(TransportError::lock(format!("lock {token} is not held")))
        }
    }
}
