//! Side tables keyed by message identity.
//!
//! A received message does not carry its envelope; the envelope is looked up
//! by the address of the message instead. Entries hold a [`Weak`] reference
//! to the message, which never keeps the message alive but does keep its
//! allocation reserved, so an address cannot be reused by another message
//! while an entry for it exists. Entries of dropped messages are purged
//! periodically and whenever a source stops.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;

use crate::{TransportEnvelope, transport::LockSession};

const PURGE_INTERVAL: usize = 64;

/// Concurrent map from a live `Arc` allocation to a value.
pub(crate) struct IdentityMap<V> {
    entries: DashMap<usize, Entry<V>>,
    inserts: AtomicUsize,
}

struct Entry<V> {
    alive: Box<dyn Fn() -> bool + Send + Sync>,
    value: V,
}

impl<V> Default for IdentityMap<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            inserts: AtomicUsize::new(0),
        }
    }
}

impl<V: Clone> IdentityMap<V> {
    pub(crate) fn insert<L>(&self, object: &Arc<L>, value: V)
    where
        L: ?Sized + Send + Sync + 'static,
    {
        let weak: Weak<L> = Arc::downgrade(object);
        self.entries.insert(
            address(object.as_ref()),
            Entry {
                alive: Box::new(move || weak.strong_count() > 0),
                value,
            },
        );

        if self.inserts.fetch_add(1, Ordering::Relaxed) % PURGE_INTERVAL == PURGE_INTERVAL - 1 {
            self.purge();
        }
    }

    pub(crate) fn get<L: ?Sized>(&self, object: &L) -> Option<V> {
        self.entries
            .get(&address(object))
            .filter(|entry| (entry.alive)())
            .map(|entry| entry.value.clone())
    }

    pub(crate) fn remove<L: ?Sized>(&self, object: &L) -> Option<V> {
        self.entries
            .remove(&address(object))
            .map(|(_, entry)| entry.value)
    }

    /// Drop the entries of messages that no longer exist.
    pub(crate) fn purge(&self) {
        self.entries.retain(|_, entry| (entry.alive)());
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn address<L: ?Sized>(object: &L) -> usize {
    object as *const L as *const () as usize
}

/// Envelope a message was deserialized from, with what is needed to
/// settle it.
#[derive(Clone)]
pub(crate) struct Association {
    pub(crate) envelope: Arc<TransportEnvelope>,
    pub(crate) session: Option<Arc<dyn LockSession>>,
    /// Set once the delivery has been completed, abandoned or rejected.
    pub(crate) processed: Arc<tokio::sync::Mutex<bool>>,
}

impl Association {
    pub(crate) fn new(envelope: TransportEnvelope, session: Option<Arc<dyn LockSession>>) -> Self {
        Self {
            envelope: Arc::new(envelope),
            session,
            processed: Arc::new(tokio::sync::Mutex::new(false)),
        }
    }
}

pub(crate) type AssociationTable = IdentityMap<Association>;
