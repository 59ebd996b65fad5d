use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use orbit_types::events::ChangeEvent;
use orbit_types::models::Collection;

pub const DEFAULT_CHANGE_BUFFER: usize = 1024;

/// Fans collection changes out to every live subscription.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every live subscription holds a receiver; a lagging one just re-evaluates.
    changes_tx: broadcast::Sender<ChangeEvent>,

    /// Registered, not yet released subscriptions.
    live: AtomicUsize,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (changes_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                changes_tx,
                live: AtomicUsize::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.changes_tx.subscribe()
    }

    /// Announce that documents in `collection` were written.
    pub fn publish(&self, collection: Collection) {
        // No receivers just means nobody is watching.
        let receivers = self.inner.changes_tx.send(ChangeEvent { collection }).unwrap_or(0);
        trace!("change in {} published to {} receivers", collection, receivers);
    }

    pub fn publish_all(&self, collections: &[Collection]) {
        for collection in collections {
            self.publish(*collection);
        }
    }

    pub fn live_subscriptions(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    pub(crate) fn track(&self) {
        self.inner.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn untrack(&self) {
        self.inner.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_BUFFER)
    }
}
