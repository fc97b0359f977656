//! In-process transport.
//!
//! Routes emitted events to the subscriptions whose filters match them and
//! multicasts each routed event to every attached handler. Events can be
//! delivered synchronously on the caller's thread or queued to a dispatch
//! worker, which is how a real connection hands events over.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::config::CorrelatorConfig;
use crate::error::{CorrResult, CorrelatorError, TransportError};
use crate::target::{Coordinates, SubscriptionFilter};

use super::{EventHandler, EventPayload, HandlerId, SubscriptionId, Transport, TransportEvent};

#[derive(Debug)]
struct Routed {
    source: Coordinates,
    payload: EventPayload,
}

#[derive(Default)]
struct Shared {
    handlers: RwLock<HashMap<HandlerId, EventHandler>>,
    subscriptions: Mutex<HashMap<SubscriptionId, Vec<SubscriptionFilter>>>,
    subscribe_calls: AtomicU64,
    unsubscribe_calls: AtomicU64,
    delivered: AtomicU64,
    fail_subscribe: AtomicBool,
}

impl Shared {
    fn deliver(&self, event: &TransportEvent) -> usize {
        // Invoke outside the lock so handlers may attach or detach handlers.
        let handlers: Vec<EventHandler> = self.handlers.read().values().cloned().collect();
        for handler in &handlers {
            handler(event);
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        handlers.len()
    }

    fn emit(&self, source: &Coordinates, payload: &EventPayload) -> usize {
        let matching: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|(_, filters)| filters.iter().all(|f| f.matches(source)))
            .map(|(id, _)| *id)
            .collect();

        for id in &matching {
            let event = TransportEvent::new(*id, source.clone(), payload.clone());
            trace!(subscription = %id, source = %source, "routing event");
            self.deliver(&event);
        }
        matching.len()
    }
}

/// Thread-safe in-memory [`Transport`].
pub struct InMemoryTransport {
    shared: Arc<Shared>,
    publish_tx: Option<Sender<Routed>>,
    dropped_events: Arc<AtomicU64>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("handlers", &self.handler_count())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    /// Transport without a dispatch worker; only synchronous delivery.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            publish_tx: None,
            dropped_events: Arc::new(AtomicU64::new(0)),
            join: Mutex::new(None),
        }
    }

    /// Transport with a dispatch worker thread fed by a bounded queue.
    pub fn with_dispatcher(queue_capacity: usize) -> CorrResult<Self> {
        let shared = Arc::new(Shared::default());
        let (publish_tx, publish_rx) = bounded::<Routed>(queue_capacity.max(1));

        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("keywait-dispatch".to_string())
            .spawn(move || worker_loop(&thread_shared, &publish_rx))
            .map_err(|e| {
                CorrelatorError::internal(format!("failed to spawn dispatch worker: {e}"))
            })?;

        Ok(Self {
            shared,
            publish_tx: Some(publish_tx),
            dropped_events: Arc::new(AtomicU64::new(0)),
            join: Mutex::new(Some(join)),
        })
    }

    /// Transport with a dispatch worker sized by `cfg.dispatch_queue_capacity`.
    pub fn from_config(cfg: &CorrelatorConfig) -> CorrResult<Self> {
        Self::with_dispatcher(cfg.dispatch_queue_capacity)
    }

    /// Delivers `event` to every attached handler on the calling thread.
    /// Returns the number of handlers invoked.
    pub fn deliver(&self, event: &TransportEvent) -> usize {
        self.shared.deliver(event)
    }

    /// Delivers one event per subscription whose filters match `source`, each
    /// attributed to that subscription. Returns the number of subscriptions hit.
    pub fn emit(&self, source: &Coordinates, payload: &EventPayload) -> usize {
        self.shared.emit(source, payload)
    }

    /// Queues an emission for the dispatch worker without blocking.
    ///
    /// Without a worker, or when the queue is full, the emission is dropped
    /// and counted.
    pub fn publish(&self, source: Coordinates, payload: EventPayload) {
        let Some(tx) = &self.publish_tx else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match tx.try_send(Routed { source, payload }) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Makes subsequent `subscribe` calls fail.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.shared.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.read().len()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    #[must_use]
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.shared.subscriptions.lock().contains_key(&id)
    }

    #[must_use]
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.shared.subscriptions.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> u64 {
        self.shared.subscribe_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn unsubscribe_calls(&self) -> u64 {
        self.shared.unsubscribe_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn delivered_events(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }
}

impl Transport for InMemoryTransport {
    fn subscribe(&self, id: SubscriptionId, filters: &[SubscriptionFilter]) -> CorrResult<()> {
        self.shared.subscribe_calls.fetch_add(1, Ordering::Relaxed);
        if self.shared.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::SubscribeFailed {
                id,
                message: "transport refused subscription".to_string(),
            }
            .into());
        }
        debug!(subscription = %id, filters = filters.len(), "subscribe");
        self.shared.subscriptions.lock().insert(id, filters.to_vec());
        Ok(())
    }

    fn unsubscribe(&self, id: SubscriptionId) -> CorrResult<()> {
        self.shared.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);
        debug!(subscription = %id, "unsubscribe");
        if self.shared.subscriptions.lock().remove(&id).is_none() {
            return Err(TransportError::UnsubscribeFailed {
                id,
                message: "unknown subscription".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn add_handler(&self, handler: EventHandler) -> HandlerId {
        let id = HandlerId::new();
        self.shared.handlers.write().insert(id, handler);
        id
    }

    fn remove_handler(&self, id: HandlerId) -> bool {
        self.shared.handlers.write().remove(&id).is_some()
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        // Closing the queue ends the worker once it has drained.
        drop(self.publish_tx.take());
        let Some(handle) = self.join.lock().take() else {
            return;
        };
        // The last reference can be released by a handler on the worker itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("dispatch worker panicked");
        }
    }
}

fn worker_loop(shared: &Shared, publish_rx: &Receiver<Routed>) {
    for routed in publish_rx {
        shared.emit(&routed.source, &routed.payload);
    }
}
