//! Subscription registry.
//!
//! Owns every transport subscription and every handler the correlation layer
//! attaches to the event feed. Identical filter sets requested with
//! [`Sharing::Shared`] are reference-counted onto a single transport
//! subscription.
//!
//! Lifecycle of a subscription:
//!
//! ```text
//! Unregistered --acquire--> Registered --last graceful release--> Draining
//!      ^                        ^                                    |
//!      |                        +-------------acquire----------------+
//!      +------------------last forced release / grace elapsed--------+
//! ```
//!
//! Some transports treat a feed with zero handlers as an error. When a
//! graceful detach would remove the last handler, the registry first attaches
//! an inert keeper handler and removes it only after the grace delay, once
//! in-flight deliveries had time to land.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{CorrelatorConfig, Sharing};
use crate::error::{CorrResult, CorrelatorError};
use crate::target::{filter_fingerprint, SubscriptionFilter};
use crate::transport::{EventHandler, HandlerId, SubscriptionId, Transport, TransportEvent};

/// Registration state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Not known to the transport.
    Unregistered,
    /// Registered and referenced by at least one monitor.
    Registered,
    /// Unreferenced; waiting out the grace delay before unregistering.
    Draining,
}

/// A counted reference to a subscription, handed back on release.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionLease {
    id: SubscriptionId,
}

impl SubscriptionLease {
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }
}

#[derive(Debug)]
struct SubscriptionEntry {
    fingerprint: Option<String>,
    refs: usize,
    state: SubscriptionState,
}

#[derive(Debug, Default)]
struct RegistryState {
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
    shared: HashMap<String, SubscriptionId>,
    handlers: HashSet<HandlerId>,
    keeper: Option<HandlerId>,
    keeper_epoch: u64,
}

/// Reference-counted owner of transport subscriptions and feed handlers.
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    drain_grace: Duration,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("drain_grace", &self.drain_grace)
            .field("subscriptions", &state.subscriptions.len())
            .field("handlers", &state.handlers.len())
            .field("keeper", &state.keeper.is_some())
            .finish()
    }
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, cfg: &CorrelatorConfig) -> Self {
        Self {
            transport,
            drain_grace: cfg.drain_grace,
            state: Mutex::new(RegistryState::default()),
        }
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Obtains a reference to a subscription for `filters`, registering one
    /// with the transport unless a shared one already exists.
    pub fn acquire(
        &self,
        filters: &[SubscriptionFilter],
        sharing: Sharing,
    ) -> CorrResult<SubscriptionLease> {
        let mut state = self.state.lock();

        let fingerprint = match sharing {
            Sharing::Shared => Some(filter_fingerprint(filters)),
            Sharing::Exclusive => None,
        };

        if let Some(fp) = &fingerprint {
            if let Some(id) = state.shared.get(fp).copied() {
                if let Some(entry) = state.subscriptions.get_mut(&id) {
                    entry.refs += 1;
                    if entry.state == SubscriptionState::Draining {
                        debug!(subscription = %id, "draining subscription reacquired");
                        entry.state = SubscriptionState::Registered;
                    }
                    return Ok(SubscriptionLease { id });
                }
            }
        }

        let id = SubscriptionId::new();
        self.transport.subscribe(id, filters)?;
        debug!(subscription = %id, shared = fingerprint.is_some(), "subscription registered");

        if let Some(fp) = &fingerprint {
            state.shared.insert(fp.clone(), id);
        }
        state.subscriptions.insert(
            id,
            SubscriptionEntry {
                fingerprint,
                refs: 1,
                state: SubscriptionState::Registered,
            },
        );
        Ok(SubscriptionLease { id })
    }

    /// Attaches a handler to the transport's event feed.
    pub fn attach(&self, handler: EventHandler) -> HandlerId {
        let mut state = self.state.lock();
        let id = self.transport.add_handler(handler);
        state.handlers.insert(id);
        id
    }

    /// Detaches `handler` and releases `lease`.
    ///
    /// A forced detach releases everything immediately. A graceful detach
    /// guards against a zero-handler feed and waits out the grace delay
    /// before unregistering an unreferenced subscription.
    pub fn detach(
        &self,
        handler: HandlerId,
        lease: SubscriptionLease,
        force: bool,
    ) -> CorrResult<()> {
        self.detach_all(vec![(handler, lease)], force)
    }

    /// Detaches a batch of handlers and releases their leases together.
    ///
    /// A graceful batch installs at most one keeper and waits out a single
    /// grace delay for all of its subscriptions. Every pair is processed even
    /// when one fails; the first error is returned.
    pub fn detach_all(
        &self,
        detached: Vec<(HandlerId, SubscriptionLease)>,
        force: bool,
    ) -> CorrResult<()> {
        if detached.is_empty() {
            return Ok(());
        }

        let (released, ids, epoch) = {
            let mut state = self.state.lock();

            let mut epoch = None;
            let empties_feed = !state.handlers.is_empty()
                && state
                    .handlers
                    .iter()
                    .all(|h| detached.iter().any(|(d, _)| d == h));
            if !force && empties_feed {
                if state.keeper.is_none() {
                    let keeper: EventHandler = Arc::new(|_event: &TransportEvent| {});
                    state.keeper = Some(self.transport.add_handler(keeper));
                    debug!("keeper handler installed");
                }
                state.keeper_epoch += 1;
                epoch = Some(state.keeper_epoch);
            }

            let mut released = Ok(());
            let mut ids = Vec::with_capacity(detached.len());
            for (handler, lease) in detached {
                state.handlers.remove(&handler);
                self.transport.remove_handler(handler);
                released = released.and(self.release_locked(&mut state, lease.id, force));
                ids.push(lease.id);
            }
            (released, ids, epoch)
        };

        if force {
            return released;
        }

        thread::sleep(self.drain_grace);

        let mut state = self.state.lock();
        let mut finalized = Ok(());
        for id in ids {
            finalized = finalized.and(self.finalize_draining(&mut state, id));
        }
        if epoch.is_some_and(|e| e == state.keeper_epoch) {
            if let Some(keeper) = state.keeper.take() {
                self.transport.remove_handler(keeper);
                debug!("keeper handler removed");
            }
        }
        released.and(finalized)
    }

    fn release_locked(
        &self,
        state: &mut RegistryState,
        id: SubscriptionId,
        force: bool,
    ) -> CorrResult<()> {
        let Some(entry) = state.subscriptions.get_mut(&id) else {
            return Err(CorrelatorError::internal(format!(
                "released lease for unknown subscription {id}"
            )));
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return Ok(());
        }

        if force {
            entry.state = SubscriptionState::Draining;
            self.finalize_draining(state, id)
        } else {
            entry.state = SubscriptionState::Draining;
            debug!(subscription = %id, "subscription draining");
            Ok(())
        }
    }

    /// Unregisters `id` if it is still draining and unreferenced.
    fn finalize_draining(&self, state: &mut RegistryState, id: SubscriptionId) -> CorrResult<()> {
        let still_draining = state
            .subscriptions
            .get(&id)
            .is_some_and(|e| e.state == SubscriptionState::Draining && e.refs == 0);
        if !still_draining {
            return Ok(());
        }

        if let Some(entry) = state.subscriptions.remove(&id) {
            if let Some(fp) = entry.fingerprint {
                if state.shared.get(&fp) == Some(&id) {
                    state.shared.remove(&fp);
                }
            }
        }

        debug!(subscription = %id, "subscription unregistered");
        self.transport.unsubscribe(id).map_err(|e| {
            warn!(subscription = %id, error = %e, "transport failed to unsubscribe");
            e
        })
    }

    /// Current state of a subscription; unknown ids are `Unregistered`.
    #[must_use]
    pub fn state_of(&self, id: SubscriptionId) -> SubscriptionState {
        self.state
            .lock()
            .subscriptions
            .get(&id)
            .map_or(SubscriptionState::Unregistered, |e| e.state)
    }

    #[must_use]
    pub fn ref_count(&self, id: SubscriptionId) -> usize {
        self.state.lock().subscriptions.get(&id).map_or(0, |e| e.refs)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Handlers attached through this registry, not counting the keeper.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    #[must_use]
    pub fn keeper_installed(&self) -> bool {
        self.state.lock().keeper.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use crate::transport::InMemoryTransport;

    fn registry(grace_ms: u64) -> (Arc<InMemoryTransport>, SubscriptionRegistry) {
        let transport = Arc::new(InMemoryTransport::new());
        let cfg = CorrelatorConfig {
            drain_grace: Duration::from_millis(grace_ms),
            ..CorrelatorConfig::default()
        };
        let registry =
            SubscriptionRegistry::new(Arc::clone(&transport) as Arc<dyn Transport>, &cfg);
        (transport, registry)
    }

    fn filters() -> Vec<SubscriptionFilter> {
        vec![
            SubscriptionFilter::Element { agent: 1, element: 2 },
            SubscriptionFilter::Parameter { parameter: 3 },
        ]
    }

    fn noop() -> EventHandler {
        Arc::new(|_event: &TransportEvent| {})
    }

    #[test]
    fn shared_filters_reuse_one_subscription() {
        let (transport, registry) = registry(0);
        let a = registry.acquire(&filters(), Sharing::Shared).unwrap();
        let b = registry.acquire(&filters(), Sharing::Shared).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(registry.ref_count(a.id()), 2);
        assert_eq!(transport.subscribe_calls(), 1);
    }

    #[test]
    fn exclusive_filters_get_own_subscription() {
        let (transport, registry) = registry(0);
        let a = registry.acquire(&filters(), Sharing::Exclusive).unwrap();
        let b = registry.acquire(&filters(), Sharing::Exclusive).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(transport.subscription_count(), 2);
    }

    #[test]
    fn last_release_unregisters() {
        let (transport, registry) = registry(0);
        let ha = registry.attach(noop());
        let hb = registry.attach(noop());
        let a = registry.acquire(&filters(), Sharing::Shared).unwrap();
        let b = registry.acquire(&filters(), Sharing::Shared).unwrap();
        let id = a.id();

        registry.detach(ha, a, true).unwrap();
        assert_eq!(registry.state_of(id), SubscriptionState::Registered);
        assert!(transport.is_subscribed(id));

        registry.detach(hb, b, true).unwrap();
        assert_eq!(registry.state_of(id), SubscriptionState::Unregistered);
        assert!(!transport.is_subscribed(id));
        assert_eq!(transport.handler_count(), 0);
    }

    #[test]
    fn graceful_detach_of_last_handler_uses_keeper() {
        let (transport, registry) = registry(50);
        let registry = Arc::new(registry);
        let h = registry.attach(noop());
        let lease = registry.acquire(&filters(), Sharing::Shared).unwrap();
        let id = lease.id();

        let worker = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.detach(h, lease, false))
        };

        thread::sleep(Duration::from_millis(15));
        assert!(registry.keeper_installed());
        assert_eq!(transport.handler_count(), 1);
        assert_eq!(registry.state_of(id), SubscriptionState::Draining);

        worker.join().unwrap().unwrap();
        assert!(!registry.keeper_installed());
        assert_eq!(transport.handler_count(), 0);
        assert!(!transport.is_subscribed(id));
    }

    #[test]
    fn reacquire_while_draining_keeps_subscription() {
        let (transport, registry) = registry(60);
        let registry = Arc::new(registry);
        let h = registry.attach(noop());
        let lease = registry.acquire(&filters(), Sharing::Shared).unwrap();
        let id = lease.id();

        let worker = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.detach(h, lease, false))
        };
        thread::sleep(Duration::from_millis(15));

        let again = registry.acquire(&filters(), Sharing::Shared).unwrap();
        assert_eq!(again.id(), id);
        worker.join().unwrap().unwrap();

        assert_eq!(registry.state_of(id), SubscriptionState::Registered);
        assert!(transport.is_subscribed(id));
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(transport.unsubscribe_calls(), 0);
    }

    #[test]
    fn graceful_batch_detach_shares_one_grace_delay() {
        let (transport, registry) = registry(80);
        let other = vec![
            SubscriptionFilter::Element { agent: 1, element: 2 },
            SubscriptionFilter::Parameter { parameter: 4 },
        ];
        let ha = registry.attach(noop());
        let hb = registry.attach(noop());
        let a = registry.acquire(&filters(), Sharing::Shared).unwrap();
        let b = registry.acquire(&other, Sharing::Shared).unwrap();
        let (ida, idb) = (a.id(), b.id());

        let started = Instant::now();
        registry.detach_all(vec![(ha, a), (hb, b)], false).unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(160));
        assert!(!transport.is_subscribed(ida));
        assert!(!transport.is_subscribed(idb));
        assert!(!registry.keeper_installed());
        assert_eq!(transport.handler_count(), 0);
        assert_eq!(transport.unsubscribe_calls(), 2);
    }

    #[test]
    fn batch_leaving_other_handlers_installs_no_keeper() {
        let (transport, registry) = registry(0);
        let _other = registry.attach(noop());
        let h = registry.attach(noop());
        let lease = registry.acquire(&filters(), Sharing::Shared).unwrap();

        registry.detach_all(vec![(h, lease)], false).unwrap();
        assert!(!registry.keeper_installed());
        assert_eq!(transport.handler_count(), 1);
        assert_eq!(registry.handler_count(), 1);
    }

    #[test]
    fn refused_subscription_propagates() {
        let (transport, registry) = registry(0);
        transport.fail_subscriptions(true);
        let err = registry.acquire(&filters(), Sharing::Shared).unwrap_err();
        assert!(err.is_transport());
        assert_eq!(registry.subscription_count(), 0);
    }
}
