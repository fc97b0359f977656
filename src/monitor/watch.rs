//! Monitor lifecycle and event handling.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::ChangeCache;
use crate::config::Sharing;
use crate::error::{CorrResult, CorrelatorError, ValidationError};
use crate::store::KeyedAtomicStore;
use crate::subscription::{SubscriptionLease, SubscriptionRegistry};
use crate::target::Target;
use crate::transport::{EventHandler, HandlerId, SubscriptionId, TransportEvent};

use super::events::{ChangeEvent, MonitorStats};
use super::matcher::{Extracted, MatchOutput, TargetMatcher};

/// Callback invoked once per genuine change.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle state of a [`Monitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorState {
    Created,
    Started,
    /// Terminal.
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    suppressed: AtomicU64,
    failures: AtomicU64,
}

struct MonitorInner {
    key: String,
    matcher: TargetMatcher,
    sharing: Sharing,
    registry: Arc<SubscriptionRegistry>,
    state: AtomicU8,
    subscription: OnceLock<SubscriptionId>,
    on_change: OnceLock<ChangeCallback>,
    attachment: Mutex<Option<(HandlerId, SubscriptionLease)>>,
    cache: KeyedAtomicStore<ChangeCache>,
    counters: Counters,
}

impl MonitorInner {
    fn state(&self) -> MonitorState {
        match self.state.load(Ordering::Acquire) {
            CREATED => MonitorState::Created,
            STARTED => MonitorState::Started,
            _ => MonitorState::Stopped,
        }
    }

    fn on_event(&self, event: &TransportEvent) {
        if self.state() != MonitorState::Started {
            return;
        }
        if self.subscription.get() != Some(&event.subscription_id) {
            return;
        }

        let extracted = match self.matcher.evaluate(event) {
            Ok(MatchOutput::NoMatch) => {
                trace!(monitor = %self.key, source = %event.source, "event ignored");
                return;
            }
            Ok(MatchOutput::Match(extracted)) => extracted,
            Err(e) => {
                warn!(
                    monitor = %self.key,
                    source = %event.source,
                    error = %e,
                    "failed to parse event"
                );
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let Some(on_change) = self.on_change.get() else {
            return;
        };

        // The compare and the callback run under the per-key lock, so two
        // racing events can never both be judged a change from one prior state.
        let outcome = self
            .cache
            .get_or_add_and_action(&self.key, ChangeCache::new, |cache| -> CorrResult<bool> {
                if !cache.apply_update(extracted.update.as_ref())? {
                    return Ok(false);
                }
                let change = self.change_event(event, &extracted, cache);
                if panic::catch_unwind(AssertUnwindSafe(|| on_change(&change))).is_err() {
                    return Err(CorrelatorError::internal("change callback panicked"));
                }
                // Correlation ids are single-use; a delivered reply's row is dead.
                if matches!(self.matcher.target(), Target::Calls(_)) {
                    cache.evict(&extracted.row);
                }
                Ok(true)
            });

        match outcome {
            Ok(true) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                trace!(monitor = %self.key, "unchanged value suppressed");
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(monitor = %self.key, error = %e, "change not delivered");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Marks the monitor stopped and hands back its feed attachment, or
    /// `None` if it was already stopped.
    fn take_attachment(&self) -> Option<Option<(HandlerId, SubscriptionLease)>> {
        let mut attachment = self.attachment.lock();
        if self.state.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return None;
        }
        Some(attachment.take())
    }

    fn stopped(&self, force: bool) {
        self.cache.remove(&self.key);
        debug!(monitor = %self.key, force, "monitor stopped");
    }

    fn change_event(
        &self,
        event: &TransportEvent,
        extracted: &Extracted,
        cache: &ChangeCache,
    ) -> ChangeEvent {
        let value = cache.row(&extracted.row).map(|_| {
            cache
                .field(&extracted.row, extracted.column)
                .cloned()
                .unwrap_or_default()
        });
        ChangeEvent::new(
            self.key.clone(),
            event.subscription_id,
            extracted.source.clone(),
            value,
        )
    }
}

/// Binds one target to a subscription and turns the raw event feed into a
/// deduplicated change callback.
///
/// `Created → Started → Stopped`. Stopping is idempotent and also happens
/// (forcefully) when the monitor is dropped.
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("key", &self.inner.key)
            .field("state", &self.inner.state())
            .field("subscription", &self.inner.subscription.get())
            .finish_non_exhaustive()
    }
}

impl Monitor {
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, target: Target, sharing: Sharing) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                key: target.subscription_key(),
                matcher: TargetMatcher::new(target),
                sharing,
                registry,
                state: AtomicU8::new(CREATED),
                subscription: OnceLock::new(),
                on_change: OnceLock::new(),
                attachment: Mutex::new(None),
                cache: KeyedAtomicStore::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// The monitor's subscription key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        self.inner.matcher.target()
    }

    #[must_use]
    pub fn state(&self) -> MonitorState {
        self.inner.state()
    }

    /// Subscription the monitor listens on, once started.
    #[must_use]
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.inner.subscription.get().copied()
    }

    #[must_use]
    pub fn stats(&self) -> MonitorStats {
        let c = &self.inner.counters;
        MonitorStats {
            delivered: c.delivered.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Subscribes and starts invoking `on_change` for every genuine change.
    ///
    /// Fails if the monitor was already started or stopped, or if the
    /// transport refuses the subscription (the monitor then stays `Created`).
    pub fn start<F>(&self, on_change: F) -> CorrResult<()>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut attachment = self.inner.attachment.lock();
        if self.inner.state() != MonitorState::Created {
            return Err(ValidationError::InvalidState {
                reason: format!("monitor {} was already started", self.inner.key),
            }
            .into());
        }

        let lease = self
            .inner
            .registry
            .acquire(&self.target().filters(), self.inner.sharing)?;

        let _ = self.inner.subscription.set(lease.id());
        let _ = self.inner.on_change.set(Arc::new(on_change));
        self.inner.state.store(STARTED, Ordering::Release);

        let weak = Arc::downgrade(&self.inner);
        let handler: EventHandler = Arc::new(move |event: &TransportEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_event(event);
            }
        });
        let handler_id = self.inner.registry.attach(handler);
        *attachment = Some((handler_id, lease));

        debug!(
            monitor = %self.inner.key,
            subscription = ?self.subscription_id(),
            "monitor started"
        );
        Ok(())
    }

    /// Detaches from the event feed and releases the subscription.
    ///
    /// With `force == false` the registry's zero-handler guard and grace delay
    /// apply. Calling `stop` again is a no-op.
    pub fn stop(&self, force: bool) -> CorrResult<()> {
        let Some(attachment) = self.inner.take_attachment() else {
            return Ok(());
        };
        let released = match attachment {
            Some((handler, lease)) => self.inner.registry.detach(handler, lease, force),
            None => Ok(()),
        };
        self.inner.stopped(force);
        released
    }

    /// Stops several monitors together.
    ///
    /// Attachments are detached in one batch per registry, so a graceful
    /// stop waits out a single grace delay however many monitors it covers.
    /// Every monitor is stopped even if a release fails; the first error is
    /// returned.
    pub fn stop_all<'a, I>(monitors: I, force: bool) -> CorrResult<()>
    where
        I: IntoIterator<Item = &'a Monitor>,
    {
        type Batch = Vec<(HandlerId, SubscriptionLease)>;
        let mut batches: Vec<(Arc<SubscriptionRegistry>, Batch)> = Vec::new();
        let mut stopping = Vec::new();

        for monitor in monitors {
            let Some(attachment) = monitor.inner.take_attachment() else {
                continue;
            };
            stopping.push(monitor);
            let Some(pair) = attachment else {
                continue;
            };
            let registry = &monitor.inner.registry;
            match batches.iter_mut().find(|(r, _)| Arc::ptr_eq(r, registry)) {
                Some((_, batch)) => batch.push(pair),
                None => batches.push((Arc::clone(registry), vec![pair])),
            }
        }

        let mut released = Ok(());
        for (registry, batch) in batches {
            released = released.and(registry.detach_all(batch, force));
        }
        for monitor in stopping {
            monitor.inner.stopped(force);
        }
        released
    }

    /// Rows currently held in the change cache.
    #[must_use]
    pub fn cached_rows(&self) -> usize {
        self.inner
            .cache
            .get_and_action(&self.inner.key, |cache| cache.len())
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Err(e) = self.stop(true) {
            warn!(monitor = %self.inner.key, error = %e, "failed to release monitor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::cache::RowUpdate;
    use crate::config::CorrelatorConfig;
    use crate::target::Coordinates;
    use crate::transport::{EventPayload, InMemoryTransport, Transport};
    use crate::value::Value;

    fn setup() -> (Arc<InMemoryTransport>, Arc<SubscriptionRegistry>) {
        let transport = Arc::new(InMemoryTransport::new());
        let cfg = CorrelatorConfig {
            drain_grace: Duration::from_millis(5),
            ..CorrelatorConfig::default()
        };
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            &cfg,
        ));
        (transport, registry)
    }

    fn collecting(monitor: &Monitor) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        monitor.start(move |change| sink.lock().push(change.clone())).unwrap();
        seen
    }

    fn param(value: i64) -> EventPayload {
        EventPayload::Parameter { value: Value::Int(value) }
    }

    fn parameter(key: &str) -> Target {
        Target::Parameter(key.parse().unwrap())
    }

    fn cell(key: &str) -> Target {
        Target::Cell(key.parse().unwrap())
    }

    fn reply(id: &str) -> EventPayload {
        EventPayload::Message {
            correlation_id: id.to_string(),
            body: Value::from(id),
        }
    }

    #[test]
    fn duplicate_values_invoke_callback_once() {
        let (transport, registry) = setup();
        let monitor = Monitor::new(registry, parameter("1/2/10"), Sharing::Shared);
        let seen = collecting(&monitor);

        let at = Coordinates::parameter(1, 2, 10);
        transport.emit(&at, &param(1));
        transport.emit(&at, &param(1));
        transport.emit(&at, &param(2));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].value, Value::Int(1));
        assert_eq!(seen[1].value, Value::Int(2));
        assert_eq!(monitor.stats().suppressed, 1);
    }

    #[test]
    fn events_for_other_subscriptions_are_ignored() {
        let (transport, registry) = setup();
        let monitor = Monitor::new(registry, parameter("1/2/10"), Sharing::Exclusive);
        let seen = collecting(&monitor);

        let foreign =
            TransportEvent::new(SubscriptionId::new(), Coordinates::parameter(1, 2, 10), param(1));
        transport.deliver(&foreign);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn panicking_callback_does_not_break_delivery() {
        let (transport, registry) = setup();
        let bad = Monitor::new(
            Arc::clone(&registry),
            parameter("1/2/10"),
            Sharing::Shared,
        );
        bad.start(|_change| panic!("callback bug")).unwrap();
        let good = Monitor::new(registry, parameter("1/2/10"), Sharing::Shared);
        let seen = collecting(&good);

        transport.emit(&Coordinates::parameter(1, 2, 10), &param(3));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(bad.stats().failures, 1);
    }

    #[test]
    fn bodiless_table_event_is_logged_failure() {
        let (transport, registry) = setup();
        let monitor = Monitor::new(registry, cell("1/2/2000/0/r1"), Sharing::Shared);
        let seen = collecting(&monitor);

        let table = Coordinates::parameter(1, 2, 2000);
        transport.emit(&table, &EventPayload::Table { update: None });
        assert!(seen.lock().is_empty());
        assert_eq!(monitor.stats().failures, 1);

        let update = RowUpdate::upsert("r1", vec![Some(Value::String("up".into()))]);
        transport.emit(
            &Coordinates::parameter(1, 2, 2000),
            &EventPayload::Table { update: Some(update) },
        );
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn row_deletion_reports_deleted_cell() {
        let (transport, registry) = setup();
        let monitor = Monitor::new(registry, cell("1/2/2000/0/r1"), Sharing::Shared);
        let seen = collecting(&monitor);
        let at = Coordinates::parameter(1, 2, 2000);

        transport.emit(
            &at,
            &EventPayload::Table {
                update: Some(RowUpdate::upsert("r1", vec![Some(Value::Int(1))])),
            },
        );
        transport.emit(
            &at,
            &EventPayload::Table {
                update: Some(RowUpdate::delete("r1")),
            },
        );

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].deleted);
        assert_eq!(seen[1].source.row.as_deref(), Some("r1"));
    }

    #[test]
    fn start_twice_is_rejected() {
        let (_transport, registry) = setup();
        let monitor = Monitor::new(registry, parameter("1/2/10"), Sharing::Shared);
        monitor.start(|_| {}).unwrap();
        let err = monitor.start(|_| {}).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn stop_is_idempotent_and_releases() {
        let (transport, registry) = setup();
        let monitor = Monitor::new(
            Arc::clone(&registry),
            parameter("1/2/10"),
            Sharing::Shared,
        );
        let seen = collecting(&monitor);

        monitor.stop(false).unwrap();
        monitor.stop(false).unwrap();
        monitor.stop(true).unwrap();

        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert_eq!(transport.handler_count(), 0);
        assert_eq!(transport.subscription_count(), 0);
        assert_eq!(transport.unsubscribe_calls(), 1);

        transport.emit(&Coordinates::parameter(1, 2, 10), &param(1));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn stop_before_start_is_terminal() {
        let (transport, registry) = setup();
        let monitor = Monitor::new(registry, parameter("1/2/10"), Sharing::Shared);
        monitor.stop(true).unwrap();
        assert!(monitor.start(|_| {}).is_err());
        assert_eq!(transport.subscribe_calls(), 0);
    }

    #[test]
    fn refused_subscription_leaves_monitor_created() {
        let (transport, registry) = setup();
        transport.fail_subscriptions(true);
        let monitor = Monitor::new(registry, parameter("1/2/10"), Sharing::Shared);
        assert!(monitor.start(|_| {}).unwrap_err().is_transport());
        assert_eq!(monitor.state(), MonitorState::Created);
        assert_eq!(transport.handler_count(), 0);
    }

    #[test]
    fn drop_releases_everything() {
        let (transport, registry) = setup();
        {
            let calls = Target::Calls("1/2".parse().unwrap());
            let monitor = Monitor::new(registry, calls, Sharing::Shared);
            monitor.start(|_| {}).unwrap();
            assert_eq!(transport.handler_count(), 1);
        }
        assert_eq!(transport.handler_count(), 0);
        assert_eq!(transport.subscription_count(), 0);
    }

    #[test]
    fn delivered_replies_are_evicted_from_cache() {
        let (transport, registry) = setup();
        let calls = Monitor::new(
            Arc::clone(&registry),
            Target::Calls("1/2".parse().unwrap()),
            Sharing::Shared,
        );
        let seen = collecting(&calls);
        let values = Monitor::new(registry, parameter("1/2/10"), Sharing::Shared);
        let _values_seen = collecting(&values);

        for id in ["a", "b", "c"] {
            transport.emit(&Coordinates::element(1, 2), &reply(id));
        }
        transport.emit(&Coordinates::parameter(1, 2, 10), &param(4));

        assert_eq!(seen.lock().len(), 3);
        assert_eq!(calls.stats().delivered, 3);
        assert_eq!(calls.cached_rows(), 0);
        assert_eq!(values.cached_rows(), 1);
    }

    #[test]
    fn stop_all_releases_each_monitor_once() {
        let (transport, registry) = setup();
        let a = Monitor::new(Arc::clone(&registry), parameter("1/2/10"), Sharing::Shared);
        let b = Monitor::new(Arc::clone(&registry), parameter("1/2/11"), Sharing::Shared);
        let idle = Monitor::new(registry, parameter("1/2/12"), Sharing::Shared);
        a.start(|_| {}).unwrap();
        b.start(|_| {}).unwrap();
        b.stop(true).unwrap();

        Monitor::stop_all([&a, &b, &idle], false).unwrap();

        for monitor in [&a, &b, &idle] {
            assert_eq!(monitor.state(), MonitorState::Stopped);
        }
        assert_eq!(transport.handler_count(), 0);
        assert_eq!(transport.subscription_count(), 0);
        assert_eq!(transport.unsubscribe_calls(), 2);
    }
}
