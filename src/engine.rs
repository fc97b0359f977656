//! Entry point tying a transport to monitors and waiters.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::CorrelatorConfig;
use crate::error::CorrResult;
use crate::monitor::Monitor;
use crate::subscription::SubscriptionRegistry;
use crate::target::Target;
use crate::transport::Transport;
use crate::waiter::{
    CallStrategy, CellStrategy, ExpectedReply, ExpectedValue, ParameterStrategy, WaitStrategy,
    Waiter,
};

/// Creates monitors and waiters that share one subscription registry.
#[derive(Clone)]
pub struct Correlator {
    registry: Arc<SubscriptionRegistry>,
    config: CorrelatorConfig,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl Correlator {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: CorrelatorConfig) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(transport, &config));
        Self { registry, config }
    }

    /// A correlator with [`CorrelatorConfig::default`].
    #[must_use]
    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, CorrelatorConfig::default())
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.registry.transport()
    }

    /// An unstarted monitor for `target`, using the configured sharing policy.
    #[must_use]
    pub fn monitor(&self, target: Target) -> Monitor {
        Monitor::new(Arc::clone(&self.registry), target, self.config.sharing)
    }

    /// Starts a waiter for `requests`.
    pub fn waiter<S, I>(&self, strategy: S, requests: I) -> CorrResult<Waiter<S>>
    where
        S: WaitStrategy,
        I: IntoIterator<Item = S::Request>,
    {
        Waiter::new(Arc::clone(&self.registry), strategy, requests, self.config.sharing)
    }

    /// Waits for parameters to reach expected values.
    pub fn parameter_waiter<I>(&self, requests: I) -> CorrResult<Waiter<ParameterStrategy>>
    where
        I: IntoIterator<Item = ExpectedValue>,
    {
        self.waiter(ParameterStrategy, requests)
    }

    /// Waits for table cells to reach expected values.
    pub fn cell_waiter<I>(&self, requests: I) -> CorrResult<Waiter<CellStrategy>>
    where
        I: IntoIterator<Item = ExpectedValue>,
    {
        self.waiter(CellStrategy, requests)
    }

    /// Waits for replies to inter-application calls.
    pub fn call_waiter<I>(&self, requests: I) -> CorrResult<Waiter<CallStrategy>>
    where
        I: IntoIterator<Item = ExpectedReply>,
    {
        self.waiter(CallStrategy, requests)
    }

    /// Starts waiting for `requests`, runs `issue`, then waits for all of them.
    ///
    /// Monitors are live before `issue` runs, so a response that arrives
    /// while `issue` is still executing is not missed. If `issue` fails, the
    /// waiter is force-stopped and the error returned. `timeout` defaults to
    /// [`CorrelatorConfig::default_wait_timeout`].
    pub fn request_and_wait<S, I, F>(
        &self,
        strategy: S,
        requests: I,
        issue: F,
        timeout: Option<Duration>,
    ) -> CorrResult<Vec<S::Output>>
    where
        S: WaitStrategy,
        I: IntoIterator<Item = S::Request>,
        F: FnOnce() -> CorrResult<()>,
    {
        let waiter = self.waiter(strategy, requests)?;
        if let Err(e) = issue() {
            debug!(error = %e, "request failed, abandoning wait");
            waiter.cancel();
            return Err(e);
        }
        waiter.wait_all(timeout.unwrap_or(self.config.default_wait_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::CorrelatorError;
    use crate::target::Coordinates;
    use crate::transport::{EventPayload, InMemoryTransport};
    use crate::value::Value;

    fn correlator() -> (Arc<InMemoryTransport>, Correlator) {
        let transport = Arc::new(InMemoryTransport::new());
        let config = CorrelatorConfig {
            drain_grace: Duration::from_millis(5),
            ..CorrelatorConfig::default()
        };
        let correlator = Correlator::new(Arc::clone(&transport) as Arc<dyn Transport>, config);
        (transport, correlator)
    }

    #[test]
    fn reply_during_issue_is_not_missed() {
        let (transport, correlator) = correlator();
        let replies = correlator
            .request_and_wait(
                CallStrategy,
                vec![ExpectedReply::new("5/6", "req-1")],
                || {
                    transport.emit(
                        &Coordinates::element(5, 6),
                        &EventPayload::Message {
                            correlation_id: "req-1".to_string(),
                            body: Value::Int(42),
                        },
                    );
                    Ok(())
                },
                Some(Duration::from_millis(500)),
            )
            .unwrap();

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].body, Value::Int(42));
        assert_eq!(transport.handler_count(), 0);
        assert_eq!(transport.subscription_count(), 0);
    }

    #[test]
    fn failed_issue_releases_monitors() {
        let (transport, correlator) = correlator();
        let err = correlator
            .request_and_wait(
                ParameterStrategy,
                vec![ExpectedValue::new("1/2/3", true)],
                || Err(CorrelatorError::internal("send failed")),
                None,
            )
            .unwrap_err();

        assert!(err.is_internal());
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(transport.unsubscribe_calls(), 1);
        assert_eq!(transport.handler_count(), 0);
    }

    #[test]
    fn monitor_uses_configured_sharing() {
        let (transport, correlator) = correlator();
        let a = correlator.monitor(Target::Parameter("1/2/3".parse().unwrap()));
        let b = correlator.monitor(Target::Parameter("1/2/3".parse().unwrap()));
        a.start(|_| {}).unwrap();
        b.start(|_| {}).unwrap();
        assert_eq!(a.subscription_id(), b.subscription_id());
        assert_eq!(transport.subscribe_calls(), 1);
    }
}
