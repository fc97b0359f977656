//! Multi-key waiting on top of monitors.
//!
//! A [`Waiter`] turns a set of requests into the minimal set of monitors
//! (one per distinct subscription key), then yields one result per satisfied
//! request, in completion order. Each request is satisfied at most once; a
//! wait cycle that sees no completion within its window ends the wait with a
//! timeout naming every still-outstanding request.

mod handle;
pub mod strategy;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvError, Select};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Sharing;
use crate::error::{CorrResult, CorrelatorError, ExecutionError};
use crate::monitor::Monitor;
use crate::subscription::SubscriptionRegistry;
use crate::target::Target;

use handle::WaitHandle;
pub use strategy::{
    CallReply, CallStrategy, CellStrategy, Correlated, ExpectedReply, ExpectedValue, Fingerprint,
    ObservedValue, ParameterStrategy, WaitStrategy,
};

type Pending = Arc<Mutex<BTreeSet<Fingerprint>>>;

/// Waits for a set of keyed conditions, yielding results as they complete.
///
/// Dropping a waiter that has not finished force-stops its monitors.
pub struct Waiter<S: WaitStrategy> {
    strategy: Arc<S>,
    pending: Pending,
    handles: Vec<WaitHandle<S::Output>>,
    finished: bool,
}

impl<S: WaitStrategy> std::fmt::Debug for Waiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &*self.pending.lock())
            .field("monitors", &self.handles.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<S: WaitStrategy> Waiter<S> {
    /// Decomposes `requests`, then creates and starts one monitor per distinct
    /// subscription key.
    ///
    /// Every key is validated before any monitor starts. If a monitor fails
    /// to start, the ones already started are force-stopped.
    pub fn new<I>(
        registry: Arc<SubscriptionRegistry>,
        strategy: S,
        requests: I,
        sharing: Sharing,
    ) -> CorrResult<Self>
    where
        I: IntoIterator<Item = S::Request>,
    {
        let mut groups: BTreeMap<String, Target> = BTreeMap::new();
        let mut fingerprints = BTreeSet::new();
        for request in requests {
            let (target, fingerprint) = strategy.decompose(&request)?;
            groups.entry(target.subscription_key()).or_insert(target);
            fingerprints.insert(fingerprint);
        }

        let strategy = Arc::new(strategy);
        let pending: Pending = Arc::new(Mutex::new(fingerprints));
        let mut handles = Vec::with_capacity(groups.len());

        for (key, target) in groups {
            let monitor = Monitor::new(Arc::clone(&registry), target, sharing);
            let (handle, tx) = WaitHandle::channel(monitor);

            let strategy_cb = Arc::clone(&strategy);
            let pending_cb = Arc::clone(&pending);
            let started = handle.monitor().start(move |change| {
                let Some(correlated) = strategy_cb.correlate(change) else {
                    return;
                };
                if pending_cb.lock().contains(&correlated.fingerprint) {
                    // The receiver is gone only once the waiter is dropped.
                    let _ = tx.send(correlated);
                }
            });

            if let Err(e) = started {
                warn!(key = %key, error = %e, "wait monitor failed to start");
                let _ = Monitor::stop_all(handles.iter().map(WaitHandle::monitor), true);
                return Err(e);
            }
            handles.push(handle);
        }

        debug!(
            requests = pending.lock().len(),
            monitors = handles.len(),
            "waiter started"
        );
        Ok(Self {
            strategy,
            pending,
            handles,
            finished: false,
        })
    }

    #[must_use]
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Fingerprints of the requests not yet satisfied.
    #[must_use]
    pub fn pending(&self) -> Vec<Fingerprint> {
        self.pending.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The waiter's monitors, one per distinct subscription key.
    pub fn monitors(&self) -> impl Iterator<Item = &Monitor> + '_ {
        self.handles.iter().map(WaitHandle::monitor)
    }

    /// Lazily yields one result per satisfied request.
    ///
    /// `timeout` bounds each wait cycle, not the whole wait: every result
    /// received restarts the window. A cycle that expires yields a timeout
    /// error naming the outstanding requests and ends the sequence. Monitors
    /// are stopped gracefully before the sequence ends either way.
    pub fn wait_next(&mut self, timeout: Duration) -> WaitNext<'_, S> {
        WaitNext {
            waiter: self,
            timeout,
            done: false,
        }
    }

    /// Waits until every request is satisfied and returns the results in
    /// completion order.
    pub fn wait_all(mut self, timeout: Duration) -> CorrResult<Vec<S::Output>> {
        self.wait_next(timeout).collect()
    }

    /// Abandons the wait, force-stopping all monitors.
    pub fn cancel(mut self) {
        self.finish(true);
    }

    fn next_result(&mut self, timeout: Duration) -> Option<CorrResult<S::Output>> {
        if self.finished {
            return None;
        }

        loop {
            if self.pending.lock().is_empty() {
                self.finish(false);
                return None;
            }

            let live: Vec<usize> = (0..self.handles.len())
                .filter(|&i| self.handles[i].is_connected())
                .collect();
            if live.is_empty() {
                self.finish(false);
                return Some(Err(ExecutionError::Disconnected {
                    path: "waiter".to_string(),
                }
                .into()));
            }

            let selected = {
                let mut select = Select::new();
                for &i in &live {
                    select.recv(self.handles[i].rx());
                }
                let received = match select.select_timeout(timeout) {
                    Ok(op) => {
                        let i = live[op.index()];
                        Some((i, op.recv(self.handles[i].rx())))
                    }
                    Err(_) => None,
                };
                received
            };

            match selected {
                None => return Some(Err(self.timed_out(timeout))),
                Some((i, Err(RecvError))) => self.handles[i].disconnect(),
                Some((_, Ok(correlated))) => {
                    // Late or repeated results for a satisfied request are skipped.
                    if self.pending.lock().remove(&correlated.fingerprint) {
                        return Some(Ok(correlated.output));
                    }
                }
            }
        }
    }

    fn timed_out(&mut self, timeout: Duration) -> CorrelatorError {
        let outstanding: Vec<String> = self.pending().iter().map(ToString::to_string).collect();
        info!(outstanding = ?outstanding, timeout_ms = timeout.as_millis(), "wait timed out");
        self.finish(false);
        ExecutionError::Timeout {
            duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            outstanding,
        }
        .into()
    }

    /// Stops every monitor exactly once, as one batch so a graceful stop
    /// waits out a single grace delay.
    fn finish(&mut self, force: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let stopped = Monitor::stop_all(self.handles.iter().map(WaitHandle::monitor), force);
        let discarded: usize = self.handles.iter().map(WaitHandle::drain).sum();
        if let Err(e) = stopped {
            warn!(error = %e, "failed to stop wait monitors");
        }
        debug!(force, monitors = self.handles.len(), discarded, "waiter finished");
    }
}

impl<S: WaitStrategy> Drop for Waiter<S> {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// Iterator returned by [`Waiter::wait_next`].
pub struct WaitNext<'a, S: WaitStrategy> {
    waiter: &'a mut Waiter<S>,
    timeout: Duration,
    done: bool,
}

impl<S: WaitStrategy> Iterator for WaitNext<'_, S> {
    type Item = CorrResult<S::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.waiter.next_result(self.timeout);
        if !matches!(next, Some(Ok(_))) {
            self.done = true;
        }
        next
    }
}
