use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::monitor::Monitor;

use super::strategy::Correlated;

/// One monitor of a waiter plus the queue its callback feeds.
///
/// The queue becoming ready is the handle's signal; items are drained one per
/// wait cycle.
#[derive(Debug)]
pub(crate) struct WaitHandle<O> {
    monitor: Monitor,
    rx: Receiver<Correlated<O>>,
    connected: bool,
}

impl<O> WaitHandle<O> {
    pub(crate) fn channel(monitor: Monitor) -> (Self, Sender<Correlated<O>>) {
        let (tx, rx) = unbounded();
        (
            Self {
                monitor,
                rx,
                connected: true,
            },
            tx,
        )
    }

    pub(crate) const fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub(crate) const fn rx(&self) -> &Receiver<Correlated<O>> {
        &self.rx
    }

    pub(crate) const fn is_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Discards anything still queued. Meant for after the monitor stopped.
    pub(crate) fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}
