//! Runtime configuration.

use std::time::Duration;

/// Whether monitors with identical filter sets reuse one transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Sharing {
    /// Reference-count one subscription across all monitors with the same filters.
    #[default]
    Shared,
    /// Every monitor owns its own subscription.
    Exclusive,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Delay between detaching a handler gracefully and releasing the
    /// transport resources behind it. Absorbs in-flight deliveries.
    pub drain_grace: Duration,
    /// Max queued events in the in-memory transport's dispatch worker.
    pub dispatch_queue_capacity: usize,
    /// Per-cycle wait window used when a caller does not pass one.
    pub default_wait_timeout: Duration,
    /// Subscription sharing policy for waiter monitors.
    pub sharing: Sharing,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_millis(100),
            dispatch_queue_capacity: 4096,
            default_wait_timeout: Duration::from_secs(30),
            sharing: Sharing::Shared,
        }
    }
}
