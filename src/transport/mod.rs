//! Transport boundary.
//!
//! The transport owns the connection to the remote system. The correlation
//! layer only needs to register and remove named filter sets and to attach
//! handlers to the transport's multicast event feed. Every attached handler
//! sees every delivered event; filtering by subscription and coordinates is
//! the handler's job.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::RowUpdate;
use crate::error::CorrResult;
use crate::target::{Coordinates, SubscriptionFilter};
use crate::value::Value;

mod memory;

pub use memory::InMemoryTransport;

/// Unique identifier for a transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Identifier of a handler attached to the event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(Uuid);

impl HandlerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HandlerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// New value(s) carried by a delivered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// New value of a scalar parameter.
    Parameter { value: Value },
    /// Incremental table update. A transport may deliver a table event
    /// without a body.
    Table {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update: Option<RowUpdate>,
    },
    /// Reply to an inter-application call.
    Message { correlation_id: String, body: Value },
}

/// An event as delivered by the transport.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportEvent {
    pub subscription_id: SubscriptionId,
    pub source: Coordinates,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl TransportEvent {
    #[must_use]
    pub fn new(
        subscription_id: SubscriptionId,
        source: Coordinates,
        payload: EventPayload,
    ) -> Self {
        Self {
            subscription_id,
            source,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Handler attached to the multicast event feed.
pub type EventHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// The minimal transport abstraction the correlation layer consumes.
///
/// Implementations may deliver events on any number of threads, concurrently
/// with handler registration and removal.
pub trait Transport: Send + Sync {
    /// Registers a named set of filter predicates.
    fn subscribe(&self, id: SubscriptionId, filters: &[SubscriptionFilter]) -> CorrResult<()>;

    /// Removes a previously registered filter set.
    fn unsubscribe(&self, id: SubscriptionId) -> CorrResult<()>;

    /// Attaches a handler that receives every delivered event.
    fn add_handler(&self, handler: EventHandler) -> HandlerId;

    /// Detaches a handler. Returns false if it was not attached.
    fn remove_handler(&self, id: HandlerId) -> bool;
}
