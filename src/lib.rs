//! # keywait - keyed change monitoring and multi-key waiting
//!
//! keywait watches remote data points addressed by composite keys and turns a
//! raw, possibly redundant event feed into deduplicated change notifications.
//! On top of that it waits for sets of keyed conditions and correlates
//! request/response traffic.
//!
//! ## Core Concepts
//!
//! - **Target**: a parameter, a table cell, or the replies addressed to an element
//! - **Monitor**: one target bound to a transport subscription, firing once per genuine change
//! - **Subscription registry**: reference-counted, optionally shared transport subscriptions
//! - **Waiter**: waits for many keys at once, yielding results in completion order
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keywait::{Correlator, ExpectedValue, InMemoryTransport};
//!
//! let transport = Arc::new(InMemoryTransport::new());
//! let correlator = Correlator::with_defaults(transport.clone());
//!
//! let waiter = correlator.parameter_waiter([
//!     ExpectedValue::new("1/20/1000", "running"),
//!     ExpectedValue::new("1/20/1001", 5),
//! ])?;
//! // ... issue the request that changes both parameters ...
//! let results = waiter.wait_all(Duration::from_secs(5))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod target;
pub mod value;

// Change tracking
pub mod cache;
pub mod store;

// Event feed
pub mod subscription;
pub mod transport;

// Monitoring and waiting
pub mod engine;
pub mod monitor;
pub mod waiter;

pub use cache::{ChangeCache, Row, RowUpdate};
pub use config::{CorrelatorConfig, Sharing};
pub use engine::Correlator;
pub use error::{CorrResult, CorrelatorError, ExecutionError, TransportError, ValidationError};
pub use monitor::{ChangeCallback, ChangeEvent, Monitor, MonitorState, MonitorStats};
pub use store::KeyedAtomicStore;
pub use subscription::{SubscriptionLease, SubscriptionRegistry, SubscriptionState};
pub use target::{CellKey, Coordinates, ElementKey, ParameterKey, SubscriptionFilter, Target};
pub use transport::{
    EventHandler, EventPayload, HandlerId, InMemoryTransport, SubscriptionId, Transport,
    TransportEvent,
};
pub use value::Value;
pub use waiter::{
    CallReply, CallStrategy, CellStrategy, ExpectedReply, ExpectedValue, Fingerprint,
    ObservedValue, ParameterStrategy, WaitNext, WaitStrategy, Waiter,
};
