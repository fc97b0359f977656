//! Key decomposition and result construction for the waiter kinds.
//!
//! A [`WaitStrategy`] tells a [`Waiter`](super::Waiter) which target a request
//! needs watched, which fingerprint satisfies it, and how an observed change
//! turns into a result carrying that fingerprint.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CorrResult, CorrelatorError};
use crate::monitor::ChangeEvent;
use crate::target::{CellKey, ElementKey, ParameterKey, Target};
use crate::value::Value;

/// Identifies what satisfies one request: the canonical target key plus a
/// discriminator (the expected value's fingerprint, or a correlation id).
///
/// Compared field by field, so a key containing `=` can never alias another
/// key's discriminator.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint {
    pub key: String,
    pub discriminator: String,
}

impl Fingerprint {
    #[must_use]
    pub fn new(key: impl Into<String>, discriminator: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            discriminator: discriminator.into(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.discriminator)
    }
}

/// A result paired with the fingerprint it satisfies.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct Correlated<O> {
    pub fingerprint: Fingerprint,
    pub output: O,
}

/// Strategy for one family of wait requests.
pub trait WaitStrategy: Send + Sync + 'static {
    /// What a caller asks to wait for.
    type Request;
    /// What the waiter yields per satisfied request.
    type Output: Clone + fmt::Debug + Send + 'static;

    /// Splits a request into the target to watch and the fingerprint that
    /// satisfies it. Malformed keys are argument errors.
    fn decompose(&self, request: &Self::Request) -> CorrResult<(Target, Fingerprint)>;

    /// Builds the result for an observed change, or `None` if the change can
    /// never satisfy a request of this kind.
    fn correlate(&self, change: &ChangeEvent) -> Option<Correlated<Self::Output>>;
}

/// Wait until a parameter or cell holds `value`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedValue {
    pub key: String,
    pub value: Value,
}

impl ExpectedValue {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A value observed at a parameter or a cell.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedValue {
    pub key: String,
    pub value: Value,
    pub deleted: bool,
    pub timestamp: DateTime<Utc>,
}

fn value_fingerprint(key: impl Into<String>, value: &Value) -> Fingerprint {
    Fingerprint::new(key, value.fingerprint())
}

fn observed(change: &ChangeEvent) -> Correlated<ObservedValue> {
    Correlated {
        fingerprint: value_fingerprint(change.monitor_key.as_str(), &change.value),
        output: ObservedValue {
            key: change.monitor_key.clone(),
            value: change.value.clone(),
            deleted: change.deleted,
            timestamp: change.timestamp,
        },
    }
}

/// Waits for parameters (`agent/element/parameter`) to reach expected values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterStrategy;

impl WaitStrategy for ParameterStrategy {
    type Request = ExpectedValue;
    type Output = ObservedValue;

    fn decompose(&self, request: &ExpectedValue) -> CorrResult<(Target, Fingerprint)> {
        let key: ParameterKey = request.key.parse()?;
        let fingerprint = value_fingerprint(key.to_string(), &request.value);
        Ok((Target::Parameter(key), fingerprint))
    }

    fn correlate(&self, change: &ChangeEvent) -> Option<Correlated<ObservedValue>> {
        Some(observed(change))
    }
}

/// Waits for table cells (`agent/element/table/column/row`) to reach
/// expected values. Expecting `Value::Null` waits for the row's deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellStrategy;

impl WaitStrategy for CellStrategy {
    type Request = ExpectedValue;
    type Output = ObservedValue;

    fn decompose(&self, request: &ExpectedValue) -> CorrResult<(Target, Fingerprint)> {
        let key: CellKey = request.key.parse()?;
        let fingerprint = value_fingerprint(key.to_string(), &request.value);
        Ok((Target::Cell(key), fingerprint))
    }

    fn correlate(&self, change: &ChangeEvent) -> Option<Correlated<ObservedValue>> {
        Some(observed(change))
    }
}

/// Wait for the reply to an inter-application call sent to `key`
/// (`agent/element`).
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedReply {
    pub key: String,
    pub correlation_id: String,
}

impl ExpectedReply {
    #[must_use]
    pub fn new(key: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    pub key: String,
    pub correlation_id: String,
    pub body: Value,
    pub timestamp: DateTime<Utc>,
}

fn reply_fingerprint(key: &ElementKey, correlation_id: &str) -> Fingerprint {
    Fingerprint::new(key.to_string(), correlation_id)
}

/// Waits for replies to inter-application calls, correlated by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallStrategy;

impl WaitStrategy for CallStrategy {
    type Request = ExpectedReply;
    type Output = CallReply;

    fn decompose(&self, request: &ExpectedReply) -> CorrResult<(Target, Fingerprint)> {
        let key: ElementKey = request.key.parse()?;
        if request.correlation_id.trim().is_empty() {
            return Err(CorrelatorError::missing("correlation_id"));
        }
        Ok((Target::Calls(key), reply_fingerprint(&key, &request.correlation_id)))
    }

    fn correlate(&self, change: &ChangeEvent) -> Option<Correlated<CallReply>> {
        let correlation_id = change.correlation_id()?;
        let key = ElementKey {
            agent: change.source.agent,
            element: change.source.element,
        };
        Some(Correlated {
            fingerprint: reply_fingerprint(&key, correlation_id),
            output: CallReply {
                key: key.to_string(),
                correlation_id: correlation_id.to_string(),
                body: change.value.clone(),
                timestamp: change.timestamp,
            },
        })
    }
}
