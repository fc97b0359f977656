//! Change notifications handed to monitor callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::target::Coordinates;
use crate::transport::SubscriptionId;
use crate::value::Value;

/// A genuine change observed by a monitor.
///
/// For table cells `source` carries the column and row; for inter-application
/// replies `source.row` carries the correlation id.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub event_id: Uuid,
    pub monitor_key: String,
    pub subscription_id: SubscriptionId,
    pub source: Coordinates,
    /// New value; `Null` when the row was deleted.
    pub value: Value,
    pub deleted: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(
        monitor_key: impl Into<String>,
        subscription_id: SubscriptionId,
        source: Coordinates,
        value: Option<Value>,
    ) -> Self {
        let deleted = value.is_none();
        Self {
            event_id: Uuid::new_v4(),
            monitor_key: monitor_key.into(),
            subscription_id,
            source,
            value: value.unwrap_or_default(),
            deleted,
            timestamp: Utc::now(),
        }
    }

    /// Correlation id of an inter-application reply (the row of the source).
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.source.row.as_deref()
    }
}

/// Counters describing what a monitor did with the events it saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    /// Changes handed to the callback.
    pub delivered: u64,
    /// Matching events the change cache judged redundant.
    pub suppressed: u64,
    /// Events dropped because parsing or the callback failed.
    pub failures: u64,
}
