//! Event matching for monitors.
//!
//! The matcher decides whether a delivered event concerns a monitor's target
//! and, if so, turns its payload into the cache update that represents it.

use crate::cache::RowUpdate;
use crate::error::{CorrResult, CorrelatorError, ExecutionError};
use crate::target::{CellKey, Coordinates, ElementKey, ParameterKey, Target};
use crate::transport::{EventPayload, TransportEvent};
use crate::value::Value;

/// The part of an event a monitor cares about.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    /// Cache row the update lands in.
    pub row: String,
    /// Field position reported to the callback.
    pub column: usize,
    /// `None` when the transport delivered a table event without a body.
    pub update: Option<RowUpdate>,
    /// Coordinates reported to the callback.
    pub source: Coordinates,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutput {
    NoMatch,
    Match(Extracted),
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    target: Target,
}

impl TargetMatcher {
    #[must_use]
    pub const fn new(target: Target) -> Self {
        Self { target }
    }

    #[must_use]
    pub const fn target(&self) -> &Target {
        &self.target
    }

    /// Evaluates one event against the target.
    ///
    /// Events for other coordinates are `NoMatch`. A matching event whose
    /// payload cannot represent the target is an error.
    pub fn evaluate(&self, event: &TransportEvent) -> CorrResult<MatchOutput> {
        if !self.target.matches(&event.source) {
            return Ok(MatchOutput::NoMatch);
        }

        match &self.target {
            Target::Parameter(key) => match_parameter(key, event),
            Target::Cell(key) => match_cell(key, event),
            Target::Calls(key) => match_call(key, event),
        }
    }
}

fn unexpected(target: &str, event: &TransportEvent) -> CorrelatorError {
    CorrelatorError::Execution(ExecutionError::UnexpectedPayload {
        reason: format!("{target} at {} got {:?}", event.source, event.payload),
    })
}

fn reported(value: &Value) -> Option<Value> {
    if value.is_null() {
        None
    } else {
        Some(value.clone())
    }
}

fn match_parameter(key: &ParameterKey, event: &TransportEvent) -> CorrResult<MatchOutput> {
    let EventPayload::Parameter { value } = &event.payload else {
        return Err(unexpected("parameter", event));
    };

    let row = key.parameter.to_string();
    Ok(MatchOutput::Match(Extracted {
        update: Some(RowUpdate::upsert(row.clone(), vec![reported(value)])),
        row,
        column: 0,
        source: Coordinates::parameter(key.agent, key.element, key.parameter),
    }))
}

fn match_cell(key: &CellKey, event: &TransportEvent) -> CorrResult<MatchOutput> {
    let source = Coordinates::parameter(key.agent, key.element, key.table)
        .with_row(key.column, key.row.clone());

    match &event.payload {
        // Single-cell event addressed by row and column.
        EventPayload::Parameter { value } => {
            let same_row = event.source.row.as_deref() == Some(key.row.as_str());
            if !same_row || event.source.column != Some(key.column) {
                return Ok(MatchOutput::NoMatch);
            }
            Ok(MatchOutput::Match(Extracted {
                update: Some(RowUpdate::upsert(
                    key.row.clone(),
                    cell_fields(key.column, reported(value)),
                )),
                row: key.row.clone(),
                column: key.column,
                source,
            }))
        }
        EventPayload::Table { update: None } => Ok(MatchOutput::Match(Extracted {
            update: None,
            row: key.row.clone(),
            column: key.column,
            source,
        })),
        EventPayload::Table { update: Some(update) } => {
            let Some(restricted) = restrict_to_cell(update, key) else {
                return Ok(MatchOutput::NoMatch);
            };
            Ok(MatchOutput::Match(Extracted {
                update: Some(restricted),
                row: key.row.clone(),
                column: key.column,
                source,
            }))
        }
        EventPayload::Message { .. } => Err(unexpected("cell", event)),
    }
}

fn match_call(key: &ElementKey, event: &TransportEvent) -> CorrResult<MatchOutput> {
    let EventPayload::Message { correlation_id, body } = &event.payload else {
        return Err(unexpected("call reply", event));
    };
    if correlation_id.is_empty() {
        return Err(CorrelatorError::missing("correlation_id"));
    }

    let mut source = Coordinates::element(key.agent, key.element);
    source.row = Some(correlation_id.clone());
    Ok(MatchOutput::Match(Extracted {
        update: Some(RowUpdate::upsert(correlation_id.clone(), vec![Some(body.clone())])),
        row: correlation_id.clone(),
        column: 0,
        source,
    }))
}

/// A row that reports only `value` at `column`.
fn cell_fields(column: usize, value: Option<Value>) -> Vec<Option<Value>> {
    let mut fields = vec![None; column + 1];
    fields[column] = value;
    fields
}

/// Narrows a table update to the one cell a monitor watches, so changes in
/// other rows or columns are not mistaken for changes of this cell.
fn restrict_to_cell(update: &RowUpdate, key: &CellKey) -> Option<RowUpdate> {
    let mut restricted = RowUpdate::default();

    if update
        .deleted
        .as_ref()
        .is_some_and(|rows| rows.iter().any(|r| *r == key.row))
    {
        restricted = restricted.with_delete(key.row.clone());
    }

    let cell = update
        .updated
        .as_ref()
        .and_then(|rows| rows.get(&key.row))
        .and_then(|fields| fields.get(key.column).cloned().flatten());
    if let Some(value) = cell {
        restricted = restricted.with_upsert(key.row.clone(), cell_fields(key.column, Some(value)));
    }

    if restricted.is_empty() {
        None
    } else {
        Some(restricted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::SubscriptionId;

    fn event(source: Coordinates, payload: EventPayload) -> TransportEvent {
        TransportEvent::new(SubscriptionId::new(), source, payload)
    }

    fn parameter(value: i64) -> EventPayload {
        EventPayload::Parameter { value: Value::Int(value) }
    }

    fn table(update: RowUpdate) -> EventPayload {
        EventPayload::Table { update: Some(update) }
    }

    #[test]
    fn parameter_event_becomes_single_field_row() {
        let matcher = TargetMatcher::new(Target::Parameter("1/2/10".parse().unwrap()));
        let ev = event(Coordinates::parameter(1, 2, 10), parameter(5));
        let MatchOutput::Match(x) = matcher.evaluate(&ev).unwrap() else {
            panic!("expected match");
        };
        assert_eq!(x.row, "10");
        assert_eq!(x.update, Some(RowUpdate::upsert("10", vec![Some(Value::Int(5))])));
    }

    #[test]
    fn other_coordinates_do_not_match() {
        let matcher = TargetMatcher::new(Target::Parameter("1/2/10".parse().unwrap()));
        let ev = event(Coordinates::parameter(1, 3, 10), parameter(5));
        assert_eq!(matcher.evaluate(&ev).unwrap(), MatchOutput::NoMatch);
    }

    #[test]
    fn wrong_payload_kind_is_error() {
        let matcher = TargetMatcher::new(Target::Parameter("1/2/10".parse().unwrap()));
        let ev = event(Coordinates::parameter(1, 2, 10), EventPayload::Table { update: None });
        assert!(matcher.evaluate(&ev).is_err());
    }

    #[test]
    fn table_update_is_restricted_to_watched_cell() {
        let matcher = TargetMatcher::new(Target::Cell("1/2/2000/1/r1".parse().unwrap()));
        let update = RowUpdate::upsert("r1", vec![Some(Value::Int(1)), Some(Value::Int(2))])
            .with_upsert("r2", vec![Some(Value::Int(3)), Some(Value::Int(4))]);
        let ev = event(Coordinates::parameter(1, 2, 2000), table(update));

        let MatchOutput::Match(x) = matcher.evaluate(&ev).unwrap() else {
            panic!("expected match");
        };
        assert_eq!(x.update, Some(RowUpdate::upsert("r1", vec![None, Some(Value::Int(2))])));
        assert_eq!(x.source.to_string(), "1/2/2000/1/r1");
    }

    #[test]
    fn table_update_for_other_rows_is_no_match() {
        let matcher = TargetMatcher::new(Target::Cell("1/2/2000/1/r1".parse().unwrap()));
        let update = RowUpdate::upsert("r2", vec![Some(Value::Int(3)), Some(Value::Int(4))]);
        let ev = event(Coordinates::parameter(1, 2, 2000), table(update));
        assert_eq!(matcher.evaluate(&ev).unwrap(), MatchOutput::NoMatch);
    }

    #[test]
    fn row_deletion_is_kept() {
        let matcher = TargetMatcher::new(Target::Cell("1/2/2000/0/r1".parse().unwrap()));
        let ev = event(
            Coordinates::parameter(1, 2, 2000),
            EventPayload::Table {
                update: Some(RowUpdate::delete("r1")),
            },
        );
        let MatchOutput::Match(x) = matcher.evaluate(&ev).unwrap() else {
            panic!("expected match");
        };
        assert_eq!(x.update, Some(RowUpdate::delete("r1")));
    }

    #[test]
    fn bodiless_table_event_matches_without_update() {
        let matcher = TargetMatcher::new(Target::Cell("1/2/2000/0/r1".parse().unwrap()));
        let ev = event(Coordinates::parameter(1, 2, 2000), EventPayload::Table { update: None });
        let MatchOutput::Match(x) = matcher.evaluate(&ev).unwrap() else {
            panic!("expected match");
        };
        assert!(x.update.is_none());
    }

    #[test]
    fn call_reply_keyed_by_correlation_id() {
        let matcher = TargetMatcher::new(Target::Calls("1/2".parse().unwrap()));
        let ev = event(
            Coordinates::element(1, 2),
            EventPayload::Message {
                correlation_id: "abc".to_string(),
                body: Value::String("ok".to_string()),
            },
        );
        let MatchOutput::Match(x) = matcher.evaluate(&ev).unwrap() else {
            panic!("expected match");
        };
        assert_eq!(x.row, "abc");
        assert_eq!(x.source.row.as_deref(), Some("abc"));
    }
}
