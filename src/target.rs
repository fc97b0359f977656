//! Composite keys and the targets they address.
//!
//! A key is the slash-separated coordinate path of a remote data point:
//!
//! - `agent/element` for an element (inter-application replies)
//! - `agent/element/parameter` for a scalar parameter
//! - `agent/element/table/column/row` for a table cell
//!
//! Two targets share a subscription iff their [`Target::subscription_key`]
//! strings are equal.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CorrResult, CorrelatorError};

fn parse_id(key: &str, part: Option<&str>, what: &str) -> CorrResult<u32> {
    let Some(part) = part else {
        return Err(CorrelatorError::malformed_key(key, format!("missing {what}")));
    };
    part.trim()
        .parse::<u32>()
        .map_err(|_| {
            CorrelatorError::malformed_key(key, format!("{what} '{part}' is not a number"))
        })
}

/// Source coordinates of a delivered event or an observed change.
///
/// `parameter` is absent for element-level traffic such as inter-application
/// messages; `row` is absent for whole-table updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinates {
    pub agent: u32,
    pub element: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
}

impl Coordinates {
    /// Element-level coordinates.
    #[must_use]
    pub const fn element(agent: u32, element: u32) -> Self {
        Self {
            agent,
            element,
            parameter: None,
            column: None,
            row: None,
        }
    }

    /// Parameter (or whole table) coordinates.
    #[must_use]
    pub const fn parameter(agent: u32, element: u32, parameter: u32) -> Self {
        Self {
            agent,
            element,
            parameter: Some(parameter),
            column: None,
            row: None,
        }
    }

    #[must_use]
    pub fn with_row(mut self, column: usize, row: impl Into<String>) -> Self {
        self.column = Some(column);
        self.row = Some(row.into());
        self
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent, self.element)?;
        if let Some(pid) = self.parameter {
            write!(f, "/{pid}")?;
        }
        if let Some(column) = self.column {
            write!(f, "/{column}")?;
        }
        if let Some(row) = &self.row {
            write!(f, "/{row}")?;
        }
        Ok(())
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementKey {
    pub agent: u32,
    pub element: u32,
}

impl FromStr for ElementKey {
    type Err = CorrelatorError;

    fn from_str(key: &str) -> CorrResult<Self> {
        let mut parts = key.split('/');
        let agent = parse_id(key, parts.next(), "agent id")?;
        let element = parse_id(key, parts.next(), "element id")?;
        if parts.next().is_some() {
            return Err(CorrelatorError::malformed_key(key, "expected agent/element"));
        }
        Ok(Self { agent, element })
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent, self.element)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterKey {
    pub agent: u32,
    pub element: u32,
    pub parameter: u32,
}

impl FromStr for ParameterKey {
    type Err = CorrelatorError;

    fn from_str(key: &str) -> CorrResult<Self> {
        let mut parts = key.split('/');
        let agent = parse_id(key, parts.next(), "agent id")?;
        let element = parse_id(key, parts.next(), "element id")?;
        let parameter = parse_id(key, parts.next(), "parameter id")?;
        if parts.next().is_some() {
            return Err(CorrelatorError::malformed_key(key, "expected agent/element/parameter"));
        }
        Ok(Self {
            agent,
            element,
            parameter,
        })
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.agent, self.element, self.parameter)
    }
}

/// A single table cell. `column` is the zero-based position inside a row.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub agent: u32,
    pub element: u32,
    pub table: u32,
    pub column: usize,
    pub row: String,
}

impl FromStr for CellKey {
    type Err = CorrelatorError;

    fn from_str(key: &str) -> CorrResult<Self> {
        // The row key is the remainder and may itself contain slashes.
        let mut parts = key.splitn(5, '/');
        let agent = parse_id(key, parts.next(), "agent id")?;
        let element = parse_id(key, parts.next(), "element id")?;
        let table = parse_id(key, parts.next(), "table id")?;
        let column = parse_id(key, parts.next(), "column index")? as usize;
        let row = match parts.next() {
            Some(row) if !row.is_empty() => row.to_string(),
            _ => return Err(CorrelatorError::malformed_key(key, "missing row key")),
        };
        Ok(Self {
            agent,
            element,
            table,
            column,
            row,
        })
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.agent, self.element, self.table, self.column, self.row
        )
    }
}

/// One predicate of a subscription filter set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    /// Events originating from one element.
    Element { agent: u32, element: u32 },
    /// Events for one parameter or table.
    Parameter { parameter: u32 },
    /// Table events restricted to one row.
    Row { row: String },
    /// Element-level inter-application messages.
    Messages,
}

impl SubscriptionFilter {
    /// Whether an event at `source` passes this predicate.
    #[must_use]
    pub fn matches(&self, source: &Coordinates) -> bool {
        match self {
            Self::Element { agent, element } => {
                source.agent == *agent && source.element == *element
            }
            Self::Parameter { parameter } => source.parameter == Some(*parameter),
            Self::Row { row } => source.row.as_ref().map_or(true, |r| r == row),
            Self::Messages => source.parameter.is_none(),
        }
    }
}

impl fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Element { agent, element } => write!(f, "element={agent}/{element}"),
            Self::Parameter { parameter } => write!(f, "parameter={parameter}"),
            Self::Row { row } => write!(f, "row={row}"),
            Self::Messages => write!(f, "messages"),
        }
    }
}

/// Canonical text of a filter set; identical sets produce identical text.
#[must_use]
pub fn filter_fingerprint(filters: &[SubscriptionFilter]) -> String {
    let mut sorted: Vec<&SubscriptionFilter> = filters.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";")
}

/// An addressable remote data point a monitor watches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    Parameter(ParameterKey),
    Cell(CellKey),
    /// Replies to inter-application calls addressed to one element.
    Calls(ElementKey),
}

impl Target {
    /// The minimal unique key a monitor for this target is grouped under.
    #[must_use]
    pub fn subscription_key(&self) -> String {
        match self {
            Self::Parameter(k) => k.to_string(),
            Self::Cell(k) => k.to_string(),
            Self::Calls(k) => format!("{k}/calls"),
        }
    }

    /// Filter predicates registered with the transport for this target.
    #[must_use]
    pub fn filters(&self) -> Vec<SubscriptionFilter> {
        match self {
            Self::Parameter(k) => vec![
                SubscriptionFilter::Element {
                    agent: k.agent,
                    element: k.element,
                },
                SubscriptionFilter::Parameter {
                    parameter: k.parameter,
                },
            ],
            Self::Cell(k) => vec![
                SubscriptionFilter::Element {
                    agent: k.agent,
                    element: k.element,
                },
                SubscriptionFilter::Parameter { parameter: k.table },
                SubscriptionFilter::Row { row: k.row.clone() },
            ],
            Self::Calls(k) => vec![
                SubscriptionFilter::Element {
                    agent: k.agent,
                    element: k.element,
                },
                SubscriptionFilter::Messages,
            ],
        }
    }

    /// Whether an event at `source` concerns this target.
    #[must_use]
    pub fn matches(&self, source: &Coordinates) -> bool {
        match self {
            Self::Parameter(k) => {
                source.agent == k.agent
                    && source.element == k.element
                    && source.parameter == Some(k.parameter)
            }
            Self::Cell(k) => {
                source.agent == k.agent
                    && source.element == k.element
                    && source.parameter == Some(k.table)
                    && source.row.as_ref().map_or(true, |r| *r == k.row)
            }
            Self::Calls(k) => {
                source.agent == k.agent && source.element == k.element && source.parameter.is_none()
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subscription_key())
    }
}
