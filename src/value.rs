//! Field values carried by change notifications.
//!
//! The correlation layer never interprets payload contents. It only needs to
//! compare two values for equality (change detection) and to render a value
//! into a stable textual fingerprint (result correlation).

use serde::{Deserialize, Serialize};

/// An opaque value reported by the remote system for a parameter, a table
/// cell or an inter-application reply.
///
/// # Examples
///
/// ```
/// use keywait::Value;
///
/// let a = Value::Int(5);
/// let b = Value::Float(5.0);
///
/// assert!(a.same_as(&b));
/// assert_eq!(a.fingerprint(), b.fingerprint());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Structured(serde_json::Value),
    #[default]
    Null,
}

impl Value {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    /// Value-equality used for change detection.
    ///
    /// `Int` and `Float` compare numerically and `NaN` equals `NaN`, so a
    /// source that alternates between integer and float encodings of the same
    /// reading does not produce spurious changes. Strings never equal numbers.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Int(_) | Self::Float(_), Self::Int(_) | Self::Float(_)) => {
                match (self.as_float(), other.as_float()) {
                    (Some(a), Some(b)) => a == b || (a.is_nan() && b.is_nan()),
                    _ => false,
                }
            }
            _ => self == other,
        }
    }

    /// Canonical text used when correlating results by fingerprint.
    ///
    /// Integral floats render without a fractional part so that `5` and `5.0`
    /// produce the same fingerprint. Strings render quoted and escaped and
    /// structured values carry a `json:` prefix, so no two variants share a
    /// rendering: `"5"` differs from `5`, `"null"` from `null`.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            #[allow(clippy::cast_possible_truncation)]
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 9.0e15 => {
                (*v as i64).to_string()
            }
            Self::Float(v) => v.to_string(),
            Self::String(v) => format!("{v:?}"),
            Self::Structured(v) => format!("json:{v}"),
            Self::Null => "null".to_string(),
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Structured(_) => "structured",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Structured(v) => write!(f, "{v}"),
            Self::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Structured(v)
    }
}
