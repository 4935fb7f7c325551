use num_traits::NumCast;
use serde::{Deserialize, Serialize};
use serde_json::Number;
use strum_macros::EnumString;

/// Supported destination types for a decoded field.
///
/// `Timestamp` is RFC 3339 text converted to Unix seconds; it decodes into
/// [`Value::Int64`].
#[derive(Clone, Copy, Debug, Deserialize, EnumString, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int64,
    UInt64,
    Float64,
    Utf8,
    Timestamp,
}

/// A single decoded value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Utf8(String),
}

impl Value {
    /// Returns the kind this value decodes as.
    #[must_use]
    pub fn kind(&self) -> FieldKind {
        match self {
            Self::Bool(_) => FieldKind::Bool,
            Self::Int64(_) => FieldKind::Int64,
            Self::UInt64(_) => FieldKind::UInt64,
            Self::Float64(_) => FieldKind::Float64,
            Self::Utf8(_) => FieldKind::Utf8,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(v) => Some(v),
            _ => None,
        }
    }

    /// Converts a numeric value into any primitive numeric type.
    ///
    /// Returns `None` for non-numeric values and for conversions that do
    /// not fit the target type.
    #[must_use]
    pub fn to_num<T: NumCast>(&self) -> Option<T> {
        match self {
            Self::Int64(v) => NumCast::from(*v),
            Self::UInt64(v) => NumCast::from(*v),
            Self::Float64(v) => NumCast::from(*v),
            Self::Bool(_) | Self::Utf8(_) => None,
        }
    }

    /// Converts the value into a JSON value.
    ///
    /// Returns `None` for floats JSON cannot represent (NaN, infinities).
    #[must_use]
    pub fn into_json_value(self) -> Option<serde_json::Value> {
        match self {
            Self::Bool(v) => Some(serde_json::Value::Bool(v)),
            Self::Int64(v) => Some(serde_json::Value::Number(v.into())),
            Self::UInt64(v) => Some(serde_json::Value::Number(v.into())),
            Self::Float64(v) => Number::from_f64(v).map(serde_json::Value::Number),
            Self::Utf8(v) => Some(serde_json::Value::String(v)),
        }
    }
}
