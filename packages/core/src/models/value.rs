//! Property Values
//!
//! `PropValue` is the closed set of value types a node property can hold.
//! The storage engine persists every value into a dual-slot row (string slot,
//! numeric slot) plus a type tag - see [`crate::db::codec`]. Lists are
//! homogeneous and stored one row per element.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single typed property value.
///
/// Doubles survive round-trips bit-exactly (persisted via their raw bit
/// pattern), dates to millisecond precision (persisted as epoch millis).
/// `Blob` carries opaque caller-serialized bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropValue {
    Int(i32),
    Long(i64),
    Double(f64),
    Date(DateTime<Utc>),
    Bool(bool),
    Str(String),
    /// Homogeneous multi-valued property, one storage row per element
    List(Vec<PropValue>),
    /// Opaque serialized payload
    Blob(Vec<u8>),
}

impl PropValue {
    /// Millisecond-truncated date value. Sub-millisecond precision does not
    /// survive storage, so build date properties through this helper.
    pub fn date(ts: DateTime<Utc>) -> Self {
        match DateTime::from_timestamp_millis(ts.timestamp_millis()) {
            Some(t) => Self::Date(t),
            None => Self::Date(ts),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i32> for PropValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}
