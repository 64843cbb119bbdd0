//! Value Codec
//!
//! Converts [`PropValue`] to and from the dual-slot storage representation:
//! a type tag plus a string slot and a numeric slot, of which exactly one is
//! populated per value. Multi-valued properties are expanded element-by-
//! element by the storage engine; each element row carries the *negated* tag
//! so decoding can tell a list member from a scalar sharing the same
//! (node, name).
//!
//! Slot selection:
//!
//! | value  | tag | string slot      | numeric slot      |
//! |--------|-----|------------------|-------------------|
//! | Int    | 1   |                  | widened i64       |
//! | Long   | 2   |                  | as-is             |
//! | Double | 4   |                  | raw bit pattern   |
//! | Str    | 5   | as-is            |                   |
//! | Date   | 6   |                  | epoch millis      |
//! | Bool   | 7   | "true"/"false"   |                   |
//! | Blob   | 8   | base64           |                   |
//!
//! Tag 3 (float) is decoded for compatibility (f32 bits in the low half of
//! the numeric slot) but never produced. Doubles round-trip bit-exactly;
//! dates to millisecond precision.

use crate::error::RepoError;
use crate::models::PropValue;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::DateTime;

pub const TAG_UNKNOWN: i64 = 0;
pub const TAG_INT: i64 = 1;
pub const TAG_LONG: i64 = 2;
pub const TAG_FLOAT: i64 = 3;
pub const TAG_DOUBLE: i64 = 4;
pub const TAG_STRING: i64 = 5;
pub const TAG_DATE: i64 = 6;
pub const TAG_BOOL: i64 = 7;
pub const TAG_BLOB: i64 = 8;

/// Type tag for a scalar value. Lists are expanded by the caller and must
/// never reach this function.
pub fn type_tag(value: &PropValue) -> Result<i64, RepoError> {
    match value {
        PropValue::Int(_) => Ok(TAG_INT),
        PropValue::Long(_) => Ok(TAG_LONG),
        PropValue::Double(_) => Ok(TAG_DOUBLE),
        PropValue::Str(_) => Ok(TAG_STRING),
        PropValue::Date(_) => Ok(TAG_DATE),
        PropValue::Bool(_) => Ok(TAG_BOOL),
        PropValue::Blob(_) => Ok(TAG_BLOB),
        PropValue::List(_) => Err(RepoError::invalid_argument(
            "nested collections are not supported as property values",
        )),
    }
}

/// String slot for a scalar value, `None` when the value lives in the
/// numeric slot.
pub fn string_slot(value: &PropValue) -> Option<String> {
    match value {
        PropValue::Str(s) => Some(s.clone()),
        PropValue::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        PropValue::Blob(bytes) => Some(BASE64.encode(bytes)),
        _ => None,
    }
}

/// Numeric slot for a scalar value, `None` when the value lives in the
/// string slot.
pub fn numeric_slot(value: &PropValue) -> Option<i64> {
    match value {
        PropValue::Int(v) => Some(*v as i64),
        PropValue::Long(v) => Some(*v),
        PropValue::Double(v) => Some(v.to_bits() as i64),
        PropValue::Date(v) => Some(v.timestamp_millis()),
        _ => None,
    }
}

/// Encode a scalar value into its (tag, string slot, numeric slot) triple.
/// The tag is negated by the caller for list members.
pub fn encode(value: &PropValue) -> Result<(i64, Option<String>, Option<i64>), RepoError> {
    Ok((type_tag(value)?, string_slot(value), numeric_slot(value)))
}

/// Decode one storage row back into a value. The tag is taken by absolute
/// value (list members are negated); an unknown tag or an empty row decodes
/// to `None`.
pub fn decode(tag: i64, value_s: Option<&str>, value_n: Option<i64>) -> Option<PropValue> {
    match tag.abs() {
        TAG_INT => value_n.map(|n| PropValue::Int(n as i32)),
        TAG_LONG => value_n.map(PropValue::Long),
        TAG_FLOAT => value_n.map(|n| PropValue::Double(f32::from_bits(n as u32) as f64)),
        TAG_DOUBLE => value_n.map(|n| PropValue::Double(f64::from_bits(n as u64))),
        TAG_STRING => value_s.map(|s| PropValue::Str(s.to_string())),
        TAG_DATE => value_n
            .and_then(DateTime::from_timestamp_millis)
            .map(PropValue::Date),
        TAG_BOOL => value_s.map(|s| PropValue::Bool(s == "true")),
        TAG_BLOB => value_s
            .and_then(|s| BASE64.decode(s).ok())
            .map(PropValue::Blob),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn round_trip(v: PropValue) {
        let (tag, s, n) = encode(&v).unwrap();
        let back = decode(tag, s.as_deref(), n).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn round_trips_integers() {
        round_trip(PropValue::Int(0));
        round_trip(PropValue::Int(42));
        round_trip(PropValue::Int(-42));
        round_trip(PropValue::Int(i32::MIN));
        round_trip(PropValue::Long(i64::MAX));
        round_trip(PropValue::Long(-1));
    }

    #[test]
    fn round_trips_doubles_bit_exactly() {
        round_trip(PropValue::Double(0.1));
        round_trip(PropValue::Double(-1234.5678));
        round_trip(PropValue::Double(f64::MIN_POSITIVE));
        round_trip(PropValue::Double(f64::INFINITY));
    }

    #[test]
    fn round_trips_strings_and_bools() {
        round_trip(PropValue::Str("".into()));
        round_trip(PropValue::Str("héllo wörld".into()));
        round_trip(PropValue::Bool(true));
        round_trip(PropValue::Bool(false));
    }

    #[test]
    fn round_trips_dates_to_millis() {
        round_trip(PropValue::date(Utc::now()));
        round_trip(PropValue::Date(
            DateTime::from_timestamp_millis(1).unwrap(),
        ));
    }

    #[test]
    fn round_trips_blobs() {
        round_trip(PropValue::Blob(vec![]));
        round_trip(PropValue::Blob(vec![0, 1, 2, 255]));
    }

    #[test]
    fn negated_tag_decodes_like_positive() {
        let (tag, s, n) = encode(&PropValue::Int(7)).unwrap();
        assert_eq!(decode(-tag, s.as_deref(), n), Some(PropValue::Int(7)));
    }

    #[test]
    fn rejects_nested_lists() {
        let nested = PropValue::List(vec![PropValue::Int(1)]);
        assert!(encode(&nested).is_err());
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        assert_eq!(decode(TAG_UNKNOWN, None, None), None);
        assert_eq!(decode(99, Some("x"), Some(1)), None);
    }

    #[test]
    fn float_tag_decodes_low_bits() {
        let bits = 1.5f32.to_bits() as i64;
        assert_eq!(decode(TAG_FLOAT, None, Some(bits)), Some(PropValue::Double(1.5)));
    }
}
