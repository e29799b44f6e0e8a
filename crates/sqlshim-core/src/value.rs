//! Dynamic SQL values.

use serde::{Deserialize, Serialize};

/// A bound prepared-statement argument.
///
/// Variants mirror the binary protocol parameter encodings: integers keep
/// their wire width and signedness, temporal, decimal and string types all
/// arrive as raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    /// NULL value
    #[default]
    Null,
    TinyInt(i8),
    UTinyInt(u8),
    SmallInt(i16),
    USmallInt(u16),
    Int(i32),
    UInt(u32),
    BigInt(i64),
    UBigInt(u64),
    Float(f32),
    Double(f64),
    /// Length-encoded payload (strings, blobs, decimals, dates)
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Is this an unsigned integer?
    pub const fn is_unsigned(&self) -> bool {
        matches!(
            self,
            Value::UTinyInt(_) | Value::USmallInt(_) | Value::UInt(_) | Value::UBigInt(_)
        )
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UBigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A field decoded from a backend text-protocol row.
///
/// Integer columns decode as `Signed`/`Unsigned` depending on the column's
/// UNSIGNED flag, FLOAT and DOUBLE as `Float`, everything else stays raw.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    String(Vec<u8>),
}

impl FieldValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Text-protocol rendering; `None` for NULL.
    ///
    /// Floats use the shortest representation that round-trips, without an
    /// exponent.
    pub fn to_text(&self) -> Option<Vec<u8>> {
        match self {
            FieldValue::Null => None,
            FieldValue::Unsigned(v) => Some(v.to_string().into_bytes()),
            FieldValue::Signed(v) => Some(v.to_string().into_bytes()),
            FieldValue::Float(v) => Some(v.to_string().into_bytes()),
            FieldValue::String(b) => Some(b.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_text() {
        assert_eq!(FieldValue::Null.to_text(), None);
        assert_eq!(FieldValue::Unsigned(u64::MAX).to_text().unwrap(), b"18446744073709551615");
        assert_eq!(FieldValue::Signed(-42).to_text().unwrap(), b"-42");
        assert_eq!(FieldValue::Float(1.5).to_text().unwrap(), b"1.5");
        assert_eq!(FieldValue::Float(3.0).to_text().unwrap(), b"3");
        assert_eq!(FieldValue::Float(1e21).to_text().unwrap(), b"1000000000000000000000");
        assert_eq!(
            FieldValue::String(b"abc".to_vec()).to_text().unwrap(),
            b"abc"
        );
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("hi"), Value::Bytes(b"hi".to_vec()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(7_i64)), Value::BigInt(7));
        assert!(Value::UInt(1).is_unsigned());
        assert!(!Value::Int(1).is_unsigned());
        assert_eq!(Value::default(), Value::Null);
        assert_eq!(Value::Bytes(vec![1]).as_bytes(), Some(&[1u8][..]));
        assert_eq!(Value::Int(1).as_bytes(), None);
    }
}
