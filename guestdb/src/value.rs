//! Parameter and column value types, and their encoding at the guest boundary.

use wasmtime::Val;

use crate::error::{Error, Result};

/// A value that can be bound to a prepared statement parameter or read from
/// a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// IEEE-754 double.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary blob.
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v.into())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Integer(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Blob(v.to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Convenience macro for building parameter lists.
///
/// Usage: `params![1_i64, blob.as_slice(), "text"]`
#[macro_export]
macro_rules! params {
    ($($val:expr),* $(,)?) => {
        &[$($crate::Value::from($val)),*][..]
    };
}

/// Encodes a float as the raw bit pattern of a guest `f64` argument.
pub(crate) const fn float_to_guest(v: f64) -> Val {
    Val::F64(v.to_bits())
}

/// Decodes a guest `f64` result bit for bit.
pub(crate) const fn float_from_guest(val: &Val) -> Option<f64> {
    match val {
        Val::F64(bits) => Some(f64::from_bits(*bits)),
        _ => None,
    }
}

/// Converts a host parameter or column index to the guest's `int`.
pub(crate) fn index(idx: usize) -> Result<i32> {
    i32::try_from(idx).map_err(|_| Error::Range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_bits_survive() {
        for v in [0.0, -0.0, 2.5, f64::MIN_POSITIVE / 2.0, f64::INFINITY] {
            let back = float_from_guest(&float_to_guest(v)).unwrap();
            assert_eq!(back.to_bits(), v.to_bits());
        }
        let payload = f64::from_bits(0x7ff8_dead_beef_0001);
        let back = float_from_guest(&float_to_guest(payload)).unwrap();
        assert_eq!(back.to_bits(), 0x7ff8_dead_beef_0001);
    }

    #[test]
    fn test_float_from_wrong_type() {
        assert_eq!(float_from_guest(&Val::I64(1)), None);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(true), Value::Integer(1));
        assert_eq!(Value::from(false), Value::Integer(0));
        assert_eq!(Value::from(7_i32), Value::Integer(7));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("a")), Value::Text("a".into()));
        let params = params![1_i64, &b"\x00\x01"[..], "x", 0.5];
        assert_eq!(
            params,
            &[
                Value::Integer(1),
                Value::Blob(vec![0, 1]),
                Value::Text("x".into()),
                Value::Float(0.5),
            ]
        );
    }

    #[test]
    fn test_index_range() {
        assert_eq!(index(3).unwrap(), 3);
        assert_eq!(index(usize::MAX).unwrap_err(), Error::Range);
    }
}
