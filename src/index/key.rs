//! Canonical index-key encoding.
//!
//! `value_to_key` maps a typed scalar to a byte string whose lexicographic
//! order equals the value order within that type. Each type carries a
//! distinct prefix, so an index holding mixed types stays totally ordered
//! with types grouped together.
//!
//! - null   → `\x00null`
//! - bool   → `b:false` / `b:true`
//! - int64  → `i:` + 20-digit zero-padded decimal of the value biased by
//!   2^63 into u64 space, monotonic across the whole i64 range
//! - float64 → `f:` + 20-digit zero-padded decimal of the IEEE-754 bits
//!   after sign normalization (positive: sign bit set; negative: all bits
//!   flipped), so byte order equals numeric order
//! - string → `s:` + UTF-8 bytes
//!
//! NaN is not indexable: encoding it is a `Type` error. Documents and arrays
//! are not indexable and encode to `None`; the index maintenance layer skips
//! them, as it skips null values.

use crate::core::errors::NovusError;
use crate::core::value::Value;

/// Hard cap so any leaf entry fits a 4 KiB node with room to split.
pub const MAX_KEY_LEN: usize = 1024;

const NULL_KEY: &[u8] = b"\x00null";

/// Sign-normalize an f64 so the transformed bits sort like the float.
fn normalize_f64(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits & 0x8000_0000_0000_0000 == 0 {
        bits | 0x8000_0000_0000_0000
    } else {
        !bits
    }
}

pub fn value_to_key(value: &Value) -> Result<Option<Vec<u8>>, NovusError> {
    let key = match value {
        Value::Null => NULL_KEY.to_vec(),
        Value::Bool(false) => b"b:false".to_vec(),
        Value::Bool(true) => b"b:true".to_vec(),
        Value::Int(i) => {
            let biased = (*i as u64).wrapping_add(1u64 << 63);
            format!("i:{biased:020}").into_bytes()
        }
        Value::Float(f) => {
            if f.is_nan() {
                return Err(NovusError::Type("NaN is not indexable".into()));
            }
            format!("f:{:020}", normalize_f64(*f)).into_bytes()
        }
        Value::Str(s) => {
            let mut key = Vec::with_capacity(2 + s.len());
            key.extend_from_slice(b"s:");
            key.extend_from_slice(s.as_bytes());
            key
        }
        Value::Doc(_) | Value::Array(_) => return Ok(None),
    };
    if key.len() > MAX_KEY_LEN {
        return Err(NovusError::Type(format!(
            "index key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(Some(key))
}

/// Encoding used for index maintenance: null and non-scalar values produce
/// no entry.
pub fn indexable_key(value: &Value) -> Result<Option<Vec<u8>>, NovusError> {
    if value.is_null() {
        return Ok(None);
    }
    value_to_key(value)
}

/// Render a key for plan display, e.g. `"s:mysql"`.
pub fn key_display(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(v: Value) -> Vec<u8> {
        value_to_key(&v).unwrap().unwrap()
    }

    #[test]
    fn bool_order() {
        assert!(key(Value::Bool(false)) < key(Value::Bool(true)));
    }

    #[test]
    fn int_order_across_sign() {
        let values = [i64::MIN, -1_000_000, -1, 0, 1, 7, 1_000_000, i64::MAX];
        for pair in values.windows(2) {
            assert!(
                key(Value::Int(pair[0])) < key(Value::Int(pair[1])),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn float_order_across_sign() {
        let values = [
            f64::NEG_INFINITY,
            -1e300,
            -2.5,
            -1.0,
            -0.0,
            0.5,
            1.0,
            2.5,
            1e300,
            f64::INFINITY,
        ];
        for pair in values.windows(2) {
            if pair[0] == pair[1] {
                continue;
            }
            assert!(
                key(Value::Float(pair[0])) < key(Value::Float(pair[1])),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn string_order_is_bytewise() {
        assert!(key(Value::from("a")) < key(Value::from("aa")));
        assert!(key(Value::from("a")) < key(Value::from("b")));
        assert_eq!(key(Value::from("mysql")), b"s:mysql".to_vec());
    }

    #[test]
    fn nan_is_rejected() {
        assert!(matches!(
            value_to_key(&Value::Float(f64::NAN)),
            Err(NovusError::Type(_))
        ));
    }

    #[test]
    fn composite_values_are_not_indexable() {
        assert_eq!(value_to_key(&Value::Doc(Default::default())).unwrap(), None);
        assert_eq!(value_to_key(&Value::Array(vec![])).unwrap(), None);
    }

    #[test]
    fn null_is_encodable_but_not_indexed() {
        assert_eq!(value_to_key(&Value::Null).unwrap().unwrap(), b"\x00null");
        assert_eq!(indexable_key(&Value::Null).unwrap(), None);
    }

    #[test]
    fn oversized_key_is_rejected() {
        let s = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            value_to_key(&Value::Str(s)),
            Err(NovusError::Type(_))
        ));
    }

    proptest! {
        #[test]
        fn int_encoding_is_monotonic(a in any::<i64>(), b in any::<i64>()) {
            if a < b {
                prop_assert!(key(Value::Int(a)) < key(Value::Int(b)));
            }
        }

        #[test]
        fn float_encoding_is_monotonic(
            a in prop_oneof![prop::num::f64::NORMAL, prop::num::f64::ZERO],
            b in prop_oneof![prop::num::f64::NORMAL, prop::num::f64::ZERO],
        ) {
            if a < b {
                prop_assert!(key(Value::Float(a)) < key(Value::Float(b)));
            }
        }
    }
}
