//! Proptest strategies for tunerdb field values and keys.
//!
//! # Usage
//!
//! ```no_run
//! use tunerdb_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(value in strategies::arb_key_value()) {
//!         // test invariant with a random key field value
//!     }
//! }
//! ```

use proptest::prelude::*;
use tunerdb_types::FieldValue;

/// Generates a string that can appear in a key: any text without NUL, up to 24 chars.
pub fn arb_key_string() -> impl Strategy<Value = String> {
    "[^\u{0}]{0,24}"
}

/// Generates a finite `f64` (NaN orders inconsistently and never appears in keys).
pub fn arb_finite_f64() -> impl Strategy<Value = f64> {
    any::<f64>().prop_filter("finite", |v| v.is_finite())
}

/// Generates a value of any type usable as a key field.
pub fn arb_key_value() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i8>().prop_map(FieldValue::I8),
        any::<u8>().prop_map(FieldValue::U8),
        any::<i16>().prop_map(FieldValue::I16),
        any::<u16>().prop_map(FieldValue::U16),
        any::<i32>().prop_map(FieldValue::I32),
        any::<u32>().prop_map(FieldValue::U32),
        any::<i64>().prop_map(FieldValue::I64),
        any::<u64>().prop_map(FieldValue::U64),
        any::<f32>().prop_filter("finite", |v| v.is_finite()).prop_map(FieldValue::F32),
        arb_finite_f64().prop_map(FieldValue::F64),
        arb_key_string().prop_map(FieldValue::Str),
    ]
}

/// Generates a pair of values of the same key type, for ordering properties.
pub fn arb_same_type_pair() -> impl Strategy<Value = (FieldValue, FieldValue)> {
    prop_oneof![
        (any::<i16>(), any::<i16>()).prop_map(|(a, b)| (FieldValue::I16(a), FieldValue::I16(b))),
        (any::<u32>(), any::<u32>()).prop_map(|(a, b)| (FieldValue::U32(a), FieldValue::U32(b))),
        (any::<i64>(), any::<i64>()).prop_map(|(a, b)| (FieldValue::I64(a), FieldValue::I64(b))),
        (arb_finite_f64(), arb_finite_f64()).prop_map(|(a, b)| (FieldValue::F64(a), FieldValue::F64(b))),
        (arb_key_string(), arb_key_string()).prop_map(|(a, b)| (FieldValue::Str(a), FieldValue::Str(b))),
    ]
}
