//! Field types and dynamically typed field values.
//!
//! Schema descriptors identify every stored field by a stable `type_id`. Degraded decoding,
//! screen predicates and dynamic sort keys all work on [`FieldValue`]s so they can handle record
//! fields without knowing the concrete Rust type.

use std::{cmp::Ordering, fmt};

use crate::codec::{
    Ascending, CodecError, Wire, ascending::encode_str_ascending, read_len, take, wire::PREFIX_SIZE,
};

const VECTOR_TAG: u32 = 0x0100_0000;
const NESTED_TAG: u32 = 0x0200_0000;
const VARIANT_TAG: u32 = 0x0300_0000;
const TAG_MASK: u32 = 0xFF00_0000;

/// The type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Boolean, one byte.
    Bool,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// UTF-8 string.
    Str,
    /// Vector of elements with the given element type id.
    Vector(u32),
    /// Nested struct with the given tag.
    Nested(u32),
    /// Tagged variant with the given tag.
    Variant(u32),
}

impl FieldType {
    /// Returns the stable numeric id stored in schema descriptors.
    pub const fn type_id(self) -> u32 {
        match self {
            Self::Bool => 1,
            Self::I8 => 2,
            Self::U8 => 3,
            Self::I16 => 4,
            Self::U16 => 5,
            Self::I32 => 6,
            Self::U32 => 7,
            Self::I64 => 8,
            Self::U64 => 9,
            Self::F32 => 10,
            Self::F64 => 11,
            Self::Str => 12,
            Self::Vector(elem) => VECTOR_TAG | (elem & !TAG_MASK),
            Self::Nested(tag) => NESTED_TAG | (tag & !TAG_MASK),
            Self::Variant(tag) => VARIANT_TAG | (tag & !TAG_MASK),
        }
    }

    /// Reverses [`type_id`](Self::type_id). Returns `None` for unknown ids.
    pub fn from_type_id(type_id: u32) -> Option<Self> {
        let ty = match type_id {
            1 => Self::Bool,
            2 => Self::I8,
            3 => Self::U8,
            4 => Self::I16,
            5 => Self::U16,
            6 => Self::I32,
            7 => Self::U32,
            8 => Self::I64,
            9 => Self::U64,
            10 => Self::F32,
            11 => Self::F64,
            12 => Self::Str,
            id => match id & TAG_MASK {
                VECTOR_TAG => Self::Vector(id & !TAG_MASK),
                NESTED_TAG => Self::Nested(id & !TAG_MASK),
                VARIANT_TAG => Self::Variant(id & !TAG_MASK),
                _ => return None,
            },
        };
        Some(ty)
    }

    /// Serialized width for fixed-size types, `None` for length-prefixed ones.
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Some(1),
            Self::I16 | Self::U16 => Some(2),
            Self::I32 | Self::U32 | Self::F32 => Some(4),
            Self::I64 | Self::U64 | Self::F64 => Some(8),
            Self::Str | Self::Vector(_) | Self::Nested(_) | Self::Variant(_) => None,
        }
    }

    /// Whether values of this type may appear in keys.
    pub const fn is_key_type(self) -> bool {
        !matches!(self, Self::Vector(_) | Self::Nested(_) | Self::Variant(_))
    }

    /// `(signed, bits)` for integer types.
    const fn int_shape(self) -> Option<(bool, u32)> {
        match self {
            Self::I8 => Some((true, 8)),
            Self::U8 => Some((false, 8)),
            Self::I16 => Some((true, 16)),
            Self::U16 => Some((false, 16)),
            Self::I32 => Some((true, 32)),
            Self::U32 => Some((false, 32)),
            Self::I64 => Some((true, 64)),
            Self::U64 => Some((false, 64)),
            _ => None,
        }
    }

    /// Whether every value of `self` is exactly representable as `target`.
    pub fn widens_to(self, target: Self) -> bool {
        if self == target {
            return true;
        }
        match (self.int_shape(), target.int_shape()) {
            (Some((false, from)), Some((false, to))) => to >= from,
            (Some((false, from)), Some((true, to))) => to > from,
            (Some((true, from)), Some((true, to))) => to >= from,
            (Some(_), Some(_)) => false,
            (Some((_, from)), None) => match target {
                Self::F64 => from <= 32,
                Self::F32 => from <= 16,
                _ => false,
            },
            (None, _) => matches!((self, target), (Self::F32, Self::F64)),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector(elem) => write!(f, "vector<{elem:#x}>"),
            Self::Nested(tag) => write!(f, "nested<{tag}>"),
            Self::Variant(tag) => write!(f, "variant<{tag}>"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

/// A dynamically typed field value.
///
/// Containers are kept as their serialized bytes (including the length prefix), which is
/// enough to copy them between records and to compare them for equality.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Boolean value.
    Bool(bool),
    /// Signed 8-bit value.
    I8(i8),
    /// Unsigned 8-bit value.
    U8(u8),
    /// Signed 16-bit value.
    I16(i16),
    /// Unsigned 16-bit value.
    U16(u16),
    /// Signed 32-bit value.
    I32(i32),
    /// Unsigned 32-bit value.
    U32(u32),
    /// Signed 64-bit value.
    I64(i64),
    /// Unsigned 64-bit value.
    U64(u64),
    /// 32-bit float value.
    F32(f32),
    /// 64-bit float value.
    F64(f64),
    /// String value.
    Str(String),
    /// Serialized container value.
    Raw {
        /// Type of the container.
        field_type: FieldType,
        /// Complete serialized form, prefixes included.
        bytes: Vec<u8>,
    },
}

impl FieldValue {
    /// Returns the type of this value.
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::I8(_) => FieldType::I8,
            Self::U8(_) => FieldType::U8,
            Self::I16(_) => FieldType::I16,
            Self::U16(_) => FieldType::U16,
            Self::I32(_) => FieldType::I32,
            Self::U32(_) => FieldType::U32,
            Self::I64(_) => FieldType::I64,
            Self::U64(_) => FieldType::U64,
            Self::F32(_) => FieldType::F32,
            Self::F64(_) => FieldType::F64,
            Self::Str(_) => FieldType::Str,
            Self::Raw { field_type, .. } => *field_type,
        }
    }

    fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Self::I8(v) => i128::from(v),
            Self::U8(v) => i128::from(v),
            Self::I16(v) => i128::from(v),
            Self::U16(v) => i128::from(v),
            Self::I32(v) => i128::from(v),
            Self::U32(v) => i128::from(v),
            Self::I64(v) => i128::from(v),
            Self::U64(v) => i128::from(v),
            _ => return None,
        })
    }

    fn as_f64(&self) -> Option<f64> {
        Some(match *self {
            Self::F32(v) => f64::from(v),
            Self::F64(v) => v,
            Self::I8(v) => f64::from(v),
            Self::U8(v) => f64::from(v),
            Self::I16(v) => f64::from(v),
            Self::U16(v) => f64::from(v),
            Self::I32(v) => f64::from(v),
            Self::U32(v) => f64::from(v),
            Self::I64(v) => v as f64,
            Self::U64(v) => v as f64,
            _ => return None,
        })
    }

    /// Converts to `target`, allowing identity and lossless widening only.
    ///
    /// Returns `None` when the conversion could lose information or the types are unrelated.
    pub fn convert_to(self, target: FieldType) -> Option<Self> {
        let source = self.field_type();
        if source == target {
            return Some(self);
        }
        if !source.widens_to(target) {
            return None;
        }
        if let Some(v) = self.as_i128() {
            let converted = match target {
                FieldType::I16 => Self::I16(i16::try_from(v).ok()?),
                FieldType::U16 => Self::U16(u16::try_from(v).ok()?),
                FieldType::I32 => Self::I32(i32::try_from(v).ok()?),
                FieldType::U32 => Self::U32(u32::try_from(v).ok()?),
                FieldType::I64 => Self::I64(i64::try_from(v).ok()?),
                FieldType::U64 => Self::U64(u64::try_from(v).ok()?),
                // Exact: widens_to admits at most 16-bit sources for f32 and 32-bit for f64.
                FieldType::F32 => Self::F32(v as f32),
                FieldType::F64 => Self::F64(v as f64),
                _ => return None,
            };
            return Some(converted);
        }
        match (self, target) {
            (Self::F32(v), FieldType::F64) => Some(Self::F64(f64::from(v))),
            _ => None,
        }
    }

    /// Compares two values of compatible types.
    ///
    /// Integers compare numerically regardless of width, mixed integer/float pairs compare as
    /// floats, strings compare bytewise. Returns `None` for incomparable pairs (and for NaN).
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if let (Some(a), Some(b)) = (self.as_i128(), other.as_i128()) {
            return Some(a.cmp(&b));
        }
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            return a.partial_cmp(&b);
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Str(a), Self::Str(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            (
                Self::Raw { field_type: ta, bytes: a },
                Self::Raw { field_type: tb, bytes: b },
            ) if ta == tb => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// String prefix test. `false` for non-string values.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        match (self, prefix) {
            (Self::Str(s), Self::Str(p)) => s.starts_with(p.as_str()),
            _ => false,
        }
    }

    /// Substring test. `false` for non-string values.
    pub fn contains(&self, needle: &Self) -> bool {
        match (self, needle) {
            (Self::Str(s), Self::Str(n)) => s.contains(n.as_str()),
            _ => false,
        }
    }

    /// Appends the ascending (key) encoding of this value.
    ///
    /// Containers are never key fields; their serialized bytes are appended verbatim.
    pub fn encode_ascending(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bool(v) => v.encode_ascending(out),
            Self::I8(v) => v.encode_ascending(out),
            Self::U8(v) => v.encode_ascending(out),
            Self::I16(v) => v.encode_ascending(out),
            Self::U16(v) => v.encode_ascending(out),
            Self::I32(v) => v.encode_ascending(out),
            Self::U32(v) => v.encode_ascending(out),
            Self::I64(v) => v.encode_ascending(out),
            Self::U64(v) => v.encode_ascending(out),
            Self::F32(v) => v.encode_ascending(out),
            Self::F64(v) => v.encode_ascending(out),
            Self::Str(v) => encode_str_ascending(v, out),
            Self::Raw { bytes, .. } => out.extend_from_slice(bytes),
        }
    }

    /// Reads a value of type `field_type` in wire format from the front of `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for truncated or malformed input.
    pub fn read_wire(field_type: FieldType, buf: &mut &[u8]) -> Result<Self, CodecError> {
        let value = match field_type {
            FieldType::Bool => Self::Bool(bool::deserialize(buf)?),
            FieldType::I8 => Self::I8(i8::deserialize(buf)?),
            FieldType::U8 => Self::U8(u8::deserialize(buf)?),
            FieldType::I16 => Self::I16(i16::deserialize(buf)?),
            FieldType::U16 => Self::U16(u16::deserialize(buf)?),
            FieldType::I32 => Self::I32(i32::deserialize(buf)?),
            FieldType::U32 => Self::U32(u32::deserialize(buf)?),
            FieldType::I64 => Self::I64(i64::deserialize(buf)?),
            FieldType::U64 => Self::U64(u64::deserialize(buf)?),
            FieldType::F32 => Self::F32(f32::deserialize(buf)?),
            FieldType::F64 => Self::F64(f64::deserialize(buf)?),
            FieldType::Str => Self::Str(String::deserialize(buf)?),
            FieldType::Vector(_) | FieldType::Nested(_) | FieldType::Variant(_) => {
                let start = *buf;
                Self::skip_wire(field_type, buf)?;
                let consumed = start.len() - buf.len();
                Self::Raw { field_type, bytes: start[..consumed].to_vec() }
            },
        };
        Ok(value)
    }

    /// Skips a value of type `field_type` in wire format.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the buffer is too short or a length prefix overruns it.
    pub fn skip_wire(field_type: FieldType, buf: &mut &[u8]) -> Result<(), CodecError> {
        if let Some(size) = field_type.fixed_size() {
            take(buf, size)?;
            return Ok(());
        }
        if matches!(field_type, FieldType::Variant(_)) {
            take(buf, PREFIX_SIZE)?;
        }
        let declared = read_len(buf)?;
        if declared > buf.len() {
            return Err(CodecError::LengthOverrun { declared, remaining: buf.len() });
        }
        take(buf, declared)?;
        Ok(())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::I8(v) => write!(f, "{v}"),
            Self::U8(v) => write!(f, "{v}"),
            Self::I16(v) => write!(f, "{v}"),
            Self::U16(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::U32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Raw { field_type, bytes } => write!(f, "<{field_type}: {} bytes>", bytes.len()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::codec::{serialize, write_variant};

    #[test]
    fn test_type_id_roundtrip() {
        let types = [
            FieldType::Bool,
            FieldType::I64,
            FieldType::Str,
            FieldType::Vector(FieldType::U16.type_id()),
            FieldType::Nested(3),
            FieldType::Variant(1),
        ];
        for ty in types {
            assert_eq!(FieldType::from_type_id(ty.type_id()), Some(ty));
        }
        assert_eq!(FieldType::from_type_id(0), None);
        assert_eq!(FieldType::from_type_id(0x7F00_0000), None);
    }

    #[test]
    fn test_widening_rules() {
        assert!(FieldType::I16.widens_to(FieldType::I32));
        assert!(FieldType::U8.widens_to(FieldType::I16));
        assert!(FieldType::U32.widens_to(FieldType::U64));
        assert!(FieldType::F32.widens_to(FieldType::F64));
        assert!(FieldType::U16.widens_to(FieldType::F64));
        assert!(!FieldType::I32.widens_to(FieldType::U64));
        assert!(!FieldType::U32.widens_to(FieldType::I32));
        assert!(!FieldType::I64.widens_to(FieldType::I32));
        assert!(!FieldType::I64.widens_to(FieldType::F64));
        assert!(!FieldType::Str.widens_to(FieldType::U8));
    }

    #[test]
    fn test_convert_to_widens_value() {
        assert_eq!(FieldValue::I8(-3).convert_to(FieldType::I64), Some(FieldValue::I64(-3)));
        assert_eq!(FieldValue::U16(7).convert_to(FieldType::F64), Some(FieldValue::F64(7.0)));
        assert_eq!(FieldValue::F32(1.5).convert_to(FieldType::F64), Some(FieldValue::F64(1.5)));
        assert_eq!(FieldValue::U64(7).convert_to(FieldType::U32), None);
        assert_eq!(FieldValue::Str("x".into()).convert_to(FieldType::I32), None);
    }

    #[test]
    fn test_compare_across_widths() {
        assert_eq!(FieldValue::U8(5).compare(&FieldValue::I64(-1)), Some(Ordering::Greater));
        assert_eq!(FieldValue::I32(2).compare(&FieldValue::F64(2.5)), Some(Ordering::Less));
        assert_eq!(
            FieldValue::Str("BBC".into()).compare(&FieldValue::Str("ARD".into())),
            Some(Ordering::Greater)
        );
        assert_eq!(FieldValue::Str("1".into()).compare(&FieldValue::U8(1)), None);
    }

    #[test]
    fn test_string_matchers() {
        let name = FieldValue::Str("BBC One HD".into());
        assert!(name.starts_with(&FieldValue::Str("BBC".into())));
        assert!(name.contains(&FieldValue::Str("One".into())));
        assert!(!name.contains(&FieldValue::U8(1)));
    }

    #[test]
    fn test_read_wire_vector_keeps_prefix() {
        let pids: Vec<u16> = vec![100, 200];
        let mut bytes = serialize(&pids);
        bytes.push(0xFF);
        let mut buf = &bytes[..];
        let ty = FieldType::Vector(FieldType::U16.type_id());
        let value = FieldValue::read_wire(ty, &mut buf).unwrap();
        assert_eq!(value, FieldValue::Raw { field_type: ty, bytes: serialize(&pids) });
        assert_eq!(buf, &[0xFF]);
    }

    #[test]
    fn test_skip_wire_variant() {
        let mut bytes = Vec::new();
        write_variant(&mut bytes, 2, 3);
        bytes.extend_from_slice(&[1, 2, 3, 9]);
        let mut buf = &bytes[..];
        FieldValue::skip_wire(FieldType::Variant(1), &mut buf).unwrap();
        assert_eq!(buf, &[9]);
    }

    #[test]
    fn test_skip_wire_overrun() {
        let bytes = [0u8, 0, 0, 9, 1];
        let mut buf = &bytes[..];
        let err = FieldValue::skip_wire(FieldType::Str, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LengthOverrun { .. }));
    }

    #[test]
    fn test_encode_ascending_matches_typed() {
        let mut out = Vec::new();
        FieldValue::I32(-2).encode_ascending(&mut out);
        assert_eq!(out, crate::codec::encode_ascending(&-2i32));
    }
}
