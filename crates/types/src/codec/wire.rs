//! Record value encoding.
//!
//! Layout rules:
//!
//! - Fixed-size scalars are stored bare, using their ascending encoding.
//! - Strings, vectors and nested structs are `[len:4][payload]`, where `len` is the
//!   ascending-encoded (big-endian) payload size in bytes.
//! - Variants are `[tag:4][len:4][payload]`, so a reader that does not know `tag` can still skip
//!   the value.
//!
//! [`Wire::serialized_size`] is computed without serializing so callers can size buffers in a
//! single pass.

use byteorder::{BigEndian, ByteOrder};

use super::{Ascending, CodecError, take};
use crate::field::{FieldType, FieldValue};

/// Size of a length prefix or variant tag.
pub const PREFIX_SIZE: usize = 4;

/// Types that can be stored as record fields.
pub trait Wire: Sized {
    /// The field type recorded in schema descriptors.
    const FIELD_TYPE: FieldType;

    /// Appends the serialized form of `self` to `out`.
    fn serialize(&self, out: &mut Vec<u8>);

    /// Reads a value from the front of `buf`, advancing it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ShortBuffer`] or [`CodecError::LengthOverrun`] when the buffer is
    /// too short for the declared content.
    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError>;

    /// Returns the exact number of bytes [`serialize`](Wire::serialize) appends.
    fn serialized_size(&self) -> usize;

    /// Converts to a dynamic field value.
    ///
    /// Non-scalar types produce [`FieldValue::Raw`] holding their serialized bytes.
    fn to_value(&self) -> FieldValue {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        self.serialize(&mut bytes);
        FieldValue::Raw { field_type: Self::FIELD_TYPE, bytes }
    }

    /// Converts back from a dynamic field value, widening scalars where allowed.
    ///
    /// Returns `None` when the value's type is incompatible.
    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::Raw { field_type, bytes } if field_type == Self::FIELD_TYPE => {
                deserialize(&bytes).ok()
            },
            _ => None,
        }
    }
}

/// Serializes a value into a pre-sized buffer.
pub fn serialize<T: Wire>(value: &T) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.serialized_size());
    value.serialize(&mut out);
    out
}

/// Deserializes a value that must occupy the whole of `bytes`.
///
/// # Errors
///
/// Returns the decode error of `T`, or [`CodecError::TrailingBytes`] when bytes are left over.
pub fn deserialize<T: Wire>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut buf = bytes;
    let value = T::deserialize(&mut buf)?;
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes { remaining: buf.len() });
    }
    Ok(value)
}

/// Returns the serialized size of a value.
pub fn serialized_size<T: Wire>(value: &T) -> usize {
    value.serialized_size()
}

/// Appends a 4-byte length prefix.
#[inline]
pub fn write_len(out: &mut Vec<u8>, len: usize) {
    debug_assert!(u32::try_from(len).is_ok(), "payload exceeds 4-byte length prefix");
    let mut tmp = [0u8; PREFIX_SIZE];
    BigEndian::write_u32(&mut tmp, len as u32);
    out.extend_from_slice(&tmp);
}

/// Reads a 4-byte length prefix.
///
/// # Errors
///
/// Returns [`CodecError::ShortBuffer`] if fewer than four bytes remain.
#[inline]
pub fn read_len(buf: &mut &[u8]) -> Result<usize, CodecError> {
    Ok(BigEndian::read_u32(take(buf, PREFIX_SIZE)?) as usize)
}

/// Reads a length prefix and splits off the payload it declares.
///
/// # Errors
///
/// Returns [`CodecError::LengthOverrun`] if the declared length exceeds the remaining bytes.
pub fn take_sized<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], CodecError> {
    let declared = read_len(buf)?;
    if declared > buf.len() {
        return Err(CodecError::LengthOverrun { declared, remaining: buf.len() });
    }
    take(buf, declared)
}

/// Appends a variant header: `[tag:4][len:4]`. The payload follows.
pub fn write_variant(out: &mut Vec<u8>, tag: u32, payload_len: usize) {
    tag.encode_ascending(out);
    write_len(out, payload_len);
}

/// Reads a variant header and returns the tag with its payload.
///
/// # Errors
///
/// Returns [`CodecError::LengthOverrun`] if the declared payload overruns the buffer.
pub fn read_variant<'a>(buf: &mut &'a [u8]) -> Result<(u32, &'a [u8]), CodecError> {
    let tag = u32::decode_ascending(buf)?;
    let payload = take_sized(buf)?;
    Ok((tag, payload))
}

macro_rules! impl_wire_scalar {
    ($ty:ty, $variant:ident) => {
        impl Wire for $ty {
            const FIELD_TYPE: FieldType = FieldType::$variant;

            #[inline]
            fn serialize(&self, out: &mut Vec<u8>) {
                self.encode_ascending(out);
            }

            #[inline]
            fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
                <$ty as Ascending>::decode_ascending(buf)
            }

            #[inline]
            fn serialized_size(&self) -> usize {
                self.ascending_size()
            }

            fn to_value(&self) -> FieldValue {
                FieldValue::$variant(*self)
            }

            fn from_value(value: FieldValue) -> Option<Self> {
                match value.convert_to(FieldType::$variant)? {
                    FieldValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_wire_scalar!(bool, Bool);
impl_wire_scalar!(i8, I8);
impl_wire_scalar!(u8, U8);
impl_wire_scalar!(i16, I16);
impl_wire_scalar!(u16, U16);
impl_wire_scalar!(i32, I32);
impl_wire_scalar!(u32, U32);
impl_wire_scalar!(i64, I64);
impl_wire_scalar!(u64, U64);
impl_wire_scalar!(f32, F32);
impl_wire_scalar!(f64, F64);

impl Wire for String {
    const FIELD_TYPE: FieldType = FieldType::Str;

    fn serialize(&self, out: &mut Vec<u8>) {
        write_len(out, self.len());
        out.extend_from_slice(self.as_bytes());
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let payload = take_sized(buf)?;
        let text = std::str::from_utf8(payload).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(text.to_string())
    }

    fn serialized_size(&self) -> usize {
        PREFIX_SIZE + self.len()
    }

    fn to_value(&self) -> FieldValue {
        FieldValue::Str(self.clone())
    }

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    const FIELD_TYPE: FieldType = FieldType::Vector(T::FIELD_TYPE.type_id());

    fn serialize(&self, out: &mut Vec<u8>) {
        let payload: usize = self.iter().map(Wire::serialized_size).sum();
        write_len(out, payload);
        for item in self {
            item.serialize(out);
        }
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let mut payload = take_sized(buf)?;
        if let Some(size) = T::FIELD_TYPE.fixed_size() {
            if payload.len() % size != 0 {
                return Err(CodecError::InvalidLength {
                    reason: format!(
                        "vector payload of {} bytes is not a multiple of element size {size}",
                        payload.len()
                    ),
                });
            }
        }
        let mut items = Vec::new();
        while !payload.is_empty() {
            items.push(T::deserialize(&mut payload)?);
        }
        Ok(items)
    }

    fn serialized_size(&self) -> usize {
        PREFIX_SIZE + self.iter().map(Wire::serialized_size).sum::<usize>()
    }
}

/// Declares a plain struct stored as a nested, length-prefixed record field.
///
/// The tag identifies the struct in schema descriptors and must stay stable. Decoding ignores
/// payload bytes past the last known field, so fields may be appended later.
///
/// ```
/// tunerdb_types::wire_struct! {
///     /// DVB-T tuning parameters.
///     pub struct TerrestrialTuning: 3 {
///         frequency: u32,
///         bandwidth: u8,
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $tag:literal {
            $(
                $(#[$fmeta:meta])*
                $field:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $fty,
            )*
        }

        impl $crate::codec::Wire for $name {
            const FIELD_TYPE: $crate::field::FieldType = $crate::field::FieldType::Nested($tag);

            fn serialize(&self, out: &mut Vec<u8>) {
                let payload = 0usize $(+ $crate::codec::Wire::serialized_size(&self.$field))*;
                $crate::codec::write_len(out, payload);
                $( $crate::codec::Wire::serialize(&self.$field, out); )*
            }

            fn deserialize(buf: &mut &[u8]) -> Result<Self, $crate::codec::CodecError> {
                #[allow(unused_mut, unused_variables)]
                let mut payload = $crate::codec::take_sized(buf)?;
                Ok(Self {
                    $( $field: <$fty as $crate::codec::Wire>::deserialize(&mut payload)?, )*
                })
            }

            fn serialized_size(&self) -> usize {
                $crate::codec::wire::PREFIX_SIZE
                    $(+ $crate::codec::Wire::serialized_size(&self.$field))*
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    crate::wire_struct! {
        struct Tuning: 9 {
            frequency: u32,
            label: String,
        }
    }

    #[test]
    fn test_string_layout() {
        assert_eq!(serialize(&"ab".to_string()), vec![0, 0, 0, 2, b'a', b'b']);
    }

    #[test]
    fn test_vector_roundtrip() {
        let pids: Vec<u16> = vec![0x100, 0x101, 0x1FFF];
        let bytes = serialize(&pids);
        assert_eq!(bytes.len(), pids.serialized_size());
        assert_eq!(deserialize::<Vec<u16>>(&bytes).unwrap(), pids);
    }

    #[test]
    fn test_vector_rejects_partial_element() {
        let mut bytes = Vec::new();
        write_len(&mut bytes, 3);
        bytes.extend_from_slice(&[0x01, 0x00, 0x01]);
        let err = deserialize::<Vec<u16>>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::InvalidLength { .. }));
    }

    #[test]
    fn test_nested_struct_roundtrip() {
        let tuning = Tuning { frequency: 11_494_000, label: "H".to_string() };
        let bytes = serialize(&tuning);
        assert_eq!(bytes.len(), tuning.serialized_size());
        assert_eq!(deserialize::<Tuning>(&bytes).unwrap(), tuning);
    }

    #[test]
    fn test_nested_struct_ignores_appended_fields() {
        let tuning = Tuning { frequency: 42, label: "V".to_string() };
        let mut payload = Vec::new();
        tuning.frequency.serialize(&mut payload);
        tuning.label.serialize(&mut payload);
        payload.extend_from_slice(&[0xAA, 0xBB]);
        let mut bytes = Vec::new();
        write_len(&mut bytes, payload.len());
        bytes.extend_from_slice(&payload);
        assert_eq!(deserialize::<Tuning>(&bytes).unwrap(), tuning);
    }

    #[test]
    fn test_length_overrun_detected() {
        let bytes = [0u8, 0, 0, 10, b'x'];
        let err = deserialize::<String>(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::LengthOverrun { declared: 10, remaining: 1 }));
    }

    #[test]
    fn test_variant_header_roundtrip() {
        let mut out = Vec::new();
        write_variant(&mut out, 7, 2);
        out.extend_from_slice(&[1, 2]);
        out.push(0xEE);
        let mut buf = &out[..];
        let (tag, payload) = read_variant(&mut buf).unwrap();
        assert_eq!(tag, 7);
        assert_eq!(payload, &[1, 2]);
        assert_eq!(buf, &[0xEE]);
    }

    #[test]
    fn test_vector_type_tracks_element_type() {
        assert_eq!(<Vec<u16> as Wire>::FIELD_TYPE, FieldType::Vector(FieldType::U16.type_id()));
        assert_ne!(<Vec<u16> as Wire>::FIELD_TYPE, <Vec<u32> as Wire>::FIELD_TYPE);
    }

    #[test]
    fn test_scalar_from_value_widens() {
        assert_eq!(<i64 as Wire>::from_value(FieldValue::I16(-5)), Some(-5));
        assert_eq!(<u16 as Wire>::from_value(FieldValue::U32(5)), None);
    }

    proptest! {
        #[test]
        fn prop_string_vector_roundtrip(items in proptest::collection::vec(".{0,12}", 0..8)) {
            let bytes = serialize(&items);
            prop_assert_eq!(bytes.len(), serialized_size(&items));
            prop_assert_eq!(deserialize::<Vec<String>>(&bytes).unwrap(), items);
        }

        #[test]
        fn prop_truncated_input_never_panics(items in proptest::collection::vec(any::<u32>(), 1..8), cut in 1usize..8) {
            let bytes = serialize(&items);
            let cut = cut.min(bytes.len());
            prop_assert!(deserialize::<Vec<u32>>(&bytes[..bytes.len() - cut]).is_err());
        }
    }
}
