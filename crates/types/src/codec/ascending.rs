//! Order-preserving key encoding.
//!
//! Every encoding here satisfies `a < b` ⟺ `encode(a) < encode(b)` under unsigned
//! lexicographic byte comparison, for values of the same type:
//!
//! - Unsigned integers: fixed-width big-endian.
//! - Signed integers: big-endian with the sign bit flipped.
//! - Floats: sign bit flipped for positives, all bits complemented for negatives. NaN has no
//!   defined position and must not be encoded. `-0.0` encodes as `+0.0`.
//! - Strings: UTF-8 content followed by a single zero terminator, no length prefix. Content
//!   containing a zero byte is unsupported.
//!
//! Fixed-width encodings and zero-terminated strings are prefix-free, so a concatenation of
//! encoded fields still sorts field-by-field. Composite keys rely on that.

use byteorder::{BigEndian, ByteOrder};

use super::{CodecError, take};

/// Types with an order-preserving byte encoding.
pub trait Ascending: Sized {
    /// Encoded width for fixed-size types, `None` for strings.
    const FIXED_SIZE: Option<usize>;

    /// Appends the ascending encoding of `self` to `out`.
    fn encode_ascending(&self, out: &mut Vec<u8>);

    /// Decodes a value from the front of `buf`, advancing it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ShortBuffer`] if too few bytes remain, or a string-specific error
    /// for unterminated or non-UTF-8 content.
    fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError>;

    /// Returns the number of bytes [`encode_ascending`](Ascending::encode_ascending) appends.
    fn ascending_size(&self) -> usize;
}

/// Encodes a single value into a fresh buffer.
pub fn encode_ascending<T: Ascending>(value: &T) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.ascending_size());
    value.encode_ascending(&mut out);
    out
}

/// Decodes a single value that must occupy the whole of `bytes`.
///
/// # Errors
///
/// Returns the decode error of `T`, or [`CodecError::TrailingBytes`] when bytes are left over.
pub fn decode_ascending<T: Ascending>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut buf = bytes;
    let value = T::decode_ascending(&mut buf)?;
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes { remaining: buf.len() });
    }
    Ok(value)
}

/// Appends a zero-terminated string without allocating a `String`.
pub fn encode_str_ascending(value: &str, out: &mut Vec<u8>) {
    debug_assert!(!value.as_bytes().contains(&0), "zero byte inside ascending string");
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

macro_rules! impl_unsigned {
    ($ty:ty, $size:expr, $read:ident, $write:ident) => {
        impl Ascending for $ty {
            const FIXED_SIZE: Option<usize> = Some($size);

            #[inline]
            fn encode_ascending(&self, out: &mut Vec<u8>) {
                let mut tmp = [0u8; $size];
                BigEndian::$write(&mut tmp, *self);
                out.extend_from_slice(&tmp);
            }

            #[inline]
            fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError> {
                Ok(BigEndian::$read(take(buf, $size)?))
            }

            #[inline]
            fn ascending_size(&self) -> usize {
                $size
            }
        }
    };
}

macro_rules! impl_signed {
    ($ty:ty, $uty:ty, $sign:expr) => {
        impl Ascending for $ty {
            const FIXED_SIZE: Option<usize> = <$uty as Ascending>::FIXED_SIZE;

            #[inline]
            fn encode_ascending(&self, out: &mut Vec<u8>) {
                ((*self as $uty) ^ $sign).encode_ascending(out);
            }

            #[inline]
            fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError> {
                Ok((<$uty>::decode_ascending(buf)? ^ $sign) as $ty)
            }

            #[inline]
            fn ascending_size(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        }
    };
}

macro_rules! impl_float {
    ($ty:ty, $bits:ty, $sign:expr) => {
        impl Ascending for $ty {
            const FIXED_SIZE: Option<usize> = <$bits as Ascending>::FIXED_SIZE;

            #[inline]
            fn encode_ascending(&self, out: &mut Vec<u8>) {
                debug_assert!(!self.is_nan(), "NaN has no ascending encoding");
                // -0.0 and +0.0 compare equal, so they share the +0.0 encoding.
                let value = if *self == 0.0 { 0.0 } else { *self };
                let bits = value.to_bits();
                let ordered = if bits & $sign != 0 { !bits } else { bits | $sign };
                ordered.encode_ascending(out);
            }

            #[inline]
            fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError> {
                let ordered = <$bits>::decode_ascending(buf)?;
                let bits = if ordered & $sign != 0 { ordered & !$sign } else { !ordered };
                Ok(<$ty>::from_bits(bits))
            }

            #[inline]
            fn ascending_size(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        }
    };
}

impl Ascending for u8 {
    const FIXED_SIZE: Option<usize> = Some(1);

    #[inline]
    fn encode_ascending(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }

    #[inline]
    fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(take(buf, 1)?[0])
    }

    #[inline]
    fn ascending_size(&self) -> usize {
        1
    }
}

impl_unsigned!(u16, 2, read_u16, write_u16);
impl_unsigned!(u32, 4, read_u32, write_u32);
impl_unsigned!(u64, 8, read_u64, write_u64);

impl_signed!(i8, u8, 0x80u8);
impl_signed!(i16, u16, 0x8000u16);
impl_signed!(i32, u32, 0x8000_0000u32);
impl_signed!(i64, u64, 0x8000_0000_0000_0000u64);

impl_float!(f32, u32, 0x8000_0000u32);
impl_float!(f64, u64, 0x8000_0000_0000_0000u64);

impl Ascending for bool {
    const FIXED_SIZE: Option<usize> = Some(1);

    #[inline]
    fn encode_ascending(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    #[inline]
    fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError> {
        Ok(take(buf, 1)?[0] != 0)
    }

    #[inline]
    fn ascending_size(&self) -> usize {
        1
    }
}

impl Ascending for String {
    const FIXED_SIZE: Option<usize> = None;

    fn encode_ascending(&self, out: &mut Vec<u8>) {
        encode_str_ascending(self, out);
    }

    fn decode_ascending(buf: &mut &[u8]) -> Result<Self, CodecError> {
        let Some(end) = buf.iter().position(|&b| b == 0) else {
            return Err(CodecError::Unterminated);
        };
        let content = take(buf, end + 1)?;
        let text = std::str::from_utf8(&content[..end]).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(text.to_string())
    }

    fn ascending_size(&self) -> usize {
        self.len() + 1
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn roundtrip<T: Ascending + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = encode_ascending(&value);
        assert_eq!(bytes.len(), value.ascending_size());
        assert_eq!(decode_ascending::<T>(&bytes).unwrap(), value);
    }

    #[test]
    fn test_roundtrip_extremes() {
        roundtrip(0u8);
        roundtrip(u16::MAX);
        roundtrip(u32::MAX);
        roundtrip(u64::MAX);
        roundtrip(i8::MIN);
        roundtrip(i16::MIN);
        roundtrip(i32::MIN);
        roundtrip(i64::MIN);
        roundtrip(i64::MAX);
        roundtrip(f32::NEG_INFINITY);
        roundtrip(f64::INFINITY);
        roundtrip(-0.0f64);
        roundtrip(true);
        roundtrip(String::new());
        roundtrip("BBC One HD".to_string());
    }

    #[test]
    fn test_signed_sign_bit_flipped() {
        assert_eq!(encode_ascending(&0i16), vec![0x80, 0x00]);
        assert_eq!(encode_ascending(&-1i16), vec![0x7F, 0xFF]);
        assert_eq!(encode_ascending(&i32::MIN), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_string_is_zero_terminated() {
        assert_eq!(encode_ascending(&"ab".to_string()), vec![b'a', b'b', 0]);
    }

    #[test]
    fn test_string_prefix_sorts_first() {
        let short = encode_ascending(&"ab".to_string());
        let long = encode_ascending(&"abc".to_string());
        assert!(short < long);
    }

    #[test]
    fn test_decode_short_buffer() {
        let err = decode_ascending::<u32>(&[1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::ShortBuffer { needed: 4, remaining: 2 }));
    }

    #[test]
    fn test_decode_unterminated_string() {
        let err = decode_ascending::<String>(b"abc").unwrap_err();
        assert!(matches!(err, CodecError::Unterminated));
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let err = decode_ascending::<u8>(&[1, 2]).unwrap_err();
        assert!(matches!(err, CodecError::TrailingBytes { remaining: 1 }));
    }

    #[test]
    fn test_negative_zero_encodes_as_positive_zero() {
        assert_eq!(encode_ascending(&-0.0f32), encode_ascending(&0.0f32));
        assert_eq!(encode_ascending(&-0.0f64), encode_ascending(&0.0f64));
        assert!(encode_ascending(&-f64::MIN_POSITIVE) < encode_ascending(&-0.0f64));
        let decoded = decode_ascending::<f64>(&encode_ascending(&-0.0f64)).unwrap();
        assert!(decoded.is_sign_positive());
    }

    proptest! {
        #[test]
        fn prop_i64_order_preserved(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), encode_ascending(&a).cmp(&encode_ascending(&b)));
        }

        #[test]
        fn prop_i16_order_preserved(a in any::<i16>(), b in any::<i16>()) {
            prop_assert_eq!(a.cmp(&b), encode_ascending(&a).cmp(&encode_ascending(&b)));
        }

        #[test]
        fn prop_u32_order_preserved(a in any::<u32>(), b in any::<u32>()) {
            prop_assert_eq!(a.cmp(&b), encode_ascending(&a).cmp(&encode_ascending(&b)));
        }

        #[test]
        fn prop_f64_order_preserved(
            a in proptest::num::f64::NORMAL | proptest::num::f64::SUBNORMAL | proptest::num::f64::INFINITE,
            b in proptest::num::f64::NORMAL | proptest::num::f64::SUBNORMAL | proptest::num::f64::INFINITE,
        ) {
            let native = a.partial_cmp(&b).unwrap();
            prop_assert_eq!(native, encode_ascending(&a).cmp(&encode_ascending(&b)));
        }

        #[test]
        fn prop_f32_roundtrip(v in proptest::num::f32::ANY.prop_filter("no NaN", |v| !v.is_nan())) {
            let decoded = decode_ascending::<f32>(&encode_ascending(&v)).unwrap();
            prop_assert_eq!(v.to_bits(), decoded.to_bits());
        }

        #[test]
        fn prop_string_order_preserved(a in "[a-zA-Z0-9 ]{0,16}", b in "[a-zA-Z0-9 ]{0,16}") {
            let ea = encode_ascending(&a);
            let eb = encode_ascending(&b);
            prop_assert_eq!(a.as_bytes().cmp(b.as_bytes()), ea.cmp(&eb));
            prop_assert_eq!(decode_ascending::<String>(&ea).unwrap(), a);
        }
    }
}
