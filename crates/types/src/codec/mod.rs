//! Byte encodings used by the record store.
//!
//! Three encodings live here, each with a distinct job:
//!
//! - [`ascending`]: order-preserving key encoding. Unsigned lexicographic comparison of the
//!   encoded bytes matches the natural ordering of the values.
//! - [`wire`]: the record value format. Fixed-size fields are stored bare, variable-size fields
//!   carry a 4-byte length prefix, variants additionally carry a 4-byte tag.
//! - [`encode`] / [`decode`]: postcard serialization for internal metadata such as the persisted
//!   schema descriptor.

pub mod ascending;
pub mod wire;

use serde::{Serialize, de::DeserializeOwned};
use snafu::Snafu;

pub use ascending::{Ascending, decode_ascending, encode_ascending};
pub use wire::{
    Wire, deserialize, read_len, read_variant, serialize, serialized_size, take_sized, write_len,
    write_variant,
};

/// Error type for codec operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    /// Fewer bytes remain than the value being decoded needs.
    #[snafu(display("Short buffer: needed {needed} bytes, {remaining} remaining"))]
    ShortBuffer {
        /// Bytes required by the value.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A length prefix points past the end of the buffer.
    #[snafu(display("Declared length {declared} overruns buffer ({remaining} remaining)"))]
    LengthOverrun {
        /// Length declared by the prefix.
        declared: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A zero-terminated string has no terminator.
    #[snafu(display("Unterminated string in key"))]
    Unterminated,

    /// String content is not valid UTF-8.
    #[snafu(display("Invalid UTF-8 in string field"))]
    InvalidUtf8,

    /// A length does not fit the 4-byte prefix or is inconsistent with the payload.
    #[snafu(display("Invalid length: {reason}"))]
    InvalidLength {
        /// Description of the inconsistency.
        reason: String,
    },

    /// Bytes were left over after a value that should consume the whole buffer.
    #[snafu(display("Trailing bytes after value: {remaining}"))]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },

    /// Encoding failed.
    #[snafu(display("Encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("Decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },
}

/// Splits `n` bytes off the front of `buf`.
///
/// # Errors
///
/// Returns [`CodecError::ShortBuffer`] if fewer than `n` bytes remain.
#[inline]
pub fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if buf.len() < n {
        return Err(CodecError::ShortBuffer { needed: n, remaining: buf.len() });
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|source| CodecError::Encode { source })
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns `CodecError::Decode` if deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|source| CodecError::Decode { source })
}
