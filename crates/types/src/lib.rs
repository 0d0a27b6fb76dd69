//! Core types for the tunerdb storage engine.
//!
//! This crate provides the foundations shared by the engine and its tools:
//! - Order-preserving key encoding and the record wire format ([`codec`])
//! - Field types and dynamically typed field values ([`field`])
//! - Validated configuration structs ([`config`])

pub mod codec;
pub mod config;
pub mod field;

// Re-export commonly used types at crate root
pub use codec::{Ascending, CodecError, Wire};
pub use field::{FieldType, FieldValue};
