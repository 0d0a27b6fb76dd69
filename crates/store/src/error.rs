//! Error types for the tunerdb storage engine.

use std::io;

use snafu::Snafu;
use tunerdb_types::{CodecError, config::ConfigError};

/// Result type alias for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur during engine operations.
///
/// "Not found" is never an error: lookups return `Option` and cursors become invalid.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The database file could not be opened or created.
    #[snafu(display("Failed to open database at {path}: {source}"))]
    Open {
        /// Path of the database file.
        path: String,
        /// The underlying redb error.
        source: redb::DatabaseError,
    },

    /// A transaction could not be started.
    #[snafu(display("Transaction error: {source}"))]
    Transaction {
        /// The underlying redb error.
        source: redb::TransactionError,
    },

    /// A table could not be opened.
    #[snafu(display("Table error: {source}"))]
    Table {
        /// The underlying redb error.
        source: redb::TableError,
    },

    /// A read or write inside a table failed.
    #[snafu(display("Storage error: {source}"))]
    Storage {
        /// The underlying redb error.
        source: redb::StorageError,
    },

    /// A write transaction failed to commit.
    #[snafu(display("Commit error: {source}"))]
    Commit {
        /// The underlying redb error.
        source: redb::CommitError,
    },

    /// Invalid configuration was supplied.
    #[snafu(display("Configuration error: {source}"))]
    Config {
        /// The validation failure.
        source: ConfigError,
    },

    /// Internal metadata (schema descriptor, counters) could not be encoded or decoded.
    #[snafu(display("Metadata codec error: {source}"))]
    Codec {
        /// The underlying codec error.
        source: CodecError,
    },

    /// A stored record could not be decoded.
    #[snafu(display("Failed to decode {record} record: {source}"))]
    Decode {
        /// Name of the record type.
        record: &'static str,
        /// The underlying codec error.
        source: CodecError,
    },

    /// Stored data is internally inconsistent.
    #[snafu(display("Corrupted database: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// An exact-key lookup was attempted while the database runs in degraded mode.
    #[snafu(display("Exact-key lookup of {record} refused: database schema differs (degraded mode)"))]
    DegradedLookup {
        /// Name of the record type.
        record: &'static str,
    },

    /// A write was attempted while the database runs in degraded mode.
    #[snafu(display("Write of {record} refused: database schema differs (degraded mode)"))]
    DegradedWrite {
        /// Name of the record type.
        record: &'static str,
    },

    /// A type id does not belong to the database schema.
    #[snafu(display("Unknown record type: {type_id}"))]
    UnknownRecordType {
        /// The unknown type id.
        type_id: u32,
    },

    /// A schema definition or sort key is invalid.
    #[snafu(display("Invalid schema: {reason}"))]
    Schema {
        /// Description of the problem.
        reason: String,
    },

    /// A database upgrade failed.
    #[snafu(display("Upgrade failed: {reason}"))]
    Upgrade {
        /// Description of the failure.
        reason: String,
    },

    /// I/O error while manipulating database files.
    #[snafu(display("I/O error on {path}: {source}"))]
    Io {
        /// The file being manipulated.
        path: String,
        /// The underlying I/O error.
        source: io::Error,
    },
}
