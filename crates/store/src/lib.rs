//! tunerdb-store: the ordered record store of a DVB receiver.
//!
//! Typed records are kept in redb tables keyed by order-preserving byte keys, with secondary
//! indexes and a per-type change log maintained inside every write transaction. On top of
//! that sit screens (live sorted views for scrolling UIs), a broker batching small writes from
//! many threads into few commits, and an offline upgrade for schema changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Screens  /  Upgrade  /  Broker        │
//! │  (sorted views, schema upgrade, batching)   │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │          Transactions & Cursors              │
//! │ (ReadTxn, WriteTxn, ChildTxn; typed cursors) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │     Records, Indexes, Change Log, Schema     │
//! │  (define_record!, key layout, degraded mode) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                   redb                       │
//! │   (<name>_data, <name>_index, <name>_log)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use tunerdb_store::{Database, DatabaseSchema, ReadAccess, RecordCursor, WriteAccess, config::DatabaseConfig};
//!
//! tunerdb_store::define_record! {
//!     pub struct Bouquet {
//!         type_id: 9,
//!         name: "bouquet",
//!         primary_key: [1],
//!         indexes: [(1, "by_name", [2])],
//!         fields: {
//!             1 => bouquet_id: u16,
//!             2 => name: String,
//!         }
//!     }
//! }
//!
//! let schema = DatabaseSchema::new("chdb").with::<Bouquet>();
//! let db = Database::open_in_memory(schema, DatabaseConfig::default())?;
//!
//! let txn = db.write()?;
//! txn.put(&Bouquet { bouquet_id: 1, name: "Sky".to_string() })?;
//! txn.commit()?;
//!
//! let txn = db.read()?;
//! let mut by_name = txn.index_cursor::<Bouquet>(1)?;
//! by_name.first()?;
//! for bouquet in by_name.range() {
//!     println!("{}", bouquet?.name);
//! }
//! # Ok::<(), tunerdb_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod cursor;
pub mod db;
pub mod error;
mod index;
pub mod record;
pub mod schema;
pub mod screen;
pub mod tables;
pub mod transaction;
pub mod upgrade;

// Re-export commonly used types
pub use broker::{BrokerStats, SharedWriteGuard, WriteBroker};
pub use cursor::{Cursor, FindMode, IndexCursor, LogCursor, LogEntry, RecordCursor, RecordRange};
pub use db::Database;
pub use error::{Error, Result};
pub use record::{FieldDescriptor, IndexDescriptor, Record, RecordDescriptor};
pub use schema::{DatabaseSchema, RecordKind, SchemaState, StoredSchema};
pub use screen::{
    FieldMatcher, Filter, MatchOp, Screen, ScreenOptions, ScreenState, ScreenUpdate, SortOrder,
};
pub use tables::TableKind;
pub use transaction::{ChildTxn, ReadAccess, ReadTxn, WriteAccess, WriteTxn};
pub use tunerdb_types::{self as types, CodecError, FieldType, FieldValue, Wire, config};
pub use upgrade::{UpgradeOptions, UpgradeReport, upgrade_database};
