//! DVB record definitions.
//!
//! Two databases are defined:
//!
//! - `chdb`: services ([`Service`]) and the multiplexes that carry them ([`Mux`]).
//! - `epgdb`: programme guide events ([`EpgRecord`]).
//!
//! [`schema_by_name`] maps a database name to its compiled-in schema, which is what the
//! upgrade tool needs to rewrite a database file.

pub mod chdb;
pub mod epgdb;

pub use chdb::{Delivery, DvbC, DvbS, DvbT, Mux, Service, chdb_schema};
pub use epgdb::{EpgRecord, epgdb_schema};
use tunerdb_store::DatabaseSchema;

/// Names of the databases defined in this crate.
pub const DATABASE_NAMES: [&str; 2] = [chdb::NAME, epgdb::NAME];

/// Returns the compiled-in schema of a database by name.
pub fn schema_by_name(name: &str) -> Option<DatabaseSchema> {
    match name {
        chdb::NAME => Some(chdb_schema()),
        epgdb::NAME => Some(epgdb_schema()),
        _ => None,
    }
}
