//! Physical table layout.
//!
//! Each database owns three redb tables, all byte-keyed:
//!
//! | table          | key                                      | value        |
//! |----------------|------------------------------------------|--------------|
//! | `<name>_data`  | `[type_id:4][primary fields]`            | record bytes |
//! | `<name>_index` | `[type_id<<8 \| index_no:4][fields][pk]` | primary key  |
//! | `<name>_log`   | `[type_id:4][txn_id:8][pk]`              | primary key  |
//!
//! Keys in the data table starting with four zero bytes are reserved for engine metadata.
//! Record type ids are never zero, so reserved keys never collide with records.

use redb::TableDefinition;

/// Byte-keyed, byte-valued table definition.
pub type RawTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

/// Prefix shared by all reserved metadata keys.
pub(crate) const RESERVED_PREFIX: [u8; 4] = [0; 4];

/// Reserved key holding the persisted schema descriptor.
pub(crate) const SCHEMA_KEY: &[u8] = b"\0\0\0\0schema";

/// Reserved key holding the last allocated transaction id.
pub(crate) const TXN_ID_KEY: &[u8] = b"\0\0\0\0txn_id";

/// Reserved key holding the change-log horizon.
pub(crate) const LOG_HORIZON_KEY: &[u8] = b"\0\0\0\0log_horizon";

/// Which of a database's three tables an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Primary key → serialized record.
    Data,
    /// Secondary key ++ primary key → primary key.
    Index,
    /// Type ++ transaction id ++ primary key → primary key.
    Log,
}

/// Names of the three physical tables of one database.
#[derive(Debug, Clone)]
pub struct TableNames {
    data: String,
    index: String,
    log: String,
}

impl TableNames {
    /// Derives table names from the database name.
    pub fn new(name: &str) -> Self {
        Self {
            data: format!("{name}_data"),
            index: format!("{name}_index"),
            log: format!("{name}_log"),
        }
    }

    /// Returns the name of one table.
    pub fn name(&self, kind: TableKind) -> &str {
        match kind {
            TableKind::Data => &self.data,
            TableKind::Index => &self.index,
            TableKind::Log => &self.log,
        }
    }

    /// Returns the redb definition of one table.
    pub fn definition(&self, kind: TableKind) -> RawTable<'_> {
        TableDefinition::new(self.name(kind))
    }
}

/// Returns the smallest key greater than every key starting with `prefix`.
///
/// `None` when no such key exists (empty prefix or all `0xFF`).
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xFF {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let names = TableNames::new("chdb");
        assert_eq!(names.name(TableKind::Data), "chdb_data");
        assert_eq!(names.name(TableKind::Index), "chdb_index");
        assert_eq!(names.name(TableKind::Log), "chdb_log");
    }

    #[test]
    fn test_reserved_keys_share_prefix() {
        for key in [SCHEMA_KEY, TXN_ID_KEY, LOG_HORIZON_KEY] {
            assert!(key.starts_with(&RESERVED_PREFIX));
        }
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(&[0, 0, 0, 1]), Some(vec![0, 0, 0, 2]));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(&[]), None);
    }
}
