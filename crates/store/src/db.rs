//! The database handle.
//!
//! A [`Database`] owns one redb environment, the reconciled schema state and the shared write
//! broker. Clones share all three; the broker commits any parked transaction when the last
//! clone is dropped.

use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;
use redb::{ReadableTable, TableError};
use snafu::ResultExt;
use tracing::{debug, info, warn};
use tunerdb_types::{
    codec::{decode, encode},
    config::DatabaseConfig,
};

use crate::{
    broker::{BrokerStats, SharedWriteGuard, WriteBroker},
    cursor::RecordCursor,
    error::{
        CodecSnafu, CommitSnafu, ConfigSnafu, DegradedWriteSnafu, Error, IoSnafu, OpenSnafu,
        Result, StorageSnafu, TableSnafu, TransactionSnafu,
    },
    index::index_entry_key,
    record::{FIRST_DYNAMIC_INDEX, IndexDescriptor, Record, index_discriminator},
    schema::{DatabaseSchema, SchemaState, StoredSchema, check_key_fields},
    tables::{SCHEMA_KEY, TableKind, TableNames, prefix_successor},
    transaction::{ReadAccess, ReadTxn, WriteAccess, WriteTxn},
};

static NEXT_DATABASE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static READERS: RefCell<HashMap<u64, Rc<ReadTxn>>> = RefCell::new(HashMap::new());
}

/// State shared by a database handle, its transactions and its broker.
pub struct DatabaseInner {
    pub(crate) id: u64,
    pub(crate) db: redb::Database,
    pub(crate) name: String,
    pub(crate) path: Option<PathBuf>,
    pub(crate) tables: TableNames,
    pub(crate) schema: SchemaState,
    pub(crate) config: DatabaseConfig,
    /// Installed dynamic sort keys per record type.
    pub(crate) sort_keys: RwLock<HashMap<u32, Vec<IndexDescriptor>>>,
}

/// How an open treats the stored schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    /// Create the file if needed and persist the compiled schema.
    Create,
    /// Open an existing database without writing to it.
    Existing,
}

/// An open database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    broker: Arc<WriteBroker>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .field("degraded", &self.inner.schema.is_degraded())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Opens or creates a database file.
    ///
    /// A fresh file gets the compiled schema. An existing file whose stored schema differs
    /// opens in degraded mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for an invalid schema or a database of another name,
    /// [`Error::Config`] for invalid configuration, [`Error::Open`] if redb cannot open the file.
    pub fn open(
        path: impl AsRef<Path>,
        schema: DatabaseSchema,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        schema.validate()?;
        config.validate().context(ConfigSnafu)?;
        let db = redb::Database::builder()
            .set_cache_size(config.cache_size_bytes)
            .create(path)
            .context(OpenSnafu { path: path.display().to_string() })?;
        Self::from_redb(db, Some(path.to_path_buf()), &schema, config, OpenMode::Create)
    }

    /// Opens a private database held in memory.
    ///
    /// # Errors
    ///
    /// See [`open`](Database::open).
    pub fn open_in_memory(schema: DatabaseSchema, config: DatabaseConfig) -> Result<Self> {
        schema.validate()?;
        config.validate().context(ConfigSnafu)?;
        let db = redb::Database::builder()
            .set_cache_size(config.cache_size_bytes)
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(OpenSnafu { path: ":memory:".to_string() })?;
        Self::from_redb(db, None, &schema, config, OpenMode::Create)
    }

    /// Opens an existing database without modifying it.
    pub(crate) fn open_existing(
        path: &Path,
        schema: &DatabaseSchema,
        config: DatabaseConfig,
    ) -> Result<Self> {
        schema.validate()?;
        config.validate().context(ConfigSnafu)?;
        std::fs::metadata(path).context(IoSnafu { path: path.display().to_string() })?;
        let db = redb::Database::builder()
            .set_cache_size(config.cache_size_bytes)
            .open(path)
            .context(OpenSnafu { path: path.display().to_string() })?;
        Self::from_redb(db, Some(path.to_path_buf()), schema, config, OpenMode::Existing)
    }

    fn from_redb(
        db: redb::Database,
        path: Option<PathBuf>,
        schema: &DatabaseSchema,
        config: DatabaseConfig,
        mode: OpenMode,
    ) -> Result<Self> {
        let tables = TableNames::new(schema.name());
        let stored = read_stored_schema(&db, &tables)?;
        match &stored {
            Some(stored) if stored.name != schema.name() => {
                return Err(Error::Schema {
                    reason: format!(
                        "database holds schema {:?}, expected {:?}",
                        stored.name,
                        schema.name()
                    ),
                });
            },
            None if mode == OpenMode::Existing => {
                return Err(Error::Schema {
                    reason: format!("no {} schema stored in database", schema.name()),
                });
            },
            _ => {},
        }

        let state = SchemaState::reconcile(schema, stored.as_ref());
        let compiled = StoredSchema::of(schema);
        if mode == OpenMode::Create && !state.is_degraded() && stored.as_ref() != Some(&compiled) {
            write_stored_schema(&db, &tables, &compiled)?;
        }
        if state.is_degraded() {
            warn!(
                db = schema.name(),
                differences = ?state.differences(),
                "Stored schema differs from compiled schema, opening in degraded mode"
            );
        }
        info!(
            db = schema.name(),
            path = ?path,
            types = compiled.types.len(),
            degraded = state.is_degraded(),
            "Opened database"
        );

        let inner = Arc::new(DatabaseInner {
            id: NEXT_DATABASE_ID.fetch_add(1, Ordering::Relaxed),
            db,
            name: schema.name().to_string(),
            path,
            tables,
            schema: state,
            config,
            sort_keys: RwLock::new(HashMap::new()),
        });
        let broker = Arc::new(WriteBroker::new(Arc::clone(&inner)));
        Ok(Self { inner, broker })
    }

    pub(crate) fn inner(&self) -> &Arc<DatabaseInner> {
        &self.inner
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Configuration the database was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// Whether stored and compiled schemas differ.
    pub fn is_degraded(&self) -> bool {
        self.inner.schema.is_degraded()
    }

    /// Human-readable schema differences found at open.
    pub fn schema_differences(&self) -> &[String] {
        self.inner.schema.differences()
    }

    /// Begins a read transaction on the latest committed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if redb cannot begin the transaction.
    pub fn read(&self) -> Result<ReadTxn> {
        let txn = self.inner.db.begin_read().context(TransactionSnafu)?;
        Ok(ReadTxn::new(Arc::clone(&self.inner), txn))
    }

    /// Begins an exclusive write transaction.
    ///
    /// A shared transaction parked by the broker is committed first. Blocks while another
    /// write transaction is open.
    ///
    /// # Errors
    ///
    /// Returns an error if the parked transaction fails to commit or redb cannot begin.
    pub fn write(&self) -> Result<WriteTxn> {
        self.broker.flush()?;
        let txn = self.inner.db.begin_write().context(TransactionSnafu)?;
        Ok(WriteTxn::new(Arc::clone(&self.inner), txn))
    }

    /// Acquires the shared write transaction, blocking until it is this caller's turn.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transaction`] if a new transaction cannot be started.
    pub fn shared_write(&self) -> Result<SharedWriteGuard<'_>> {
        self.broker.acquire()
    }

    /// The shared write broker.
    pub fn broker(&self) -> &WriteBroker {
        &self.broker
    }

    /// Shared write broker counters.
    pub fn broker_stats(&self) -> BrokerStats {
        self.broker.stats()
    }

    /// Runs `f` against this thread's reader.
    ///
    /// Nested calls on the same thread share one snapshot. The snapshot is released when the
    /// outermost call returns and a fresh one is taken on the next call, so a long-lived
    /// thread never pins old pages.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction cannot begin, or whatever `f` returns.
    pub fn read_with<T>(&self, f: impl FnOnce(&ReadTxn) -> Result<T>) -> Result<T> {
        let id = self.inner.id;
        if let Some(txn) = READERS.with(|readers| readers.borrow().get(&id).cloned()) {
            return f(&txn);
        }

        struct Release(u64);
        impl Drop for Release {
            fn drop(&mut self) {
                READERS.with(|readers| readers.borrow_mut().remove(&self.0));
            }
        }

        let txn = Rc::new(self.read()?);
        READERS.with(|readers| readers.borrow_mut().insert(id, Rc::clone(&txn)));
        let _release = Release(id);
        f(&txn)
    }

    /// Installs a dynamic sort key over `fields` of `R` and backfills it.
    ///
    /// Returns the index number to open cursors with. A static index or sort key over the
    /// same fields is reused. Sort keys live for the lifetime of the handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for unknown or non-key fields or when all dynamic index
    /// numbers are taken, [`Error::DegradedWrite`] in degraded mode.
    pub fn install_sort_key<R: Record>(&self, fields: &[u16]) -> Result<u8> {
        let desc = R::descriptor();
        check_key_fields(desc, "sort key", fields)?;
        if self.is_degraded() {
            return DegradedWriteSnafu { record: R::NAME }.fail();
        }
        if let Some(index) = desc.indexes.iter().find(|index| index.fields == fields) {
            return Ok(index.index_no);
        }

        let index_no = {
            let sort_keys = self.inner.sort_keys.read();
            let installed = sort_keys.get(&R::TYPE_ID).map(Vec::as_slice).unwrap_or_default();
            if let Some(key) = installed.iter().find(|key| key.fields == fields) {
                return Ok(key.index_no);
            }
            u8::try_from(installed.len())
                .ok()
                .and_then(|n| FIRST_DYNAMIC_INDEX.checked_add(n))
                .ok_or_else(|| Error::Schema {
                    reason: format!("{}: no dynamic sort key numbers left", R::NAME),
                })?
        };

        let guard = self.shared_write()?;
        let txn = guard.txn();
        let prefix = index_discriminator(R::TYPE_ID, index_no).to_be_bytes();
        txn.delete_range_raw(TableKind::Index, &prefix, prefix_successor(&prefix).as_deref())?;
        let mut backfilled = 0u64;
        {
            let mut cursor = txn.cursor::<R>();
            cursor.first()?;
            for record in cursor.range() {
                let record = record?;
                let primary_key = record.primary_key();
                let key = index_entry_key(&record, index_no, fields, &primary_key);
                txn.put_raw(TableKind::Index, &key, &primary_key)?;
                backfilled += 1;
            }
        }
        let descriptor =
            IndexDescriptor { index_no, name: format!("sort_{index_no}"), fields: fields.to_vec() };
        self.inner.sort_keys.write().entry(R::TYPE_ID).or_default().push(descriptor);
        if let Err(e) = guard.commit() {
            if let Some(keys) = self.inner.sort_keys.write().get_mut(&R::TYPE_ID) {
                keys.retain(|key| key.index_no != index_no);
            }
            return Err(e);
        }
        debug!(db = %self.inner.name, record = R::NAME, index_no, backfilled, "Installed sort key");
        Ok(index_no)
    }

    /// Cleans the change log down to the configured retention.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn clean_log_default(&self) -> Result<u64> {
        let txn = self.write()?;
        let removed = txn.clean_log(self.inner.config.log_retention_txns)?;
        txn.commit()?;
        Ok(removed)
    }

    /// Commits any parked shared transaction and closes this handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the parked transaction fails to commit.
    pub fn close(self) -> Result<()> {
        self.broker.flush()?;
        info!(db = %self.inner.name, "Closed database");
        Ok(())
    }
}

fn read_stored_schema(db: &redb::Database, tables: &TableNames) -> Result<Option<StoredSchema>> {
    let txn = db.begin_read().context(TransactionSnafu)?;
    let table = match txn.open_table(tables.definition(TableKind::Data)) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(source) => return Err(Error::Table { source }),
    };
    match table.get(SCHEMA_KEY).context(StorageSnafu)? {
        Some(bytes) => decode::<StoredSchema>(bytes.value()).map(Some).context(CodecSnafu),
        None => Ok(None),
    }
}

fn write_stored_schema(db: &redb::Database, tables: &TableNames, schema: &StoredSchema) -> Result<()> {
    let bytes = encode(schema).context(CodecSnafu)?;
    let txn = db.begin_write().context(TransactionSnafu)?;
    for kind in [TableKind::Data, TableKind::Index, TableKind::Log] {
        let mut table = txn.open_table(tables.definition(kind)).context(TableSnafu)?;
        if kind == TableKind::Data {
            table.insert(SCHEMA_KEY, bytes.as_slice()).context(StorageSnafu)?;
        }
    }
    txn.commit().context(CommitSnafu)?;
    debug!(db = %schema.name, types = schema.types.len(), "Stored schema descriptor");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use tunerdb_test_utils::TestDir;
    use tunerdb_types::FieldValue;

    use super::*;

    crate::define_record! {
        struct Event {
            type_id: 41,
            name: "event",
            primary_key: [1],
            indexes: [(1, "by_start", [2])],
            fields: {
                1 => id: u32,
                2 => start: u32,
                3 => duration: u16,
                4 => title: String,
            }
        }
    }

    fn schema() -> DatabaseSchema {
        DatabaseSchema::new("events").with::<Event>()
    }

    fn event(id: u32, start: u32, duration: u16) -> Event {
        Event { id, start, duration, title: format!("e{id}") }
    }

    #[test]
    fn test_reopen_keeps_records_and_schema() {
        let dir = TestDir::new();
        let path = dir.join("events.redb");
        {
            let db = Database::open(&path, schema(), DatabaseConfig::default()).unwrap();
            let txn = db.write().unwrap();
            txn.put(&event(1, 100, 30)).unwrap();
            txn.commit().unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path, schema(), DatabaseConfig::default()).unwrap();
        assert!(!db.is_degraded());
        let read = db.read().unwrap();
        assert_eq!(read.get_like(&event(1, 0, 0)).unwrap(), Some(event(1, 100, 30)));
    }

    #[test]
    fn test_name_mismatch_is_rejected() {
        let dir = TestDir::new();
        let path = dir.join("db.redb");
        Database::open(&path, schema(), DatabaseConfig::default()).unwrap().close().unwrap();
        let other = DatabaseSchema::new("other").with::<Event>();
        let err = Database::open(&path, other, DatabaseConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    #[test]
    fn test_open_existing_requires_stored_schema() {
        let dir = TestDir::new();
        let missing = dir.join("missing.redb");
        let err = Database::open_existing(&missing, &schema(), DatabaseConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_read_with_shares_snapshot_when_nested() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        let txn = db.write().unwrap();
        txn.put(&event(1, 100, 30)).unwrap();
        txn.commit().unwrap();

        let count = db
            .read_with(|outer| {
                let writer = db.clone();
                let txn = writer.write()?;
                txn.put(&event(2, 200, 30))?;
                txn.commit()?;
                // The nested call sees the outer snapshot, not the later commit
                db.read_with(|inner| {
                    assert_eq!(inner.last_txn_id()?, outer.last_txn_id()?);
                    let mut cursor = inner.cursor::<Event>();
                    cursor.first()?;
                    Ok(cursor.range().count())
                })
            })
            .unwrap();
        assert_eq!(count, 1);
        // A fresh snapshot after the outermost call returns
        let count = db
            .read_with(|txn| {
                let mut cursor = txn.cursor::<Event>();
                cursor.first()?;
                Ok(cursor.range().count())
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_install_sort_key_backfills_and_maintains() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        let txn = db.write().unwrap();
        txn.put(&event(1, 300, 10)).unwrap();
        txn.put(&event(2, 100, 50)).unwrap();
        txn.commit().unwrap();

        let by_duration = db.install_sort_key::<Event>(&[3, 1]).unwrap();
        assert_eq!(by_duration, FIRST_DYNAMIC_INDEX);
        assert_eq!(db.install_sort_key::<Event>(&[3, 1]).unwrap(), by_duration);
        // Matches the static index
        assert_eq!(db.install_sort_key::<Event>(&[2]).unwrap(), 1);

        let txn = db.write().unwrap();
        txn.put(&event(3, 200, 20)).unwrap();
        txn.put(&event(1, 300, 60)).unwrap();
        txn.commit().unwrap();

        let read = db.read().unwrap();
        let mut cursor = read.index_cursor::<Event>(by_duration).unwrap();
        cursor.first().unwrap();
        let ids: Vec<u32> = cursor.range().map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let mut short = read.index_cursor_prefix::<Event>(by_duration, &[FieldValue::U16(20)]).unwrap();
        short.first().unwrap();
        assert_eq!(short.range().count(), 1);
    }

    #[test]
    fn test_install_sort_key_rejects_unknown_fields() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        assert!(matches!(db.install_sort_key::<Event>(&[9]), Err(Error::Schema { .. })));
    }

    #[test]
    fn test_clean_log_default() {
        let config = DatabaseConfig::builder().log_retention_txns(1).build().unwrap();
        let db = Database::open_in_memory(schema(), config).unwrap();
        for id in 0..3 {
            let txn = db.write().unwrap();
            txn.put(&event(id, id, 1)).unwrap();
            txn.commit().unwrap();
        }
        assert_eq!(db.clean_log_default().unwrap(), 1);
        assert_eq!(db.read().unwrap().log_horizon().unwrap(), 2);
    }
}
