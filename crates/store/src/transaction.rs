//! Read, write and child transactions.
//!
//! Transactions wrap redb transactions and add the typed record layer: every `put`/`delete`
//! maintains secondary indexes and appends a change-log entry inside the same transaction.
//!
//! Cursors borrow the transaction that created them, so a cursor outliving its transaction or
//! a transaction committing while cursors are live are compile-time errors. Write
//! transactions are `!Sync`: one thread mutates a transaction at a time.

use std::{
    cell::{Cell, RefCell},
    ops::Bound,
    sync::Arc,
};

use redb::{ReadableTable, TableError};
use snafu::ResultExt;
use tracing::{debug, warn};
use tunerdb_types::{FieldValue, codec::decode_ascending};

use crate::{
    cursor::{Cursor, IndexCursor, LogCursor},
    db::DatabaseInner,
    error::{CodecSnafu, CommitSnafu, DegradedLookupSnafu, Error, Result, StorageSnafu, TableSnafu},
    index,
    record::{Record, index_discriminator, index_prefix, primary_prefix},
    tables::{LOG_HORIZON_KEY, TXN_ID_KEY, TableKind},
};

/// Raw key/value pair.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Seek direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest key at or after the bound.
    Forward,
    /// Largest key at or before the bound.
    Backward,
}

fn seek_in<T>(table: &T, from: Bound<&[u8]>, direction: Direction) -> Result<Option<Entry>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let found = match direction {
        Direction::Forward => {
            table.range::<&[u8]>((from, Bound::Unbounded)).context(StorageSnafu)?.next()
        },
        Direction::Backward => {
            table.range::<&[u8]>((Bound::Unbounded, from)).context(StorageSnafu)?.next_back()
        },
    };
    match found {
        Some(item) => {
            let (key, value) = item.context(StorageSnafu)?;
            Ok(Some((key.value().to_vec(), value.value().to_vec())))
        },
        None => Ok(None),
    }
}

fn get_in<T>(table: &T, key: &[u8]) -> Result<Option<Vec<u8>>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table.get(key).context(StorageSnafu)?.map(|value| value.value().to_vec()))
}

fn read_counter<A: ReadAccess + ?Sized>(txn: &A, key: &[u8]) -> Result<u64> {
    match txn.get_raw(TableKind::Data, key)? {
        Some(bytes) => decode_ascending::<u64>(&bytes).context(CodecSnafu),
        None => Ok(0),
    }
}

/// Read operations shared by every transaction type.
pub trait ReadAccess {
    /// Database state this transaction belongs to.
    #[doc(hidden)]
    fn inner(&self) -> &DatabaseInner;

    /// Reads one raw value.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying table cannot be read.
    fn get_raw(&self, kind: TableKind, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns the nearest entry from `from` in `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying table cannot be read.
    fn seek_raw(&self, kind: TableKind, from: Bound<&[u8]>, direction: Direction)
    -> Result<Option<Entry>>;

    /// Whether the database runs in degraded mode.
    fn is_degraded(&self) -> bool {
        self.inner().schema.is_degraded()
    }

    /// Whether writes to this database append change-log entries.
    fn change_log_enabled(&self) -> bool {
        self.inner().config.change_log
    }

    /// Looks up a record by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegradedLookup`] in degraded mode, [`Error::Decode`] if the stored
    /// record is malformed.
    fn get<R: Record>(&self, primary_key: &[u8]) -> Result<Option<R>>
    where
        Self: Sized,
    {
        if self.is_degraded() {
            return DegradedLookupSnafu { record: R::NAME }.fail();
        }
        match self.get_raw(TableKind::Data, primary_key)? {
            Some(bytes) => self.inner().schema.decode::<R>(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Looks up the stored version of a record by the primary key fields of `probe`.
    ///
    /// # Errors
    ///
    /// See [`get`](ReadAccess::get).
    fn get_like<R: Record>(&self, probe: &R) -> Result<Option<R>>
    where
        Self: Sized,
    {
        self.get(&probe.primary_key())
    }

    /// Opens an unpositioned cursor over all records of type `R`.
    fn cursor<R: Record>(&self) -> Cursor<'_, Self, R>
    where
        Self: Sized,
    {
        Cursor::new(self, primary_prefix::<R>(&[]))
    }

    /// Opens a cursor bounded to records whose leading primary key fields equal `values`.
    fn cursor_prefix<R: Record>(&self, values: &[FieldValue]) -> Cursor<'_, Self, R>
    where
        Self: Sized,
    {
        Cursor::new(self, primary_prefix::<R>(values))
    }

    /// Opens an unpositioned cursor over a secondary index or installed sort key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegradedLookup`] in degraded mode, [`Error::Schema`] if the index does
    /// not exist.
    fn index_cursor<R: Record>(&self, index_no: u8) -> Result<IndexCursor<'_, Self, R>>
    where
        Self: Sized,
    {
        self.index_cursor_prefix(index_no, &[])
    }

    /// Opens an index cursor bounded to entries whose leading indexed fields equal `values`.
    ///
    /// # Errors
    ///
    /// See [`index_cursor`](ReadAccess::index_cursor).
    fn index_cursor_prefix<R: Record>(
        &self,
        index_no: u8,
        values: &[FieldValue],
    ) -> Result<IndexCursor<'_, Self, R>>
    where
        Self: Sized,
    {
        if self.is_degraded() {
            return DegradedLookupSnafu { record: R::NAME }.fail();
        }
        if index::index_fields::<R>(self.inner(), index_no).is_none() {
            return Err(Error::Schema {
                reason: format!(
                    "{}: no index {index_no} (discriminator {:#x})",
                    R::NAME,
                    index_discriminator(R::TYPE_ID, index_no)
                ),
            });
        }
        Ok(IndexCursor::new(self, index_prefix::<R>(index_no, values)))
    }

    /// Opens a cursor over the change log of type `R`.
    fn log_cursor<R: Record>(&self) -> LogCursor<'_, Self>
    where
        Self: Sized,
    {
        LogCursor::new(self, R::TYPE_ID)
    }

    /// Last committed transaction id (0 if none).
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    fn last_txn_id(&self) -> Result<u64> {
        read_counter(self, TXN_ID_KEY)
    }

    /// Oldest transaction id whose log entries are guaranteed to be present.
    ///
    /// # Errors
    ///
    /// Returns an error if the horizon cannot be read.
    fn log_horizon(&self) -> Result<u64> {
        read_counter(self, LOG_HORIZON_KEY)
    }
}

/// Write operations shared by write and child transactions.
pub trait WriteAccess: ReadAccess {
    /// Writes one raw value.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying table cannot be written.
    fn put_raw(&self, kind: TableKind, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removes one raw value. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying table cannot be written.
    fn delete_raw(&self, kind: TableKind, key: &[u8]) -> Result<bool>;

    /// Returns this transaction's id, allocating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read or written.
    fn txn_id(&self) -> Result<u64>;

    /// Removes every entry with `start <= key < end`. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying table cannot be read or written.
    fn delete_range_raw(&self, kind: TableKind, start: &[u8], end: Option<&[u8]>) -> Result<u64> {
        let mut removed = 0;
        while let Some((key, _)) = self.seek_raw(kind, Bound::Included(start), Direction::Forward)? {
            if end.is_some_and(|end| key.as_slice() >= end) {
                break;
            }
            self.delete_raw(kind, &key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Inserts or replaces a record, maintaining indexes and the change log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DegradedWrite`] in degraded mode, or a storage error.
    fn put<R: Record>(&self, record: &R) -> Result<()>
    where
        Self: Sized,
    {
        index::put_record(self, record)
    }

    /// Deletes the record with the primary key of `record`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// See [`put`](WriteAccess::put).
    fn delete<R: Record>(&self, record: &R) -> Result<bool>
    where
        Self: Sized,
    {
        index::delete_record::<_, R>(self, &record.primary_key())
    }

    /// Deletes the record stored under `primary_key`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// See [`put`](WriteAccess::put).
    fn delete_key<R: Record>(&self, primary_key: &[u8]) -> Result<bool>
    where
        Self: Sized,
    {
        index::delete_record::<_, R>(self, primary_key)
    }

    /// Deletes change-log entries older than the last `keep` transactions.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    fn clean_log(&self, keep: u64) -> Result<u64>
    where
        Self: Sized,
    {
        index::clean_log(self, keep)
    }
}

/// A read-only snapshot.
pub struct ReadTxn {
    inner: Arc<DatabaseInner>,
    txn: redb::ReadTransaction,
}

impl ReadTxn {
    pub(crate) fn new(inner: Arc<DatabaseInner>, txn: redb::ReadTransaction) -> Self {
        Self { inner, txn }
    }
}

impl ReadAccess for ReadTxn {
    fn inner(&self) -> &DatabaseInner {
        &self.inner
    }

    fn get_raw(&self, kind: TableKind, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.txn.open_table(self.inner.tables.definition(kind)) {
            Ok(table) => get_in(&table, key),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(source) => Err(Error::Table { source }),
        }
    }

    fn seek_raw(
        &self,
        kind: TableKind,
        from: Bound<&[u8]>,
        direction: Direction,
    ) -> Result<Option<Entry>> {
        match self.txn.open_table(self.inner.tables.definition(kind)) {
            Ok(table) => seek_in(&table, from, direction),
            Err(TableError::TableDoesNotExist(_)) => Ok(None),
            Err(source) => Err(Error::Table { source }),
        }
    }
}

/// A read-write transaction.
///
/// Dropping it without [`commit`](WriteTxn::commit) discards all changes.
pub struct WriteTxn {
    inner: Arc<DatabaseInner>,
    txn: redb::WriteTransaction,
    txn_id: Cell<Option<u64>>,
}

impl WriteTxn {
    pub(crate) fn new(inner: Arc<DatabaseInner>, txn: redb::WriteTransaction) -> Self {
        Self { inner, txn, txn_id: Cell::new(None) }
    }

    /// Starts a child transaction whose writes can be rolled back independently.
    pub fn child(&self) -> ChildTxn<'_> {
        ChildTxn { parent: self, journal: RefCell::new(Vec::new()), finished: Cell::new(false) }
    }

    /// Commits all changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Commit`] if redb fails to commit.
    pub fn commit(self) -> Result<()> {
        let txn_id = self.txn_id.get();
        self.txn.commit().context(CommitSnafu)?;
        debug!(db = %self.inner.name, txn_id, "Committed write transaction");
        Ok(())
    }

    /// Discards all changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if redb fails to roll back.
    pub fn abort(self) -> Result<()> {
        self.txn.abort().context(StorageSnafu)
    }
}

impl ReadAccess for WriteTxn {
    fn inner(&self) -> &DatabaseInner {
        &self.inner
    }

    fn get_raw(&self, kind: TableKind, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(self.inner.tables.definition(kind)).context(TableSnafu)?;
        get_in(&table, key)
    }

    fn seek_raw(
        &self,
        kind: TableKind,
        from: Bound<&[u8]>,
        direction: Direction,
    ) -> Result<Option<Entry>> {
        let table = self.txn.open_table(self.inner.tables.definition(kind)).context(TableSnafu)?;
        seek_in(&table, from, direction)
    }
}

impl WriteAccess for WriteTxn {
    fn put_raw(&self, kind: TableKind, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table =
            self.txn.open_table(self.inner.tables.definition(kind)).context(TableSnafu)?;
        table.insert(key, value).context(StorageSnafu)?;
        Ok(())
    }

    fn delete_raw(&self, kind: TableKind, key: &[u8]) -> Result<bool> {
        let mut table =
            self.txn.open_table(self.inner.tables.definition(kind)).context(TableSnafu)?;
        let removed = table.remove(key).context(StorageSnafu)?;
        Ok(removed.is_some())
    }

    fn txn_id(&self) -> Result<u64> {
        if let Some(id) = self.txn_id.get() {
            return Ok(id);
        }
        let id = read_counter(self, TXN_ID_KEY)? + 1;
        self.put_raw(TableKind::Data, TXN_ID_KEY, &id.to_be_bytes())?;
        self.txn_id.set(Some(id));
        Ok(id)
    }
}

struct Undo {
    kind: TableKind,
    key: Vec<u8>,
    previous: Option<Vec<u8>>,
}

/// A transaction nested in a [`WriteTxn`].
///
/// Writes go straight into the parent while an undo journal is kept. [`commit`](Self::commit)
/// keeps them; [`abort`](Self::abort) or dropping the child replays the journal in reverse,
/// leaving writes made through other children untouched.
pub struct ChildTxn<'p> {
    parent: &'p WriteTxn,
    journal: RefCell<Vec<Undo>>,
    finished: Cell<bool>,
}

impl ChildTxn<'_> {
    /// Keeps this child's writes in the parent.
    pub fn commit(self) {
        self.finished.set(true);
        self.journal.borrow_mut().clear();
    }

    /// Reverts this child's writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent cannot be written; the parent should then be aborted.
    pub fn abort(self) -> Result<()> {
        self.finished.set(true);
        self.rollback()
    }

    fn rollback(&self) -> Result<()> {
        let journal = std::mem::take(&mut *self.journal.borrow_mut());
        for undo in journal.into_iter().rev() {
            match undo.previous {
                Some(previous) => self.parent.put_raw(undo.kind, &undo.key, &previous)?,
                None => {
                    self.parent.delete_raw(undo.kind, &undo.key)?;
                },
            }
        }
        Ok(())
    }
}

impl Drop for ChildTxn<'_> {
    fn drop(&mut self) {
        if self.finished.get() {
            return;
        }
        if let Err(e) = self.rollback() {
            warn!(db = %self.parent.inner.name, error = %e, "Failed to roll back child transaction");
        }
    }
}

impl ReadAccess for ChildTxn<'_> {
    fn inner(&self) -> &DatabaseInner {
        self.parent.inner()
    }

    fn get_raw(&self, kind: TableKind, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.parent.get_raw(kind, key)
    }

    fn seek_raw(
        &self,
        kind: TableKind,
        from: Bound<&[u8]>,
        direction: Direction,
    ) -> Result<Option<Entry>> {
        self.parent.seek_raw(kind, from, direction)
    }
}

impl WriteAccess for ChildTxn<'_> {
    fn put_raw(&self, kind: TableKind, key: &[u8], value: &[u8]) -> Result<()> {
        let previous = self.parent.get_raw(kind, key)?;
        self.parent.put_raw(kind, key, value)?;
        self.journal.borrow_mut().push(Undo { kind, key: key.to_vec(), previous });
        Ok(())
    }

    fn delete_raw(&self, kind: TableKind, key: &[u8]) -> Result<bool> {
        let Some(previous) = self.parent.get_raw(kind, key)? else {
            return Ok(false);
        };
        self.parent.delete_raw(kind, key)?;
        self.journal.borrow_mut().push(Undo { kind, key: key.to_vec(), previous: Some(previous) });
        Ok(true)
    }

    fn txn_id(&self) -> Result<u64> {
        self.parent.txn_id()
    }
}
