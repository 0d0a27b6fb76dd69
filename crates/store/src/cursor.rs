//! Cursors over primary records, secondary indexes and the change log.
//!
//! All cursors are scoped to a key prefix. Moving past the last key that starts with the prefix
//! makes the cursor invalid; there is no separate end bound. Not finding a key is never an
//! error, the cursor just becomes invalid.
//!
//! [`Cursor`] and [`IndexCursor`] expose the same operations through [`RecordCursor`] but are
//! distinct types: an index cursor's key is a secondary key and its value a primary key, and
//! the two can never be swapped.

use std::{marker::PhantomData, ops::Bound};

use snafu::ResultExt;
use tunerdb_types::{Ascending, FieldValue};

use crate::{
    error::{CodecSnafu, DecodeSnafu, DegradedLookupSnafu, Error, Result},
    record::Record,
    tables::{TableKind, prefix_successor},
    transaction::{Direction, Entry, ReadAccess},
};

/// Positioning mode for `find`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    /// Exactly the given key.
    Eq,
    /// The smallest key greater than or equal to the given key.
    SetRange,
    /// The largest key less than or equal to the given key.
    Leq,
}

/// Prefix-scoped cursor over one raw table.
pub(crate) struct RawCursor<'t, A> {
    txn: &'t A,
    kind: TableKind,
    prefix: Vec<u8>,
    current: Option<Entry>,
}

impl<'t, A: ReadAccess> RawCursor<'t, A> {
    pub(crate) fn new(txn: &'t A, kind: TableKind, prefix: Vec<u8>) -> Self {
        Self { txn, kind, prefix, current: None }
    }

    pub(crate) fn txn(&self) -> &'t A {
        self.txn
    }

    fn seek(&self, from: Bound<&[u8]>, direction: Direction) -> Result<Option<Entry>> {
        self.txn.seek_raw(self.kind, from, direction)
    }

    fn accept(&mut self, entry: Option<Entry>) -> bool {
        self.current = entry.filter(|(key, _)| key.starts_with(&self.prefix));
        self.current.is_some()
    }

    pub(crate) fn first(&mut self) -> Result<bool> {
        let entry = self.seek(Bound::Included(&self.prefix), Direction::Forward)?;
        Ok(self.accept(entry))
    }

    pub(crate) fn last(&mut self) -> Result<bool> {
        let entry = match prefix_successor(&self.prefix) {
            Some(upper) => self.seek(Bound::Excluded(&upper), Direction::Backward)?,
            None => self.seek(Bound::Unbounded, Direction::Backward)?,
        };
        Ok(self.accept(entry))
    }

    pub(crate) fn next(&mut self) -> Result<bool> {
        let Some((key, _)) = self.current.take() else {
            return Ok(false);
        };
        let entry = self.seek(Bound::Excluded(&key), Direction::Forward)?;
        Ok(self.accept(entry))
    }

    pub(crate) fn prev(&mut self) -> Result<bool> {
        let Some((key, _)) = self.current.take() else {
            return Ok(false);
        };
        let entry = self.seek(Bound::Excluded(&key), Direction::Backward)?;
        Ok(self.accept(entry))
    }

    pub(crate) fn find(&mut self, key: &[u8], mode: FindMode) -> Result<bool> {
        let start = key.max(self.prefix.as_slice());
        let at_or_after = self.seek(Bound::Included(start), Direction::Forward)?;
        let entry = match mode {
            FindMode::Eq => at_or_after.filter(|(found, _)| found == key),
            FindMode::SetRange => at_or_after,
            FindMode::Leq => match at_or_after {
                Some(entry) if entry.0 == key => Some(entry),
                _ => self.seek(Bound::Excluded(key), Direction::Backward)?,
            },
        };
        Ok(self.accept(entry))
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(key, _)| key.as_slice())
    }

    pub(crate) fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, value)| value.as_slice())
    }
}

/// Operations common to primary and index cursors.
pub trait RecordCursor {
    /// Record type yielded by the cursor.
    type Record: Record;

    /// Positions at the first key in range. Returns whether the cursor is valid.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`Error::Corrupted`] for a dangling index entry.
    fn first(&mut self) -> Result<bool>;

    /// Positions at the last key in range.
    ///
    /// # Errors
    ///
    /// See [`first`](RecordCursor::first).
    fn last(&mut self) -> Result<bool>;

    /// Moves to the next key. An invalid cursor stays invalid.
    ///
    /// # Errors
    ///
    /// See [`first`](RecordCursor::first).
    fn next(&mut self) -> Result<bool>;

    /// Moves to the previous key. An invalid cursor stays invalid.
    ///
    /// # Errors
    ///
    /// See [`first`](RecordCursor::first).
    fn prev(&mut self) -> Result<bool>;

    /// Positions relative to `key` according to `mode`.
    ///
    /// # Errors
    ///
    /// See [`first`](RecordCursor::first).
    fn find(&mut self, key: &[u8], mode: FindMode) -> Result<bool>;

    /// Whether the cursor points at a key in range.
    fn is_valid(&self) -> bool;

    /// Key at the cursor.
    fn key(&self) -> Option<&[u8]>;

    /// Decodes the record at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the stored record is malformed.
    fn current(&self) -> Result<Option<Self::Record>>;

    /// Returns a single-pass iterator yielding the current record and every following one.
    ///
    /// Consuming the iterator advances the cursor; it ends exactly when the cursor becomes
    /// invalid.
    fn range(&mut self) -> RecordRange<'_, Self>
    where
        Self: Sized,
    {
        RecordRange { cursor: self }
    }
}

/// Cursor over primary records of one type.
pub struct Cursor<'t, A, R> {
    raw: RawCursor<'t, A>,
    _record: PhantomData<fn() -> R>,
}

impl<'t, A: ReadAccess, R: Record> Cursor<'t, A, R> {
    pub(crate) fn new(txn: &'t A, prefix: Vec<u8>) -> Self {
        Self { raw: RawCursor::new(txn, TableKind::Data, prefix), _record: PhantomData }
    }

    /// Reads one field of the current record without decoding the rest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the stored record is shorter than its layout.
    pub fn field(&self, field_id: u16) -> Result<Option<FieldValue>> {
        let Some(bytes) = self.raw.value() else {
            return Ok(None);
        };
        let Some(layout) = self.raw.txn().inner().schema.layout(R::TYPE_ID) else {
            return Ok(None);
        };
        layout.read_field(bytes, field_id).context(DecodeSnafu { record: R::NAME })
    }

    /// Reads one field of the current record if it sits at a fixed offset.
    ///
    /// Returns `None` for fields that need a forward walk to locate.
    ///
    /// # Errors
    ///
    /// See [`field`](Cursor::field).
    pub fn fixed_field(&self, field_id: u16) -> Result<Option<FieldValue>> {
        let fixed = self
            .raw
            .txn()
            .inner()
            .schema
            .layout(R::TYPE_ID)
            .and_then(|layout| layout.fixed_offset(field_id))
            .is_some();
        if fixed { self.field(field_id) } else { Ok(None) }
    }
}

impl<A: ReadAccess, R: Record> RecordCursor for Cursor<'_, A, R> {
    type Record = R;

    fn first(&mut self) -> Result<bool> {
        self.raw.first()
    }

    fn last(&mut self) -> Result<bool> {
        self.raw.last()
    }

    fn next(&mut self) -> Result<bool> {
        self.raw.next()
    }

    fn prev(&mut self) -> Result<bool> {
        self.raw.prev()
    }

    fn find(&mut self, key: &[u8], mode: FindMode) -> Result<bool> {
        if mode == FindMode::Eq && self.raw.txn().is_degraded() {
            return DegradedLookupSnafu { record: R::NAME }.fail();
        }
        self.raw.find(key, mode)
    }

    fn is_valid(&self) -> bool {
        self.raw.is_valid()
    }

    fn key(&self) -> Option<&[u8]> {
        self.raw.key()
    }

    fn current(&self) -> Result<Option<R>> {
        match self.raw.value() {
            Some(bytes) => self.raw.txn().inner().schema.decode::<R>(bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Cursor over a secondary index (or installed sort key) of one type.
///
/// Keys are secondary keys `[disc][fields]` followed by the primary key. The cursor owns a main
/// cursor position into the data table, re-resolved from the entry's primary key on every
/// move.
pub struct IndexCursor<'t, A, R> {
    index: RawCursor<'t, A>,
    main: Option<Entry>,
    _record: PhantomData<fn() -> R>,
}

impl<'t, A: ReadAccess, R: Record> IndexCursor<'t, A, R> {
    pub(crate) fn new(txn: &'t A, prefix: Vec<u8>) -> Self {
        Self { index: RawCursor::new(txn, TableKind::Index, prefix), main: None, _record: PhantomData }
    }

    fn resolve(&mut self, valid: bool) -> Result<bool> {
        self.main = None;
        if !valid {
            return Ok(false);
        }
        let Some(primary_key) = self.index.value().map(<[u8]>::to_vec) else {
            return Ok(false);
        };
        match self.index.txn().get_raw(TableKind::Data, &primary_key)? {
            Some(data) => {
                self.main = Some((primary_key, data));
                Ok(true)
            },
            None => Err(Error::Corrupted {
                reason: format!("{} index entry points at missing record", R::NAME),
            }),
        }
    }

    /// Primary key of the current entry.
    pub fn primary_key(&self) -> Option<&[u8]> {
        self.main.as_ref().map(|(key, _)| key.as_slice())
    }

    /// Secondary key of the current entry, without the primary key suffix.
    pub fn secondary_key(&self) -> Option<&[u8]> {
        let key = self.index.key()?;
        let primary_len = self.primary_key()?.len();
        key.get(..key.len().checked_sub(primary_len)?)
    }
}

impl<A: ReadAccess, R: Record> RecordCursor for IndexCursor<'_, A, R> {
    type Record = R;

    fn first(&mut self) -> Result<bool> {
        let valid = self.index.first()?;
        self.resolve(valid)
    }

    fn last(&mut self) -> Result<bool> {
        let valid = self.index.last()?;
        self.resolve(valid)
    }

    fn next(&mut self) -> Result<bool> {
        let valid = self.index.next()?;
        self.resolve(valid)
    }

    fn prev(&mut self) -> Result<bool> {
        let valid = self.index.prev()?;
        self.resolve(valid)
    }

    /// Positions by secondary key (`[disc][fields]`, no primary key suffix).
    ///
    /// `Eq` finds the first entry with exactly this secondary key, `Leq` the last entry whose
    /// secondary key is less than or equal to it.
    fn find(&mut self, key: &[u8], mode: FindMode) -> Result<bool> {
        let valid = match mode {
            FindMode::SetRange => self.index.find(key, FindMode::SetRange)?,
            FindMode::Eq => {
                self.index.find(key, FindMode::SetRange)?
                    && self.index.key().zip(self.index.value()).is_some_and(|(found, primary)| {
                        found.len() == key.len() + primary.len() && found.starts_with(key)
                    })
            },
            FindMode::Leq => match prefix_successor(key) {
                Some(upper) => {
                    let entry = self.index.seek(Bound::Excluded(&upper), Direction::Backward)?;
                    self.index.accept(entry)
                },
                None => self.index.last()?,
            },
        };
        if !valid {
            self.index.current = None;
        }
        self.resolve(valid)
    }

    fn is_valid(&self) -> bool {
        self.main.is_some()
    }

    fn key(&self) -> Option<&[u8]> {
        self.index.key()
    }

    fn current(&self) -> Result<Option<R>> {
        match &self.main {
            Some((_, data)) => self.index.txn().inner().schema.decode::<R>(data).map(Some),
            None => Ok(None),
        }
    }
}

/// Single-pass iterator over the records of a cursor.
pub struct RecordRange<'c, C> {
    cursor: &'c mut C,
}

impl<C: RecordCursor> Iterator for RecordRange<'_, C> {
    type Item = Result<C::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.cursor.is_valid() {
            return None;
        }
        let record = match self.cursor.current() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        if let Err(e) = self.cursor.next() {
            return Some(Err(e));
        }
        Some(Ok(record))
    }
}

/// One change-log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Transaction that changed the record.
    pub txn_id: u64,
    /// Primary key of the changed record.
    pub primary_key: Vec<u8>,
}

/// Cursor over the change log of one record type, in transaction id order.
pub struct LogCursor<'t, A> {
    raw: RawCursor<'t, A>,
}

impl<'t, A: ReadAccess> LogCursor<'t, A> {
    pub(crate) fn new(txn: &'t A, type_id: u32) -> Self {
        Self { raw: RawCursor::new(txn, TableKind::Log, type_id.to_be_bytes().to_vec()) }
    }

    /// Positions at the oldest entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn first(&mut self) -> Result<bool> {
        self.raw.first()
    }

    /// Positions at the first entry written after transaction `txn_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn seek_after(&mut self, txn_id: u64) -> Result<bool> {
        let mut key = self.raw.prefix.clone();
        txn_id.saturating_add(1).encode_ascending(&mut key);
        self.raw.find(&key, FindMode::SetRange)
    }

    /// Moves to the next entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn next(&mut self) -> Result<bool> {
        self.raw.next()
    }

    /// Whether the cursor points at an entry.
    pub fn is_valid(&self) -> bool {
        self.raw.is_valid()
    }

    /// Decodes the entry at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] for a malformed log key.
    pub fn entry(&self) -> Result<Option<LogEntry>> {
        let (Some(key), Some(primary_key)) = (self.raw.key(), self.raw.value()) else {
            return Ok(None);
        };
        let mut rest = key.get(self.raw.prefix.len()..).unwrap_or_default();
        let txn_id = u64::decode_ascending(&mut rest).context(CodecSnafu)?;
        if rest != primary_key {
            return Err(Error::Corrupted { reason: "log key does not end with its primary key".to_string() });
        }
        Ok(Some(LogEntry { txn_id, primary_key: primary_key.to_vec() }))
    }

    /// Collects every entry written after transaction `txn_id`.
    ///
    /// # Errors
    ///
    /// See [`entry`](LogCursor::entry).
    pub fn entries_after(&mut self, txn_id: u64) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        self.seek_after(txn_id)?;
        while let Some(entry) = self.entry()? {
            entries.push(entry);
            self.next()?;
        }
        Ok(entries)
    }

    /// Whether entries following `last_seen` may already have been cleaned away.
    ///
    /// A consumer that is behind the horizon must rescan instead of replaying the log.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn behind_horizon(&self, last_seen: u64) -> Result<bool> {
        Ok(last_seen.saturating_add(1) < self.raw.txn().log_horizon()?)
    }
}
