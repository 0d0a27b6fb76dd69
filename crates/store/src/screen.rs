//! Screens: live, sorted, filtered views of one record type.
//!
//! A screen copies the matching records of a source database into a private in-memory
//! database, sorted by a static index, the primary key or an installed sort key. After that
//! [`Screen::update`] replays the source's change log instead of rescanning.
//!
//! Rows are addressed through up to two references, each a `(sort key, row)` pair. Every
//! insert or removal in the private copy shifts the row of each reference it precedes, so
//! reaching row `n` walks only from the nearest reference instead of counting from the top.

use std::{cmp::Ordering, collections::HashSet};

use snafu::ResultExt;
use tracing::debug;
use tunerdb_types::{
    FieldValue,
    config::{DatabaseConfig, ScreenConfig},
};

use crate::{
    cursor::{Cursor, FindMode, RawCursor, RecordCursor},
    db::Database,
    error::{ConfigSnafu, Error, Result},
    index::{index_entry_key, index_fields},
    record::{Record, index_discriminator, primary_prefix},
    schema::{DatabaseSchema, check_key_fields},
    tables::TableKind,
    transaction::{ReadAccess, WriteAccess, WriteTxn},
};

/// Cache size of a screen's private database.
const SCREEN_CACHE_BYTES: usize = 4 * 1024 * 1024;

/// Sort order of a screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Primary key order.
    #[default]
    Primary,
    /// Order of a static index.
    Index(u8),
    /// Order of the given key fields, ties broken by primary key.
    Fields(Vec<u16>),
}

/// Comparison applied by a [`FieldMatcher`]: `record.field <op> reference.field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    /// Equal.
    Eq,
    /// Greater than or equal.
    Geq,
    /// Less than or equal.
    Leq,
    /// Greater than.
    Gt,
    /// Less than.
    Lt,
    /// String or vector prefix.
    StartsWith,
    /// Substring or element.
    Contains,
}

impl MatchOp {
    fn holds(self, value: &FieldValue, reference: &FieldValue) -> bool {
        match self {
            Self::StartsWith => value.starts_with(reference),
            Self::Contains => value.contains(reference),
            op => match value.compare(reference) {
                Some(ordering) => match op {
                    Self::Eq => ordering == Ordering::Equal,
                    Self::Geq => ordering != Ordering::Less,
                    Self::Leq => ordering != Ordering::Greater,
                    Self::Gt => ordering == Ordering::Greater,
                    Self::Lt => ordering == Ordering::Less,
                    Self::StartsWith | Self::Contains => false,
                },
                None => false,
            },
        }
    }
}

/// One field comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMatcher {
    /// Compared field id.
    pub field: u16,
    /// Comparison.
    pub op: MatchOp,
}

/// A conjunction of field comparisons against a reference record.
#[derive(Debug, Clone)]
pub struct Filter<R> {
    reference: R,
    matchers: Vec<FieldMatcher>,
}

impl<R: Record> Filter<R> {
    /// Creates a filter with no comparisons, matching everything.
    pub fn new(reference: R) -> Self {
        Self { reference, matchers: Vec::new() }
    }

    /// Adds a comparison of `field` against the reference record's value.
    #[must_use]
    pub fn matching(mut self, field: u16, op: MatchOp) -> Self {
        self.matchers.push(FieldMatcher { field, op });
        self
    }

    /// The comparisons of this filter.
    pub fn matchers(&self) -> &[FieldMatcher] {
        &self.matchers
    }

    /// Whether every comparison holds for `record`.
    pub fn matches(&self, record: &R) -> bool {
        self.matchers.iter().all(|matcher| match record.get_field(matcher.field) {
            Some(value) => self.holds(matcher, &value),
            None => false,
        })
    }

    fn holds(&self, matcher: &FieldMatcher, value: &FieldValue) -> bool {
        self.reference
            .get_field(matcher.field)
            .is_some_and(|reference| matcher.op.holds(value, &reference))
    }

    /// Evaluates the comparisons readable at fixed offsets. `false` means the record can be
    /// skipped without decoding it.
    fn prefilter<A: ReadAccess>(&self, cursor: &Cursor<'_, A, R>) -> Result<bool> {
        for matcher in &self.matchers {
            if let Some(value) = cursor.fixed_field(matcher.field)? {
                if !self.holds(matcher, &value) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// What a screen shows and in which order.
#[derive(Debug, Clone)]
pub struct ScreenOptions<R> {
    sort: SortOrder,
    key_prefix: Vec<FieldValue>,
    filters: Vec<Filter<R>>,
}

#[bon::bon]
impl<R: Record> ScreenOptions<R> {
    /// Creates validated screen options.
    ///
    /// Both filters must match for a record to be shown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if:
    /// - the sort order names a missing index or non-key fields
    /// - the key prefix is longer than the primary key or a value has the wrong type
    /// - a filter compares a field `R` does not have
    #[builder]
    pub fn new(
        #[builder(default)] sort: SortOrder,
        #[builder(default)] key_prefix: Vec<FieldValue>,
        filter: Option<Filter<R>>,
        second_filter: Option<Filter<R>>,
    ) -> Result<Self> {
        let desc = R::descriptor();
        match &sort {
            SortOrder::Primary => {},
            SortOrder::Index(index_no) => {
                if desc.index(*index_no).is_none() {
                    return Err(Error::Schema {
                        reason: format!("{}: screen sorts by missing index {index_no}", R::NAME),
                    });
                }
            },
            SortOrder::Fields(fields) => check_key_fields(desc, "screen sort", fields)?,
        }
        if key_prefix.len() > desc.primary_key.len() {
            return Err(Error::Schema {
                reason: format!("{}: key prefix longer than primary key", R::NAME),
            });
        }
        for (value, field_id) in key_prefix.iter().zip(&desc.primary_key) {
            let expected = desc.field(*field_id).map(|field| field.type_id);
            if expected != Some(value.field_type().type_id()) {
                return Err(Error::Schema {
                    reason: format!("{}: key prefix value {value} has the wrong type", R::NAME),
                });
            }
        }
        let filters: Vec<Filter<R>> = filter.into_iter().chain(second_filter).collect();
        for matcher in filters.iter().flat_map(Filter::matchers) {
            if desc.field(matcher.field).is_none() {
                return Err(Error::Schema {
                    reason: format!("{}: filter on unknown field {}", R::NAME, matcher.field),
                });
            }
        }
        Ok(Self { sort, key_prefix, filters })
    }
}

impl<R: Record> ScreenOptions<R> {
    fn matches(&self, record: &R) -> bool {
        self.filters.iter().all(|filter| filter.matches(record))
    }

    fn prefilter<A: ReadAccess>(&self, cursor: &Cursor<'_, A, R>) -> Result<bool> {
        for filter in &self.filters {
            if !filter.prefilter(cursor)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn in_range(&self, primary_key: &[u8]) -> bool {
        primary_key.starts_with(&primary_prefix::<R>(&self.key_prefix))
    }
}

/// Outcome of [`Screen::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenUpdate {
    /// Nothing changed since the last update.
    Unchanged,
    /// Changes were applied from the change log.
    Incremental {
        /// Records inserted or replaced.
        upserted: usize,
        /// Records removed.
        removed: usize,
    },
    /// The view was rebuilt from a full scan.
    Rescanned,
}

/// Position of the last window handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScreenState {
    /// Row of the window's first record.
    pub pos_top: usize,
    /// Rows in the view.
    pub list_size: usize,
    /// Primary key of the window's first record.
    pub key_top: Option<Vec<u8>>,
    /// Primary key of the window's last record.
    pub key_bottom: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RowRef {
    /// Physical sort key: secondary key ++ primary key.
    key: Vec<u8>,
    primary_key: Vec<u8>,
    row: usize,
}

const PRIMARY_REF: usize = 0;
const AUX_REF: usize = 1;

enum Start<'a> {
    Ref(&'a RowRef),
    Top,
    Bottom,
}

/// A live sorted view of records of type `R`.
pub struct Screen<R: Record> {
    temp: Database,
    sort_index: u8,
    sort_fields: Vec<u16>,
    options: ScreenOptions<R>,
    config: ScreenConfig,
    last_txn_id: u64,
    list_size: usize,
    refs: [Option<RowRef>; 2],
    active: usize,
    state: ScreenState,
    stale: bool,
}

impl<R: Record> Screen<R> {
    /// Builds a screen from a full scan of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid configuration, or any error of the scan.
    pub fn new<A: ReadAccess>(source: &A, options: ScreenOptions<R>, config: ScreenConfig) -> Result<Self> {
        config.validate().context(ConfigSnafu)?;
        let (temp, sort_index, sort_fields) = Self::open_temp(&options.sort)?;
        let mut screen = Self {
            temp,
            sort_index,
            sort_fields,
            options,
            config,
            last_txn_id: 0,
            list_size: 0,
            refs: [None, None],
            active: PRIMARY_REF,
            state: ScreenState::default(),
            stale: true,
        };
        screen.rescan(source)?;
        Ok(screen)
    }

    fn open_temp(sort: &SortOrder) -> Result<(Database, u8, Vec<u16>)> {
        let config = DatabaseConfig::builder()
            .cache_size_bytes(SCREEN_CACHE_BYTES)
            .change_log(false)
            .build()
            .context(ConfigSnafu)?;
        let temp = Database::open_in_memory(DatabaseSchema::new("screen").with::<R>(), config)?;
        let sort_index = match sort {
            SortOrder::Primary => temp.install_sort_key::<R>(&R::descriptor().primary_key)?,
            SortOrder::Index(index_no) => *index_no,
            SortOrder::Fields(fields) => temp.install_sort_key::<R>(fields)?,
        };
        let sort_fields = index_fields::<R>(temp.inner(), sort_index).ok_or_else(|| Error::Schema {
            reason: format!("{}: screen sort index {sort_index} missing", R::NAME),
        })?;
        Ok((temp, sort_index, sort_fields))
    }

    fn rescan<A: ReadAccess>(&mut self, source: &A) -> Result<()> {
        self.stale = true;
        let (temp, sort_index, sort_fields) = Self::open_temp(&self.options.sort)?;
        let last_txn_id = source.last_txn_id()?;
        let txn = temp.write()?;
        let mut scanned = 0usize;
        let mut matched = 0usize;
        {
            let mut cursor = source.cursor_prefix::<R>(&self.options.key_prefix);
            let mut valid = cursor.first()?;
            while valid {
                scanned += 1;
                if self.options.prefilter(&cursor)? {
                    if let Some(record) = cursor.current()? {
                        if self.options.matches(&record) {
                            txn.put(&record)?;
                            matched += 1;
                        }
                    }
                }
                valid = cursor.next()?;
            }
        }
        txn.commit()?;

        self.temp = temp;
        self.sort_index = sort_index;
        self.sort_fields = sort_fields;
        self.last_txn_id = last_txn_id;
        self.list_size = matched;
        self.refs = [None, None];
        self.active = PRIMARY_REF;
        self.state = ScreenState { list_size: matched, ..ScreenState::default() };
        self.stale = false;
        debug!(record = R::NAME, scanned, matched, last_txn_id, "Rescanned screen");
        Ok(())
    }

    /// Brings the view up to date with `source`.
    ///
    /// Replays the change log since the last update, re-evaluating every changed record from
    /// scratch. Falls back to a full rescan when the source keeps no change log, the log was
    /// cleaned past this screen's position, the source is degraded or the log is corrupt.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed rescan. A failed incremental update leaves the previous
    /// view in place and forces a rescan on the next call.
    pub fn update<A: ReadAccess>(&mut self, source: &A) -> Result<ScreenUpdate> {
        let last_txn_id = source.last_txn_id()?;
        if !self.stale && last_txn_id == self.last_txn_id {
            return Ok(ScreenUpdate::Unchanged);
        }
        if self.stale
            || !source.change_log_enabled()
            || source.is_degraded()
            || last_txn_id < self.last_txn_id
            || source.log_cursor::<R>().behind_horizon(self.last_txn_id)?
        {
            self.rescan(source)?;
            return Ok(ScreenUpdate::Rescanned);
        }

        match self.replay(source, last_txn_id) {
            Ok(update) => Ok(update),
            Err(Error::Corrupted { reason }) => {
                debug!(record = R::NAME, reason, "Change log unusable, rescanning screen");
                self.rescan(source)?;
                Ok(ScreenUpdate::Rescanned)
            },
            Err(e) => {
                self.stale = true;
                Err(e)
            },
        }
    }

    fn replay<A: ReadAccess>(&mut self, source: &A, last_txn_id: u64) -> Result<ScreenUpdate> {
        let entries = source.log_cursor::<R>().entries_after(self.last_txn_id)?;
        let mut seen = HashSet::new();
        let mut refs = self.refs.clone();
        let mut list_size = self.list_size;
        let (mut upserted, mut removed) = (0, 0);

        let txn = self.temp.write()?;
        for entry in entries {
            if !seen.insert(entry.primary_key.clone()) {
                continue;
            }
            let current = if self.options.in_range(&entry.primary_key) {
                source.get::<R>(&entry.primary_key)?.filter(|record| self.options.matches(record))
            } else {
                None
            };
            match current {
                Some(record) => {
                    self.upsert(&txn, &mut refs, &mut list_size, &record)?;
                    upserted += 1;
                },
                None => {
                    if self.remove(&txn, &mut refs, &mut list_size, &entry.primary_key)? {
                        removed += 1;
                    }
                },
            }
        }
        txn.commit()?;

        self.refs = refs;
        self.list_size = list_size;
        self.state.list_size = list_size;
        self.last_txn_id = last_txn_id;
        debug!(record = R::NAME, upserted, removed, last_txn_id, "Updated screen");
        Ok(ScreenUpdate::Incremental { upserted, removed })
    }

    fn sort_key(&self, record: &R, primary_key: &[u8]) -> Vec<u8> {
        index_entry_key(record, self.sort_index, &self.sort_fields, primary_key)
    }

    fn sort_prefix(&self) -> Vec<u8> {
        index_discriminator(R::TYPE_ID, self.sort_index).to_be_bytes().to_vec()
    }

    fn upsert(
        &self,
        txn: &WriteTxn,
        refs: &mut [Option<RowRef>; 2],
        list_size: &mut usize,
        record: &R,
    ) -> Result<()> {
        let primary_key = record.primary_key();
        let new_key = self.sort_key(record, &primary_key);
        if let Some(old) = txn.get::<R>(&primary_key)? {
            if self.sort_key(&old, &primary_key) == new_key {
                return txn.put(record);
            }
        }
        self.remove(txn, refs, list_size, &primary_key)?;
        txn.put(record)?;
        *list_size += 1;
        for slot in refs.iter_mut().flatten() {
            if new_key < slot.key {
                slot.row += 1;
            }
        }
        Ok(())
    }

    fn remove(
        &self,
        txn: &WriteTxn,
        refs: &mut [Option<RowRef>; 2],
        list_size: &mut usize,
        primary_key: &[u8],
    ) -> Result<bool> {
        let Some(old) = txn.get::<R>(primary_key)? else {
            return Ok(false);
        };
        let old_key = self.sort_key(&old, primary_key);
        txn.delete_key::<R>(primary_key)?;
        *list_size -= 1;
        for slot in refs.iter_mut() {
            let Some(reference) = slot.as_mut() else {
                continue;
            };
            match old_key.cmp(&reference.key) {
                Ordering::Less => {
                    reference.row = reference.row.checked_sub(1).ok_or_else(|| Error::Corrupted {
                        reason: format!("{} screen reference row underflow", R::NAME),
                    })?;
                },
                Ordering::Greater => {},
                Ordering::Equal => {
                    let row = reference.row;
                    *slot = self.reseat(txn, &old_key, row)?;
                },
            }
        }
        Ok(true)
    }

    /// Finds the entry taking the place of a removed referenced entry.
    fn reseat<A: ReadAccess>(&self, txn: &A, removed_key: &[u8], row: usize) -> Result<Option<RowRef>> {
        let mut cursor = RawCursor::new(txn, TableKind::Index, self.sort_prefix());
        if cursor.find(removed_key, FindMode::SetRange)? {
            return Ok(row_ref(&cursor, row));
        }
        if row > 0 && cursor.find(removed_key, FindMode::Leq)? {
            return Ok(row_ref(&cursor, row - 1));
        }
        Ok(None)
    }

    /// Walks from `start` to `target` row.
    fn walk<A: ReadAccess>(&self, txn: &A, start: Start<'_>, target: usize) -> Result<Option<RowRef>> {
        let mut cursor = RawCursor::new(txn, TableKind::Index, self.sort_prefix());
        let (valid, mut row) = match start {
            Start::Ref(reference) => (cursor.find(&reference.key, FindMode::Eq)?, reference.row),
            Start::Top => (cursor.first()?, 0),
            Start::Bottom => (cursor.last()?, self.list_size.saturating_sub(1)),
        };
        if !valid {
            return Err(Error::Corrupted { reason: format!("{} screen lost its position", R::NAME) });
        }
        while row < target {
            if !cursor.next()? {
                return Ok(None);
            }
            row += 1;
        }
        while row > target {
            if !cursor.prev()? {
                return Ok(None);
            }
            row -= 1;
        }
        Ok(row_ref(&cursor, row))
    }

    /// Moves a reference to `row`. Returns `false` if the row does not exist.
    ///
    /// Jumps of at most `small_jump_rows` from the primary reference move the primary
    /// reference. Longer jumps move the auxiliary reference, starting from whichever of the two
    /// references, the top or the bottom is nearest.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`Error::Corrupted`] if a reference no longer exists.
    pub fn set_reference(&mut self, row: usize) -> Result<bool> {
        if row >= self.list_size {
            return Ok(false);
        }
        let txn = self.temp.read()?;
        let primary = self.refs[PRIMARY_REF].as_ref();
        let (slot, moved) = match primary {
            Some(reference) if reference.row.abs_diff(row) <= self.config.small_jump_rows => {
                (PRIMARY_REF, self.walk(&txn, Start::Ref(reference), row)?)
            },
            None if row <= self.config.small_jump_rows => {
                (PRIMARY_REF, self.walk(&txn, Start::Top, row)?)
            },
            _ => {
                let bottom = self.list_size - 1;
                let mut best = (Start::Top, row);
                if bottom - row < best.1 {
                    best = (Start::Bottom, bottom - row);
                }
                for reference in self.refs.iter().flatten() {
                    if reference.row.abs_diff(row) < best.1 {
                        best = (Start::Ref(reference), reference.row.abs_diff(row));
                    }
                }
                (AUX_REF, self.walk(&txn, best.0, row)?)
            },
        };
        let found = moved.is_some();
        if found {
            self.refs[slot] = moved;
            self.active = slot;
        }
        Ok(found)
    }

    /// Returns the record at `row`, moving a reference there.
    ///
    /// # Errors
    ///
    /// See [`set_reference`](Screen::set_reference).
    pub fn record_at_row(&mut self, row: usize) -> Result<Option<R>> {
        if !self.set_reference(row)? {
            return Ok(None);
        }
        let Some(reference) = &self.refs[self.active] else {
            return Ok(None);
        };
        self.temp.read()?.get::<R>(&reference.primary_key)
    }

    /// Returns up to `rows` records starting at row `top` and records the window position.
    ///
    /// # Errors
    ///
    /// See [`set_reference`](Screen::set_reference).
    pub fn window(&mut self, top: usize, rows: usize) -> Result<Vec<R>> {
        let mut records = Vec::with_capacity(rows.min(self.list_size));
        let mut state = ScreenState {
            pos_top: top.min(self.list_size),
            list_size: self.list_size,
            ..ScreenState::default()
        };
        if rows > 0 && self.set_reference(top)? {
            if let Some(reference) = &self.refs[self.active] {
                let txn = self.temp.read()?;
                let mut cursor = txn.index_cursor::<R>(self.sort_index)?;
                cursor.find(&reference.key, FindMode::SetRange)?;
                while records.len() < rows && cursor.is_valid() {
                    if state.key_top.is_none() {
                        state.key_top = cursor.primary_key().map(<[u8]>::to_vec);
                    }
                    state.key_bottom = cursor.primary_key().map(<[u8]>::to_vec);
                    if let Some(record) = cursor.current()? {
                        records.push(record);
                    }
                    cursor.next()?;
                }
            }
        }
        self.state = state;
        Ok(records)
    }

    /// Returns the row of the record with `primary_key`, `None` if the view does not hold it.
    ///
    /// The auxiliary reference is left on the found row.
    ///
    /// # Errors
    ///
    /// See [`set_reference`](Screen::set_reference).
    pub fn row_of_key(&mut self, primary_key: &[u8]) -> Result<Option<usize>> {
        let txn = self.temp.read()?;
        let Some(record) = txn.get::<R>(primary_key)? else {
            return Ok(None);
        };
        let target = self.sort_key(&record, primary_key);
        let mut cursor = RawCursor::new(&txn, TableKind::Index, self.sort_prefix());
        let start = self.refs[self.active].as_ref().or(self.refs[PRIMARY_REF].as_ref());
        let (mut valid, mut row) = match start {
            Some(reference) => (cursor.find(&reference.key, FindMode::Eq)?, reference.row),
            None => (cursor.first()?, 0),
        };
        let forward = cursor.key().is_some_and(|key| key <= target.as_slice());
        while valid && cursor.key() != Some(target.as_slice()) {
            if forward {
                valid = cursor.next()?;
                row += 1;
            } else {
                valid = cursor.prev()?;
                row = row.saturating_sub(1);
            }
        }
        if !valid {
            return Err(Error::Corrupted { reason: format!("{} screen entry missing", R::NAME) });
        }
        self.refs[AUX_REF] = row_ref(&cursor, row);
        self.active = AUX_REF;
        Ok(Some(row))
    }

    /// Number of rows in the view.
    pub fn list_size(&self) -> usize {
        self.list_size
    }

    /// Position of the last window.
    pub fn state(&self) -> &ScreenState {
        &self.state
    }

    /// Source transaction id the view reflects.
    pub fn last_txn_id(&self) -> u64 {
        self.last_txn_id
    }
}

fn row_ref<A: ReadAccess>(cursor: &RawCursor<'_, A>, row: usize) -> Option<RowRef> {
    let (key, primary_key) = (cursor.key()?, cursor.value()?);
    Some(RowRef { key: key.to_vec(), primary_key: primary_key.to_vec(), row })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    crate::define_record! {
        struct Prog {
            type_id: 61,
            name: "prog",
            primary_key: [1, 2],
            indexes: [(1, "by_order", [3])],
            fields: {
                1 => sat: u8,
                2 => id: u16,
                3 => order: u16,
                4 => name: String,
            }
        }
    }

    fn prog(sat: u8, id: u16, order: u16, name: &str) -> Prog {
        Prog { sat, id, order, name: name.to_string() }
    }

    fn source() -> Database {
        let db = Database::open_in_memory(DatabaseSchema::new("src").with::<Prog>(), DatabaseConfig::default())
            .unwrap();
        let txn = db.write().unwrap();
        for (id, order, name) in [(1, 30, "bbc"), (2, 10, "arte"), (3, 20, "zdf"), (4, 20, "ard"), (5, 40, "orf")] {
            txn.put(&prog(1, id, order, name)).unwrap();
        }
        txn.put(&prog(2, 9, 5, "rai")).unwrap();
        txn.commit().unwrap();
        db
    }

    fn screen(db: &Database, options: ScreenOptions<Prog>) -> Screen<Prog> {
        Screen::new(&db.read().unwrap(), options, ScreenConfig::default()).unwrap()
    }

    fn ids(records: &[Prog]) -> Vec<u16> {
        records.iter().map(|p| p.id).collect()
    }

    #[test]
    fn test_sorted_by_static_index_with_key_prefix() {
        let db = source();
        let options = ScreenOptions::builder()
            .sort(SortOrder::Index(1))
            .key_prefix(vec![FieldValue::U8(1)])
            .build()
            .unwrap();
        let mut screen = screen(&db, options);
        assert_eq!(screen.list_size(), 5);
        assert_eq!(ids(&screen.window(0, 10).unwrap()), vec![2, 3, 4, 1, 5]);
        assert_eq!(screen.state().key_top, Some(prog(1, 2, 0, "").primary_key()));
        assert_eq!(screen.state().key_bottom, Some(prog(1, 5, 0, "").primary_key()));
    }

    #[test]
    fn test_filters_are_conjunctive() {
        let db = source();
        let options = ScreenOptions::builder()
            .sort(SortOrder::Fields(vec![4]))
            .filter(Filter::new(prog(0, 0, 20, "")).matching(3, MatchOp::Geq))
            .second_filter(Filter::new(prog(0, 0, 0, "r")).matching(4, MatchOp::Contains))
            .build()
            .unwrap();
        let mut screen = screen(&db, options);
        // order >= 20 and name contains "r": ard, orf
        assert_eq!(ids(&screen.window(0, 10).unwrap()), vec![4, 5]);
    }

    #[test]
    fn test_options_reject_bad_fields() {
        assert!(ScreenOptions::<Prog>::builder().sort(SortOrder::Index(9)).build().is_err());
        assert!(ScreenOptions::<Prog>::builder().sort(SortOrder::Fields(vec![42])).build().is_err());
        assert!(ScreenOptions::<Prog>::builder().key_prefix(vec![FieldValue::U16(1)]).build().is_err());
        assert!(
            ScreenOptions::<Prog>::builder()
                .filter(Filter::new(Prog::default()).matching(42, MatchOp::Eq))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_insert_ahead_of_reference_shifts_row() {
        let db = source();
        let options = ScreenOptions::builder().sort(SortOrder::Index(1)).build().unwrap();
        let mut screen = screen(&db, options);
        // rows: rai(5) arte(10) zdf(20) ard(20) bbc(30) orf(40)
        let held = screen.record_at_row(3).unwrap().unwrap();
        assert_eq!(held.id, 4);

        let txn = db.write().unwrap();
        txn.put(&prog(3, 1, 1, "new")).unwrap();
        txn.commit().unwrap();
        let update = screen.update(&db.read().unwrap()).unwrap();
        assert_eq!(update, ScreenUpdate::Incremental { upserted: 1, removed: 0 });
        assert_eq!(screen.refs[PRIMARY_REF].as_ref().unwrap().row, 4);
        assert_eq!(screen.record_at_row(4).unwrap().unwrap().id, 4);
        assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Unchanged);
    }

    #[test]
    fn test_removing_referenced_row_reseats() {
        let db = source();
        let options = ScreenOptions::builder().sort(SortOrder::Index(1)).build().unwrap();
        let mut screen = screen(&db, options);
        // rows: rai(5) arte(10) zdf(20) ard(20) bbc(30) orf(40)
        assert_eq!(screen.record_at_row(2).unwrap().unwrap().id, 3);

        let txn = db.write().unwrap();
        txn.delete(&prog(1, 3, 0, "")).unwrap();
        txn.commit().unwrap();
        screen.update(&db.read().unwrap()).unwrap();
        let reference = screen.refs[PRIMARY_REF].clone().unwrap();
        assert_eq!(reference.row, 2);
        assert_eq!(reference.primary_key, prog(1, 4, 0, "").primary_key());

        // Last row removed: reference falls back to the predecessor
        assert_eq!(screen.record_at_row(4).unwrap().unwrap().id, 5);
        let txn = db.write().unwrap();
        txn.delete(&prog(1, 5, 0, "")).unwrap();
        txn.commit().unwrap();
        screen.update(&db.read().unwrap()).unwrap();
        assert_eq!(screen.refs[PRIMARY_REF].as_ref().unwrap().row, 3);
        assert_eq!(screen.list_size(), 4);
    }

    #[test]
    fn test_record_leaving_filter_is_removed() {
        let db = source();
        let options = ScreenOptions::builder()
            .filter(Filter::new(prog(0, 0, 20, "")).matching(3, MatchOp::Leq))
            .build()
            .unwrap();
        let mut screen = screen(&db, options);
        assert_eq!(screen.list_size(), 4);
        let txn = db.write().unwrap();
        txn.put(&prog(1, 2, 99, "arte")).unwrap();
        txn.put(&prog(1, 1, 15, "bbc")).unwrap();
        txn.commit().unwrap();
        let update = screen.update(&db.read().unwrap()).unwrap();
        assert_eq!(update, ScreenUpdate::Incremental { upserted: 1, removed: 1 });
        assert_eq!(ids(&screen.window(0, 10).unwrap()), vec![1, 3, 4, 9]);
    }

    #[test]
    fn test_cleaned_log_forces_rescan() {
        let db = source();
        let mut screen = screen(&db, ScreenOptions::builder().build().unwrap());
        for id in 10..14 {
            let txn = db.write().unwrap();
            txn.put(&prog(1, id, 0, "x")).unwrap();
            txn.commit().unwrap();
        }
        let txn = db.write().unwrap();
        txn.clean_log(1).unwrap();
        txn.commit().unwrap();
        assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Rescanned);
        assert_eq!(screen.list_size(), 10);
    }

    #[test]
    fn test_reference_underflow_recovers_by_rescan() {
        let db = source();
        let options = ScreenOptions::builder().sort(SortOrder::Index(1)).build().unwrap();
        let mut screen = screen(&db, options);
        assert_eq!(screen.record_at_row(4).unwrap().unwrap().id, 1);
        assert!(screen.refs.iter().flatten().any(|reference| reference.row == 4));
        for reference in screen.refs.iter_mut().flatten() {
            reference.row = 0;
        }

        let txn = db.write().unwrap();
        assert!(txn.delete(&prog(1, 2, 10, "arte")).unwrap());
        txn.commit().unwrap();
        assert_eq!(screen.update(&db.read().unwrap()).unwrap(), ScreenUpdate::Rescanned);
        assert_eq!(ids(&screen.window(0, 10).unwrap()), vec![9, 3, 4, 1, 5]);
    }

    #[test]
    fn test_large_jumps_move_auxiliary_reference() {
        let db = Database::open_in_memory(DatabaseSchema::new("src").with::<Prog>(), DatabaseConfig::default())
            .unwrap();
        let txn = db.write().unwrap();
        for id in 0..200 {
            txn.put(&prog(1, id, id, "p")).unwrap();
        }
        txn.commit().unwrap();
        let config = ScreenConfig::builder().small_jump_rows(8).build().unwrap();
        let mut screen: Screen<Prog> =
            Screen::new(&db.read().unwrap(), ScreenOptions::builder().build().unwrap(), config).unwrap();

        assert_eq!(screen.record_at_row(3).unwrap().unwrap().id, 3);
        assert_eq!(screen.record_at_row(150).unwrap().unwrap().id, 150);
        assert_eq!(screen.refs[PRIMARY_REF].as_ref().unwrap().row, 3);
        assert_eq!(screen.refs[AUX_REF].as_ref().unwrap().row, 150);
        assert_eq!(screen.record_at_row(190).unwrap().unwrap().id, 190);
        assert_eq!(screen.record_at_row(199).unwrap().unwrap().id, 199);
        assert!(screen.record_at_row(200).unwrap().is_none());
        assert_eq!(screen.row_of_key(&prog(1, 42, 0, "").primary_key()).unwrap(), Some(42));
        assert_eq!(screen.row_of_key(&prog(1, 999, 0, "").primary_key()).unwrap(), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_row_consistency(
            records in proptest::collection::btree_map(0u16..300, 0u16..20, 1..80),
            rows in proptest::collection::vec(0usize..80, 1..20),
            inserted in proptest::collection::btree_map(300u16..400, 0u16..20, 0..10),
        ) {
            let db = Database::open_in_memory(DatabaseSchema::new("src").with::<Prog>(), DatabaseConfig::default())
                .unwrap();
            let txn = db.write().unwrap();
            for (id, order) in &records {
                txn.put(&prog(0, *id, *order, "")).unwrap();
            }
            txn.commit().unwrap();
            let config = ScreenConfig::builder().small_jump_rows(4).build().unwrap();
            let options: ScreenOptions<Prog> = ScreenOptions::builder().sort(SortOrder::Index(1)).build().unwrap();
            let mut screen = Screen::new(&db.read().unwrap(), options, config).unwrap();

            let mut expected: Vec<(u16, u16)> = records.iter().map(|(id, order)| (*order, *id)).collect();
            expected.sort_unstable();
            for row in &rows {
                let found = screen.record_at_row(*row).unwrap();
                prop_assert_eq!(found.map(|p| p.id), expected.get(*row).map(|(_, id)| *id));
            }

            let txn = db.write().unwrap();
            for (id, order) in &inserted {
                txn.put(&prog(0, *id, *order, "")).unwrap();
            }
            txn.commit().unwrap();
            screen.update(&db.read().unwrap()).unwrap();
            expected.extend(inserted.iter().map(|(id, order)| (*order, *id)));
            expected.sort_unstable();
            prop_assert_eq!(screen.list_size(), expected.len());
            for row in rows.iter().rev() {
                let found = screen.record_at_row(*row).unwrap();
                prop_assert_eq!(found.map(|p| p.id), expected.get(*row).map(|(_, id)| *id));
            }
        }
    }
}
