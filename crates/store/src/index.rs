//! Secondary index and change-log maintenance.
//!
//! Every primary write compares the old and new secondary keys of each static index and
//! each installed sort key, touching only those that changed, then appends one log entry.
//! All of it happens inside the caller's transaction.

use std::ops::Bound;

use tracing::{debug, trace};

use crate::{
    db::DatabaseInner,
    error::{DegradedWriteSnafu, Result},
    record::{Record, index_discriminator, key_for},
    tables::{LOG_HORIZON_KEY, TableKind, prefix_successor},
    transaction::{Direction, WriteAccess},
};

/// Returns the fields of a static index or installed sort key.
pub(crate) fn index_fields<R: Record>(inner: &DatabaseInner, index_no: u8) -> Option<Vec<u16>> {
    if let Some(index) = R::descriptor().index(index_no) {
        return Some(index.fields.clone());
    }
    inner
        .sort_keys
        .read()
        .get(&R::TYPE_ID)?
        .iter()
        .find(|key| key.index_no == index_no)
        .map(|key| key.fields.clone())
}

/// Returns every index maintained for `R`: static indexes, then installed sort keys.
pub(crate) fn indexes_for<R: Record>(inner: &DatabaseInner) -> Vec<(u8, Vec<u16>)> {
    let mut indexes: Vec<(u8, Vec<u16>)> =
        R::descriptor().indexes.iter().map(|index| (index.index_no, index.fields.clone())).collect();
    if let Some(sort_keys) = inner.sort_keys.read().get(&R::TYPE_ID) {
        indexes.extend(sort_keys.iter().map(|key| (key.index_no, key.fields.clone())));
    }
    indexes
}

/// Physical index key: `[disc][fields] ++ primary_key`.
pub(crate) fn index_entry_key<R: Record>(
    record: &R,
    index_no: u8,
    fields: &[u16],
    primary_key: &[u8],
) -> Vec<u8> {
    let mut key = key_for(record, index_discriminator(R::TYPE_ID, index_no), fields);
    key.extend_from_slice(primary_key);
    key
}

/// Physical log key: `[type][txn_id] ++ primary_key`.
fn log_key(type_id: u32, txn_id: u64, primary_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(12 + primary_key.len());
    key.extend_from_slice(&type_id.to_be_bytes());
    key.extend_from_slice(&txn_id.to_be_bytes());
    key.extend_from_slice(primary_key);
    key
}

fn previous<W: WriteAccess, R: Record>(txn: &W, primary_key: &[u8]) -> Result<Option<R>> {
    match txn.get_raw(TableKind::Data, primary_key)? {
        Some(bytes) => txn.inner().schema.decode::<R>(&bytes).map(Some),
        None => Ok(None),
    }
}

/// Stamps the write with the transaction id and logs it when the change log is enabled.
///
/// The id advances even without a change log so readers can tell the database changed.
fn append_log<W: WriteAccess>(txn: &W, type_id: u32, primary_key: &[u8]) -> Result<()> {
    let txn_id = txn.txn_id()?;
    if !txn.change_log_enabled() {
        return Ok(());
    }
    txn.put_raw(TableKind::Log, &log_key(type_id, txn_id, primary_key), primary_key)
}

/// Writes a record and brings its indexes and the change log up to date.
pub(crate) fn put_record<W: WriteAccess, R: Record>(txn: &W, record: &R) -> Result<()> {
    if txn.is_degraded() {
        return DegradedWriteSnafu { record: R::NAME }.fail();
    }
    let primary_key = record.primary_key();
    let old = previous::<W, R>(txn, &primary_key)?;
    txn.put_raw(TableKind::Data, &primary_key, &record.to_bytes())?;

    for (index_no, fields) in indexes_for::<R>(txn.inner()) {
        let new_key = index_entry_key(record, index_no, &fields, &primary_key);
        if let Some(old) = &old {
            let old_key = index_entry_key(old, index_no, &fields, &primary_key);
            if old_key == new_key {
                continue;
            }
            txn.delete_raw(TableKind::Index, &old_key)?;
        }
        txn.put_raw(TableKind::Index, &new_key, &primary_key)?;
    }

    append_log(txn, R::TYPE_ID, &primary_key)?;
    trace!(record = R::NAME, replaced = old.is_some(), "Put record");
    Ok(())
}

/// Deletes a record with its index entries and logs the change.
///
/// Returns whether the record existed.
pub(crate) fn delete_record<W: WriteAccess, R: Record>(txn: &W, primary_key: &[u8]) -> Result<bool> {
    if txn.is_degraded() {
        return DegradedWriteSnafu { record: R::NAME }.fail();
    }
    let Some(old) = previous::<W, R>(txn, primary_key)? else {
        return Ok(false);
    };
    txn.delete_raw(TableKind::Data, primary_key)?;
    for (index_no, fields) in indexes_for::<R>(txn.inner()) {
        txn.delete_raw(TableKind::Index, &index_entry_key(&old, index_no, &fields, primary_key))?;
    }
    append_log(txn, R::TYPE_ID, primary_key)?;
    trace!(record = R::NAME, "Deleted record");
    Ok(true)
}

/// Deletes log entries of every type older than `last_txn_id - keep`.
///
/// The horizon only moves forward. Returns the number of entries removed.
pub(crate) fn clean_log<W: WriteAccess>(txn: &W, keep: u64) -> Result<u64> {
    let horizon = txn.last_txn_id()?.saturating_sub(keep);
    if horizon <= txn.log_horizon()? {
        return Ok(0);
    }

    let mut removed = 0;
    let mut next = Some(Vec::new());
    while let Some(from) = next {
        let Some((key, _)) = txn.seek_raw(TableKind::Log, Bound::Included(&from), Direction::Forward)?
        else {
            break;
        };
        let Some(type_prefix) = key.get(..4) else {
            break;
        };
        let mut start = type_prefix.to_vec();
        start.extend_from_slice(&0u64.to_be_bytes());
        let mut end = type_prefix.to_vec();
        end.extend_from_slice(&horizon.to_be_bytes());
        removed += txn.delete_range_raw(TableKind::Log, &start, Some(&end))?;
        next = prefix_successor(type_prefix);
    }

    txn.put_raw(TableKind::Data, LOG_HORIZON_KEY, &horizon.to_be_bytes())?;
    debug!(db = %txn.inner().name, horizon, removed, "Cleaned change log");
    Ok(removed)
}
