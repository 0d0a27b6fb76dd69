//! Schema descriptors and schema evolution.
//!
//! Every database persists the descriptors of its record types under a reserved key. At open
//! the stored descriptors are compared with the compiled-in ones:
//!
//! - identical: records decode through the fast typed path.
//! - different: the database runs in degraded mode. Records decode field by field through the
//!   stored layout, matching fields by id, widening compatible types, defaulting fields absent
//!   from the stored layout and skipping fields the current build no longer knows. Exact-key
//!   lookups and writes are refused; full scans stay safe.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    marker::PhantomData,
    sync::{Arc, OnceLock},
};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::trace;
use tunerdb_types::{
    CodecError, FieldType, FieldValue,
    codec::{take, take_sized},
};

use crate::{
    cursor::RecordCursor,
    error::{DecodeSnafu, Error, Result},
    record::{FIRST_DYNAMIC_INDEX, Record, RecordDescriptor},
    transaction::{ReadAccess, ReadTxn, WriteAccess, WriteTxn},
};

/// Largest permitted record type id (ids are shifted into index discriminators).
const MAX_TYPE_ID: u32 = (1 << 24) - 1;

/// Type-erased record type, as listed in a [`DatabaseSchema`].
pub trait RecordKind: Send + Sync {
    /// Returns the compiled-in descriptor.
    fn descriptor(&self) -> &'static RecordDescriptor;

    /// Copies every record of this type from `source` into `dest`, re-encoding it under the
    /// compiled-in schema. Returns the number of records copied.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be decoded or written.
    fn copy_records(&self, source: &ReadTxn, dest: &WriteTxn) -> Result<u64>;
}

struct KindOf<R>(PhantomData<fn() -> R>);

impl<R: Record> RecordKind for KindOf<R> {
    fn descriptor(&self) -> &'static RecordDescriptor {
        R::descriptor()
    }

    fn copy_records(&self, source: &ReadTxn, dest: &WriteTxn) -> Result<u64> {
        let mut cursor = source.cursor::<R>();
        cursor.first()?;
        let mut copied = 0;
        for record in cursor.range() {
            dest.put(&record?)?;
            copied += 1;
        }
        Ok(copied)
    }
}

/// The record types making up one database.
///
/// ```no_run
/// # tunerdb_store::define_record! { pub struct Mux { type_id: 2, name: "mux", primary_key: [1], indexes: [], fields: { 1 => ts_id: u16 } } }
/// # tunerdb_store::define_record! { pub struct Service { type_id: 1, name: "service", primary_key: [1], indexes: [], fields: { 1 => service_id: u16 } } }
/// use tunerdb_store::DatabaseSchema;
/// let schema = DatabaseSchema::new("chdb").with::<Service>().with::<Mux>();
/// schema.validate().expect("valid schema");
/// ```
#[derive(Clone)]
pub struct DatabaseSchema {
    name: String,
    kinds: Vec<Arc<dyn RecordKind>>,
}

impl DatabaseSchema {
    /// Creates an empty schema. The name prefixes the physical table names.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), kinds: Vec::new() }
    }

    /// Adds a record type.
    #[must_use]
    pub fn with<R: Record>(mut self) -> Self {
        self.kinds.push(Arc::new(KindOf::<R>(PhantomData)));
        self
    }

    /// Returns the database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterates the compiled-in descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &'static RecordDescriptor> + '_ {
        self.kinds.iter().map(|kind| kind.descriptor())
    }

    /// Returns the descriptor of one record type.
    pub fn descriptor(&self, type_id: u32) -> Option<&'static RecordDescriptor> {
        self.descriptors().find(|d| d.type_id == type_id)
    }

    pub(crate) fn kinds(&self) -> &[Arc<dyn RecordKind>] {
        &self.kinds
    }

    /// Checks the schema for structural errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if:
    /// - the name is empty or not usable in table names
    /// - a type id is zero, above `2^24 - 1` or used twice
    /// - a field id is used twice within a type
    /// - a primary key is empty or names a missing or non-key field
    /// - an index number is outside 1-127 or used twice, or an index names a missing or
    ///   non-key field
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || !self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(schema_error(format!("invalid database name {:?}", self.name)));
        }
        let mut type_ids = HashSet::new();
        for desc in self.descriptors() {
            if desc.type_id == 0 || desc.type_id > MAX_TYPE_ID {
                return Err(schema_error(format!(
                    "{}: type id {} outside 1-{MAX_TYPE_ID}",
                    desc.name, desc.type_id
                )));
            }
            if !type_ids.insert(desc.type_id) {
                return Err(schema_error(format!("duplicate type id {}", desc.type_id)));
            }
            let mut field_ids = HashSet::new();
            for field in &desc.fields {
                if !field_ids.insert(field.field_id) {
                    return Err(schema_error(format!(
                        "{}: duplicate field id {}",
                        desc.name, field.field_id
                    )));
                }
            }
            if desc.primary_key.is_empty() {
                return Err(schema_error(format!("{}: empty primary key", desc.name)));
            }
            check_key_fields(desc, "primary key", &desc.primary_key)?;
            let mut index_nos = HashSet::new();
            for index in &desc.indexes {
                if index.index_no == 0 || index.index_no >= FIRST_DYNAMIC_INDEX {
                    return Err(schema_error(format!(
                        "{}: index {} number {} outside 1-127",
                        desc.name, index.name, index.index_no
                    )));
                }
                if !index_nos.insert(index.index_no) {
                    return Err(schema_error(format!(
                        "{}: duplicate index number {}",
                        desc.name, index.index_no
                    )));
                }
                check_key_fields(desc, &index.name, &index.fields)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSchema")
            .field("name", &self.name)
            .field("types", &self.descriptors().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

/// Checks that every field id names an existing field of a key-capable type.
pub(crate) fn check_key_fields(desc: &RecordDescriptor, what: &str, fields: &[u16]) -> Result<()> {
    for field_id in fields {
        let Some(field) = desc.field(*field_id) else {
            return Err(schema_error(format!(
                "{}: {what} names unknown field {field_id}",
                desc.name
            )));
        };
        let key_capable =
            FieldType::from_type_id(field.type_id).is_some_and(FieldType::is_key_type);
        if !key_capable {
            return Err(schema_error(format!(
                "{}: {what} field {} cannot be part of a key",
                desc.name, field.name
            )));
        }
    }
    Ok(())
}

fn schema_error(reason: String) -> Error {
    Error::Schema { reason }
}

/// Schema descriptor as persisted in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSchema {
    /// Database name.
    pub name: String,
    /// Descriptors of all record types.
    pub types: Vec<RecordDescriptor>,
}

impl StoredSchema {
    /// Captures the compiled-in descriptors of a schema.
    pub fn of(schema: &DatabaseSchema) -> Self {
        Self { name: schema.name().to_string(), types: schema.descriptors().cloned().collect() }
    }
}

struct TypeSchema {
    /// Layout records of this type are stored with.
    stored: RecordDescriptor,
    identical: bool,
    layout: OnceLock<FieldLayout>,
}

/// Result of comparing stored and compiled-in descriptors, owned by the open database.
pub struct SchemaState {
    types: HashMap<u32, TypeSchema>,
    differences: Vec<String>,
}

impl SchemaState {
    /// Compares the compiled-in schema with the stored one.
    ///
    /// `stored == None` means a fresh database, which is never degraded. Types missing from the
    /// stored schema have no records yet and do not degrade the database either.
    pub fn reconcile(compiled: &DatabaseSchema, stored: Option<&StoredSchema>) -> Self {
        let mut types = HashMap::new();
        let mut differences = Vec::new();
        for desc in compiled.descriptors() {
            let stored_desc = stored
                .and_then(|stored| stored.types.iter().find(|s| s.type_id == desc.type_id))
                .unwrap_or(desc);
            let identical = stored_desc == desc;
            if !identical {
                differences.extend(describe_differences(stored_desc, desc));
            }
            types.insert(
                desc.type_id,
                TypeSchema { stored: stored_desc.clone(), identical, layout: OnceLock::new() },
            );
        }
        if let Some(stored) = stored {
            for desc in &stored.types {
                if compiled.descriptor(desc.type_id).is_none() {
                    differences.push(format!("{}: type dropped from compiled schema", desc.name));
                }
            }
        }
        Self { types, differences }
    }

    /// Whether stored and compiled-in schemas differ.
    pub fn is_degraded(&self) -> bool {
        !self.differences.is_empty()
    }

    /// Human-readable list of differences.
    pub fn differences(&self) -> &[String] {
        &self.differences
    }

    /// Decodes a record, through the degraded path when its type's schema differs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for malformed input.
    pub fn decode<R: Record>(&self, bytes: &[u8]) -> Result<R> {
        match self.types.get(&R::TYPE_ID) {
            Some(ts) if !ts.identical => {
                degraded_decode::<R>(&ts.stored, bytes).context(DecodeSnafu { record: R::NAME })
            },
            _ => R::decode(bytes).context(DecodeSnafu { record: R::NAME }),
        }
    }

    /// Returns the memoized field layout of a type as stored.
    pub fn layout(&self, type_id: u32) -> Option<&FieldLayout> {
        let ts = self.types.get(&type_id)?;
        Some(ts.layout.get_or_init(|| FieldLayout::new(&ts.stored)))
    }
}

fn describe_differences(stored: &RecordDescriptor, compiled: &RecordDescriptor) -> Vec<String> {
    let mut out = Vec::new();
    for field in &compiled.fields {
        match stored.field(field.field_id) {
            None => out.push(format!("{}.{}: added", compiled.name, field.name)),
            Some(old) if old.type_id != field.type_id => {
                out.push(format!("{}.{}: type changed", compiled.name, field.name));
            },
            Some(_) => {},
        }
    }
    for field in &stored.fields {
        if compiled.field(field.field_id).is_none() {
            out.push(format!("{}.{}: removed", compiled.name, field.name));
        }
    }
    if stored.primary_key != compiled.primary_key || stored.indexes != compiled.indexes {
        out.push(format!("{}: keys changed", compiled.name));
    }
    if out.is_empty() {
        out.push(format!("{}: field order changed", compiled.name));
    }
    out
}

/// Decodes a record laid out according to `stored`, matching fields by id.
///
/// # Errors
///
/// Returns a [`CodecError`] when the buffer is shorter than the stored layout requires.
pub fn degraded_decode<R: Record>(stored: &RecordDescriptor, bytes: &[u8]) -> Result<R, CodecError> {
    let compiled = R::descriptor();
    let mut record = R::default();
    let mut buf = bytes;
    for field in &stored.fields {
        let field_type = FieldType::from_type_id(field.type_id);
        match (field_type, compiled.field(field.field_id)) {
            (Some(field_type), Some(_)) => {
                let value = FieldValue::read_wire(field_type, &mut buf)?;
                if !record.set_field(field.field_id, value) {
                    trace!(record = R::NAME, field = %field.name, "Incompatible stored field, using default");
                }
            },
            (Some(field_type), None) => FieldValue::skip_wire(field_type, &mut buf)?,
            (None, _) => skip_unknown(field.serialized_size, &mut buf)?,
        }
    }
    Ok(record)
}

fn skip_unknown(serialized_size: i32, buf: &mut &[u8]) -> Result<(), CodecError> {
    match usize::try_from(serialized_size) {
        Ok(size) => take(buf, size).map(|_| ()),
        Err(_) => take_sized(buf).map(|_| ()),
    }
}

#[derive(Debug)]
struct LayoutField {
    field_id: u16,
    field_type: Option<FieldType>,
    serialized_size: i32,
    offset: Option<usize>,
}

/// Field positions of one stored record layout.
///
/// Offsets are known for every field preceded only by fixed-size fields. Reads of later fields
/// walk forward from the last known offset.
#[derive(Debug)]
pub struct FieldLayout {
    fields: Vec<LayoutField>,
}

impl FieldLayout {
    /// Computes the layout of a descriptor.
    pub fn new(desc: &RecordDescriptor) -> Self {
        let mut offset = Some(0usize);
        let fields = desc
            .fields
            .iter()
            .map(|field| {
                let field_type = FieldType::from_type_id(field.type_id);
                let entry = LayoutField {
                    field_id: field.field_id,
                    field_type,
                    serialized_size: field.serialized_size,
                    offset,
                };
                let fixed = field_type.and_then(FieldType::fixed_size);
                offset = offset.zip(fixed).map(|(at, size)| at + size);
                entry
            })
            .collect();
        Self { fields }
    }

    /// Byte offset of a field preceded only by fixed-size fields.
    pub fn fixed_offset(&self, field_id: u16) -> Option<usize> {
        self.fields.iter().find(|f| f.field_id == field_id)?.offset
    }

    /// Reads one field without decoding the whole record.
    ///
    /// Returns `None` when the field is not part of the layout.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] when `bytes` is shorter than the layout requires.
    pub fn read_field(&self, bytes: &[u8], field_id: u16) -> Result<Option<FieldValue>, CodecError> {
        let Some(pos) = self.fields.iter().position(|f| f.field_id == field_id) else {
            return Ok(None);
        };
        let Some(field_type) = self.fields[pos].field_type else {
            return Ok(None);
        };
        let Some(start) = self.fields[..=pos].iter().rposition(|f| f.offset.is_some()) else {
            return Ok(None);
        };
        let Some(offset) = self.fields[start].offset else {
            return Ok(None);
        };
        let mut buf = bytes
            .get(offset..)
            .ok_or(CodecError::ShortBuffer { needed: offset, remaining: bytes.len() })?;
        for field in &self.fields[start..pos] {
            match field.field_type {
                Some(ty) => FieldValue::skip_wire(ty, &mut buf)?,
                None => skip_unknown(field.serialized_size, &mut buf)?,
            }
        }
        FieldValue::read_wire(field_type, &mut buf).map(Some)
    }
}
