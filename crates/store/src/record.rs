//! Typed records and their descriptors.
//!
//! A record type is a plain struct declared with [`define_record!`]. The macro assigns every
//! field a stable id, generates the wire encoding and produces a [`RecordDescriptor`] that is
//! persisted with the database so later builds can detect schema drift.

use serde::{Deserialize, Serialize};
use tunerdb_types::{CodecError, FieldValue, Wire};

/// Serialized size marker for variable-size fields.
pub const VARIABLE_SIZE: i32 = -1;

/// Index numbers at or above this value belong to dynamic sort keys.
pub const FIRST_DYNAMIC_INDEX: u8 = 128;

/// Description of one record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Stable field id. Never reassigned once used.
    pub field_id: u16,
    /// Field type id, see [`tunerdb_types::FieldType::type_id`].
    pub type_id: u32,
    /// Serialized width for fixed-size fields, [`VARIABLE_SIZE`] otherwise.
    pub serialized_size: i32,
    /// Field name.
    pub name: String,
}

impl FieldDescriptor {
    /// Describes a field of Rust type `T`.
    pub fn of<T: Wire>(field_id: u16, name: &str) -> Self {
        let serialized_size = T::FIELD_TYPE
            .fixed_size()
            .and_then(|size| i32::try_from(size).ok())
            .unwrap_or(VARIABLE_SIZE);
        Self { field_id, type_id: T::FIELD_TYPE.type_id(), serialized_size, name: name.to_string() }
    }
}

/// Description of one secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Index number, unique within the record type.
    pub index_no: u8,
    /// Index name.
    pub name: String,
    /// Indexed field ids, most significant first.
    pub fields: Vec<u16>,
}

/// Description of one record type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDescriptor {
    /// Type id; also the primary key discriminator.
    pub type_id: u32,
    /// Record type name.
    pub name: String,
    /// Fields in declaration (and serialization) order.
    pub fields: Vec<FieldDescriptor>,
    /// Field ids forming the primary key, most significant first.
    pub primary_key: Vec<u16>,
    /// Static secondary indexes.
    pub indexes: Vec<IndexDescriptor>,
}

impl RecordDescriptor {
    /// Looks up a field by id.
    pub fn field(&self, field_id: u16) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.field_id == field_id)
    }

    /// Looks up a static index by number.
    pub fn index(&self, index_no: u8) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.index_no == index_no)
    }
}

/// A typed record stored in the database.
///
/// Implementations are generated by [`define_record!`].
pub trait Record: Clone + Default + Send + 'static {
    /// Type id, unique within a database schema. Must be non-zero and below `2^24`.
    const TYPE_ID: u32;

    /// Record type name.
    const NAME: &'static str;

    /// Returns the compiled-in descriptor.
    fn descriptor() -> &'static RecordDescriptor;

    /// Reads a field by id.
    fn get_field(&self, field_id: u16) -> Option<FieldValue>;

    /// Writes a field by id, widening the value where allowed.
    ///
    /// Returns `false` when the id is unknown or the value's type is incompatible.
    fn set_field(&mut self, field_id: u16, value: FieldValue) -> bool;

    /// Appends the wire encoding of all fields in declaration order.
    fn encode(&self, out: &mut Vec<u8>);

    /// Decodes a record encoded with the compiled-in layout.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for truncated, overlong or malformed input.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;

    /// Returns the exact number of bytes [`encode`](Record::encode) appends.
    fn encoded_size(&self) -> usize;

    /// Returns the primary key: `[TYPE_ID][ascending primary key fields]`.
    fn primary_key(&self) -> Vec<u8> {
        key_for(self, Self::TYPE_ID, &Self::descriptor().primary_key)
    }

    /// Returns the secondary key of a static index, `None` if the index does not exist.
    fn index_key(&self, index_no: u8) -> Option<Vec<u8>> {
        let index = Self::descriptor().index(index_no)?;
        Some(key_for(self, index_discriminator(Self::TYPE_ID, index_no), &index.fields))
    }

    /// Serializes the record into a pre-sized buffer.
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size());
        self.encode(&mut out);
        out
    }
}

/// Discriminator of a secondary index key.
pub const fn index_discriminator(type_id: u32, index_no: u8) -> u32 {
    (type_id << 8) | index_no as u32
}

/// Builds `[disc][ascending fields]` from a record.
///
/// Unknown field ids contribute nothing; schemas are validated so this does not happen for
/// declared keys.
pub fn key_for<R: Record>(record: &R, discriminator: u32, fields: &[u16]) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + fields.len() * 8);
    key.extend_from_slice(&discriminator.to_be_bytes());
    for field_id in fields {
        if let Some(value) = record.get_field(*field_id) {
            value.encode_ascending(&mut key);
        }
    }
    key
}

/// Builds a primary key prefix from leading key field values.
///
/// `primary_prefix::<Service>(&[FieldValue::I16(192)])` bounds a cursor to one satellite.
pub fn primary_prefix<R: Record>(values: &[FieldValue]) -> Vec<u8> {
    prefix_for(R::TYPE_ID, values)
}

/// Builds a secondary key prefix for an index from leading indexed field values.
pub fn index_prefix<R: Record>(index_no: u8, values: &[FieldValue]) -> Vec<u8> {
    prefix_for(index_discriminator(R::TYPE_ID, index_no), values)
}

fn prefix_for(discriminator: u32, values: &[FieldValue]) -> Vec<u8> {
    let mut key = discriminator.to_be_bytes().to_vec();
    for value in values {
        value.encode_ascending(&mut key);
    }
    key
}

/// Declares a record struct and implements [`Record`] for it.
///
/// ```
/// tunerdb_store::define_record! {
///     /// A bouquet of services.
///     pub struct Bouquet {
///         type_id: 9,
///         name: "bouquet",
///         primary_key: [1],
///         indexes: [(1, "by_name", [2])],
///         fields: {
///             1 => bouquet_id: u16,
///             2 => name: String = "unnamed".to_string(),
///             3 => service_ids: Vec<u16>,
///         }
///     }
/// }
///
/// use tunerdb_store::Record;
/// let bouquet = Bouquet::default();
/// assert_eq!(bouquet.name, "unnamed");
/// assert_eq!(Bouquet::descriptor().fields.len(), 3);
/// ```
///
/// Field ids are append-only: a later build may add fields with new ids and drop old ones, but
/// must never reuse an id with a different meaning.
#[macro_export]
macro_rules! define_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            type_id: $type_id:literal,
            name: $rname:literal,
            primary_key: [$($pk:literal),+ $(,)?],
            indexes: [$( ($ino:literal, $iname:literal, [$($ifield:literal),+ $(,)?]) ),* $(,)?],
            fields: {
                $(
                    $(#[$fmeta:meta])*
                    $fid:literal => $field:ident : $fty:ty $(= $default:expr)?
                ),+ $(,)?
            } $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                pub $field: $fty,
            )+
        }

        impl Default for $name {
            fn default() -> Self {
                Self { $( $field: $crate::__field_default!($fty $(, $default)?), )+ }
            }
        }

        impl $crate::record::Record for $name {
            const TYPE_ID: u32 = $type_id;
            const NAME: &'static str = $rname;

            fn descriptor() -> &'static $crate::record::RecordDescriptor {
                static DESCRIPTOR: ::std::sync::OnceLock<$crate::record::RecordDescriptor> =
                    ::std::sync::OnceLock::new();
                DESCRIPTOR.get_or_init(|| $crate::record::RecordDescriptor {
                    type_id: $type_id,
                    name: $rname.to_string(),
                    fields: vec![
                        $( $crate::record::FieldDescriptor::of::<$fty>($fid, stringify!($field)), )+
                    ],
                    primary_key: vec![$($pk),+],
                    indexes: vec![
                        $(
                            $crate::record::IndexDescriptor {
                                index_no: $ino,
                                name: $iname.to_string(),
                                fields: vec![$($ifield),+],
                            },
                        )*
                    ],
                })
            }

            fn get_field(&self, field_id: u16) -> Option<$crate::FieldValue> {
                match field_id {
                    $( $fid => Some($crate::Wire::to_value(&self.$field)), )+
                    _ => None,
                }
            }

            fn set_field(&mut self, field_id: u16, value: $crate::FieldValue) -> bool {
                match field_id {
                    $(
                        $fid => match <$fty as $crate::Wire>::from_value(value) {
                            Some(v) => {
                                self.$field = v;
                                true
                            },
                            None => false,
                        },
                    )+
                    _ => false,
                }
            }

            fn encode(&self, out: &mut Vec<u8>) {
                $( $crate::Wire::serialize(&self.$field, out); )+
            }

            fn decode(bytes: &[u8]) -> Result<Self, $crate::CodecError> {
                let mut buf = bytes;
                let record = Self {
                    $( $field: <$fty as $crate::Wire>::deserialize(&mut buf)?, )+
                };
                if !buf.is_empty() {
                    return Err($crate::CodecError::TrailingBytes { remaining: buf.len() });
                }
                Ok(record)
            }

            fn encoded_size(&self) -> usize {
                0 $( + $crate::Wire::serialized_size(&self.$field) )+
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __field_default {
    ($fty:ty) => {
        <$fty as ::std::default::Default>::default()
    };
    ($fty:ty, $default:expr) => {
        $default
    };
}
