//! Entity identity resolution.
//!
//! Every tracked entry is identified two ways:
//!
//! - by **instance**: the address of the shared `Arc<RwLock<E>>` handle, so
//!   the same object can never be tracked twice;
//! - by **key**: the table plus the normalized primary key values, so two
//!   objects can never claim the same row.
//!
//! Key values are normalized before comparison. Drivers do not preserve
//! integer widths (a `SMALLINT` key may come back as a 64-bit integer), so
//! all integer and temporal variants collapse to one `i64` part; text and
//! decimal collapse to text; bytes and UUIDs collapse to bytes.

use crate::entry::EntryId;
use rowtrack_core::Value;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Shared handle to a tracked instance.
///
/// Every reference obtained from a context for the same row points to the
/// same underlying object.
pub type EntityRef<E> = Arc<RwLock<E>>;

/// One normalized key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    /// Float keys compare by bit pattern.
    Float(u64),
    Text(String),
    Bytes(Vec<u8>),
    Json(String),
}

impl KeyPart {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null | Value::Default => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::Date(_)
            | Value::Time(_)
            | Value::Timestamp(_) => KeyPart::Int(value.as_i64().unwrap_or_default()),
            Value::Float(f) => KeyPart::Float(f64::from(*f).to_bits()),
            Value::Double(f) => KeyPart::Float(f.to_bits()),
            Value::Decimal(s) | Value::Text(s) => KeyPart::Text(s.clone()),
            Value::Bytes(b) => KeyPart::Bytes(b.clone()),
            Value::Uuid(u) => KeyPart::Bytes(u.to_vec()),
            Value::Json(j) => KeyPart::Json(j.to_string()),
        }
    }
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        KeyPart::from_value(value)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "NULL"),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            KeyPart::Text(s) => write!(f, "'{s}'"),
            KeyPart::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            KeyPart::Json(j) => write!(f, "{j}"),
        }
    }
}

/// Table plus normalized primary key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    table: &'static str,
    parts: Vec<KeyPart>,
}

impl IdentityKey {
    pub fn new(table: &'static str, key_values: &[Value]) -> Self {
        Self {
            table,
            parts: key_values.iter().map(KeyPart::from_value).collect(),
        }
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.table)?;
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

/// The resolved identity of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// The key is known; at most one live entry may hold it.
    Persistent(IdentityKey),
    /// The key is generated by the database and not assigned yet.
    ///
    /// Unique per entry; replaced by a persistent key once the insert has
    /// run and the generated value has been written back.
    Temporary {
        table: &'static str,
        entry: EntryId,
    },
}

impl EntityKey {
    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityKey::Temporary { .. })
    }

    pub fn identity(&self) -> Option<&IdentityKey> {
        match self {
            EntityKey::Persistent(key) => Some(key),
            EntityKey::Temporary { .. } => None,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityKey::Persistent(key) => key.table,
            EntityKey::Temporary { table, .. } => table,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Persistent(key) => write!(f, "{key}"),
            EntityKey::Temporary { table, entry } => write!(f, "{table}(new {entry})"),
        }
    }
}

/// Address of a tracked instance's shared allocation.
///
/// Valid for as long as the tracker holds its own clone of the handle, which
/// it does for the lifetime of the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct InstanceId(usize);

impl InstanceId {
    pub(crate) fn of<E>(instance: &EntityRef<E>) -> Self {
        Self(Arc::as_ptr(instance).addr())
    }
}
