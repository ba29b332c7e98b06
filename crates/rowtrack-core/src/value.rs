//! Dynamic SQL values.

use serde::{Deserialize, Serialize};

use crate::error::{Error, TypeError};

/// A dynamically-typed SQL value.
///
/// This enum is the currency of the whole workspace: entities convert their
/// fields to and from `Value`s, the change tracker snapshots them, and drivers
/// bind and read them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 8-bit signed integer
    TinyInt(i8),

    /// 16-bit signed integer
    SmallInt(i16),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 32-bit floating point
    Float(f32),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since epoch)
    Date(i32),

    /// Time (microseconds since midnight)
    Time(i64),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),

    /// SQL DEFAULT keyword
    Default,
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::TinyInt(_) => "TINYINT",
            Value::SmallInt(_) => "SMALLINT",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Float(_) => "REAL",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Date(_) => "DATE",
            Value::Time(_) => "TIME",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
            Value::Default => "DEFAULT",
        }
    }

    /// Whether this value is one of the integer variants.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_)
        )
    }

    /// Whether this value, sitting in a server-generated key column, means
    /// "not assigned yet".
    ///
    /// NULL, DEFAULT and an integer zero all qualify: entities commonly hold
    /// `0` in an identity field until the database hands out the real key.
    pub fn is_unassigned_key(&self) -> bool {
        match self {
            Value::Null | Value::Default => true,
            v if v.is_integer() => v.as_i64() == Some(0),
            _ => false,
        }
    }

    /// Compare two values for change detection.
    ///
    /// Unlike `PartialEq`, floats are compared by bit pattern so that a NaN
    /// that was never touched does not read as modified on every sweep.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::TinyInt(v) => Some(*v != 0),
            Value::SmallInt(v) => Some(*v != 0),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    ///
    /// Temporal variants are accepted since they are integer counts at rest.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::TinyInt(v) => Some(i64::from(*v)),
            Value::SmallInt(v) => Some(i64::from(*v)),
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Time(v) | Value::Timestamp(v) => Some(*v),
            Value::Date(v) => Some(i64::from(*v)),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::TinyInt(v) => Some(f64::from(*v)),
            Value::SmallInt(v) => Some(f64::from(*v)),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Uuid(u) => Some(u),
            _ => None,
        }
    }

    /// Render a short, bounded description for logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Default => "DEFAULT".to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Text(s) if s.chars().count() > 32 => {
                format!("'{}...'", s.chars().take(32).collect::<String>())
            }
            Value::Text(s) | Value::Decimal(s) => format!("'{s}'"),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::Uuid(u) => u.iter().map(|b| format!("{b:02x}")).collect(),
            Value::Json(j) => j.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            other => other
                .as_i64()
                .map_or_else(|| other.type_name().to_string(), |v| v.to_string()),
        }
    }

    fn type_error(&self, expected: &'static str) -> Error {
        Error::Type(TypeError {
            expected,
            actual: self.type_name().to_string(),
            column: None,
            rust_type: None,
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::TinyInt(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::SmallInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

/// Unsigned integers widen to the next signed variant that holds them.
impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::SmallInt(i16::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(i32::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::BigInt(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

// TryFrom implementations for extracting values.
//
// Drivers rarely preserve the declared integer width (SQLite hands back a
// single 64-bit integer class), so every integer target accepts any integer
// variant and range-checks it.

macro_rules! impl_try_from_integer {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    let wide = match &value {
                        Value::Bool(_) | Value::TinyInt(_) | Value::SmallInt(_)
                        | Value::Int(_) | Value::BigInt(_) => value.as_i64(),
                        _ => None,
                    };
                    let Some(wide) = wide else {
                        return Err(value.type_error($name));
                    };
                    <$ty>::try_from(wide).map_err(|_| {
                        Error::Type(TypeError {
                            expected: $name,
                            actual: format!("integer {wide} out of range"),
                            column: None,
                            rust_type: Some($name),
                        })
                    })
                }
            }
        )*
    };
}

impl_try_from_integer!(
    i8 => "i8",
    i16 => "i16",
    i32 => "i32",
    u8 => "u8",
    u16 => "u16",
    u32 => "u32",
);

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| value.type_error("i64"))
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| value.type_error("bool"))
    }
}

/// Maximum integer value exactly representable in f32: 2^24
const F32_MAX_EXACT_INT: i64 = 1 << 24;

impl TryFrom<Value> for f32 {
    type Error = Error;

    /// Convert a Value to f32, returning an error if precision would be lost.
    ///
    /// A `Double` read back from storage that originated as an `f32` converts
    /// exactly; anything else that does not survive the round-trip is refused.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Double(v) => {
                let converted = v as f32;
                if v.is_finite() && f64::from(converted) != v {
                    return Err(Error::Type(TypeError {
                        expected: "f32-representable f64",
                        actual: format!("f64 value {v} loses precision as f32"),
                        column: None,
                        rust_type: Some("f32"),
                    }));
                }
                Ok(converted)
            }
            ref v if v.is_integer() => {
                let wide = v.as_i64().unwrap_or_default();
                if wide.unsigned_abs() > F32_MAX_EXACT_INT as u64 {
                    return Err(Error::Type(TypeError {
                        expected: "f32-representable integer",
                        actual: format!("integer {wide} exceeds f32 exact range"),
                        column: None,
                        rust_type: Some("f32"),
                    }));
                }
                Ok(wide as f32)
            }
            other => Err(other.type_error("f32")),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(_) | Value::Double(_) | Value::TinyInt(_) | Value::SmallInt(_)
            | Value::Int(_) | Value::BigInt(_) => {
                value.as_f64().ok_or_else(|| value.type_error("f64"))
            }
            other => Err(other.type_error("f64")),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(v) | Value::Decimal(v) => Ok(v),
            other => Err(other.type_error("String")),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(v) => Ok(v),
            Value::Uuid(v) => Ok(v.to_vec()),
            Value::Text(v) => Ok(v.into_bytes()),
            other => Err(other.type_error("Vec<u8>")),
        }
    }
}

impl TryFrom<Value> for [u8; 16] {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Uuid(v) => Ok(v),
            Value::Bytes(v) if v.len() == 16 => {
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&v);
                Ok(arr)
            }
            other => Err(other.type_error("UUID")),
        }
    }
}

impl TryFrom<Value> for serde_json::Value {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Json(v) => Ok(v),
            Value::Text(s) => serde_json::from_str(&s).map_err(|e| {
                Error::Type(TypeError {
                    expected: "valid JSON",
                    actual: format!("invalid JSON: {e}"),
                    column: None,
                    rust_type: None,
                })
            }),
            other => Err(other.type_error("JSON")),
        }
    }
}

/// `None` for NULL, otherwise the inner conversion.
impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}
