//! SQL type definitions and mapping.

use crate::value::Value;

/// SQL data types a mapped column can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    // Integer types
    TinyInt,
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    Decimal,
    Boolean,
    Text,
    Blob,

    // Date/time types
    Date,
    Time,
    Timestamp,

    Uuid,
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Decimal => "DECIMAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
            SqlType::Json => "JSON",
        }
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }

    /// Whether a column of this type can hold a database-generated value.
    ///
    /// Identity columns must be integers; computed columns and concurrency
    /// tokens may also be binary (row versions) or temporal.
    pub const fn can_be_generated(&self) -> bool {
        self.is_integer()
            || matches!(
                self,
                SqlType::Blob | SqlType::Timestamp | SqlType::Uuid | SqlType::Text
            )
    }

    /// Narrow a value handed back by a driver into this column's declared
    /// shape.
    ///
    /// Drivers that store every integer in one 64-bit class return `BigInt`
    /// for a `SMALLINT` column; this puts the value back into the variant the
    /// entity produced. Values that do not fit are returned unchanged and left
    /// for the entity's own conversion to reject.
    pub fn coerce(&self, value: Value) -> Value {
        let wide = match &value {
            Value::Null => return value,
            v => v.as_i64(),
        };
        match (self, wide) {
            (SqlType::TinyInt, Some(v)) => i8::try_from(v).map_or(value, Value::TinyInt),
            (SqlType::SmallInt, Some(v)) => i16::try_from(v).map_or(value, Value::SmallInt),
            (SqlType::Integer, Some(v)) => i32::try_from(v).map_or(value, Value::Int),
            (SqlType::BigInt, Some(v)) => Value::BigInt(v),
            (SqlType::Boolean, Some(v)) => Value::Bool(v != 0),
            (SqlType::Timestamp, Some(v)) => Value::Timestamp(v),
            (SqlType::Time, Some(v)) => Value::Time(v),
            (SqlType::Date, Some(v)) => i32::try_from(v).map_or(value, Value::Date),
            (SqlType::Uuid, None) => match value {
                Value::Bytes(b) if b.len() == 16 => {
                    let mut arr = [0u8; 16];
                    arr.copy_from_slice(&b);
                    Value::Uuid(arr)
                }
                other => other,
            },
            _ => value,
        }
    }
}
