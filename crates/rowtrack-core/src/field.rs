//! Field and column definitions.

use crate::types::SqlType;

/// How the database produces a column's value, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Generated {
    /// The application supplies the value.
    #[default]
    Never,
    /// Assigned by the database on insert (identity / autoincrement).
    ///
    /// An unassigned value (NULL, DEFAULT or zero) is left out of the INSERT
    /// and read back afterwards; an explicit value is sent as-is.
    OnInsert,
    /// Recomputed by the database on every insert and update (computed
    /// columns, row versions). Never written by the application.
    Always,
}

/// Metadata about an entity field/column.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column_name: &'static str,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether this is a primary key
    pub primary_key: bool,
    /// Whether and when the database generates the value
    pub generated: Generated,
    /// Whether the original value takes part in UPDATE/DELETE predicates
    pub concurrency_token: bool,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column_name: &'static str, sql_type: SqlType) -> Self {
        Self {
            name,
            column_name,
            sql_type,
            nullable: false,
            primary_key: false,
            generated: Generated::Never,
            concurrency_token: false,
            foreign_key: None,
        }
    }

    /// Set the database column name.
    pub const fn column(mut self, name: &'static str) -> Self {
        self.column_name = name;
        self
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set primary key flag.
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Mark the column as database-generated.
    pub const fn generated(mut self, value: Generated) -> Self {
        self.generated = value;
        self
    }

    /// Shorthand for an identity key column.
    pub const fn identity(self) -> Self {
        self.primary_key(true).generated(Generated::OnInsert)
    }

    /// Set concurrency token flag.
    pub const fn concurrency_token(mut self, value: bool) -> Self {
        self.concurrency_token = value;
        self
    }

    /// Set foreign key reference ("table.column").
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    /// Split the foreign key reference into `(table, column)`.
    ///
    /// A reference without a dot is taken to point at the table's `id`
    /// column.
    pub fn foreign_key_target(&self) -> Option<(&'static str, &'static str)> {
        self.foreign_key
            .map(|fk| fk.split_once('.').unwrap_or((fk, "id")))
    }

    /// Whether the application may write this column in an UPDATE.
    pub const fn is_writable(&self) -> bool {
        !self.primary_key && !matches!(self.generated, Generated::Always)
    }
}
