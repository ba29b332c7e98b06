//! Entity trait for mapping structs to tables.
//!
//! The `Entity` trait is the mapping metadata provider: it tells the change
//! tracker which table a type lives in, which columns it has, which of them
//! form the key, which are generated by the database and which reference
//! other tables. It also moves values in both directions between an instance
//! and its row.

use crate::Result;
use crate::field::FieldInfo;
use crate::notify::PropertyNotifier;
use crate::row::Row;
use crate::value::Value;

/// Trait for types that can be tracked and persisted.
///
/// # Example
///
/// ```ignore
/// use rowtrack_core::{Entity, FieldInfo, Result, Row, SqlType, Value};
///
/// struct Post {
///     id: i32,
///     blog_id: i32,
///     title: String,
/// }
///
/// impl Entity for Post {
///     const TABLE_NAME: &'static str = "post";
///
///     fn fields() -> &'static [FieldInfo] {
///         static FIELDS: [FieldInfo; 3] = [
///             FieldInfo::new("id", "id", SqlType::Integer).identity(),
///             FieldInfo::new("blog_id", "blog_id", SqlType::Integer).foreign_key("blog.id"),
///             FieldInfo::new("title", "title", SqlType::Text),
///         ];
///         &FIELDS
///     }
///
///     fn to_row(&self) -> Vec<(&'static str, Value)> {
///         vec![
///             ("id", Value::Int(self.id)),
///             ("blog_id", Value::Int(self.blog_id)),
///             ("title", Value::Text(self.title.clone())),
///         ]
///     }
///
///     fn from_row(row: &Row) -> Result<Self> {
///         Ok(Self {
///             id: row.get_named("id")?,
///             blog_id: row.get_named("blog_id")?,
///             title: row.get_named("title")?,
///         })
///     }
///
///     fn set_column(&mut self, column: &str, value: Value) -> Result<()> {
///         match column {
///             "id" => self.id = value.try_into()?,
///             "blog_id" => self.blog_id = value.try_into()?,
///             "title" => self.title = value.try_into()?,
///             _ => {}
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Entity: Sized + Send + Sync + 'static {
    /// The name of the database table.
    const TABLE_NAME: &'static str;

    /// Get field metadata for all mapped columns.
    ///
    /// At least one field must be flagged as primary key.
    fn fields() -> &'static [FieldInfo];

    /// Current values of every mapped column, keyed by column name.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct an instance from a database row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Write one column's value onto the instance.
    ///
    /// Used to hand back database-generated values and to propagate a
    /// principal's generated key into a dependent's foreign key column.
    #[allow(clippy::result_large_err)]
    fn set_column(&mut self, column: &str, value: Value) -> Result<()>;

    /// The instance's change notifier, for entities that report their own
    /// writes.
    ///
    /// Entities returning `Some` are tracked by notification; all others are
    /// tracked by comparing snapshots.
    fn change_notifier(&self) -> Option<&PropertyNotifier> {
        None
    }
}
