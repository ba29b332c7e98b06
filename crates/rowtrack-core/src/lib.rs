//! Core types and traits for rowtrack.
//!
//! This crate provides the foundational abstractions shared by the change
//! tracker and the database drivers:
//!
//! - `Value` and `Row` for dynamically-typed column data
//! - `Entity` trait and `FieldInfo` for mapping metadata
//! - `Connection` / `TransactionOps` for database access
//! - `PropertyNotifier` for entities that report their own mutations
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod connection;
pub mod entity;
pub mod error;
pub mod field;
pub mod notify;
pub mod row;
pub mod types;
pub mod value;

pub use connection::{Connection, Dialect, IsolationLevel, TransactionOps};
pub use entity::Entity;
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result, TypeError,
};
pub use field::{FieldInfo, Generated};
pub use notify::{PropertyNotifier, SubscriptionId};
pub use row::{ColumnInfo, FromValue, Row};
pub use types::SqlType;
pub use value::Value;
