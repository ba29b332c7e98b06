//! SQLite driver for rowtrack.
//!
//! This crate provides a SQLite database driver over the bundled libsqlite3.
//! It implements the `Connection` trait from rowtrack-core, so a
//! `SqliteConnection` can back a change-tracking context directly.
//!
//! # Example
//!
//! ```rust,ignore
//! use rowtrack_sqlite::{SqliteConfig, SqliteConnection};
//!
//! let conn = SqliteConnection::open(&SqliteConfig::file("blogs.db"))?;
//! conn.execute_raw("CREATE TABLE blog (id INTEGER PRIMARY KEY, name TEXT)")?;
//! ```
//!
//! # Type Mapping
//!
//! | Value | SQLite storage | Read back as |
//! |-------|----------------|--------------|
//! | `Bool`, integers | INTEGER | `BigInt` |
//! | `Float`, `Double` | REAL | `Double` |
//! | `Text`, `Decimal`, `Json` | TEXT | `Text` |
//! | `Bytes`, `Uuid` | BLOB | `Bytes` |
//! | `Date`, `Time`, `Timestamp` | INTEGER | `BigInt` |
//! | `Null` | NULL | `Null` |
//!
//! Values read back are narrowed to the column's declared type by the
//! caller (`SqlType::coerce`).
//!
//! # Foreign keys
//!
//! Connections enable `PRAGMA foreign_keys` by default, and SQLite supports
//! `PRAGMA defer_foreign_keys` for postponing checks to commit time.

// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection, SqliteTransaction};

/// The SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

/// The SQLite library version number.
pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}
