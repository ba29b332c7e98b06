//! Database connection traits.
//!
//! This module defines the abstractions the persistence core needs from a
//! driver:
//!
//! - [`Connection`] - executes statements and opens transactions
//! - [`TransactionOps`] - statements inside one transaction, then commit or rollback
//! - [`IsolationLevel`] - SQL transaction isolation levels
//! - [`Dialect`] - the few SQL spelling differences command rendering cares about
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation and timeout handling.

use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Transactions can see uncommitted changes from others.
    ReadUncommitted,
    /// Transactions only see committed changes from others.
    #[default]
    ReadCommitted,
    /// Transactions see a consistent snapshot of the database.
    RepeatableRead,
    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// SQL dialect spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Positional parameter placeholder, 1-based.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
        }
    }

    /// Quote an identifier, doubling embedded quotes.
    pub fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Statement that postpones foreign key checks to commit time, if the
    /// dialect has one.
    ///
    /// On PostgreSQL this only affects constraints declared `DEFERRABLE`.
    pub const fn defer_constraints_sql(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres => Some("SET CONSTRAINTS ALL DEFERRED"),
            Dialect::Sqlite => Some("PRAGMA defer_foreign_keys = ON"),
        }
    }

    pub const fn supports_deferred_constraints(&self) -> bool {
        self.defer_constraints_sql().is_some()
    }
}

/// A database connection capable of executing statements.
///
/// All operations are async and take a `Cx` context for cancellation/timeout
/// support. Implementations must be `Send + Sync` for use across async
/// boundaries.
///
/// ```rust,ignore
/// let rows = conn.query(&cx, "SELECT * FROM blog WHERE id = ?1", &[Value::Int(1)]).await?;
///
/// let tx = conn.begin(&cx).await?;
/// tx.execute(&cx, "DELETE FROM blog WHERE id = ?1", &[Value::Int(2)]).await?;
/// tx.commit(&cx).await?;
/// ```
pub trait Connection: Send + Sync {
    /// The transaction type returned by this connection.
    type Tx<'conn>: TransactionOps
    where
        Self: 'conn;

    /// The SQL dialect this connection speaks.
    fn dialect(&self) -> Dialect;

    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Begin a transaction with default isolation level (ReadCommitted).
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send {
        self.begin_with(cx, IsolationLevel::default())
    }

    /// Begin a transaction with a specific isolation level.
    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send;

    /// Check if the connection is still valid by sending a ping.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Check if the connection is still valid (alias for ping that returns bool).
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }
}

/// Operations inside one open transaction.
///
/// Transactions must be explicitly committed or rolled back; dropping one
/// without either rolls it back.
pub trait TransactionOps: Send {
    /// Execute a query within this transaction.
    ///
    /// Also used for data-modification statements with a `RETURNING`
    /// clause: each returned row is one affected row.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Execute a statement within this transaction and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Commit the transaction, making all changes permanent.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
