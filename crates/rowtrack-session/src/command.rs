//! Modification commands: one INSERT, UPDATE or DELETE per pending entry.

use crate::entry::EntryId;
use crate::error::TrackerError;
use rowtrack_core::{Dialect, SqlType, Value};
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;

/// Kind of statement a command renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CommandKind {
    Insert,
    Update,
    Delete,
}

impl CommandKind {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            CommandKind::Insert => "INSERT",
            CommandKind::Update => "UPDATE",
            CommandKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Where a written column's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    /// A value known when the batch was prepared.
    Value(Value),
    /// A key the database generates for a principal inserted earlier in the
    /// same batch.
    PrincipalKey {
        principal: EntryId,
        column: &'static str,
    },
}

/// One column written by an INSERT or UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnModification {
    pub column: &'static str,
    pub source: ParamSource,
}

impl ColumnModification {
    pub fn value(column: &'static str, value: Value) -> Self {
        Self {
            column,
            source: ParamSource::Value(value),
        }
    }
}

/// Parameters of a command, resolved at execution time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundParams {
    pub values: Vec<Value>,
    /// Principal keys copied into this command's foreign key columns.
    pub propagated: Vec<(&'static str, Value)>,
}

/// A single row-level statement derived from one entry.
#[derive(Debug, Clone)]
pub struct ModificationCommand {
    pub entry: EntryId,
    pub kind: CommandKind,
    pub table: &'static str,
    /// Rendered entry for diagnostics, e.g. `blog(1)`.
    pub label: String,
    /// Columns written (empty for DELETE).
    pub columns: Vec<ColumnModification>,
    /// Original key and concurrency token values (empty for INSERT).
    pub predicate: Vec<(&'static str, Value)>,
    /// Database-generated columns to read back.
    pub returning: Vec<(&'static str, SqlType)>,
}

impl ModificationCommand {
    pub fn has_returning(&self) -> bool {
        !self.returning.is_empty()
    }

    /// Render the statement with positional placeholders.
    ///
    /// NULL predicate values render as `IS NULL` and bind nothing.
    pub fn sql(&self, dialect: Dialect) -> String {
        let table = dialect.quote_identifier(self.table);
        let mut param = 0usize;
        let mut next = || {
            param += 1;
            dialect.placeholder(param)
        };

        let mut sql = match self.kind {
            CommandKind::Insert if self.columns.is_empty() => {
                format!("INSERT INTO {table} DEFAULT VALUES")
            }
            CommandKind::Insert => {
                let names: Vec<String> = self
                    .columns
                    .iter()
                    .map(|c| dialect.quote_identifier(c.column))
                    .collect();
                let params: Vec<String> = self.columns.iter().map(|_| next()).collect();
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    names.join(", "),
                    params.join(", ")
                )
            }
            CommandKind::Update => {
                let sets: Vec<String> = self
                    .columns
                    .iter()
                    .map(|c| format!("{} = {}", dialect.quote_identifier(c.column), next()))
                    .collect();
                format!("UPDATE {table} SET {}", sets.join(", "))
            }
            CommandKind::Delete => format!("DELETE FROM {table}"),
        };

        if !self.predicate.is_empty() {
            let conditions: Vec<String> = self
                .predicate
                .iter()
                .map(|(column, value)| {
                    let column = dialect.quote_identifier(column);
                    if value.is_null() {
                        format!("{column} IS NULL")
                    } else {
                        format!("{column} = {}", next())
                    }
                })
                .collect();
            let _ = write!(sql, " WHERE {}", conditions.join(" AND "));
        }

        if self.has_returning() {
            let names: Vec<String> = self
                .returning
                .iter()
                .map(|(column, _)| dialect.quote_identifier(column))
                .collect();
            let _ = write!(sql, " RETURNING {}", names.join(", "));
        }
        sql
    }

    /// Bind parameters in placeholder order.
    ///
    /// `principal_key` looks up a value generated earlier in the batch.
    pub fn bind<F>(&self, principal_key: F) -> Result<BoundParams, TrackerError>
    where
        F: Fn(EntryId, &str) -> Option<Value>,
    {
        let mut bound = BoundParams::default();
        for modification in &self.columns {
            match &modification.source {
                ParamSource::Value(value) => bound.values.push(value.clone()),
                ParamSource::PrincipalKey { principal, column } => {
                    let Some(value) = principal_key(*principal, column) else {
                        return Err(TrackerError::mapping(
                            self.table,
                            format!(
                                "key '{}' of principal {} was not generated before {} needed it",
                                column, principal, self.label
                            ),
                        ));
                    };
                    bound.propagated.push((modification.column, value.clone()));
                    bound.values.push(value);
                }
            }
        }
        bound.values.extend(
            self.predicate
                .iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(_, value)| value.clone()),
        );
        Ok(bound)
    }
}

/// An ordered list of commands, ready to run in one transaction.
#[derive(Debug, Clone, Default)]
pub struct CommandBatch {
    pub(crate) commands: Vec<ModificationCommand>,
    /// Every pending entry the batch accounts for, including modified
    /// entries with nothing to write.
    pub(crate) entries: Vec<EntryId>,
    pub(crate) defer_constraints: bool,
}

impl CommandBatch {
    pub fn commands(&self) -> &[ModificationCommand] {
        &self.commands
    }

    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    /// Whether foreign key checks must be deferred to commit.
    pub fn defers_constraints(&self) -> bool {
        self.defer_constraints
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn count(&self, kind: CommandKind) -> usize {
        self.commands.iter().filter(|c| c.kind == kind).count()
    }
}
