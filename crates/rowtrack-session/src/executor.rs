//! Running a command batch inside one transaction.

use crate::command::{CommandBatch, CommandKind, ModificationCommand};
use crate::entry::EntryId;
use crate::error::TrackerError;
use rowtrack_core::{Connection, Cx, Dialect, IsolationLevel, Outcome, TransactionOps, Value};
use std::collections::HashMap;

/// What the database reported back while running a batch.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Database-generated column values, per entry.
    pub generated: HashMap<EntryId, Vec<(&'static str, Value)>>,
    /// Principal keys written into dependents' foreign key columns.
    pub propagated: HashMap<EntryId, Vec<(&'static str, Value)>>,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ExecutionResult {
    /// Total number of commands run.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    /// A value generated for `entry` earlier in the batch.
    pub fn generated_value(&self, entry: EntryId, column: &str) -> Option<Value> {
        self.generated
            .get(&entry)?
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, value)| value.clone())
    }
}

/// Runs a [`CommandBatch`] all-or-nothing.
///
/// Every command must affect exactly one row. Any failure, including
/// cancellation between commands, rolls the whole transaction back.
pub struct BatchExecutor<'c, C> {
    connection: &'c C,
    isolation: IsolationLevel,
}

impl<'c, C: Connection> BatchExecutor<'c, C> {
    pub fn new(connection: &'c C, isolation: IsolationLevel) -> Self {
        Self {
            connection,
            isolation,
        }
    }

    /// Execute the batch.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict` if a command affected other than one row
    /// - `ConstraintViolation` if the database rejected a statement or the
    ///   commit on a constraint
    /// - `ConnectionFailure` on transport errors and timeouts
    /// - `Database` for any other driver error
    #[tracing::instrument(level = "info", skip(self, cx, batch))]
    pub async fn execute(&self, cx: &Cx, batch: &CommandBatch) -> Outcome<ExecutionResult, TrackerError> {
        tracing::info!(
            commands = batch.len(),
            deferred = batch.defers_constraints(),
            "Executing command batch"
        );
        let start = std::time::Instant::now();

        let tx = match self.connection.begin_with(cx, self.isolation).await {
            Outcome::Ok(tx) => tx,
            Outcome::Err(e) => return Outcome::Err(TrackerError::from_database(e, None)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let result = match run_commands(cx, &tx, self.connection.dialect(), batch).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Command batch failed; rolling back");
                rollback(cx, tx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                tracing::warn!("Command batch cancelled; rolling back");
                rollback(cx, tx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                rollback(cx, tx).await;
                return Outcome::Panicked(p);
            }
        };

        match tx.commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Commit failed");
                return Outcome::Err(TrackerError::from_database(e, None));
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Command batch committed"
        );
        Outcome::Ok(result)
    }
}

async fn run_commands<T: TransactionOps>(
    cx: &Cx,
    tx: &T,
    dialect: Dialect,
    batch: &CommandBatch,
) -> Outcome<ExecutionResult, TrackerError> {
    let mut result = ExecutionResult::default();

    if batch.defers_constraints() {
        if let Some(sql) = dialect.defer_constraints_sql() {
            tracing::debug!(sql = sql, "Deferring constraint checks");
            match tx.execute(cx, sql, &[]).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(TrackerError::from_database(e, None)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
    }

    for command in batch.commands() {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let bound = match command.bind(|principal, column| result.generated_value(principal, column)) {
            Ok(bound) => bound,
            Err(e) => return Outcome::Err(e),
        };
        let sql = command.sql(dialect);
        tracing::trace!(entry = %command.entry, sql = %sql, params = bound.values.len(), "Executing command");

        let affected = if command.has_returning() {
            let rows = match tx.query(cx, &sql, &bound.values).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(failed(command, e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let [row] = rows.as_slice() {
                let mut values = Vec::with_capacity(command.returning.len());
                for (idx, (column, sql_type)) in command.returning.iter().enumerate() {
                    let Some(value) = row.get_by_name(column).or_else(|| row.get(idx)) else {
                        return Outcome::Err(TrackerError::mapping(
                            command.table,
                            format!("RETURNING row is missing column '{column}'"),
                        ));
                    };
                    values.push((*column, sql_type.coerce(value.clone())));
                }
                result.generated.insert(command.entry, values);
            }
            rows.len() as u64
        } else {
            match tx.execute(cx, &sql, &bound.values).await {
                Outcome::Ok(n) => n,
                Outcome::Err(e) => return Outcome::Err(failed(command, e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        if affected != 1 {
            tracing::warn!(
                entry = %command.entry,
                kind = %command.kind,
                affected = affected,
                "Command did not affect exactly one row"
            );
            return Outcome::Err(TrackerError::ConcurrencyConflict {
                entry: command.entry,
                label: command.label.clone(),
                kind: command.kind,
                affected,
            });
        }

        if !bound.propagated.is_empty() {
            result
                .propagated
                .entry(command.entry)
                .or_default()
                .extend(bound.propagated);
        }
        match command.kind {
            CommandKind::Insert => result.inserted += 1,
            CommandKind::Update => result.updated += 1,
            CommandKind::Delete => result.deleted += 1,
        }
    }

    Outcome::Ok(result)
}

fn failed(command: &ModificationCommand, e: rowtrack_core::Error) -> TrackerError {
    TrackerError::from_database(e, Some((command.entry, &command.label)))
}

async fn rollback<T: TransactionOps>(cx: &Cx, tx: T) {
    match tx.rollback(cx).await {
        Outcome::Ok(()) => tracing::debug!("Transaction rolled back"),
        Outcome::Err(e) => tracing::warn!(error = %e, "Rollback failed"),
        Outcome::Cancelled(_) => tracing::warn!("Rollback cancelled"),
        Outcome::Panicked(_) => tracing::warn!("Rollback panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ColumnModification;
    use crate::command::ParamSource;
    use crate::test_support::{Failure, MockConnection, MockState};
    use asupersync::runtime::RuntimeBuilder;
    use asupersync::types::CancelKind;
    use rowtrack_core::SqlType;
    use std::sync::{Arc, Mutex};

    fn insert(entry: u64, table: &'static str) -> ModificationCommand {
        ModificationCommand {
            entry: EntryId(entry),
            kind: CommandKind::Insert,
            table,
            label: format!("{table}(new #{entry})"),
            columns: vec![ColumnModification::value("name", Value::Text("x".into()))],
            predicate: vec![],
            returning: vec![("id", SqlType::Integer)],
        }
    }

    fn update(entry: u64, id: i32) -> ModificationCommand {
        ModificationCommand {
            entry: EntryId(entry),
            kind: CommandKind::Update,
            table: "blog",
            label: format!("blog({id})"),
            columns: vec![ColumnModification::value("name", Value::Null)],
            predicate: vec![("id", Value::Int(id))],
            returning: vec![],
        }
    }

    fn batch(commands: Vec<ModificationCommand>) -> CommandBatch {
        CommandBatch {
            entries: commands.iter().map(|c| c.entry).collect(),
            commands,
            defer_constraints: false,
        }
    }

    #[test]
    fn commits_and_collects_generated_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state));

        let mut dependent = insert(2, "post");
        dependent.columns.push(ColumnModification {
            column: "blog_id",
            source: ParamSource::PrincipalKey {
                principal: EntryId(1),
                column: "id",
            },
        });
        let batch = batch(vec![insert(1, "blog"), dependent, update(3, 7)]);

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::default());
            let Outcome::Ok(result) = executor.execute(&cx, &batch).await else {
                panic!("batch should commit");
            };
            assert_eq!((result.inserted, result.updated, result.deleted), (2, 1, 0));
            assert_eq!(result.generated_value(EntryId(1), "id"), Some(Value::Int(1)));
            assert_eq!(result.generated_value(EntryId(2), "id"), Some(Value::Int(2)));
            assert_eq!(
                result.propagated[&EntryId(2)],
                vec![("blog_id", Value::Int(1))]
            );
        });

        let state = state.lock().unwrap();
        assert_eq!((state.begins, state.commits, state.rollbacks), (1, 1, 0));
        let (sql, params) = &state.executed[1];
        assert!(sql.starts_with("INSERT INTO \"post\""));
        assert_eq!(params[1], Value::Int(1));
    }

    #[test]
    fn zero_rows_is_a_concurrency_conflict() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        state.lock().unwrap().zero_rows_on = Some("UPDATE".into());
        let conn = MockConnection::new(Arc::clone(&state));
        let batch = batch(vec![insert(1, "blog"), update(2, 7)]);

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::default());
            match executor.execute(&cx, &batch).await {
                Outcome::Err(TrackerError::ConcurrencyConflict {
                    entry,
                    kind,
                    affected,
                    ..
                }) => {
                    assert_eq!(entry, EntryId(2));
                    assert_eq!(kind, CommandKind::Update);
                    assert_eq!(affected, 0);
                }
                other => panic!("expected conflict, got {other:?}"),
            }
        });

        let state = state.lock().unwrap();
        assert_eq!((state.commits, state.rollbacks), (0, 1));
    }

    #[test]
    fn constraint_failure_rolls_back() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        state.lock().unwrap().fail_on = Some(("INSERT INTO \"post\"".into(), Failure::Constraint));
        let conn = MockConnection::new(Arc::clone(&state));
        let batch = batch(vec![insert(1, "blog"), insert(2, "post")]);

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::default());
            match executor.execute(&cx, &batch).await {
                Outcome::Err(TrackerError::ConstraintViolation { entry, label, .. }) => {
                    assert_eq!(entry, Some(EntryId(2)));
                    assert_eq!(label.as_deref(), Some("post(new #2)"));
                }
                other => panic!("expected constraint violation, got {other:?}"),
            }
        });

        let state = state.lock().unwrap();
        assert_eq!((state.commits, state.rollbacks), (0, 1));
    }

    #[test]
    fn lost_connection_is_reported() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        state.lock().unwrap().fail_on = Some(("UPDATE".into(), Failure::Disconnect));
        let conn = MockConnection::new(Arc::clone(&state));
        let batch = batch(vec![update(1, 7)]);

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::Serializable);
            assert!(matches!(
                executor.execute(&cx, &batch).await,
                Outcome::Err(TrackerError::ConnectionFailure { .. })
            ));
        });
        assert_eq!(state.lock().unwrap().rollbacks, 1);
    }

    #[test]
    fn cancelled_statement_rolls_back() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        state.lock().unwrap().cancel_on = Some("UPDATE".into());
        let conn = MockConnection::new(Arc::clone(&state));
        let batch = batch(vec![insert(1, "blog"), update(2, 7), insert(3, "post")]);

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::default());
            match executor.execute(&cx, &batch).await {
                Outcome::Cancelled(reason) => assert_eq!(reason.kind, CancelKind::User),
                other => panic!("expected cancellation, got {other:?}"),
            }
        });

        let state = state.lock().unwrap();
        assert_eq!((state.begins, state.commits, state.rollbacks), (1, 0, 1));
        assert_eq!(state.executed.len(), 1);
        assert!(state.executed[0].0.starts_with("INSERT INTO \"blog\""));
    }

    #[test]
    fn cancel_request_stops_before_next_command() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        cx.cancel_with(CancelKind::User, Some("shutting down"));
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state));
        let batch = batch(vec![insert(1, "blog"), update(2, 7)]);

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::default());
            assert!(matches!(
                executor.execute(&cx, &batch).await,
                Outcome::Cancelled(_)
            ));
        });

        let state = state.lock().unwrap();
        assert!(state.executed.is_empty());
        assert_eq!((state.commits, state.rollbacks), (0, 1));
    }

    #[test]
    fn deferred_batch_sets_pragma_first() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        let conn = MockConnection::new(Arc::clone(&state));
        let mut batch = batch(vec![update(1, 7)]);
        batch.defer_constraints = true;

        rt.block_on(async {
            let executor = BatchExecutor::new(&conn, IsolationLevel::default());
            assert!(matches!(executor.execute(&cx, &batch).await, Outcome::Ok(_)));
        });
        let state = state.lock().unwrap();
        assert_eq!(state.executed[0].0, "PRAGMA defer_foreign_keys = ON");
    }
}
