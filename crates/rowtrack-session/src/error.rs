//! Error taxonomy for change tracking and saving.

use crate::command::CommandKind;
use crate::entry::{EntityState, EntryId};
use rowtrack_core::Error;
use std::fmt;

/// Errors raised by the tracker, the batch preparer and the executor.
///
/// Identity and state errors surface immediately from the call that caused
/// them. Cycle errors are raised before any I/O. Execution errors are raised
/// after the transaction has been rolled back, with the tracker left exactly
/// as it was before the save.
#[derive(Debug)]
pub enum TrackerError {
    /// Another live entry already tracks this identity (or this instance).
    DuplicateIdentity {
        /// Table of the entity.
        table: &'static str,
        /// Rendered key values.
        key: String,
    },
    /// The instance has no entry in this tracker.
    NotTracked {
        /// Rust type name of the instance.
        type_name: &'static str,
    },
    /// The requested state change is not in the transition table.
    InvalidStateTransition {
        /// Table of the entity.
        table: &'static str,
        /// Current state.
        from: EntityState,
        /// Requested state.
        to: EntityState,
    },
    /// Pending entries depend on each other in a loop that cannot be
    /// broken by statement order.
    UnresolvableDependencyCycle {
        /// Entries on the cycle, first entry repeated at the end.
        cycle: Vec<String>,
    },
    /// An UPDATE or DELETE (or INSERT) did not affect exactly one row.
    ConcurrencyConflict {
        /// Entry whose command failed.
        entry: EntryId,
        /// Rendered entry, e.g. `blog(1)`.
        label: String,
        /// Statement kind.
        kind: CommandKind,
        /// Rows the database reported as affected.
        affected: u64,
    },
    /// The database rejected a statement because of a constraint.
    ConstraintViolation {
        /// Entry whose command failed; `None` for deferred checks at commit.
        entry: Option<EntryId>,
        /// Rendered entry, if known.
        label: Option<String>,
        /// Database diagnostic.
        source: Error,
    },
    /// Transport failure, lost connection or timeout.
    ConnectionFailure {
        /// Underlying driver error.
        source: Error,
    },
    /// Any other database failure.
    Database {
        /// Underlying driver error.
        source: Error,
    },
    /// An entity and its mapping metadata or rows disagree.
    Mapping {
        /// Table of the entity.
        table: &'static str,
        /// What went wrong.
        message: String,
        /// Conversion error, if one caused this.
        source: Option<Error>,
    },
}

impl TrackerError {
    pub(crate) fn mapping(table: &'static str, message: impl Into<String>) -> Self {
        TrackerError::Mapping {
            table,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn mapping_source(table: &'static str, message: impl Into<String>, source: Error) -> Self {
        TrackerError::Mapping {
            table,
            message: message.into(),
            source: Some(source),
        }
    }

    /// Classify a driver error raised while running a batch.
    pub(crate) fn from_database(source: Error, entry: Option<(EntryId, &str)>) -> Self {
        if source.is_constraint_violation() {
            TrackerError::ConstraintViolation {
                entry: entry.map(|(id, _)| id),
                label: entry.map(|(_, label)| label.to_string()),
                source,
            }
        } else if source.is_connection_error() || source.is_timeout() {
            TrackerError::ConnectionFailure { source }
        } else {
            TrackerError::Database { source }
        }
    }

    /// Did this error come from talking to the database?
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            TrackerError::ConcurrencyConflict { .. }
                | TrackerError::ConstraintViolation { .. }
                | TrackerError::ConnectionFailure { .. }
                | TrackerError::Database { .. }
        )
    }

    /// Is this an optimistic concurrency failure?
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, TrackerError::ConcurrencyConflict { .. })
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerError::DuplicateIdentity { table, key } => {
                write!(f, "An entity of table '{}' with key {} is already tracked", table, key)
            }
            TrackerError::NotTracked { type_name } => {
                write!(f, "Instance of {} is not tracked", type_name)
            }
            TrackerError::InvalidStateTransition { table, from, to } => {
                write!(f, "Invalid state transition for '{}': {} -> {}", table, from, to)
            }
            TrackerError::UnresolvableDependencyCycle { cycle } => {
                write!(f, "Unresolvable dependency cycle: {}", cycle.join(" -> "))
            }
            TrackerError::ConcurrencyConflict {
                label,
                kind,
                affected,
                ..
            } => write!(
                f,
                "Concurrency conflict: {} of {} affected {} rows, expected 1",
                kind, label, affected
            ),
            TrackerError::ConstraintViolation { label, source, .. } => match label {
                Some(label) => write!(f, "Constraint violation saving {}: {}", label, source),
                None => write!(f, "Constraint violation: {}", source),
            },
            TrackerError::ConnectionFailure { source } => {
                write!(f, "Connection failure: {}", source)
            }
            TrackerError::Database { source } => write!(f, "Database error: {}", source),
            TrackerError::Mapping { table, message, .. } => {
                write!(f, "Mapping error for '{}': {}", table, message)
            }
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrackerError::ConstraintViolation { source, .. }
            | TrackerError::ConnectionFailure { source }
            | TrackerError::Database { source } => Some(source),
            TrackerError::Mapping { source, .. } => source
                .as_ref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<TrackerError> for Error {
    fn from(e: TrackerError) -> Self {
        Error::Custom(e.to_string())
    }
}
