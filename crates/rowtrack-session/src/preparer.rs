//! Turning pending entries into an ordered command batch.
//!
//! Each pending entry yields at most one command. Commands are ordered so
//! that every foreign key reference is satisfiable at the moment each
//! statement runs:
//!
//! - a principal's INSERT runs before the INSERT or UPDATE of a dependent
//!   that references it;
//! - a dependent's DELETE, or an UPDATE moving it away, runs before the
//!   principal's DELETE.
//!
//! Ties keep tracking order. Dependencies that no order can satisfy are
//! reported before anything touches the database.

use crate::command::{ColumnModification, CommandBatch, CommandKind, ModificationCommand, ParamSource};
use crate::entry::{EntityState, EntryId, EntryRecord};
use crate::error::TrackerError;
use crate::identity::KeyPart;
use crate::tracker::ChangeTracker;
use rowtrack_core::{Generated, Value};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Options for [`CommandBatchPreparer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepareOptions {
    /// Allow cycles of foreign key dependencies by deferring constraint
    /// checks to commit.
    pub defer_constraints: bool,
}

/// An edge between two commands: `from` must run before `to`.
#[derive(Debug, Clone, Copy)]
struct Edge {
    to: usize,
    /// Satisfiable by checking constraints at commit instead of per
    /// statement. Edges that carry a generated key are not.
    deferrable: bool,
}

struct Planned<'t> {
    record: &'t EntryRecord,
    command: ModificationCommand,
    /// Principals whose generated key this command consumes.
    awaits: Vec<EntryId>,
}

/// Builds a [`CommandBatch`] from a tracker's pending entries.
pub struct CommandBatchPreparer<'t> {
    tracker: &'t ChangeTracker,
    options: PrepareOptions,
}

impl<'t> CommandBatchPreparer<'t> {
    pub fn new(tracker: &'t ChangeTracker, options: PrepareOptions) -> Self {
        Self { tracker, options }
    }

    /// Derive and order the commands.
    ///
    /// Uses the values as of the last change detection.
    ///
    /// # Errors
    ///
    /// - `UnresolvableDependencyCycle` if the dependencies form a loop that
    ///   cannot be broken (or can only be broken by deferral, which is off)
    /// - `Mapping` if a tracked entry's key, or a column the database
    ///   generates on every write, was modified
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare(&self) -> Result<CommandBatch, TrackerError> {
        let mut entries = Vec::new();
        let mut planned = Vec::new();
        for record in self.tracker.entries.values() {
            if !record.state.is_pending() {
                continue;
            }
            entries.push(record.id);
            if let Some(step) = self.plan(record)? {
                planned.push(step);
            }
        }

        let edges = self.dependencies(&planned);
        let (order, deferred) = self.order(&planned, &edges)?;

        let mut commands: Vec<Option<ModificationCommand>> =
            planned.into_iter().map(|p| Some(p.command)).collect();
        let commands: Vec<ModificationCommand> =
            order.into_iter().filter_map(|idx| commands[idx].take()).collect();

        let batch = CommandBatch {
            commands,
            entries,
            defer_constraints: deferred,
        };
        tracing::debug!(
            inserts = batch.count(CommandKind::Insert),
            updates = batch.count(CommandKind::Update),
            deletes = batch.count(CommandKind::Delete),
            entries = batch.entries.len(),
            deferred = deferred,
            "Command batch prepared"
        );
        Ok(batch)
    }

    fn plan(&self, record: &'t EntryRecord) -> Result<Option<Planned<'t>>, TrackerError> {
        let meta = &record.metadata;
        let mut awaits = Vec::new();
        let mut columns = Vec::new();
        let mut predicate = Vec::new();
        let mut returning = Vec::new();

        let kind = match record.state {
            EntityState::Added => CommandKind::Insert,
            EntityState::Modified => CommandKind::Update,
            EntityState::Deleted => CommandKind::Delete,
            EntityState::Unchanged | EntityState::Detached => return Ok(None),
        };

        if kind == CommandKind::Update && record.key_changed() {
            return Err(TrackerError::mapping(
                meta.table,
                format!("the key of {} was modified; keys are immutable once tracked", record.key),
            ));
        }
        if kind == CommandKind::Update {
            if let Some(column) = record.modified_generated().next() {
                return Err(TrackerError::mapping(
                    meta.table,
                    format!("column '{column}' of {} is generated by the database and cannot be written", record.key),
                ));
            }
        }

        match kind {
            CommandKind::Insert => {
                for (idx, field) in meta.fields.iter().enumerate() {
                    let value = &record.current[idx];
                    let generated_now = match field.generated {
                        Generated::Always => true,
                        Generated::OnInsert => value.is_unassigned_key(),
                        Generated::Never => false,
                    };
                    if generated_now {
                        returning.push((field.column_name, field.sql_type));
                    } else if let Some(source) = self.linked_source(record, idx, &mut awaits) {
                        columns.push(ColumnModification {
                            column: field.column_name,
                            source,
                        });
                    } else if !matches!(value, Value::Default) {
                        columns.push(ColumnModification::value(field.column_name, value.clone()));
                    }
                }
            }
            CommandKind::Update => {
                for (idx, field) in meta.fields.iter().enumerate() {
                    if record.modified[idx] {
                        let source = self
                            .linked_source(record, idx, &mut awaits)
                            .unwrap_or_else(|| ParamSource::Value(record.current[idx].clone()));
                        columns.push(ColumnModification {
                            column: field.column_name,
                            source,
                        });
                    }
                    if field.generated == Generated::Always {
                        returning.push((field.column_name, field.sql_type));
                    }
                }
                if columns.is_empty() {
                    tracing::trace!(entry = %record.id, key = %record.key, "Modified entry has nothing to write");
                    return Ok(None);
                }
                predicate = self.predicate(record);
            }
            CommandKind::Delete => {
                predicate = self.predicate(record);
            }
        }

        Ok(Some(Planned {
            record,
            command: ModificationCommand {
                entry: record.id,
                kind,
                table: meta.table,
                label: record.label(),
                columns,
                predicate,
                returning,
            },
            awaits,
        }))
    }

    /// Original key values plus concurrency tokens.
    fn predicate(&self, record: &EntryRecord) -> Vec<(&'static str, Value)> {
        let meta = &record.metadata;
        meta.key
            .iter()
            .chain(meta.concurrency_tokens.iter().filter(|idx| !meta.key.contains(*idx)))
            .map(|&idx| (meta.column_name(idx), record.original[idx].clone()))
            .collect()
    }

    /// Source for a foreign key column linked to a principal that is still
    /// waiting for its generated key.
    fn linked_source(
        &self,
        record: &EntryRecord,
        column: usize,
        awaits: &mut Vec<EntryId>,
    ) -> Option<ParamSource> {
        let principal_id = *self.tracker.links.get(&(record.id, column))?;
        let principal = self.tracker.entries.get(&principal_id)?;
        let fk = record.metadata.foreign_keys.iter().find(|fk| fk.column == column)?;
        let principal_idx = principal.metadata.index_of(fk.principal_column)?;

        let value = &principal.current[principal_idx];
        let awaiting = principal.state == EntityState::Added
            && principal.metadata.fields[principal_idx].generated != Generated::Never
            && value.is_unassigned_key();
        if awaiting {
            awaits.push(principal_id);
            Some(ParamSource::PrincipalKey {
                principal: principal_id,
                column: fk.principal_column,
            })
        } else {
            Some(ParamSource::Value(value.clone()))
        }
    }

    /// Build the "runs before" graph over planned commands.
    fn dependencies(&self, planned: &[Planned<'t>]) -> Vec<Vec<Edge>> {
        let mut edges: Vec<Vec<Edge>> = vec![Vec::new(); planned.len()];
        let mut seen: HashMap<(usize, usize), usize> = HashMap::new();
        let mut add = |from: usize, to: usize, deferrable: bool| {
            if from == to {
                return;
            }
            match seen.get(&(from, to)) {
                Some(&pos) => {
                    // Any strict reason makes the edge strict.
                    edges[from][pos].deferrable &= deferrable;
                }
                None => {
                    seen.insert((from, to), edges[from].len());
                    edges[from].push(Edge { to, deferrable });
                }
            }
        };

        // Only columns some pending entry references are worth indexing.
        let referenced: HashSet<(&'static str, &'static str)> = planned
            .iter()
            .flat_map(|p| p.record.metadata.foreign_keys.iter())
            .map(|fk| (fk.principal_table, fk.principal_column))
            .collect();

        let mut node_of: HashMap<EntryId, usize> = HashMap::new();
        let mut inserted: HashMap<(&'static str, &'static str, KeyPart), usize> = HashMap::new();
        let mut deleted: HashMap<(&'static str, &'static str, KeyPart), usize> = HashMap::new();

        for (node, step) in planned.iter().enumerate() {
            let record = step.record;
            let meta = &record.metadata;
            node_of.insert(record.id, node);
            let (index, values) = match step.command.kind {
                CommandKind::Insert => (&mut inserted, &record.current),
                CommandKind::Delete => (&mut deleted, &record.original),
                CommandKind::Update => continue,
            };
            for (idx, field) in meta.fields.iter().enumerate() {
                if !referenced.contains(&(meta.table, field.column_name)) {
                    continue;
                }
                let value = &values[idx];
                let unassigned = field.generated != Generated::Never && value.is_unassigned_key();
                if value.is_null() || unassigned {
                    continue;
                }
                index.insert((meta.table, field.column_name, KeyPart::from_value(value)), node);
            }
        }

        for (node, step) in planned.iter().enumerate() {
            let record = step.record;
            let meta = &record.metadata;

            for principal in &step.awaits {
                if let Some(&from) = node_of.get(principal) {
                    add(from, node, false);
                }
            }

            for fk in &meta.foreign_keys {
                let lookup = |value: &Value| {
                    (!value.is_null()).then(|| {
                        (fk.principal_table, fk.principal_column, KeyPart::from_value(value))
                    })
                };
                match step.command.kind {
                    CommandKind::Insert => {
                        if let Some(&from) = lookup(&record.current[fk.column])
                            .and_then(|k| inserted.get(&k))
                        {
                            add(from, node, true);
                        }
                    }
                    CommandKind::Update if record.modified[fk.column] => {
                        if let Some(&from) = lookup(&record.current[fk.column])
                            .and_then(|k| inserted.get(&k))
                        {
                            add(from, node, true);
                        }
                        if let Some(&to) = lookup(&record.original[fk.column])
                            .and_then(|k| deleted.get(&k))
                        {
                            add(node, to, true);
                        }
                    }
                    CommandKind::Update => {}
                    CommandKind::Delete => {
                        if let Some(&to) = lookup(&record.original[fk.column])
                            .and_then(|k| deleted.get(&k))
                        {
                            add(node, to, true);
                        }
                    }
                }
            }
        }

        edges
    }

    /// Stable topological order, plus whether constraints must be deferred.
    fn order(&self, planned: &[Planned<'t>], edges: &[Vec<Edge>]) -> Result<(Vec<usize>, bool), TrackerError> {
        let all = vec![true; planned.len()];
        let mut order = kahn(&all, edges, false);
        if order.len() == planned.len() {
            return Ok((order, false));
        }

        let mut remaining = vec![true; planned.len()];
        for &idx in &order {
            remaining[idx] = false;
        }

        if !self.options.defer_constraints {
            let cycle = find_cycle(&remaining, edges, false);
            return Err(self.cycle_error(planned, &cycle));
        }

        let rest = kahn(&remaining, edges, true);
        if rest.len() < remaining.iter().filter(|&&r| r).count() {
            let cycle = find_cycle(&remaining, edges, true);
            return Err(self.cycle_error(planned, &cycle));
        }

        tracing::info!(
            deferred = rest.len(),
            "Dependency cycle broken by deferring constraint checks"
        );
        order.extend(rest);
        Ok((order, true))
    }

    fn cycle_error(&self, planned: &[Planned<'t>], cycle: &[usize]) -> TrackerError {
        let cycle: Vec<String> = cycle
            .iter()
            .map(|&idx| planned[idx].command.label.clone())
            .collect();
        tracing::warn!(cycle = ?cycle, "Unresolvable dependency cycle");
        TrackerError::UnresolvableDependencyCycle { cycle }
    }
}

/// Kahn's algorithm over the `active` nodes, lowest index first among ready
/// nodes. With `strict_only`, deferrable edges are ignored.
fn kahn(active: &[bool], edges: &[Vec<Edge>], strict_only: bool) -> Vec<usize> {
    let considered = |edge: &Edge| active[edge.to] && !(strict_only && edge.deferrable);

    let mut indegree = vec![0usize; active.len()];
    for (from, out) in edges.iter().enumerate() {
        if !active[from] {
            continue;
        }
        for edge in out.iter().filter(|&e| considered(e)) {
            indegree[edge.to] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..active.len())
        .filter(|&idx| active[idx] && indegree[idx] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::new();
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for edge in edges[node].iter().filter(|&e| considered(e)) {
            indegree[edge.to] -= 1;
            if indegree[edge.to] == 0 {
                ready.push(Reverse(edge.to));
            }
        }
    }
    order
}

/// A cycle among the `active` nodes, first node repeated at the end.
fn find_cycle(active: &[bool], edges: &[Vec<Edge>], strict_only: bool) -> Vec<usize> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for start in (0..active.len()).filter(|&idx| active[idx]) {
        if !visited.contains(&start)
            && detect_cycle_dfs(start, active, edges, strict_only, &mut visited, &mut rec_stack, &mut path)
        {
            return path;
        }
    }
    path
}

fn detect_cycle_dfs(
    node: usize,
    active: &[bool],
    edges: &[Vec<Edge>],
    strict_only: bool,
    visited: &mut HashSet<usize>,
    rec_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for edge in &edges[node] {
        if !active[edge.to] || (strict_only && edge.deferrable) {
            continue;
        }
        if !visited.contains(&edge.to) {
            if detect_cycle_dfs(edge.to, active, edges, strict_only, visited, rec_stack, path) {
                return true;
            }
        } else if rec_stack.contains(&edge.to) {
            // Close the loop and drop the lead-in.
            let start = path.iter().position(|&n| n == edge.to).unwrap_or(0);
            path.drain(..start);
            path.push(edge.to);
            return true;
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}
