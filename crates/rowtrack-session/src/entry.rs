//! Tracked entries and the entity state machine.

use crate::error::TrackerError;
use crate::identity::{EntityKey, EntityRef, InstanceId};
use crate::metadata::EntityMetadata;
use rowtrack_core::{Entity, SubscriptionId, Value};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Tracked; matches the database as far as the tracker knows.
    Unchanged,
    /// Tracked; will be inserted.
    Added,
    /// Tracked; at least one column will be updated.
    Modified,
    /// Tracked; will be deleted.
    Deleted,
}

impl EntityState {
    /// Whether the state machine allows moving from `self` to `to`.
    ///
    /// | from \ to  | Unchanged | Added | Modified | Deleted | Detached |
    /// |------------|-----------|-------|----------|---------|----------|
    /// | Detached   | yes       | yes   | no       | no      | yes      |
    /// | Unchanged  | yes       | no    | yes      | yes     | yes      |
    /// | Added      | yes       | yes   | no       | yes     | yes      |
    /// | Modified   | yes       | no    | yes      | yes     | yes      |
    /// | Deleted    | yes       | no    | no       | yes     | yes      |
    pub const fn can_transition_to(self, to: EntityState) -> bool {
        use EntityState::*;
        matches!(
            (self, to),
            (_, Detached)
                | (Detached, Added | Unchanged)
                | (Unchanged, Unchanged | Modified | Deleted)
                | (Added, Added | Unchanged | Deleted)
                | (Modified, Modified | Unchanged | Deleted)
                | (Deleted, Deleted | Unchanged)
        )
    }

    /// Whether saving will issue a command for an entry in this state.
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Detached => "Detached",
            EntityState::Unchanged => "Unchanged",
            EntityState::Added => "Added",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an entry within one tracker.
///
/// Assigned in tracking order; iteration over entries follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub(crate) u64);

impl EntryId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How an entry's mutations are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionKind {
    /// Compare current values against the original snapshot.
    Snapshot,
    /// The instance reports each write through its notifier.
    Notification,
}

pub(crate) type Inbox = Arc<Mutex<Vec<&'static str>>>;

pub(crate) enum DetectionStrategy {
    Snapshot,
    Notification {
        inbox: Inbox,
        subscription: SubscriptionId,
    },
}

impl DetectionStrategy {
    pub(crate) fn kind(&self) -> DetectionKind {
        match self {
            DetectionStrategy::Snapshot => DetectionKind::Snapshot,
            DetectionStrategy::Notification { .. } => DetectionKind::Notification,
        }
    }

    /// Take the columns reported since the last drain, deduplicated.
    pub(crate) fn drain(&self) -> Vec<&'static str> {
        match self {
            DetectionStrategy::Snapshot => Vec::new(),
            DetectionStrategy::Notification { inbox, .. } => {
                let mut reported = lock_inbox(inbox);
                let mut columns: Vec<&'static str> = Vec::with_capacity(reported.len());
                for column in reported.drain(..) {
                    if !columns.contains(&column) {
                        columns.push(column);
                    }
                }
                columns
            }
        }
    }
}

pub(crate) fn lock_inbox(inbox: &Inbox) -> MutexGuard<'_, Vec<&'static str>> {
    match inbox.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Type-erased access to a tracked instance.
pub(crate) trait ErasedInstance: Send + Sync {
    fn read_values(&self, metadata: &EntityMetadata) -> Result<Vec<Value>, TrackerError>;

    fn write_column(&self, column: &str, value: Value) -> Result<(), TrackerError>;

    /// Route the instance's notifications into `inbox`, if it has a notifier.
    fn subscribe(&self, inbox: &Inbox) -> Option<SubscriptionId>;

    fn unsubscribe(&self, subscription: SubscriptionId);

    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct Handle<E: Entity>(pub(crate) EntityRef<E>);

impl<E: Entity> Handle<E> {
    fn read(&self) -> RwLockReadGuard<'_, E> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, E> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<E: Entity> ErasedInstance for Handle<E> {
    fn read_values(&self, metadata: &EntityMetadata) -> Result<Vec<Value>, TrackerError> {
        metadata.read_values(&*self.read())
    }

    fn write_column(&self, column: &str, value: Value) -> Result<(), TrackerError> {
        self.write().set_column(column, value).map_err(|e| {
            TrackerError::mapping_source(E::TABLE_NAME, format!("cannot write column '{column}'"), e)
        })
    }

    fn subscribe(&self, inbox: &Inbox) -> Option<SubscriptionId> {
        let guard = self.read();
        let notifier = guard.change_notifier()?;
        let sink = Arc::clone(inbox);
        Some(notifier.subscribe(move |column| lock_inbox(&sink).push(column)))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        if let Some(notifier) = self.read().change_notifier() {
            notifier.unsubscribe(subscription);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Internal bookkeeping for one tracked instance.
pub(crate) struct EntryRecord {
    pub(crate) id: EntryId,
    pub(crate) instance: Box<dyn ErasedInstance>,
    pub(crate) instance_id: InstanceId,
    pub(crate) metadata: Arc<EntityMetadata>,
    pub(crate) state: EntityState,
    pub(crate) key: EntityKey,
    /// Values as last loaded or saved.
    pub(crate) original: Vec<Value>,
    /// Values as of the last detection.
    pub(crate) current: Vec<Value>,
    pub(crate) modified: Vec<bool>,
    /// `Modified` was assigned explicitly; flags stay set until accepted.
    pub(crate) forced: bool,
    pub(crate) detection: DetectionStrategy,
}

impl EntryRecord {
    pub(crate) fn table(&self) -> &'static str {
        self.metadata.table
    }

    pub(crate) fn label(&self) -> String {
        self.key.to_string()
    }

    pub(crate) fn refresh_current(&mut self) -> Result<(), TrackerError> {
        self.current = self.instance.read_values(&self.metadata)?;
        Ok(())
    }

    /// Bring the flags of the given columns in line with their values.
    ///
    /// A column is flagged when its current value differs from the original
    /// and unflagged when it matches again, unless the entry was forced to
    /// `Modified` or the column is in `pinned`. Key columns are never
    /// flagged; see [`EntryRecord::key_changed`].
    pub(crate) fn absorb_changes(&mut self, columns: impl IntoIterator<Item = usize>, pinned: &[usize]) {
        for idx in columns {
            if self.metadata.fields[idx].primary_key {
                continue;
            }
            if !self.current[idx].same_as(&self.original[idx]) {
                self.modified[idx] = true;
            } else if !self.forced && !pinned.contains(&idx) {
                self.modified[idx] = false;
            }
        }
    }

    /// Flagged columns the database owns and an UPDATE cannot write.
    pub(crate) fn modified_generated(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.metadata
            .fields
            .iter()
            .zip(&self.modified)
            .filter(|(field, flag)| **flag && !field.primary_key && !field.is_writable())
            .map(|(field, _)| field.column_name)
    }

    /// Whether a key column no longer matches the original.
    pub(crate) fn key_changed(&self) -> bool {
        self.metadata
            .key
            .iter()
            .any(|&idx| !self.current[idx].same_as(&self.original[idx]))
    }

    pub(crate) fn has_modified_columns(&self) -> bool {
        self.modified.iter().any(|&flag| flag)
    }

    pub(crate) fn mark_all_modified(&mut self) {
        self.forced = true;
        for (idx, field) in self.metadata.fields.iter().enumerate() {
            if field.is_writable() {
                self.modified[idx] = true;
            }
        }
    }

    /// Make the current values the new baseline.
    pub(crate) fn accept_current(&mut self) {
        self.original = self.current.clone();
        self.modified.iter_mut().for_each(|flag| *flag = false);
        self.forced = false;
    }

    pub(crate) fn unsubscribe(&self) {
        if let DetectionStrategy::Notification { subscription, .. } = &self.detection {
            self.instance.unsubscribe(*subscription);
        }
    }
}

/// Read-only view of a tracked entry.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    record: &'a EntryRecord,
}

impl<'a> EntryRef<'a> {
    pub(crate) fn new(record: &'a EntryRecord) -> Self {
        Self { record }
    }

    pub fn id(&self) -> EntryId {
        self.record.id
    }

    pub fn state(&self) -> EntityState {
        self.record.state
    }

    pub fn table(&self) -> &'static str {
        self.record.table()
    }

    pub fn key(&self) -> &'a EntityKey {
        &self.record.key
    }

    pub fn detection(&self) -> DetectionKind {
        self.record.detection.kind()
    }

    pub fn is_modified(&self, column: &str) -> bool {
        self.record
            .metadata
            .index_of(column)
            .is_some_and(|idx| self.record.modified[idx])
    }

    /// Names of the columns flagged as modified.
    pub fn modified_columns(&self) -> Vec<&'static str> {
        self.record
            .modified
            .iter()
            .enumerate()
            .filter(|(_, flag)| **flag)
            .map(|(idx, _)| self.record.metadata.column_name(idx))
            .collect()
    }

    /// Value of `column` as last loaded or saved.
    pub fn original_value(&self, column: &str) -> Option<&'a Value> {
        let idx = self.record.metadata.index_of(column)?;
        self.record.original.get(idx)
    }

    /// Value of `column` as of the last change detection.
    pub fn current_value(&self, column: &str) -> Option<&'a Value> {
        let idx = self.record.metadata.index_of(column)?;
        self.record.current.get(idx)
    }

    /// The tracked instance, if it is an `E`.
    pub fn entity<E: Entity>(&self) -> Option<EntityRef<E>> {
        self.record
            .instance
            .as_any()
            .downcast_ref::<Handle<E>>()
            .map(|handle| Arc::clone(&handle.0))
    }
}

impl fmt::Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("id", &self.record.id)
            .field("key", &self.record.key)
            .field("state", &self.record.state)
            .field("modified", &self.modified_columns())
            .finish()
    }
}
