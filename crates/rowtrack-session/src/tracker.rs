//! The change tracker.
//!
//! Owns one [`EntryRecord`] per tracked instance, indexed by instance and by
//! identity, and drives the entity state machine. Entries are kept in a
//! `BTreeMap` keyed by a monotonically increasing [`EntryId`], so iteration
//! always follows the order in which instances started being tracked.

use crate::entry::{
    DetectionStrategy, EntityState, EntryId, EntryRecord, EntryRef, ErasedInstance, Handle, Inbox,
};
use crate::error::TrackerError;
use crate::identity::{EntityKey, EntityRef, IdentityKey, InstanceId};
use crate::metadata::MetadataRegistry;
use rowtrack_core::{Entity, Generated, Value};
use serde::Serialize;
use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Counts of entries that saving would write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Entries pending INSERT.
    pub added: usize,
    /// Entries pending UPDATE.
    pub modified: usize,
    /// Entries pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Tracks entity instances and their lifecycle state.
pub struct ChangeTracker {
    pub(crate) entries: BTreeMap<EntryId, EntryRecord>,
    pub(crate) by_instance: HashMap<InstanceId, EntryId>,
    pub(crate) by_key: HashMap<IdentityKey, EntryId>,
    /// Foreign key columns waiting for a principal's generated key:
    /// `(dependent, column index) -> principal`.
    pub(crate) links: HashMap<(EntryId, usize), EntryId>,
    next_id: u64,
    registry: Arc<MetadataRegistry>,
    auto_detect: bool,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self::new(Arc::new(MetadataRegistry::new()))
    }
}

impl ChangeTracker {
    /// Create an empty tracker resolving metadata through `registry`.
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            entries: BTreeMap::new(),
            by_instance: HashMap::new(),
            by_key: HashMap::new(),
            links: HashMap::new(),
            next_id: 1,
            registry,
            auto_detect: true,
        }
    }

    /// Whether `entry` and `entries` compare snapshots before answering.
    ///
    /// Notification-tracked entries are always brought up to date.
    #[must_use]
    pub fn with_auto_detect(mut self, enabled: bool) -> Self {
        self.auto_detect = enabled;
        self
    }

    pub fn auto_detect(&self) -> bool {
        self.auto_detect
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start tracking `instance` as `Added` or `Unchanged`.
    ///
    /// # Errors
    ///
    /// - `InvalidStateTransition` for any other state (entries always start
    ///   from `Detached`)
    /// - `DuplicateIdentity` if the instance, or another instance with the
    ///   same key, is already tracked
    #[tracing::instrument(level = "debug", skip(self, instance), fields(table = E::TABLE_NAME))]
    pub fn track<E: Entity>(
        &mut self,
        instance: &EntityRef<E>,
        state: EntityState,
    ) -> Result<EntryId, TrackerError> {
        if !matches!(state, EntityState::Added | EntityState::Unchanged) {
            return Err(TrackerError::InvalidStateTransition {
                table: E::TABLE_NAME,
                from: EntityState::Detached,
                to: state,
            });
        }

        let metadata = self.registry.get::<E>()?;
        let instance_id = InstanceId::of(instance);
        if let Some(existing) = self.by_instance.get(&instance_id) {
            let label = self.entries[existing].label();
            return Err(TrackerError::DuplicateIdentity {
                table: E::TABLE_NAME,
                key: label,
            });
        }

        let id = EntryId(self.next_id);
        let handle = Handle(Arc::clone(instance));
        let values = handle.read_values(&metadata)?;
        let key = metadata.resolve_key(&values, id);

        match &key {
            EntityKey::Persistent(identity) => {
                if self.by_key.contains_key(identity) {
                    return Err(TrackerError::DuplicateIdentity {
                        table: E::TABLE_NAME,
                        key: identity.to_string(),
                    });
                }
            }
            EntityKey::Temporary { .. } if state == EntityState::Unchanged => {
                return Err(TrackerError::mapping(
                    E::TABLE_NAME,
                    "an instance whose generated key is unassigned can only be added",
                ));
            }
            EntityKey::Temporary { .. } => {}
        }

        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let detection = match handle.subscribe(&inbox) {
            Some(subscription) => DetectionStrategy::Notification {
                inbox,
                subscription,
            },
            None => DetectionStrategy::Snapshot,
        };

        self.next_id += 1;
        if let EntityKey::Persistent(identity) = &key {
            self.by_key.insert(identity.clone(), id);
        }
        self.by_instance.insert(instance_id, id);

        tracing::debug!(
            entry = %id,
            key = %key,
            state = %state,
            detection = ?detection.kind(),
            "Tracking entity"
        );

        let columns = values.len();
        self.entries.insert(
            id,
            EntryRecord {
                id,
                instance: Box::new(handle),
                instance_id,
                metadata,
                state,
                key,
                original: values.clone(),
                current: values,
                modified: vec![false; columns],
                forced: false,
                detection,
            },
        );
        Ok(id)
    }

    /// Entry id of a tracked instance.
    pub fn entry_id<E: Entity>(&self, instance: &EntityRef<E>) -> Result<EntryId, TrackerError> {
        self.by_instance
            .get(&InstanceId::of(instance))
            .copied()
            .ok_or(TrackerError::NotTracked {
                type_name: std::any::type_name::<E>(),
            })
    }

    /// State of `instance`; `Detached` if it is not tracked.
    pub fn state_of<E: Entity>(&self, instance: &EntityRef<E>) -> EntityState {
        self.entry_id(instance)
            .ok()
            .and_then(|id| self.entries.get(&id))
            .map_or(EntityState::Detached, |record| record.state)
    }

    /// The entry for `instance`, with its pending changes detected.
    ///
    /// # Errors
    ///
    /// `NotTracked` if the instance has no entry.
    pub fn entry<E: Entity>(&mut self, instance: &EntityRef<E>) -> Result<EntryRef<'_>, TrackerError> {
        let id = self.entry_id(instance)?;
        self.detect_entry(id, self.auto_detect)?;
        Ok(EntryRef::new(&self.entries[&id]))
    }

    /// The entry with `id`, as last detected.
    pub fn get(&self, id: EntryId) -> Option<EntryRef<'_>> {
        self.entries.get(&id).map(EntryRef::new)
    }

    /// All tracked entries in tracking order.
    ///
    /// Pending notifications (and, with auto-detection on, snapshot
    /// differences) are folded in first. The returned iterator is lazy and
    /// can be cloned to walk the entries again.
    ///
    /// # Errors
    ///
    /// Whatever detection reports, such as `DuplicateIdentity` when an added
    /// instance was given the key of another tracked instance.
    pub fn entries(&mut self) -> Result<Entries<'_>, TrackerError> {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.detect_entry(id, self.auto_detect)?;
        }
        Ok(Entries {
            inner: self.entries.values(),
        })
    }

    /// Compare every tracked instance with its snapshot and fold in every
    /// pending notification.
    ///
    /// Idempotent: a second call without intervening mutations changes
    /// nothing. A detected entry whose values all match their originals again
    /// goes back to `Unchanged`, unless `Modified` was assigned explicitly.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<(), TrackerError> {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.detect_entry(id, true)?;
        }
        let counts = self.pending_counts();
        tracing::debug!(
            added = counts.added,
            modified = counts.modified,
            deleted = counts.deleted,
            "Change detection complete"
        );
        Ok(())
    }

    /// Fold in pending notifications without comparing snapshots.
    pub fn process_notifications(&mut self) -> Result<(), TrackerError> {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.detect_entry(id, false)?;
        }
        Ok(())
    }

    fn detect_entry(&mut self, id: EntryId, sweep_snapshot: bool) -> Result<(), TrackerError> {
        let pinned: Vec<usize> = self
            .links
            .keys()
            .filter(|(dependent, _)| *dependent == id)
            .map(|&(_, column)| column)
            .collect();
        let Some(record) = self.entries.get_mut(&id) else {
            return Ok(());
        };
        let reported = record.detection.drain();
        if matches!(record.state, EntityState::Deleted | EntityState::Detached) {
            return Ok(());
        }

        let is_snapshot = matches!(record.detection, DetectionStrategy::Snapshot);
        if reported.is_empty() && !(is_snapshot && sweep_snapshot) {
            return Ok(());
        }

        record.refresh_current()?;
        if is_snapshot {
            record.absorb_changes(0..record.current.len(), &pinned);
        } else {
            let mut columns = Vec::with_capacity(reported.len());
            for column in reported {
                match record.metadata.index_of(column) {
                    Some(idx) => columns.push(idx),
                    None => tracing::warn!(
                        entry = %id,
                        column = column,
                        "Notification for unmapped column ignored"
                    ),
                }
            }
            record.absorb_changes(columns, &pinned);
        }

        let changed = record.has_modified_columns() || record.key_changed();
        let state = record.state;
        match state {
            EntityState::Unchanged if changed => {
                record.state = EntityState::Modified;
                tracing::trace!(entry = %id, key = %record.key, "Entry became Modified");
            }
            EntityState::Modified if !changed && !record.forced => {
                record.state = EntityState::Unchanged;
                tracing::trace!(entry = %id, key = %record.key, "Entry reverted to Unchanged");
            }
            EntityState::Added => self.rekey(id)?,
            _ => {}
        }
        Ok(())
    }

    /// Re-resolve an entry's identity from its current values.
    pub(crate) fn rekey(&mut self, id: EntryId) -> Result<(), TrackerError> {
        let Some(record) = self.entries.get_mut(&id) else {
            return Ok(());
        };
        let key = record.metadata.resolve_key(&record.current, id);
        if key == record.key {
            return Ok(());
        }
        if let EntityKey::Persistent(identity) = &key {
            if self.by_key.get(identity).is_some_and(|other| *other != id) {
                return Err(TrackerError::DuplicateIdentity {
                    table: record.table(),
                    key: identity.to_string(),
                });
            }
            self.by_key.insert(identity.clone(), id);
        }
        if let EntityKey::Persistent(old) = &record.key {
            self.by_key.remove(old);
        }
        tracing::trace!(entry = %id, from = %record.key, to = %key, "Entry re-keyed");
        record.key = key;
        Ok(())
    }

    /// Move `instance` to `state`.
    ///
    /// An untracked instance is `Detached`: it can be moved to `Added` or
    /// `Unchanged` (which starts tracking it) and nowhere else.
    ///
    /// - `Unchanged -> Modified` flags every writable column.
    /// - `-> Unchanged` makes the current values the new baseline.
    /// - `Added -> Deleted` and `-> Detached` stop tracking the instance.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` if the state machine does not allow the move.
    #[tracing::instrument(level = "debug", skip(self, instance), fields(table = E::TABLE_NAME))]
    pub fn set_state<E: Entity>(
        &mut self,
        instance: &EntityRef<E>,
        state: EntityState,
    ) -> Result<(), TrackerError> {
        match self.entry_id(instance) {
            Ok(id) => self.transition(id, state),
            Err(_) if state == EntityState::Detached => Ok(()),
            Err(_) => self.track(instance, state).map(|_| ()),
        }
    }

    pub(crate) fn transition(&mut self, id: EntryId, to: EntityState) -> Result<(), TrackerError> {
        let Some(record) = self.entries.get_mut(&id) else {
            return Ok(());
        };
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(TrackerError::InvalidStateTransition {
                table: record.table(),
                from,
                to,
            });
        }

        match (from, to) {
            (_, EntityState::Detached) | (EntityState::Added, EntityState::Deleted) => {
                self.detach_entry(id);
                return Ok(());
            }
            (EntityState::Modified, EntityState::Modified) => {
                record.mark_all_modified();
            }
            (EntityState::Unchanged, EntityState::Modified) => {
                record.refresh_current()?;
                record.mark_all_modified();
                record.state = to;
            }
            (EntityState::Unchanged, EntityState::Unchanged) => {}
            (_, EntityState::Unchanged) => {
                record.refresh_current()?;
                if record.metadata.has_unassigned_key(&record.current) {
                    return Err(TrackerError::mapping(
                        record.table(),
                        "an instance whose generated key is unassigned cannot be Unchanged",
                    ));
                }
                record.accept_current();
                record.state = to;
                self.links.retain(|(dependent, _), _| *dependent != id);
                self.rekey(id)?;
            }
            _ => record.state = to,
        }

        tracing::debug!(entry = %id, from = %from, to = %to, "State changed");
        Ok(())
    }

    /// Stop tracking `instance`. Returns whether it was tracked.
    pub fn detach<E: Entity>(&mut self, instance: &EntityRef<E>) -> bool {
        match self.entry_id(instance) {
            Ok(id) => self.detach_entry(id).is_some(),
            Err(_) => false,
        }
    }

    pub(crate) fn detach_entry(&mut self, id: EntryId) -> Option<EntryRecord> {
        let record = self.entries.remove(&id)?;
        record.unsubscribe();
        self.by_instance.remove(&record.instance_id);
        if let EntityKey::Persistent(identity) = &record.key {
            if self.by_key.get(identity) == Some(&id) {
                self.by_key.remove(identity);
            }
        }
        self.links
            .retain(|(dependent, _), principal| *dependent != id && *principal != id);
        tracing::debug!(entry = %id, key = %record.key, "Entry detached");
        Some(record)
    }

    /// The tracked instance of `E` with the given key values, if any.
    pub fn find<E: Entity>(&self, key_values: &[Value]) -> Option<EntityRef<E>> {
        let identity = IdentityKey::new(E::TABLE_NAME, key_values);
        let id = self.by_key.get(&identity)?;
        EntryRef::new(self.entries.get(id)?).entity::<E>()
    }

    pub(crate) fn find_id(&self, identity: &IdentityKey) -> Option<EntryId> {
        self.by_key.get(identity).copied()
    }

    /// Whether any entry is pending, as of the last detection.
    pub fn has_changes(&self) -> bool {
        self.entries.values().any(|record| record.state.is_pending())
    }

    /// Pending entries by state, as of the last detection.
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for record in self.entries.values() {
            match record.state {
                EntityState::Added => counts.added += 1,
                EntityState::Modified => counts.modified += 1,
                EntityState::Deleted => counts.deleted += 1,
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        counts
    }

    /// Stop tracking everything.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        for record in self.entries.values() {
            record.unsubscribe();
        }
        self.entries.clear();
        self.by_instance.clear();
        self.by_key.clear();
        self.links.clear();
        if count > 0 {
            tracing::debug!(count = count, "Change tracker cleared");
        }
    }

    /// Point `dependent`'s foreign key `column` at `principal`.
    ///
    /// If the principal's key is already known it is written into the
    /// dependent right away. If the principal is awaiting a generated key,
    /// the column is linked and filled in while saving, after the principal
    /// has been inserted.
    ///
    /// # Errors
    ///
    /// - `NotTracked` if either instance is untracked
    /// - `Mapping` if `column` is not a foreign key to the principal's table
    /// - `InvalidStateTransition` if the dependent is `Deleted`
    #[tracing::instrument(level = "debug", skip(self, dependent, principal))]
    pub fn set_reference<D: Entity, P: Entity>(
        &mut self,
        dependent: &EntityRef<D>,
        column: &str,
        principal: &EntityRef<P>,
    ) -> Result<(), TrackerError> {
        let dep_id = self.entry_id(dependent)?;
        let prin_id = self.entry_id(principal)?;

        let dep = &self.entries[&dep_id];
        if dep.state == EntityState::Deleted {
            return Err(TrackerError::InvalidStateTransition {
                table: D::TABLE_NAME,
                from: EntityState::Deleted,
                to: EntityState::Modified,
            });
        }
        let Some(fk) = dep
            .metadata
            .foreign_keys
            .iter()
            .find(|fk| dep.metadata.column_name(fk.column) == column)
            .cloned()
        else {
            return Err(TrackerError::mapping(
                D::TABLE_NAME,
                format!("column '{column}' is not a foreign key"),
            ));
        };
        if fk.principal_table != P::TABLE_NAME {
            return Err(TrackerError::mapping(
                D::TABLE_NAME,
                format!(
                    "column '{column}' references '{}', not '{}'",
                    fk.principal_table,
                    P::TABLE_NAME
                ),
            ));
        }

        let prin = &self.entries[&prin_id];
        let Some(prin_idx) = prin.metadata.index_of(fk.principal_column) else {
            return Err(TrackerError::mapping(
                P::TABLE_NAME,
                format!("referenced column '{}' is not mapped", fk.principal_column),
            ));
        };
        let value = prin.instance.read_values(&prin.metadata)?.swap_remove(prin_idx);
        let awaiting_key = prin.state == EntityState::Added
            && prin.metadata.fields[prin_idx].generated != Generated::Never
            && value.is_unassigned_key();

        if awaiting_key {
            self.links.insert((dep_id, fk.column), prin_id);
            if let Some(record) = self.entries.get_mut(&dep_id) {
                if record.state != EntityState::Added {
                    record.modified[fk.column] = true;
                    record.state = EntityState::Modified;
                }
            }
            tracing::debug!(dependent = %dep_id, principal = %prin_id, column = column, "Foreign key linked to pending key");
        } else {
            self.links.remove(&(dep_id, fk.column));
            if let Some(record) = self.entries.get_mut(&dep_id) {
                record.instance.write_column(column, value)?;
            }
            self.detect_entry(dep_id, true)?;
        }
        Ok(())
    }

    /// Re-read current values of every pending entry without touching flags.
    pub(crate) fn sync_pending(&mut self) -> Result<(), TrackerError> {
        let ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|record| {
                matches!(record.state, EntityState::Added | EntityState::Modified)
            })
            .map(|record| record.id)
            .collect();
        for id in ids {
            if let Some(record) = self.entries.get_mut(&id) {
                record.refresh_current()?;
                if record.state == EntityState::Added {
                    self.rekey(id)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        for record in self.entries.values() {
            record.unsubscribe();
        }
    }
}

impl fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("entries", &self.entries.len())
            .field("pending", &self.pending_counts())
            .field("links", &self.links.len())
            .field("auto_detect", &self.auto_detect)
            .finish()
    }
}

/// Lazy iterator over tracked entries in tracking order.
///
/// Clone it to walk the same entries again.
#[derive(Clone)]
pub struct Entries<'a> {
    inner: btree_map::Values<'a, EntryId, EntryRecord>,
}

impl<'a> Iterator for Entries<'a> {
    type Item = EntryRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(EntryRef::new)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Entries<'_> {}
