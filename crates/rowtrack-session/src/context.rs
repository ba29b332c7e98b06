//! The caller-facing unit of work.

use crate::config::ContextConfig;
use crate::entry::{EntityState, EntryRef};
use crate::error::TrackerError;
use crate::executor::{BatchExecutor, ExecutionResult};
use crate::identity::EntityRef;
use crate::metadata::EntityMetadata;
use crate::preparer::{CommandBatchPreparer, PrepareOptions};
use crate::tracker::{ChangeTracker, Entries, PendingCounts};
use rowtrack_core::{Connection, Cx, Entity, Outcome, Row, Value};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Rows written by one successful [`DbContext::save_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl SaveResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// A connection plus the change tracker for the instances read or written
/// through it.
///
/// ```ignore
/// let mut db = DbContext::new(conn);
/// let blogs = db.load_all::<Blog>(&cx).await?;
/// blogs[0].write().unwrap().name = Some("New Name".into());
/// db.remove(&blogs[1])?;
/// db.add(Blog::new("Blog3"))?;
/// let saved = db.save_changes(&cx).await?;
/// assert_eq!(saved.total(), 3);
/// ```
pub struct DbContext<C: Connection> {
    connection: C,
    tracker: ChangeTracker,
    config: ContextConfig,
}

impl<C: Connection> DbContext<C> {
    /// Create a context with the default configuration.
    pub fn new(connection: C) -> Self {
        Self::with_config(connection, ContextConfig::default())
    }

    pub fn with_config(connection: C, config: ContextConfig) -> Self {
        let tracker = ChangeTracker::new(Arc::clone(&config.registry))
            .with_auto_detect(config.auto_detect_changes);
        Self {
            connection,
            tracker,
            config,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut ChangeTracker {
        &mut self.tracker
    }

    /// Give back the connection, dropping every tracked entry.
    pub fn into_connection(self) -> C {
        self.connection
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track a new instance for insertion and return its shared handle.
    pub fn add<E: Entity>(&mut self, entity: E) -> Result<EntityRef<E>, TrackerError> {
        let instance = Arc::new(RwLock::new(entity));
        self.add_ref(&instance)?;
        Ok(instance)
    }

    /// Track an existing handle for insertion.
    pub fn add_ref<E: Entity>(&mut self, instance: &EntityRef<E>) -> Result<(), TrackerError> {
        self.tracker.track(instance, EntityState::Added).map(|_| ())
    }

    /// Track an instance that already exists in the database, as `Unchanged`.
    pub fn attach<E: Entity>(&mut self, entity: E) -> Result<EntityRef<E>, TrackerError> {
        let instance = Arc::new(RwLock::new(entity));
        self.attach_ref(&instance)?;
        Ok(instance)
    }

    pub fn attach_ref<E: Entity>(&mut self, instance: &EntityRef<E>) -> Result<(), TrackerError> {
        self.tracker.track(instance, EntityState::Unchanged).map(|_| ())
    }

    /// Mark an instance for deletion.
    ///
    /// An `Added` instance is simply forgotten.
    pub fn remove<E: Entity>(&mut self, instance: &EntityRef<E>) -> Result<(), TrackerError> {
        self.tracker.set_state(instance, EntityState::Deleted)
    }

    pub fn entry<E: Entity>(&mut self, instance: &EntityRef<E>) -> Result<EntryRef<'_>, TrackerError> {
        self.tracker.entry(instance)
    }

    /// State of an instance; `Detached` if untracked.
    pub fn state_of<E: Entity>(&self, instance: &EntityRef<E>) -> EntityState {
        self.tracker.state_of(instance)
    }

    pub fn set_state<E: Entity>(
        &mut self,
        instance: &EntityRef<E>,
        state: EntityState,
    ) -> Result<(), TrackerError> {
        self.tracker.set_state(instance, state)
    }

    pub fn detach<E: Entity>(&mut self, instance: &EntityRef<E>) -> bool {
        self.tracker.detach(instance)
    }

    pub fn set_reference<D: Entity, P: Entity>(
        &mut self,
        dependent: &EntityRef<D>,
        column: &str,
        principal: &EntityRef<P>,
    ) -> Result<(), TrackerError> {
        self.tracker.set_reference(dependent, column, principal)
    }

    pub fn detect_changes(&mut self) -> Result<(), TrackerError> {
        self.tracker.detect_changes()
    }

    pub fn entries(&mut self) -> Result<Entries<'_>, TrackerError> {
        self.tracker.entries()
    }

    /// Whether saving would write anything.
    pub fn has_changes(&mut self) -> Result<bool, TrackerError> {
        self.refresh()?;
        Ok(self.tracker.has_changes())
    }

    pub fn pending_counts(&mut self) -> Result<PendingCounts, TrackerError> {
        self.refresh()?;
        Ok(self.tracker.pending_counts())
    }

    fn refresh(&mut self) -> Result<(), TrackerError> {
        if self.config.auto_detect_changes {
            self.tracker.detect_changes()
        } else {
            self.tracker.process_notifications()
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Load every row of `E`'s table.
    ///
    /// Rows whose key is already tracked resolve to the tracked instance,
    /// which is returned as-is; its in-memory changes are not overwritten.
    /// Other rows are attached as `Unchanged`.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(table = E::TABLE_NAME))]
    pub async fn load_all<E: Entity>(&mut self, cx: &Cx) -> Outcome<Vec<EntityRef<E>>, TrackerError> {
        let metadata = match self.tracker.registry().get::<E>() {
            Ok(m) => m,
            Err(e) => return Outcome::Err(e),
        };
        let sql = self.select_sql(&metadata);
        self.query_entities::<E>(cx, &metadata, &sql, &[]).await
    }

    /// Find an instance by key: the tracked instance if there is one,
    /// otherwise the row from the database, attached as `Unchanged`.
    #[tracing::instrument(level = "debug", skip(self, cx, key), fields(table = E::TABLE_NAME))]
    pub async fn find<E: Entity>(
        &mut self,
        cx: &Cx,
        key: &[Value],
    ) -> Outcome<Option<EntityRef<E>>, TrackerError> {
        if let Some(found) = self.tracker.find::<E>(key) {
            tracing::trace!("Found tracked instance");
            return Outcome::Ok(Some(found));
        }

        let metadata = match self.tracker.registry().get::<E>() {
            Ok(m) => m,
            Err(e) => return Outcome::Err(e),
        };
        if key.len() != metadata.key.len() {
            return Outcome::Err(TrackerError::mapping(
                E::TABLE_NAME,
                format!("expected {} key values, got {}", metadata.key.len(), key.len()),
            ));
        }

        let dialect = self.connection.dialect();
        let conditions: Vec<String> = metadata
            .key
            .iter()
            .enumerate()
            .map(|(i, &idx)| {
                format!(
                    "{} = {}",
                    dialect.quote_identifier(metadata.column_name(idx)),
                    dialect.placeholder(i + 1)
                )
            })
            .collect();
        let sql = format!("{} WHERE {}", self.select_sql(&metadata), conditions.join(" AND "));

        match self.query_entities::<E>(cx, &metadata, &sql, key).await {
            Outcome::Ok(found) => Outcome::Ok(found.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn select_sql(&self, metadata: &EntityMetadata) -> String {
        let dialect = self.connection.dialect();
        let columns: Vec<String> = metadata
            .fields
            .iter()
            .map(|f| dialect.quote_identifier(f.column_name))
            .collect();
        format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            dialect.quote_identifier(metadata.table)
        )
    }

    async fn query_entities<E: Entity>(
        &mut self,
        cx: &Cx,
        metadata: &EntityMetadata,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<EntityRef<E>>, TrackerError> {
        let rows = match self.connection.query(cx, sql, params).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(TrackerError::from_database(e, None)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut instances = Vec::with_capacity(rows.len());
        let mut attached = 0usize;
        for row in rows {
            match self.materialize::<E>(metadata, row) {
                Ok((instance, fresh)) => {
                    attached += usize::from(fresh);
                    instances.push(instance);
                }
                Err(e) => return Outcome::Err(e),
            }
        }
        tracing::debug!(
            rows = instances.len(),
            attached = attached,
            "Materialized query results"
        );
        Outcome::Ok(instances)
    }

    /// Resolve one row to a tracked instance. Returns whether it was newly
    /// attached.
    fn materialize<E: Entity>(
        &mut self,
        metadata: &EntityMetadata,
        row: Row,
    ) -> Result<(EntityRef<E>, bool), TrackerError> {
        let names: Vec<String> = row.column_names().map(str::to_string).collect();
        let values: Vec<Value> = names
            .iter()
            .zip(row.into_values())
            .map(|(name, value)| match metadata.index_of(name) {
                Some(idx) => metadata.fields[idx].sql_type.coerce(value),
                None => value,
            })
            .collect();
        let row = Row::new(names, values);

        let entity = E::from_row(&row)
            .map_err(|e| TrackerError::mapping_source(E::TABLE_NAME, "cannot materialize row", e))?;
        let identity = metadata.identity_of(&metadata.read_values(&entity)?);

        if let Some(existing) = self
            .tracker
            .find_id(&identity)
            .and_then(|id| self.tracker.get(id))
            .and_then(|entry| entry.entity::<E>())
        {
            return Ok((existing, false));
        }

        let instance = Arc::new(RwLock::new(entity));
        self.tracker.track(&instance, EntityState::Unchanged)?;
        Ok((instance, true))
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Persist every pending change in one transaction.
    ///
    /// On success, generated values are on the instances, added and modified
    /// entries are `Unchanged` and deleted entries are detached. On failure
    /// (including cancellation) the transaction is rolled back and every
    /// entry keeps the state and values it had before the call.
    ///
    /// # Errors
    ///
    /// - `UnresolvableDependencyCycle`, raised before any I/O
    /// - `ConcurrencyConflict`, `ConstraintViolation`, `ConnectionFailure`
    ///   and `Database` from execution
    /// - `Mapping` if a committed value could not be written back; the data
    ///   is saved and the entries are already accepted in that case
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<SaveResult, TrackerError> {
        if let Err(e) = self.refresh() {
            return Outcome::Err(e);
        }
        if let Err(e) = self.tracker.sync_pending() {
            return Outcome::Err(e);
        }

        let options = PrepareOptions {
            defer_constraints: self.config.defer_constraints
                && self.connection.dialect().supports_deferred_constraints(),
        };
        let batch = match CommandBatchPreparer::new(&self.tracker, options).prepare() {
            Ok(batch) => batch,
            Err(e) => return Outcome::Err(e),
        };
        if batch.entries().is_empty() {
            tracing::debug!("No pending changes");
            return Outcome::Ok(SaveResult::default());
        }

        let result = if batch.is_empty() {
            ExecutionResult::default()
        } else {
            let executor = BatchExecutor::new(&self.connection, self.config.isolation);
            match executor.execute(cx, &batch).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        let saved = SaveResult {
            inserted: result.inserted,
            updated: result.updated,
            deleted: result.deleted,
        };
        if let Err(e) = self.tracker.accept_batch(&batch, &result) {
            return Outcome::Err(e);
        }

        tracing::info!(
            inserted = saved.inserted,
            updated = saved.updated,
            deleted = saved.deleted,
            "Changes saved"
        );
        Outcome::Ok(saved)
    }
}

impl<C: Connection> std::fmt::Debug for DbContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("dialect", &self.connection.dialect())
            .field("tracker", &self.tracker)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Blog, Failure, MockConnection, MockState, NotifyingBlog, Player, Post, Team, blog_row};
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::Mutex;

    fn setup() -> (Arc<Mutex<MockState>>, DbContext<MockConnection>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let db = DbContext::new(MockConnection::new(Arc::clone(&state)));
        (state, db)
    }

    fn runtime() -> asupersync::runtime::Runtime {
        RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime")
    }

    #[test]
    fn save_with_nothing_pending_skips_io() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        db.attach(Blog::stored(1, "Blog1")).unwrap();

        rt.block_on(async {
            let Outcome::Ok(saved) = db.save_changes(&cx).await else {
                panic!("save should succeed");
            };
            assert_eq!(saved.total(), 0);
        });
        assert_eq!(state.lock().unwrap().begins, 0);
    }

    #[test]
    fn reverted_edit_saves_nothing() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        let blog = db.attach(Blog::stored(1, "Blog1")).unwrap();

        blog.write().unwrap().rating = 9;
        assert!(db.has_changes().unwrap());
        blog.write().unwrap().rating = 0;
        assert!(!db.has_changes().unwrap());

        rt.block_on(async {
            let Outcome::Ok(saved) = db.save_changes(&cx).await else {
                panic!("save should succeed");
            };
            assert_eq!(saved.total(), 0);
        });
        assert_eq!(state.lock().unwrap().begins, 0);
        assert_eq!(db.state_of(&blog), EntityState::Unchanged);
    }

    #[test]
    fn update_delete_and_insert_in_one_save() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        {
            let mut s = state.lock().unwrap();
            s.select_rows = vec![blog_row(1, Some("Blog1")), blog_row(2, Some("Blog2"))];
            s.next_id = 2;
        }

        rt.block_on(async {
            let Outcome::Ok(blogs) = db.load_all::<Blog>(&cx).await else {
                panic!("load should succeed");
            };
            assert_eq!(blogs.len(), 2);
            let to_update = Arc::clone(&blogs[0]);
            let to_delete = Arc::clone(&blogs[1]);

            to_update.write().unwrap().name = Some("Blog to Update".into());
            db.set_state(&to_update, EntityState::Modified).unwrap();
            db.remove(&to_delete).unwrap();
            let to_add = db.add(Blog::named("Blog to Insert")).unwrap();

            let Outcome::Ok(saved) = db.save_changes(&cx).await else {
                panic!("save should succeed");
            };
            assert_eq!((saved.inserted, saved.updated, saved.deleted), (1, 1, 1));

            assert_eq!(to_add.read().unwrap().id, 3);
            assert_eq!(db.entry(&to_update).unwrap().state(), EntityState::Unchanged);
            assert_eq!(db.entry(&to_add).unwrap().state(), EntityState::Unchanged);
            assert_eq!(db.state_of(&to_delete), EntityState::Detached);
            assert_eq!(db.entries().unwrap().count(), 2);
        });

        let state = state.lock().unwrap();
        assert_eq!((state.begins, state.commits, state.rollbacks), (1, 1, 0));
        let statements: Vec<&str> = state.executed.iter().map(|(sql, _)| sql.as_str()).collect();
        assert_eq!(
            statements,
            vec![
                "UPDATE \"blog\" SET \"name\" = ?1, \"rating\" = ?2 WHERE \"id\" = ?3",
                "DELETE FROM \"blog\" WHERE \"id\" = ?1",
                "INSERT INTO \"blog\" (\"name\", \"rating\") VALUES (?1, ?2) RETURNING \"id\"",
            ]
        );
    }

    #[test]
    fn loading_resolves_to_tracked_instances() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().select_rows = vec![blog_row(1, Some("Blog1"))];

        rt.block_on(async {
            let Outcome::Ok(first) = db.load_all::<Blog>(&cx).await else {
                panic!("load should succeed");
            };
            first[0].write().unwrap().name = Some("Local edit".into());

            let Outcome::Ok(second) = db.load_all::<Blog>(&cx).await else {
                panic!("load should succeed");
            };
            assert!(Arc::ptr_eq(&first[0], &second[0]));
            assert_eq!(second[0].read().unwrap().name.as_deref(), Some("Local edit"));

            let Outcome::Ok(Some(found)) = db.find::<Blog>(&cx, &[Value::Int(1)]).await else {
                panic!("find should succeed");
            };
            assert!(Arc::ptr_eq(&first[0], &found));
        });
        assert_eq!(db.tracker().len(), 1);
        assert_eq!(state.lock().unwrap().queries.len(), 2);
    }

    #[test]
    fn find_queries_untracked_keys() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().select_rows = vec![blog_row(7, None)];

        rt.block_on(async {
            let Outcome::Ok(Some(found)) = db.find::<Blog>(&cx, &[Value::Int(7)]).await else {
                panic!("find should succeed");
            };
            assert_eq!(found.read().unwrap().name, None);
            assert_eq!(db.state_of(&found), EntityState::Unchanged);

            assert!(matches!(
                db.find::<Blog>(&cx, &[Value::Int(7), Value::Int(8)]).await,
                Outcome::Err(TrackerError::Mapping { .. })
            ));
        });
        assert_eq!(
            state.lock().unwrap().queries,
            vec!["SELECT \"id\", \"name\", \"rating\" FROM \"blog\" WHERE \"id\" = ?1"]
        );
    }

    #[test]
    fn other_database_errors_are_wrapped() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().fail_on = Some(("INSERT".into(), Failure::Other));
        let blog = db.add(Blog::named("Blog3")).unwrap();

        rt.block_on(async {
            match db.save_changes(&cx).await {
                Outcome::Err(e) => {
                    assert!(matches!(e, TrackerError::Database { .. }));
                    assert!(e.is_execution_error());
                }
                _ => panic!("save should fail"),
            }
        });
        assert_eq!(db.state_of(&blog), EntityState::Added);
    }

    #[test]
    fn failed_save_leaves_tracker_untouched() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().fail_on = Some(("DELETE".into(), Failure::Constraint));

        let kept = db.attach(Blog::stored(1, "Blog1")).unwrap();
        let gone = db.attach(Blog::stored(2, "Blog2")).unwrap();
        let fresh = db.add(Blog::named("Blog3")).unwrap();
        kept.write().unwrap().name = Some("Renamed".into());
        db.remove(&gone).unwrap();

        rt.block_on(async {
            match db.save_changes(&cx).await {
                Outcome::Err(e) => assert!(matches!(e, TrackerError::ConstraintViolation { .. })),
                _ => panic!("save should fail"),
            }
        });

        assert_eq!(db.state_of(&kept), EntityState::Modified);
        assert_eq!(db.state_of(&gone), EntityState::Deleted);
        assert_eq!(db.state_of(&fresh), EntityState::Added);
        assert_eq!(fresh.read().unwrap().id, 0);
        assert_eq!(state.lock().unwrap().rollbacks, 1);

        state.lock().unwrap().fail_on = None;
        rt.block_on(async {
            assert!(matches!(db.save_changes(&cx).await, Outcome::Ok(_)));
        });
        assert_eq!(db.state_of(&gone), EntityState::Detached);
        assert_ne!(fresh.read().unwrap().id, 0);
    }

    #[test]
    fn cancelled_save_leaves_tracker_untouched() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().cancel_on = Some("DELETE".into());

        let kept = db.attach(Blog::stored(1, "Blog1")).unwrap();
        let gone = db.attach(Blog::stored(2, "Blog2")).unwrap();
        let fresh = db.add(Blog::named("Blog3")).unwrap();
        kept.write().unwrap().name = Some("Renamed".into());
        db.remove(&gone).unwrap();

        rt.block_on(async {
            assert!(matches!(db.save_changes(&cx).await, Outcome::Cancelled(_)));
        });

        {
            let s = state.lock().unwrap();
            assert_eq!((s.begins, s.commits, s.rollbacks), (1, 0, 1));
            assert_eq!(s.executed.len(), 1);
        }
        let entry = db.entry(&kept).unwrap();
        assert_eq!(entry.state(), EntityState::Modified);
        assert_eq!(entry.original_value("name"), Some(&Value::Text("Blog1".into())));
        assert_eq!(entry.modified_columns(), vec!["name"]);
        assert_eq!(db.state_of(&gone), EntityState::Deleted);
        assert_eq!(db.state_of(&fresh), EntityState::Added);
        assert_eq!(fresh.read().unwrap().id, 0);

        state.lock().unwrap().cancel_on = None;
        rt.block_on(async {
            assert!(matches!(db.save_changes(&cx).await, Outcome::Ok(_)));
        });
        assert_eq!(db.state_of(&kept), EntityState::Unchanged);
        assert_eq!(db.state_of(&gone), EntityState::Detached);
        assert_ne!(fresh.read().unwrap().id, 0);
    }

    #[test]
    fn concurrency_conflict_is_reported() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().zero_rows_on = Some("UPDATE".into());
        let blog = db.attach(Blog::stored(1, "Blog1")).unwrap();
        blog.write().unwrap().rating = 4;

        rt.block_on(async {
            match db.save_changes(&cx).await {
                Outcome::Err(e) => {
                    assert!(e.is_concurrency_conflict());
                    assert_eq!(
                        e.to_string(),
                        "Concurrency conflict: UPDATE of blog(1) affected 0 rows, expected 1"
                    );
                }
                _ => panic!("save should fail"),
            }
        });
        assert_eq!(db.state_of(&blog), EntityState::Modified);
    }

    #[test]
    fn notification_entities_save_without_sweep() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        let config = ContextConfig::new().auto_detect_changes(false);
        let mut db = DbContext::with_config(MockConnection::new(Arc::clone(&state)), config);

        let notifying = db.attach(NotifyingBlog::stored(1, "Blog1")).unwrap();
        let plain = db.attach(Blog::stored(2, "Blog2")).unwrap();
        notifying.write().unwrap().set_name(Some("New Name".into()));
        plain.write().unwrap().name = Some("Unnoticed".into());

        assert_eq!(db.pending_counts().unwrap().modified, 1);
        rt.block_on(async {
            let Outcome::Ok(saved) = db.save_changes(&cx).await else {
                panic!("save should succeed");
            };
            assert_eq!(saved.updated, 1);
        });

        let state = state.lock().unwrap();
        assert_eq!(
            state.executed[0].0,
            "UPDATE \"notifying_blog\" SET \"name\" = ?1 WHERE \"id\" = ?2"
        );
    }

    #[test]
    fn generated_principal_key_flows_into_dependent() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        state.lock().unwrap().next_id = 40;

        let post = db.add(Post::new(0, "Hello")).unwrap();
        let blog = db.add(Blog::named("Blog3")).unwrap();
        db.set_reference(&post, "blog_id", &blog).unwrap();

        rt.block_on(async {
            assert!(matches!(db.save_changes(&cx).await, Outcome::Ok(_)));
        });

        assert_eq!(blog.read().unwrap().id, 41);
        let post = post.read().unwrap();
        assert_eq!((post.id, post.blog_id), (42, 41));
        let state = state.lock().unwrap();
        assert!(state.executed[0].0.starts_with("INSERT INTO \"blog\""));
    }

    #[test]
    fn cycle_fails_without_touching_the_database() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let (state, mut db) = setup();
        db.add(Team::new(1, Some(10))).unwrap();
        db.add(Player::new(10, Some(1))).unwrap();

        rt.block_on(async {
            assert!(matches!(
                db.save_changes(&cx).await,
                Outcome::Err(TrackerError::UnresolvableDependencyCycle { .. })
            ));
        });
        assert_eq!(state.lock().unwrap().begins, 0);
    }

    #[test]
    fn cycle_saves_with_deferred_constraints() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let state = Arc::new(Mutex::new(MockState::default()));
        let config = ContextConfig::new().defer_constraints(true);
        let mut db = DbContext::with_config(MockConnection::new(Arc::clone(&state)), config);
        db.add(Team::new(1, Some(10))).unwrap();
        db.add(Player::new(10, Some(1))).unwrap();

        rt.block_on(async {
            assert!(matches!(db.save_changes(&cx).await, Outcome::Ok(_)));
        });
        let state = state.lock().unwrap();
        assert_eq!(state.executed[0].0, "PRAGMA defer_foreign_keys = ON");
        assert_eq!(state.executed.len(), 3);
    }

    #[test]
    fn invalid_state_changes_surface_immediately() {
        let (_state, mut db) = setup();
        let detached = Arc::new(RwLock::new(Blog::stored(1, "Blog1")));
        assert!(matches!(
            db.remove(&detached),
            Err(TrackerError::InvalidStateTransition { from: EntityState::Detached, .. })
        ));
        assert!(matches!(
            db.entry(&detached),
            Err(TrackerError::NotTracked { .. })
        ));
        db.attach_ref(&detached).unwrap();
        assert!(matches!(
            db.add_ref(&detached),
            Err(TrackerError::DuplicateIdentity { .. })
        ));
        assert!(!db.has_changes().unwrap());
    }
}
