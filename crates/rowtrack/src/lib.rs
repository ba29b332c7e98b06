//! rowtrack - change tracking and transactional persistence for Rust entities.
//!
//! rowtrack keeps a unit of work over plain Rust structs:
//!
//! - Instances are tracked by identity, at most one per key
//! - Mutations are detected by snapshot comparison or by notification
//! - Pending inserts, updates and deletes are ordered by foreign keys
//! - Everything is written in one transaction, or nothing is
//! - Generated keys flow back onto the instances and into their dependents
//!
//! # Quick Start
//!
//! ```ignore
//! use rowtrack::prelude::*;
//! use rowtrack_sqlite::SqliteConnection;
//!
//! struct Blog {
//!     id: i32,
//!     name: Option<String>,
//! }
//!
//! impl Entity for Blog {
//!     const TABLE_NAME: &'static str = "blog";
//!
//!     fn fields() -> &'static [FieldInfo] {
//!         static FIELDS: [FieldInfo; 2] = [
//!             FieldInfo::new("id", "id", SqlType::Integer).identity(),
//!             FieldInfo::new("name", "name", SqlType::Text).nullable(true),
//!         ];
//!         &FIELDS
//!     }
//!     // to_row / from_row / set_column ...
//! }
//!
//! async fn example(cx: &Cx) {
//!     let conn = SqliteConnection::open_memory().unwrap();
//!     let mut db = DbContext::new(conn);
//!
//!     let blog = db.add(Blog { id: 0, name: Some("Blog1".into()) }).unwrap();
//!     db.save_changes(cx).await.unwrap(); // INSERT ... RETURNING "id"
//!
//!     blog.write().unwrap().name = Some("Renamed".into());
//!     db.save_changes(cx).await.unwrap(); // UPDATE "blog" SET "name" = ?1 WHERE "id" = ?2
//!
//!     db.remove(&blog).unwrap();
//!     db.save_changes(cx).await.unwrap(); // DELETE FROM "blog" WHERE "id" = ?1
//! }
//! ```
//!
//! # Entity states
//!
//! | State | Meaning | After a successful save |
//! |-------|---------|-------------------------|
//! | `Detached` | not tracked | - |
//! | `Unchanged` | matches the database | `Unchanged` |
//! | `Added` | pending INSERT | `Unchanged` |
//! | `Modified` | pending UPDATE of the changed columns | `Unchanged` |
//! | `Deleted` | pending DELETE | `Detached` |
//!
//! # Failure model
//!
//! A failed save rolls its transaction back and leaves every tracked
//! instance, state and snapshot exactly as it was; fix the cause and save
//! again. Dependency cycles are reported before any statement is sent.

// Core
pub use rowtrack_core::{
    // asupersync re-exports
    Budget,
    ColumnInfo,
    Connection,
    ConnectionError,
    ConnectionErrorKind,
    Cx,
    Dialect,
    Entity,
    Error,
    FieldInfo,
    FromValue,
    Generated,
    IsolationLevel,
    Outcome,
    PropertyNotifier,
    QueryError,
    QueryErrorKind,
    RegionId,
    Result,
    Row,
    SqlType,
    SubscriptionId,
    TaskId,
    TransactionOps,
    TypeError,
    Value,
};

// Tracking and saving
pub use rowtrack_session::{
    BatchExecutor, ChangeTracker, ColumnModification, CommandBatch, CommandBatchPreparer,
    CommandKind, ContextConfig, DbContext, DetectionKind, Entries, EntityKey, EntityMetadata,
    EntityRef, EntityState, EntryId, EntryRef, ExecutionResult, ForeignKey, IdentityKey, KeyPart,
    MetadataRegistry, ModificationCommand, ParamSource, PendingCounts, PrepareOptions, SaveResult,
    TrackerError,
};

/// Sub-crates, for items not re-exported at the top level.
pub mod core {
    pub use rowtrack_core::*;
}

pub mod session {
    pub use rowtrack_session::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // asupersync
        Budget,
        // Mapping
        Connection,
        ContextConfig,
        Cx,
        // Tracking
        DbContext,
        Entity,
        EntityRef,
        EntityState,
        Error,
        FieldInfo,
        Generated,
        Outcome,
        PropertyNotifier,
        Result,
        Row,
        SaveResult,
        SqlType,
        TrackerError,
        Value,
    };
}
