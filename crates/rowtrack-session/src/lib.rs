//! Change tracking and transactional persistence for rowtrack.
//!
//! A [`DbContext`] owns one connection and one [`ChangeTracker`]. Instances
//! enter the tracker through `add`, `attach` or query materialization; the
//! tracker records their state and detects mutations; `save_changes` turns
//! the pending entries into an ordered [`CommandBatch`], runs it inside one
//! transaction and reconciles database-generated values back onto the
//! instances.
//!
//! # Pipeline
//!
//! ```text
//! mutate / add / remove
//!         │
//!         ▼
//!   ChangeTracker ── detect_changes ──► EntityState per entry
//!         │
//!         ▼
//!   CommandBatchPreparer ── FK graph, stable topological order
//!         │
//!         ▼
//!   BatchExecutor ── one transaction, exactly one row per command
//!         │
//!         ▼
//!   reconcile ── generated values, original = current, Unchanged / Detached
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut db = DbContext::new(conn);
//! let blog = db.add(Blog::new("Blog1")).unwrap();
//! db.save_changes(&cx).await.unwrap();
//! assert_ne!(blog.read().unwrap().id, 0);
//!
//! blog.write().unwrap().name = Some("Renamed".into());
//! db.save_changes(&cx).await.unwrap(); // UPDATE "blog" SET "name" = ?1 WHERE "id" = ?2
//! ```

#![allow(clippy::result_large_err)] // TrackerError carries the driver error

pub mod command;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod executor;
pub mod identity;
pub mod metadata;
pub mod preparer;
mod reconciler;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_support;

pub use command::{ColumnModification, CommandBatch, CommandKind, ModificationCommand, ParamSource};
pub use config::ContextConfig;
pub use context::{DbContext, SaveResult};
pub use entry::{DetectionKind, EntityState, EntryId, EntryRef};
pub use error::TrackerError;
pub use executor::{BatchExecutor, ExecutionResult};
pub use identity::{EntityKey, EntityRef, IdentityKey, KeyPart};
pub use metadata::{EntityMetadata, ForeignKey, MetadataRegistry};
pub use preparer::{CommandBatchPreparer, PrepareOptions};
pub use tracker::{ChangeTracker, Entries, PendingCounts};
