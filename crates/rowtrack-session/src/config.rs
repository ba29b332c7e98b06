//! Context configuration.

use crate::metadata::MetadataRegistry;
use rowtrack_core::IsolationLevel;
use std::sync::Arc;

/// Configuration for a [`DbContext`](crate::DbContext).
///
/// Passed explicitly to [`DbContext::with_config`](crate::DbContext::with_config);
/// there is no global or ambient configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Sweep every tracked entry for changes before saving.
    ///
    /// When off, only notification-tracked entries and explicit state
    /// assignments contribute changes.
    pub auto_detect_changes: bool,
    /// Break dependency cycles among pending entries by deferring foreign
    /// key checks to commit time instead of failing.
    ///
    /// Only honored when the connection's dialect supports deferral.
    pub defer_constraints: bool,
    /// Isolation level for the save transaction.
    pub isolation: IsolationLevel,
    /// Mapping metadata cache, shareable between contexts.
    pub registry: Arc<MetadataRegistry>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            defer_constraints: false,
            isolation: IsolationLevel::default(),
            registry: Arc::new(MetadataRegistry::new()),
        }
    }
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the pre-save change sweep.
    #[must_use]
    pub fn auto_detect_changes(mut self, enabled: bool) -> Self {
        self.auto_detect_changes = enabled;
        self
    }

    /// Enable or disable deferred constraint checking for cyclic batches.
    #[must_use]
    pub fn defer_constraints(mut self, enabled: bool) -> Self {
        self.defer_constraints = enabled;
        self
    }

    /// Set the save transaction's isolation level.
    #[must_use]
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = level;
        self
    }

    /// Share a metadata registry with other contexts.
    #[must_use]
    pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = registry;
        self
    }
}
